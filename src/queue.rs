//! The job queue: an MPSC channel is the in-process wakeup signal from the
//! Intake Server to the worker pool, backed by a `jobs` table in the same
//! SQLite database for at-least-once durability, the way the teacher treats
//! its `channels` table as the durable source of truth and the channel as
//! just a nudge.

use crate::models::Submission;
use rand::distr::Distribution;

/// One job as it travels the in-process channel. The URL shape determines
/// which acquisition mode the coordinator drives.
#[derive(Debug, Clone)]
pub(crate) enum JobKind {
    VideoHost,
    ChatAttachment,
}

#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub id: String,
    pub kind: JobKind,
    pub submission: Submission,
    pub attempt: u8,
}

impl Job {
    pub(crate) fn new(id: String, kind: JobKind, submission: Submission) -> Self {
        Self {
            id,
            kind,
            submission,
            attempt: 1,
        }
    }

    pub(crate) fn constr_retry(&self, max_retries: u8) -> anyhow::Result<Job> {
        if self.attempt < max_retries {
            Ok(Self {
                id: self.id.clone(),
                kind: self.kind.clone(),
                submission: self.submission.clone(),
                attempt: self.attempt + 1,
            })
        } else {
            Err(anyhow::anyhow!(
                "job {} exhausted {max_retries} retries",
                self.id
            ))
        }
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
/// `base * 2^attempt` seconds plus uniform jitter of up to half the computed
/// delay, mirroring the jitter construction in the teacher's channel-check
/// trigger (`rand::distr::Uniform` sampled once per decision instead of
/// shuffled across many).
pub(crate) fn backoff_with_jitter(base_secs: u64, attempt: u8) -> anyhow::Result<std::time::Duration> {
    let pow = 2u64.saturating_pow(u32::from(attempt));
    let delay_secs = (base_secs.saturating_mul(pow)) as f64;
    let jitter_end = delay_secs / 2.0;

    let mut rng = rand::rng();
    let range = rand::distr::Uniform::new_inclusive(0.0, jitter_end)
        .map_err(|e| anyhow::anyhow!("failed to construct jitter distribution: {e}"))?;
    let jitter = range.sample(&mut rng);

    Ok(std::time::Duration::from_secs_f64(delay_secs + jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_is_rejected_past_max_attempts() {
        let job = Job {
            id: "j1".to_string(),
            kind: JobKind::VideoHost,
            submission: Submission {
                notion_page_id: "p".to_string(),
                video_url: "u".to_string(),
                channel_name: "c".to_string(),
                parent_drive_folder_id: None,
            },
            attempt: 3,
        };
        assert!(job.constr_retry(3).is_err());
    }

    #[test]
    fn backoff_grows_with_attempt() {
        let first = backoff_with_jitter(60, 1).expect("computes");
        let second = backoff_with_jitter(60, 3).expect("computes");
        assert!(second.as_secs_f64() > first.as_secs_f64());
    }
}
