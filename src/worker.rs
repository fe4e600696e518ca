//! Worker pool: `celery_worker_concurrency` tasks each pulling from the same
//! job channel and driving one `Coordinator::run_job` at a time, grounded in
//! the teacher's `WorkerState` (one `tokio::sync::mpsc::Receiver` shared
//! across spawned tasks, graceful shutdown via a `tokio::select!` against a
//! broadcast receiver) generalized from a single in-process loop into a
//! fixed-size pool with recycling and soft/hard time limits.

use crate::coordinator::{Coordinator, JobOutcome};
use crate::errors::CoordinatorError;
use crate::queue::{backoff_with_jitter, Job};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{event, Level};

pub(crate) struct WorkerState {
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    submit_job: mpsc::Sender<Job>,
    coordinator: Arc<Coordinator>,
    db_pool: sqlx::sqlite::SqlitePool,
    concurrency: usize,
    max_jobs_per_worker: u32,
    max_retries: u8,
    retry_base_delay_secs: u64,
    soft_time_limit: std::time::Duration,
    hard_time_limit: std::time::Duration,
}

impl WorkerState {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        receiver: mpsc::Receiver<Job>,
        submit_job: mpsc::Sender<Job>,
        coordinator: Coordinator,
        db_pool: sqlx::sqlite::SqlitePool,
        concurrency: usize,
        max_jobs_per_worker: u32,
        max_retries: u8,
        retry_base_delay_secs: u64,
        soft_time_limit: std::time::Duration,
        hard_time_limit: std::time::Duration,
    ) -> Self {
        Self {
            receiver: Arc::new(Mutex::new(receiver)),
            submit_job,
            coordinator: Arc::new(coordinator),
            db_pool,
            concurrency,
            max_jobs_per_worker,
            max_retries,
            retry_base_delay_secs,
            soft_time_limit,
            hard_time_limit,
        }
    }

    /// Spawns `concurrency` worker tasks and waits for the shutdown signal,
    /// then joins every task before returning.
    pub(crate) async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut handles = Vec::with_capacity(self.concurrency);
        for slot in 0..self.concurrency {
            let receiver = self.receiver.clone();
            let submit_job = self.submit_job.clone();
            let coordinator = self.coordinator.clone();
            let db_pool = self.db_pool.clone();
            let max_jobs_per_worker = self.max_jobs_per_worker;
            let max_retries = self.max_retries;
            let retry_base_delay_secs = self.retry_base_delay_secs;
            let soft_time_limit = self.soft_time_limit;
            let hard_time_limit = self.hard_time_limit;
            let mut shutdown = shutdown.resubscribe();

            handles.push(tokio::spawn(async move {
                worker_loop(
                    slot,
                    receiver,
                    submit_job,
                    coordinator,
                    db_pool,
                    max_jobs_per_worker,
                    max_retries,
                    retry_base_delay_secs,
                    soft_time_limit,
                    hard_time_limit,
                    &mut shutdown,
                )
                .await;
            }));
        }

        let _ = shutdown.recv().await;
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    slot: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    submit_job: mpsc::Sender<Job>,
    coordinator: Arc<Coordinator>,
    db_pool: sqlx::sqlite::SqlitePool,
    max_jobs_per_worker: u32,
    max_retries: u8,
    retry_base_delay_secs: u64,
    soft_time_limit: std::time::Duration,
    hard_time_limit: std::time::Duration,
    shutdown: &mut tokio::sync::broadcast::Receiver<()>,
) {
    let mut jobs_handled: u32 = 0;

    loop {
        if jobs_handled >= max_jobs_per_worker {
            event!(Level::INFO, "Worker slot {slot} recycling after {jobs_handled} jobs");
            jobs_handled = 0;
        }

        let job = tokio::select! {
            biased;
            _ = shutdown.recv() => {
                event!(Level::INFO, "Worker slot {slot} shutting down");
                return;
            }
            job = async {
                let mut receiver = receiver.lock().await;
                receiver.recv().await
            } => job,
        };

        let Some(job) = job else {
            event!(Level::INFO, "Worker slot {slot} exiting: job channel closed");
            return;
        };

        run_one_job(
            &coordinator,
            &db_pool,
            &submit_job,
            job,
            max_retries,
            retry_base_delay_secs,
            soft_time_limit,
            hard_time_limit,
        )
        .await;
        jobs_handled = jobs_handled.saturating_add(1);
    }
}

async fn run_one_job(
    coordinator: &Coordinator,
    db_pool: &sqlx::sqlite::SqlitePool,
    submit_job: &mpsc::Sender<Job>,
    job: Job,
    max_retries: u8,
    retry_base_delay_secs: u64,
    soft_time_limit: std::time::Duration,
    hard_time_limit: std::time::Duration,
) {
    mark_running(db_pool, &job.id).await;

    let outcome = match tokio::time::timeout(hard_time_limit, run_with_soft_warning(coordinator, &job, soft_time_limit)).await {
        Ok(inner) => inner,
        Err(_) => Err(CoordinatorError::HardTimeout),
    };

    match outcome {
        Ok(JobOutcome::Done { page_id, page_url }) => {
            event!(Level::INFO, "Job {} succeeded: page {page_id} ({page_url})", job.id);
            mark_done(db_pool, &job.id, &page_id, &page_url).await;
        }
        Ok(JobOutcome::Skipped { reason }) => {
            event!(Level::INFO, "Job {} skipped: {reason}", job.id);
            mark_skipped(db_pool, &job.id, reason).await;
        }
        Err(e) if e.is_retryable() => match job.constr_retry(max_retries) {
            Ok(retry_job) => {
                let delay = backoff_with_jitter(retry_base_delay_secs, retry_job.attempt)
                    .unwrap_or(std::time::Duration::from_secs(retry_base_delay_secs));
                event!(
                    Level::WARN,
                    "Job {} failed transiently ({e}), retrying attempt {} in {:.1}s",
                    job.id,
                    retry_job.attempt,
                    delay.as_secs_f64(),
                );
                mark_retrying(db_pool, &job.id, &e.to_string()).await;
                tokio::spawn(requeue_after_delay(db_pool.clone(), submit_job.clone(), retry_job, delay));
            }
            Err(exhausted) => {
                event!(Level::ERROR, "Job {} exhausted retries: {exhausted}", job.id);
                mark_failed(db_pool, &job.id, &e.to_string()).await;
            }
        },
        Err(e) => {
            event!(Level::ERROR, "Job {} failed permanently: {e}", job.id);
            mark_failed(db_pool, &job.id, &e.to_string()).await;
        }
    }
}

/// Sleeps out the backoff delay, flips the row back to `queued` for
/// durability across a restart, and resubmits the job onto the in-process
/// channel so this live worker pool picks it up without waiting on the
/// startup sweep.
async fn requeue_after_delay(
    db_pool: sqlx::sqlite::SqlitePool,
    submit_job: mpsc::Sender<Job>,
    job: Job,
    delay: std::time::Duration,
) {
    tokio::time::sleep(delay).await;
    let now = chrono::Utc::now().to_rfc3339();
    let attempt = i64::from(job.attempt);
    let _ = sqlx::query!(
        "UPDATE jobs SET status = 'queued', updated_at = $2, attempt = $3 WHERE id = $1;",
        job.id,
        now,
        attempt,
    )
    .execute(&db_pool)
    .await;
    event!(Level::DEBUG, "Job {} requeued after backoff", job.id);
    if submit_job.send(job).await.is_err() {
        event!(Level::WARN, "Could not resubmit job after backoff: channel closed");
    }
}

/// Races the job against the soft time limit. Per spec §4.2/§7, soft-limit
/// exhaustion is terminal (never retried): dropping the `run_job` future on
/// the losing branch lets `ScratchGuard`'s `Drop` run CLEANUP, then the
/// job is reported as a `SoftTimeout` failure rather than re-attempted.
async fn run_with_soft_warning(
    coordinator: &Coordinator,
    job: &Job,
    soft_time_limit: std::time::Duration,
) -> Result<JobOutcome, CoordinatorError> {
    tokio::select! {
        result = coordinator.run_job(job) => result,
        () = tokio::time::sleep(soft_time_limit) => {
            event!(Level::WARN, "Job {} exceeded its soft time limit, failing it", job.id);
            Err(CoordinatorError::SoftTimeout)
        }
    }
}

async fn mark_running(db_pool: &sqlx::sqlite::SqlitePool, id: &str) {
    let now = chrono::Utc::now().to_rfc3339();
    let _ = sqlx::query!(
        "UPDATE jobs SET status = 'running', updated_at = $2 WHERE id = $1;",
        id,
        now,
    )
    .execute(db_pool)
    .await;
}

async fn mark_done(db_pool: &sqlx::sqlite::SqlitePool, id: &str, page_id: &str, page_url: &str) {
    let now = chrono::Utc::now().to_rfc3339();
    let result_json = serde_json::json!({ "page_id": page_id, "page_url": page_url }).to_string();
    let _ = sqlx::query!(
        "UPDATE jobs SET status = 'done', updated_at = $2, result_json = $3 WHERE id = $1;",
        id,
        now,
        result_json,
    )
    .execute(db_pool)
    .await;
}

async fn mark_skipped(db_pool: &sqlx::sqlite::SqlitePool, id: &str, reason: &str) {
    let now = chrono::Utc::now().to_rfc3339();
    let result_json = serde_json::json!({ "skipped": reason }).to_string();
    let _ = sqlx::query!(
        "UPDATE jobs SET status = 'skipped', updated_at = $2, result_json = $3 WHERE id = $1;",
        id,
        now,
        result_json,
    )
    .execute(db_pool)
    .await;
}

async fn mark_retrying(db_pool: &sqlx::sqlite::SqlitePool, id: &str, error: &str) {
    let now = chrono::Utc::now().to_rfc3339();
    let _ = sqlx::query!(
        "UPDATE jobs SET status = 'retrying', updated_at = $2, error = $3 WHERE id = $1;",
        id,
        now,
        error,
    )
    .execute(db_pool)
    .await;
}

async fn mark_failed(db_pool: &sqlx::sqlite::SqlitePool, id: &str, error: &str) {
    let now = chrono::Utc::now().to_rfc3339();
    let _ = sqlx::query!(
        "UPDATE jobs SET status = 'failed', updated_at = $2, error = $3 WHERE id = $1;",
        id,
        now,
        error,
    )
    .execute(db_pool)
    .await;
}

/// Startup sweep: any row left `running` or `queued` across a crash is
/// resubmitted once, the in-process analogue of Celery's `acks_late`
/// redelivery.
pub(crate) async fn requeue_stale_jobs(
    db_pool: &sqlx::sqlite::SqlitePool,
    submit_job: &mpsc::Sender<Job>,
) -> anyhow::Result<()> {
    let rows = sqlx::query!(
        "SELECT id, attempt, submission_json FROM jobs WHERE status IN ('running', 'queued');"
    )
    .fetch_all(db_pool)
    .await?;

    for row in rows {
        let Ok(submission) = serde_json::from_str::<crate::models::Submission>(&row.submission_json) else {
            event!(Level::WARN, "Stale job {} has unparseable submission, skipping requeue", row.id);
            continue;
        };
        let kind = if submission.video_url.contains("discord") {
            crate::queue::JobKind::ChatAttachment
        } else {
            crate::queue::JobKind::VideoHost
        };
        let mut job = Job::new(row.id.clone(), kind, submission);
        job.attempt = u8::try_from(row.attempt).unwrap_or(1).max(1);

        mark_retrying(db_pool, &job.id, "requeued after restart").await;
        if submit_job.send(job).await.is_err() {
            event!(Level::WARN, "Could not requeue stale job {}: channel closed", row.id);
        }
    }

    Ok(())
}
