use crate::errors::CoordinatorError;
use crate::models::Submission;
use crate::policy;
use crate::queue::{Job, JobKind};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use tracing::{event, Level};

/// Raw wire shape accepted at `/webhook/process-video`. Legacy field names
/// are accepted as aliases and canonicalized immediately into `Submission`
/// (spec §9: "accept both the current and legacy field names at the HTTP
/// boundary... canonicalize immediately into a single struct").
#[derive(Debug, serde::Deserialize)]
pub(crate) struct ProcessVideoReq {
    #[serde(alias = "discord_entry_id")]
    notion_page_id: Option<String>,
    #[serde(alias = "youtube_url")]
    video_url: Option<String>,
    #[serde(alias = "channel")]
    channel_name: Option<String>,
    parent_drive_folder_id: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub(crate) struct ProcessVideoResp {
    status: String,
    message: String,
    task_id: Option<String>,
    timestamp: String,
}

#[derive(Debug, serde::Serialize)]
pub(crate) struct TaskResp {
    task_id: String,
    status: String,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub(crate) struct HealthResp {
    service: String,
    timestamp: String,
}

#[derive(Clone)]
/// State shared by every HTTP handler, mirroring the teacher's
/// `HTTPHandlerState` pattern: a cloneable submit channel plus a pooled
/// database handle, constructed once in `main`.
pub(crate) struct IntakeState {
    submit_job: tokio::sync::mpsc::Sender<Job>,
    db_pool: sqlx::sqlite::SqlitePool,
    webhook_secret: Option<String>,
    policy_table: std::sync::Arc<Vec<crate::models::ChannelPolicy>>,
}

impl IntakeState {
    pub(crate) fn new(
        submit_job: &tokio::sync::mpsc::Sender<Job>,
        db_pool: &sqlx::sqlite::SqlitePool,
        webhook_secret: Option<String>,
        policy_table: std::sync::Arc<Vec<crate::models::ChannelPolicy>>,
    ) -> Self {
        Self {
            submit_job: submit_job.clone(),
            db_pool: db_pool.clone(),
            webhook_secret,
            policy_table,
        }
    }
}

/// The video-host URL recognizer predicate (Mode A). Kept intentionally
/// loose beyond the host check: downstream the extractor tool does its own
/// strict parsing, and spec §4.1 only asks the two predicates to be pure and
/// mutually recognizable.
fn is_video_host_url(url: &str) -> bool {
    let url = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("www.");
    url.starts_with("youtube.com/watch?") || url.starts_with("youtu.be/")
}

/// The chat-message URL recognizer predicate (Mode B), grounded in
/// `original_source/src/discord_client.py::is_valid_discord_message_url`'s
/// regex shape.
fn is_chat_message_url(url: &str) -> bool {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(
            r"^https?://(?:ptb\.|canary\.)?discord(?:app)?\.com/channels/\d+/\d+/\d+$",
        )
        .expect("static regex is valid")
    });
    re.is_match(url)
}

fn classify_url(url: &str) -> anyhow::Result<JobKind> {
    if is_video_host_url(url) {
        Ok(JobKind::VideoHost)
    } else if is_chat_message_url(url) {
        Ok(JobKind::ChatAttachment)
    } else {
        Err(anyhow::anyhow!(
            "video_url matches neither the video-host nor the chat-message URL shape"
        ))
    }
}

fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub(crate) async fn get_root() -> Json<HealthResp> {
    Json(HealthResp {
        service: "autotube-archivist".to_string(),
        timestamp: now_iso8601(),
    })
}

pub(crate) async fn get_health() -> Json<HealthResp> {
    Json(HealthResp {
        service: "autotube-archivist".to_string(),
        timestamp: now_iso8601(),
    })
}

pub(crate) async fn post_webhook_process_video(
    State(state): State<IntakeState>,
    headers: HeaderMap,
    Json(payload): Json<ProcessVideoReq>,
) -> (StatusCode, Json<ProcessVideoResp>) {
    // Rule 4: the X-Webhook-Secret check is conditional on whether a secret is
    // configured at all; handled inline per handler rather than as a generic
    // middleware layer, since a layer would need to special-case "no secret
    // configured" for every route it covers (see DESIGN.md).
    if let Some(expected) = &state.webhook_secret {
        match headers.get("X-Webhook-Secret").and_then(|v| v.to_str().ok()) {
            None => {
                return err_resp_from(CoordinatorError::SecretMissing);
            }
            Some(got) if got != expected => {
                return err_resp_from(CoordinatorError::SecretMismatch);
            }
            Some(_) => {}
        }
    }

    let notion_page_id = payload.notion_page_id.unwrap_or_default();
    let video_url = payload.video_url.unwrap_or_default();
    let channel_name = payload.channel_name.unwrap_or_default();

    if notion_page_id.is_empty() || video_url.is_empty() || channel_name.is_empty() {
        return err_resp_from(CoordinatorError::Validation(
            "notion_page_id, video_url, and channel_name (or their legacy aliases) are all required".to_string(),
        ));
    }

    if policy::lookup(&state.policy_table, &channel_name).is_none() {
        return err_resp_from(CoordinatorError::Validation(
            "channel_name is not a recognized channel policy".to_string(),
        ));
    }

    let kind = match classify_url(&video_url) {
        Ok(k) => k,
        Err(e) => {
            event!(Level::DEBUG, "Rejected submission with invalid URL shape: {e}");
            return err_resp_from(CoordinatorError::Validation(e.to_string()));
        }
    };

    let submission = Submission {
        notion_page_id,
        video_url,
        channel_name,
        parent_drive_folder_id: payload.parent_drive_folder_id,
    };

    let job_id = uuid::Uuid::new_v4().to_string();
    let job = Job::new(job_id.clone(), kind, submission.clone());

    let now = now_iso8601();
    let submission_json = match serde_json::to_string(&submission) {
        Ok(s) => s,
        Err(e) => {
            return err_resp(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };
    if let Err(e) = sqlx::query!(
        "INSERT INTO jobs ( id, created_at, updated_at, status, attempt, submission_json )
        VALUES ( $1, $2, $2, 'queued', 1, $3 );",
        job_id,
        now,
        submission_json,
    )
    .execute(&state.db_pool)
    .await
    {
        event!(Level::WARN, "Failed to persist queued job to database: {e}");
        return err_resp(StatusCode::INTERNAL_SERVER_ERROR, "could not enqueue job");
    }

    if state.submit_job.send(job).await.is_err() {
        event!(Level::WARN, "Job submit channel closed, worker pool unavailable");
        return err_resp(StatusCode::INTERNAL_SERVER_ERROR, "could not enqueue job");
    }

    (
        StatusCode::OK,
        Json(ProcessVideoResp {
            status: "queued".to_string(),
            message: "job accepted".to_string(),
            task_id: Some(job_id),
            timestamp: now_iso8601(),
        }),
    )
}

fn err_resp(code: StatusCode, message: &str) -> (StatusCode, Json<ProcessVideoResp>) {
    (
        code,
        Json(ProcessVideoResp {
            status: "error".to_string(),
            message: message.to_string(),
            task_id: None,
            timestamp: now_iso8601(),
        }),
    )
}

fn err_resp_from(err: CoordinatorError) -> (StatusCode, Json<ProcessVideoResp>) {
    err_resp(err.http_status(), &err.to_string())
}

pub(crate) async fn get_task(
    State(state): State<IntakeState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<TaskResp>) {
    let row = sqlx::query!(
        "SELECT status, result_json, error FROM jobs WHERE id = $1;",
        id,
    )
    .fetch_optional(&state.db_pool)
    .await;

    match row {
        Ok(Some(r)) => (
            StatusCode::OK,
            Json(TaskResp {
                task_id: id,
                status: r.status,
                result: r
                    .result_json
                    .and_then(|s| serde_json::from_str(&s).ok()),
                error: r.error,
            }),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(TaskResp {
                task_id: id,
                status: "unknown".to_string(),
                result: None,
                error: Some("no such task".to_string()),
            }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(TaskResp {
                task_id: id,
                status: "unknown".to_string(),
                result: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_video_host_and_chat_message_urls() {
        let should_video_host = [
            "https://www.youtube.com/watch?v=0123456789a",
            "youtube.com/watch?v=0123456789a",
            "https://youtu.be/0123456789a",
        ];
        for url in should_video_host {
            assert!(matches!(classify_url(url), Ok(JobKind::VideoHost)));
        }

        let should_chat = [
            "https://discord.com/channels/1/2/3",
            "https://canary.discord.com/channels/111/222/333",
        ];
        for url in should_chat {
            assert!(matches!(classify_url(url), Ok(JobKind::ChatAttachment)));
        }

        assert!(classify_url("https://vimeo.com/12345").is_err());
        assert!(classify_url("").is_err());
    }
}
