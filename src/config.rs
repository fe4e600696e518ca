use clap::Parser;

/// Immutable, process-wide configuration loaded once at startup from the
/// environment (optionally via a `.env` file). Every field mirrors one row
/// of the external interface's environment variable table; nothing here is
/// re-read after `Config::parse()` returns.
#[derive(Debug, Clone, Parser)]
#[command(about, author, version, next_line_help = true)]
pub(crate) struct Config {
    #[arg(long, env, default_value = "127.0.0.1")]
    /// The IP address the HTTP listener will bind to.
    pub webhook_host: String,

    #[arg(long, env, default_value = "22408")]
    /// The port number the HTTP listener will bind to.
    pub webhook_port: String,

    #[arg(long, env)]
    /// Shared secret an inbound webhook request must present in
    /// `X-Webhook-Secret`. If unset, the check is skipped entirely.
    pub webhook_secret: Option<String>,

    #[arg(long, env, default_value = "file:autotube_archivist.db")]
    pub database_url: String,

    #[arg(long, env)]
    /// File system path underneath which scratch directories for individual
    /// jobs are created.
    pub scratch_dir: String,

    #[arg(long, env, default_value = "cpu")]
    pub whisper_device: String,

    #[arg(long, env, default_value = "small")]
    pub whisper_model_default: String,

    #[arg(long, env, default_value = "medium")]
    /// Accepted for interface compatibility; the coordinator's recognizer is
    /// always built from `whisper_model_default` (see DESIGN.md Open
    /// Question 6). This mirrors a separate local-only transcription
    /// utility outside the webhook/worker pipeline this crate implements.
    pub whisper_model_local: String,

    #[arg(long, env, default_value_t = 14400)]
    pub celery_task_time_limit: u64,

    #[arg(long, env, default_value_t = 14100)]
    pub celery_task_soft_time_limit: u64,

    #[arg(long, env, default_value_t = 3)]
    pub celery_task_max_retries: u8,

    #[arg(long, env, default_value_t = 60)]
    pub celery_task_retry_delay: u64,

    #[arg(long, env, default_value_t = 1)]
    pub celery_worker_concurrency: usize,

    #[arg(long, env, default_value_t = 10)]
    /// Bound on completed jobs a worker handles before it is recycled, the
    /// in-process analogue of a Celery worker's `worker_max_tasks_per_child`.
    pub worker_max_jobs_per_child: u32,

    #[arg(long, env, default_value_t = false)]
    pub compression_enabled: bool,

    #[arg(long, env, default_value_t = 23)]
    pub compression_crf: u8,

    #[arg(long, env, default_value = "medium")]
    pub compression_preset: String,

    #[arg(long, env, default_value = "128k")]
    pub compression_audio_bitrate: String,

    #[arg(long, env, default_value = "192k")]
    pub audio_bitrate: String,

    #[arg(long, env, default_value_t = 16000)]
    pub streaming_sample_rate: u32,

    #[arg(long, env, default_value_t = 30.0)]
    pub streaming_chunk_duration: f64,

    #[arg(long, env, default_value_t = 5.0)]
    pub streaming_min_audio_duration: f64,

    #[arg(long, env, default_value_t = 65536)]
    pub streaming_buffer_size: usize,

    #[arg(long, env)]
    pub notion_token: String,

    #[arg(long, env)]
    pub discord_message_db_id: String,

    #[arg(long, env)]
    pub videos_db_id: String,

    #[arg(long, env)]
    /// Accepted for interface compatibility; `find_by_url` only ever queries
    /// `videos_db_id` and `discord_message_db_id` (the catalog's "two
    /// well-known destination databases"). See DESIGN.md Open Question 6.
    pub drive_uploads_db_id: String,

    #[arg(long, env)]
    /// Bearer-style user token used for chat-message mode only.
    pub discord_user_token: Option<String>,

    #[arg(long, env, default_value_t = 3)]
    pub drive_upload_max_retries: u8,

    #[arg(long, env, default_value_t = 2)]
    pub drive_upload_retry_delay: u64,
}

impl Config {
    pub(crate) fn listen_addr(&self) -> String {
        format!("{}:{}", self.webhook_host, self.webhook_port)
    }
}
