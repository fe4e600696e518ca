use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::intake::{get_health, get_root, get_task, post_webhook_process_video, IntakeState};
use crate::queue::Job;
use crate::transcriber::{StreamConfig, WhisperCliRecognizer};
use crate::worker::WorkerState;
use clap::Parser;
use tracing::{event, Level};
use tracing_subscriber::prelude::*;

mod acquirer;
mod assembler;
mod catalog;
mod config;
mod coordinator;
mod db;
mod errors;
mod intake;
mod models;
mod object_store;
mod policy;
mod queue;
mod transcriber;
mod worker;

// Wait to observe the ctrl+c signal and cause everything to shut down properly
// by dropping the sender half of a broadcast channel (all receivers will close
// upon this event).
async fn shutdown_upon_signal(send_shutdown: tokio::sync::broadcast::Sender<()>) {
    let _ = tokio::signal::ctrl_c().await;
    event!(Level::INFO, "Received signal to shut down gracefully");
    drop(send_shutdown);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load a `.env` file if present; actual process environment variables
    // always take precedence, matching `dotenvy`'s documented override rule.
    dotenvy::dotenv().ok();

    // Parse CLI and ENV arguments.
    let config = Config::parse();

    // Configure our tracing/logger.
    let format_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .compact();
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))?;
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(format_layer)
        .init();
    event!(Level::DEBUG, "Launching...");

    // Error out early on if `yt-dlp` can't be called from autotube-archivist.
    if std::process::Command::new("yt-dlp")
        .env_clear()
        .arg("--version")
        .output()
        .is_err()
    {
        return Err(anyhow::anyhow!(
            "No 'yt-dlp' executable found, make sure it is installed"
        ));
    }

    std::fs::create_dir_all(&config.scratch_dir)?;

    // Initialize a connection to the SQLite database and also create the
    // primary table if it doesn't exist.
    let db_pool = db::init_db(&config.database_url).await?;

    // Build the static channel policy table once at startup.
    let policy_table = std::sync::Arc::new(policy::build_policy_table(&config)?);

    let http = reqwest::Client::builder().build()?;

    // Prepare ctrl+c signal handling: Spawn a background task waiting for
    // ctrl+c being pressed to then drop the sender side of a broadcast
    // channel to which all other tasks are hooked up as receivers. As soon as
    // the receivers see the sender getting dropped, they initiate shutdown.
    let (send_shutdown, _) = tokio::sync::broadcast::channel::<()>(1);

    // Prepare an MPSC channel pair with a decent buffer size for HTTP
    // handlers to submit jobs to the worker pool.
    let (submit_job, recv_job) = tokio::sync::mpsc::channel::<Job>(256);

    let intake_state = IntakeState::new(
        &submit_job,
        &db_pool,
        config.webhook_secret.clone(),
        policy_table.clone(),
    );

    let catalog = catalog::CatalogClient::new(
        http.clone(),
        config.notion_token.clone(),
        config.discord_message_db_id.clone(),
        config.videos_db_id.clone(),
    );
    let object_store = object_store::ObjectStoreClient::new(
        http.clone(),
        config.drive_upload_max_retries,
        config.drive_upload_retry_delay,
    );
    let recognizer = std::sync::Arc::new(WhisperCliRecognizer::new(
        config.whisper_model_default.clone(),
        config.whisper_device.clone(),
    ));
    let coordinator_config = CoordinatorConfig {
        compression_enabled: config.compression_enabled,
        compression_crf: config.compression_crf,
        compression_preset: config.compression_preset.clone(),
        compression_audio_bitrate: config.compression_audio_bitrate.clone(),
        audio_bitrate: config.audio_bitrate.clone(),
        streaming: StreamConfig {
            sample_rate: config.streaming_sample_rate,
            chunk_duration_secs: config.streaming_chunk_duration,
            min_audio_duration_secs: config.streaming_min_audio_duration,
            buffer_size: config.streaming_buffer_size,
        },
        discord_user_token: config.discord_user_token.clone(),
    };
    let coordinator = Coordinator::new(
        catalog,
        object_store,
        recognizer,
        policy_table,
        http,
        std::path::PathBuf::from(&config.scratch_dir),
        coordinator_config,
    );

    worker::requeue_stale_jobs(&db_pool, &submit_job).await?;

    let worker_state = WorkerState::new(
        recv_job,
        submit_job.clone(),
        coordinator,
        db_pool.clone(),
        config.celery_worker_concurrency,
        config.worker_max_jobs_per_child,
        config.celery_task_max_retries,
        config.celery_task_retry_delay,
        std::time::Duration::from_secs(config.celery_task_soft_time_limit),
        std::time::Duration::from_secs(config.celery_task_time_limit),
    );
    let worker_shutdown = send_shutdown.subscribe();
    let worker_handle = tokio::task::spawn(worker_state.run(worker_shutdown));

    // Build the HTTP router to handle incoming client requests.
    let router = axum::Router::new()
        .route("/", axum::routing::get(get_root))
        .route("/health", axum::routing::get(get_health))
        .route(
            "/webhook/process-video",
            axum::routing::post(post_webhook_process_video),
        )
        .route("/task/{id}", axum::routing::get(get_task))
        .with_state(intake_state);

    // Spawn a tokio TCP listener on the configured listening address, and
    // pass it off to axum to handle the configured HTTP routes.
    let listener = tokio::net::TcpListener::bind(config.listen_addr()).await?;
    event!(Level::INFO, "Listening for HTTP requests on {}...", config.listen_addr());

    // Block on HTTP handler, returning upon shutdown.
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_upon_signal(send_shutdown))
        .await?;

    // Once the HTTP handler completed, also wait for background tasks and
    // database connections to exit.
    let _ = worker_handle.await;
    db_pool.close().await;

    Ok(())
}
