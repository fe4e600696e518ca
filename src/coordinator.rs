//! The job coordinator: the state machine that binds every other component
//! per job (spec §4.8). Grounded in the teacher's worker functions
//! (`download_video`/`follow_channel`/`check_channel`) for the overall
//! "do the work, handle every early-return branch, clean up on the way out"
//! shape, generalized from one linear function into named phases.

use crate::acquirer;
use crate::assembler;
use crate::catalog::{self, CatalogClient};
use crate::errors::CoordinatorError;
use crate::models::{
    Action, CatalogPage, ChannelPolicy, FieldType, MediaFile, MediaKind, TranscriptionAccumulator,
};
use crate::object_store::ObjectStoreClient;
use crate::policy::keys;
use crate::queue::{Job, JobKind};
use crate::transcriber::{SpeechRecognizer, StreamConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{event, Level};

/// RAII cleanup for one job's scratch files. Every path written to scratch
/// is tracked here; `Drop` removes every tracked file and then the
/// directory if it ends up empty — the Rust-native expression of spec §9's
/// "defer/ensure-release primitive is mandatory", generalizing the
/// teacher's repeated `let _ = std::fs::remove_dir_all(&tmp_work_path)` on
/// every early-return branch of `download_video` into one construct that
/// covers panics too.
pub(crate) struct ScratchGuard {
    dir: PathBuf,
    tracked: Vec<PathBuf>,
}

impl ScratchGuard {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            tracked: Vec::new(),
        }
    }

    fn track(&mut self, path: PathBuf) {
        self.tracked.push(path);
    }

    fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        for path in &self.tracked {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    event!(Level::WARN, "Failed to remove scratch file {path:?}: {e}");
                }
            }
        }
        match std::fs::read_dir(&self.dir) {
            Ok(mut entries) if entries.next().is_none() => {
                if let Err(e) = std::fs::remove_dir(&self.dir) {
                    event!(Level::WARN, "Failed to remove empty scratch dir {:?}: {e}", self.dir);
                }
            }
            Ok(_) => {
                event!(Level::WARN, "Scratch dir {:?} not empty after cleanup", self.dir);
            }
            Err(_) => {}
        }
    }
}

#[derive(Debug)]
pub(crate) enum JobOutcome {
    Done {
        page_id: String,
        page_url: String,
    },
    Skipped {
        reason: &'static str,
    },
}

pub(crate) struct CoordinatorConfig {
    pub compression_enabled: bool,
    pub compression_crf: u8,
    pub compression_preset: String,
    pub compression_audio_bitrate: String,
    pub audio_bitrate: String,
    pub streaming: StreamConfig,
    pub discord_user_token: Option<String>,
}

pub(crate) struct Coordinator {
    catalog: CatalogClient,
    object_store: ObjectStoreClient,
    recognizer: Arc<dyn SpeechRecognizer>,
    policy_table: Arc<Vec<ChannelPolicy>>,
    http: reqwest::Client,
    scratch_base: PathBuf,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub(crate) fn new(
        catalog: CatalogClient,
        object_store: ObjectStoreClient,
        recognizer: Arc<dyn SpeechRecognizer>,
        policy_table: Arc<Vec<ChannelPolicy>>,
        http: reqwest::Client,
        scratch_base: PathBuf,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            catalog,
            object_store,
            recognizer,
            policy_table,
            http,
            scratch_base,
            config,
        }
    }

    fn resolve_policy(&self, channel_name: &str) -> Result<&ChannelPolicy, CoordinatorError> {
        crate::policy::lookup(&self.policy_table, channel_name)
            .ok_or_else(|| CoordinatorError::Validation(format!("unknown channel '{channel_name}'")))
    }

    /// VALIDATE phase: re-checks the submission against the current policy
    /// table (policies may have changed since the job was enqueued).
    fn validate(&self, job: &Job) -> Result<&ChannelPolicy, CoordinatorError> {
        if job.submission.video_url.is_empty() || job.submission.channel_name.is_empty() {
            return Err(CoordinatorError::Validation("submission missing required fields".into()));
        }
        self.resolve_policy(&job.submission.channel_name)
    }

    /// DEDUP_PROBE: never writes to the catalog (spec §8 property 6).
    async fn dedup_probe(&self, video_url: &str) -> Result<Option<CatalogPage>, CoordinatorError> {
        self.catalog.find_by_url(video_url).await
    }

    /// Best-effort status write: failures here must never fail the job
    /// (spec §4.8/§7). Only meaningful for update-existing policies.
    async fn write_status(&self, policy: &ChannelPolicy, page_id: &str, status: &str) {
        if policy.action != Action::UpdateExisting {
            return;
        }
        let Some(entry) = policy.field_map.get(keys::STATUS) else {
            return;
        };
        let props = serde_json::json!({ entry.column_name: catalog::build_select(status) });
        if let Err(e) = self.catalog.update_properties(page_id, props).await {
            event!(Level::WARN, "Best-effort status write to '{status}' failed: {e}");
        }
    }

    async fn write_process_error(&self, policy: &ChannelPolicy, page_id: &str, message: &str) {
        if policy.action != Action::UpdateExisting {
            return;
        }
        let Some(entry) = policy.field_map.get(keys::PROCESS_ERRORS) else {
            return;
        };
        let first_line = message.lines().next().unwrap_or(message);
        let props = serde_json::json!({ entry.column_name: catalog::build_text(first_line) });
        if let Err(e) = self.catalog.update_properties(page_id, props).await {
            event!(Level::WARN, "Best-effort process_errors write failed: {e}");
        }
    }

    /// Runs one job end to end. `Err` means the job should be retried or
    /// recorded as a terminal failure, per `CoordinatorError::is_retryable`.
    pub(crate) async fn run_job(&self, job: &Job) -> Result<JobOutcome, CoordinatorError> {
        let policy = self.validate(job)?;

        let existing = self.dedup_probe(&job.submission.video_url).await?;
        if let Some(existing) = &existing {
            if existing.has_transcript {
                event!(Level::INFO, "Dedup skip for {}", job.submission.video_url);
                return Ok(JobOutcome::Skipped {
                    reason: "already_processed",
                });
            }
            // Open question 1 (spec §9): an existing row without a
            // transcript is not reused here — the source always creates a
            // new page in this branch too. Preserved as-is; see DESIGN.md.
            event!(
                Level::DEBUG,
                "Dedup probe found an untranscribed existing row for {}, continuing pipeline",
                job.submission.video_url
            );
        }
        let existing_page_id = existing.map(|p| p.id);

        let job_scratch_dir = self.scratch_base.join(&job.id);
        tokio::fs::create_dir_all(&job_scratch_dir)
            .await
            .map_err(|e| CoordinatorError::Permanent(format!("could not create scratch dir: {e}")))?;
        let mut guard = ScratchGuard::new(job_scratch_dir.clone());

        let result = self
            .run_pipeline(job, policy, &mut guard, existing_page_id.as_deref())
            .await;

        if let Err(e) = &result {
            if let Some(page_id) = &existing_page_id {
                self.write_status(policy, page_id, "Error").await;
                self.write_process_error(policy, page_id, &e.to_string()).await;
            }
        }

        result
    }

    async fn run_pipeline(
        &self,
        job: &Job,
        policy: &ChannelPolicy,
        guard: &mut ScratchGuard,
        existing_page_id: Option<&str>,
    ) -> Result<JobOutcome, CoordinatorError> {
        let parent_folder_id = job
            .submission
            .parent_drive_folder_id
            .clone()
            .unwrap_or_else(|| policy.folder_id.clone());
        if let Some(page_id) = existing_page_id {
            self.write_status(policy, page_id, "Processing").await;
        }

        // Probe metadata before creating the folder: the per-video folder is
        // named by date + title (`original_source/src/tasks.py:135`), not by
        // channel, so `video_info` must exist before `create_folder` runs.
        let (video_info, chat_message) = self.probe(job).await?;
        let folder_id = self
            .object_store
            .create_folder(&video_info.filename_stem(), &parent_folder_id)
            .await?;

        if let Some(page_id) = existing_page_id {
            self.write_status(policy, page_id, "Downloading").await;
        }

        let (accumulator, video_path, processing_mode) = self
            .acquire_and_transcribe(job, guard, &video_info, chat_message)
            .await?;

        if let Some(page_id) = existing_page_id {
            self.write_status(policy, page_id, "Transcribing").await;
        }

        let stem = video_info.filename_stem();
        let txt_file = assembler::write_transcript_text(guard.dir(), &stem, &accumulator.text)
            .await
            .map_err(|e| CoordinatorError::Permanent(e.to_string()))?;
        guard.track(txt_file.path.clone());
        let srt_file = assembler::write_subtitles(guard.dir(), &stem, &accumulator.segments)
            .await
            .map_err(|e| CoordinatorError::Permanent(e.to_string()))?;
        if let Some(ref s) = srt_file {
            guard.track(s.path.clone());
        }

        let final_video_path = self.maybe_compress(video_path, policy).await?;
        guard.track(final_video_path.clone());

        if let Some(page_id) = existing_page_id {
            self.write_status(policy, page_id, "Uploading to Drive").await;
        }

        let video_media = MediaFile::new(final_video_path, MediaKind::Video);
        let audio_media = acquirer::extract_audio(&video_media.path, &self.config.audio_bitrate)
            .await
            .ok();
        if let Some(ref a) = audio_media {
            guard.track(a.path.clone());
        }

        let (_, video_drive) = self.object_store.upload_if_absent(&video_media, &folder_id).await?;
        let audio_drive = match &audio_media {
            Some(a) => Some(self.object_store.upload_if_absent(a, &folder_id).await?.1),
            None => None,
        };
        let (_, txt_drive) = self.object_store.upload_if_absent(&txt_file, &folder_id).await?;
        let srt_drive = match &srt_file {
            Some(s) => Some(self.object_store.upload_if_absent(s, &folder_id).await?.1),
            None => None,
        };

        let page = self
            .publish(
                job,
                policy,
                &video_info,
                existing_page_id,
                &accumulator,
                &video_drive.view_url,
                audio_drive.as_ref().map(|d| d.view_url.as_str()),
                &txt_drive.view_url,
                srt_drive.as_ref().map(|d| d.view_url.as_str()),
            )
            .await?;

        self.catalog
            .append_transcript_toggle(&page.id, &accumulator.text)
            .await?;

        if let Some(page_id) = existing_page_id {
            self.write_status(policy, page_id, policy.status_value).await;
        }

        event!(
            Level::INFO,
            "Completed job {} for {} (mode={processing_mode})",
            job.id,
            job.submission.video_url,
        );

        Ok(JobOutcome::Done {
            page_id: page.id,
            page_url: page.url,
        })
    }

    /// Metadata probe, run before `CREATE_FOLDER` so the per-video folder can
    /// be named by date + title rather than by channel (spec §4.7; ground
    /// truth `original_source/src/tasks.py` probes before creating the
    /// folder too). For chat-attachment jobs this also fetches the message
    /// once, so `acquire_and_transcribe` doesn't re-fetch it to download.
    async fn probe(
        &self,
        job: &Job,
    ) -> Result<(crate::models::VideoInfo, Option<acquirer::ChatMessage>), CoordinatorError> {
        match job.kind {
            JobKind::VideoHost => {
                let video_info =
                    acquirer::probe_video_info(&job.submission.channel_name, &job.submission.video_url)
                        .await?;
                Ok((video_info, None))
            }
            JobKind::ChatAttachment => {
                let token = self
                    .config
                    .discord_user_token
                    .as_deref()
                    .ok_or_else(|| CoordinatorError::Config("DISCORD_USER_TOKEN not configured".into()))?;
                let message = acquirer::fetch_chat_message(&self.http, token, &job.submission.video_url).await?;
                let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
                let video_info = crate::models::VideoInfo::from_parts(
                    job.submission.video_url.clone(),
                    message.attachment_filename.clone(),
                    today,
                    String::new(),
                    message.channel_name.clone(),
                    0.0,
                    crate::models::Availability::Unlisted,
                    None,
                )
                .map_err(|e| CoordinatorError::Permanent(e.to_string()))?;
                Ok((video_info, Some(message)))
            }
        }
    }

    /// ACQUIRE+TRANSCRIBE (streaming), falling back to FALLBACK on any
    /// broken-pipe or unexpected failure, per spec §4.8. `video_info` and
    /// `chat_message` come from the earlier `probe` call.
    async fn acquire_and_transcribe(
        &self,
        job: &Job,
        guard: &mut ScratchGuard,
        video_info: &crate::models::VideoInfo,
        chat_message: Option<acquirer::ChatMessage>,
    ) -> Result<(TranscriptionAccumulator, PathBuf, &'static str), CoordinatorError> {
        let stem = video_info.filename_stem();
        match job.kind {
            JobKind::VideoHost => {
                match self.stream_acquire(&job.submission.video_url, guard, &stem).await {
                    Ok((accumulator, video_path)) => Ok((accumulator, video_path, "streamed")),
                    Err(e) => {
                        event!(Level::WARN, "Streaming pipeline failed, entering FALLBACK: {e}");
                        let (accumulator, video_path) = self.fallback_acquire(&job.submission.video_url, guard, &stem).await?;
                        Ok((accumulator, video_path, "fallback"))
                    }
                }
            }
            JobKind::ChatAttachment => {
                let message = chat_message
                    .ok_or_else(|| CoordinatorError::Permanent("chat-attachment job missing probed message".into()))?;

                let media =
                    acquirer::download_chat_attachment(&self.http, &message, guard.dir(), &stem).await?;
                guard.track(media.path.clone());

                let whole = self
                    .recognizer
                    .transcribe_whole(&media.path, None)
                    .await?;
                let mut accumulator = TranscriptionAccumulator::default();
                accumulator.push_chunk(&whole.text, whole.segments);
                accumulator.language = whole.language;
                accumulator.language_probability = whole.language_probability;
                accumulator.stream_completed = true;

                Ok((accumulator, media.path, "chat-attachment"))
            }
        }
    }

    async fn stream_acquire(
        &self,
        url: &str,
        guard: &mut ScratchGuard,
        stem: &str,
    ) -> Result<(TranscriptionAccumulator, PathBuf), CoordinatorError> {
        let mut pipeline = acquirer::stream_and_capture(
            url,
            guard.dir(),
            stem,
            self.config.streaming.sample_rate,
        )
        .await?;

        let stream_result = self
            .recognizer
            .transcribe_stream(&mut pipeline.pcm_reader, None, &self.config.streaming)
            .await;

        let video_path = pipeline.scratch_video_path.clone();
        pipeline.shutdown().await;

        let stream_result = stream_result?;
        if !stream_result.stream_completed {
            return Err(CoordinatorError::BrokenPipe(
                "chunked-stream transcription ended on a broken pipe".into(),
            ));
        }

        guard.track(video_path.clone());
        let mut accumulator = TranscriptionAccumulator {
            text: stream_result.text,
            segments: stream_result.segments,
            chunks_processed: stream_result.chunks_processed,
            stream_completed: stream_result.stream_completed,
            language: None,
            language_probability: None,
        };
        accumulator.stream_completed = true;
        Ok((accumulator, video_path))
    }

    /// FALLBACK: two independent whole-file downloads, then whole-file
    /// transcription of the audio. Guarantees a result even when the
    /// combined pipeline cannot sustain the pipe.
    async fn fallback_acquire(
        &self,
        url: &str,
        guard: &mut ScratchGuard,
        stem: &str,
    ) -> Result<(TranscriptionAccumulator, PathBuf), CoordinatorError> {
        let video = acquirer::download_video_whole(url, guard.dir(), stem).await?;
        guard.track(video.path.clone());
        let audio = acquirer::download_audio_whole(url, guard.dir(), stem, &self.config.audio_bitrate).await?;
        guard.track(audio.path.clone());

        let whole = self.recognizer.transcribe_whole(&audio.path, None).await?;
        let mut accumulator = TranscriptionAccumulator::default();
        accumulator.push_chunk(&whole.text, whole.segments);
        accumulator.language = whole.language;
        accumulator.language_probability = whole.language_probability;
        accumulator.stream_completed = true;

        Ok((accumulator, video.path))
    }

    /// COMPRESS (optional): remux `.mkv` to `.mp4` first; re-encode only if
    /// enabled globally and not skipped by the policy.
    async fn maybe_compress(
        &self,
        video_path: PathBuf,
        policy: &ChannelPolicy,
    ) -> Result<PathBuf, CoordinatorError> {
        let mut path = video_path;
        if path.extension().and_then(|e| e.to_str()) == Some("mkv") {
            match acquirer::convert_mkv_to_mp4(&path).await {
                Ok(mp4) => path = mp4,
                Err(e) => {
                    event!(Level::WARN, "Remux to mp4 failed, keeping original: {e}");
                }
            }
        }

        if self.config.compression_enabled && !policy.skip_compression {
            match acquirer::compress_video(
                &path,
                self.config.compression_crf,
                &self.config.compression_preset,
                &self.config.compression_audio_bitrate,
            )
            .await
            {
                Ok(compressed) => path = compressed,
                Err(e) => {
                    event!(Level::WARN, "Compression failed, keeping original: {e}");
                }
            }
        }

        Ok(path)
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish(
        &self,
        job: &Job,
        policy: &ChannelPolicy,
        video_info: &crate::models::VideoInfo,
        existing_page_id: Option<&str>,
        accumulator: &TranscriptionAccumulator,
        video_url: &str,
        audio_url: Option<&str>,
        transcript_txt_url: &str,
        transcript_srt_url: Option<&str>,
    ) -> Result<CatalogPage, CoordinatorError> {
        let mut values: HashMap<&str, String> = HashMap::new();
        values.insert(keys::TITLE, policy.title_format.render(&video_info.upload_date, &video_info.title));
        values.insert(keys::DATE, video_info.upload_date.clone());
        values.insert(keys::VIDEO_URL, job.submission.video_url.clone());
        values.insert(keys::VIDEO_FILE_LINK, video_url.to_string());
        values.insert(keys::AUDIO_FILE_LINK, audio_url.unwrap_or_default().to_string());
        values.insert(keys::TRANSCRIPT_FILE, transcript_txt_url.to_string());
        if let Some(srt) = transcript_srt_url {
            values.insert(keys::TRANSCRIPT_SRT_FILE, srt.to_string());
        }
        values.insert(keys::TRANSCRIPT_TEXT_INLINE, accumulator.text.clone());
        values.insert(keys::DURATION, video_info.duration_secs.to_string());
        values.insert(keys::DISCORD_CHANNEL, video_info.channel.clone());
        values.insert(
            keys::YOUTUBE_LISTING_STATUS,
            video_info.availability.listing_status().to_string(),
        );
        values.insert(keys::STATUS, policy.status_value.to_string());

        let mut properties = serde_json::Map::new();
        for entry in &policy.field_map.0 {
            let Some(text) = values.get(entry.logical_key) else {
                continue;
            };
            // Unknown logical keys with non-null values are ignored by
            // construction: we only ever look entries up from the field map.
            let fragment = match entry.field_type {
                FieldType::File => catalog::build_file(&video_info.filename_stem(), text),
                other => catalog::build_property(other, text),
            };
            properties.insert(entry.column_name.to_string(), fragment);
        }
        // §9 open question 2: the chat-message pipeline omits video_url /
        // live_video_url from its published fields (no counterpart in the
        // audit-process field map), reproduced here by the field map simply
        // never carrying those logical keys for that policy.

        let properties = serde_json::Value::Object(properties);

        match policy.action {
            Action::CreateNew => {
                let destination_id = policy
                    .destination_id
                    .as_deref()
                    .ok_or_else(|| CoordinatorError::Config("create-new policy missing destination_id".into()))?;
                let page = self.catalog.create_page(destination_id, properties).await?;
                self.write_back_transcript_link(job, &page.url).await;
                Ok(page)
            }
            Action::UpdateExisting => {
                let page_id = existing_page_id
                    .or(Some(job.submission.notion_page_id.as_str()))
                    .ok_or_else(|| CoordinatorError::Validation("update-existing job missing a target page id".into()))?;
                self.catalog.update_properties(page_id, properties).await?;
                Ok(CatalogPage {
                    id: page_id.to_string(),
                    url: String::new(),
                    has_transcript: true,
                })
            }
        }
    }

    /// After creating a new page, writes its URL back into the submitter's
    /// row's "transcript" URL column (spec §4.8 PUBLISH_CATALOG).
    async fn write_back_transcript_link(&self, job: &Job, page_url: &str) {
        let props = serde_json::json!({ "Transcript": catalog::build_url(page_url) });
        if let Err(e) = self
            .catalog
            .update_properties(&job.submission.notion_page_id, props)
            .await
        {
            event!(Level::WARN, "Failed to write transcript link back to submitter row: {e}");
        }
    }
}
