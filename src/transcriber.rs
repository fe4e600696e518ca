//! Wraps a speech-recognition model through a narrow interface (spec §9:
//! "the coordinator borrows it through a narrow interface"), so the
//! coordinator never depends on which engine backs it. The shipped
//! implementation shells out to a whisper-compatible CLI, grounded in
//! `original_source/src/transcriber.py`'s `AudioTranscriber` (same fixed
//! decoding parameters, same chunked-stream state machine), since the
//! Non-goals exclude writing a new ASR engine.

use crate::errors::CoordinatorError;
use crate::models::TimedSegment;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{event, Level};

/// Fixed decoding parameters per spec §4.4, applied identically to
/// whole-file and per-chunk calls.
pub(crate) struct WhisperParams {
    pub beam_size: u8,
    pub condition_on_previous_text: bool,
    pub temperature: f64,
    pub compression_ratio_threshold: f64,
    pub log_prob_threshold: f64,
    pub no_speech_threshold: f64,
    pub vad_filter: bool,
}

impl Default for WhisperParams {
    fn default() -> Self {
        Self {
            beam_size: 5,
            condition_on_previous_text: false,
            temperature: 0.1,
            compression_ratio_threshold: 2.0,
            log_prob_threshold: -0.6,
            no_speech_threshold: 0.2,
            vad_filter: false,
        }
    }
}

pub(crate) struct WholeFileResult {
    pub text: String,
    pub segments: Vec<TimedSegment>,
    pub language: Option<String>,
    pub language_probability: Option<f64>,
    pub duration_secs: f64,
}

pub(crate) struct StreamConfig {
    pub sample_rate: u32,
    pub chunk_duration_secs: f64,
    pub min_audio_duration_secs: f64,
    pub buffer_size: usize,
}

pub(crate) struct StreamResult {
    pub text: String,
    pub segments: Vec<TimedSegment>,
    pub chunks_processed: u32,
    pub stream_completed: bool,
}

#[async_trait]
pub(crate) trait SpeechRecognizer: Send + Sync {
    async fn transcribe_whole(
        &self,
        path: &Path,
        language: Option<&str>,
    ) -> Result<WholeFileResult, CoordinatorError>;

    async fn transcribe_stream(
        &self,
        pcm_reader: &mut (dyn AsyncRead + Send + Unpin),
        language: Option<&str>,
        config: &StreamConfig,
    ) -> Result<StreamResult, CoordinatorError>;
}

/// Long-lived per-worker handle: one instance is built once per worker
/// process and shared across jobs, the way `original_source`'s
/// `WhisperModel` is loaded once, not per job.
pub(crate) struct WhisperCliRecognizer {
    model: String,
    device: String,
    params: WhisperParams,
}

impl WhisperCliRecognizer {
    pub(crate) fn new(model: String, device: String) -> Self {
        Self {
            model,
            device,
            params: WhisperParams::default(),
        }
    }

    fn base_args(&self, cmd: &mut tokio::process::Command, language: Option<&str>) {
        cmd.arg("--model")
            .arg(&self.model)
            .arg("--device")
            .arg(&self.device)
            .arg("--beam-size")
            .arg(self.params.beam_size.to_string())
            .arg("--temperature")
            .arg(self.params.temperature.to_string())
            .arg("--compression-ratio-threshold")
            .arg(self.params.compression_ratio_threshold.to_string())
            .arg("--log-prob-threshold")
            .arg(self.params.log_prob_threshold.to_string())
            .arg("--no-speech-threshold")
            .arg(self.params.no_speech_threshold.to_string())
            .arg("--output-format")
            .arg("json");
        if !self.params.condition_on_previous_text {
            cmd.arg("--no-condition-on-previous-text");
        }
        if !self.params.vad_filter {
            cmd.arg("--no-vad-filter");
        }
        if let Some(lang) = language {
            cmd.arg("--language").arg(lang);
        }
    }

    fn parse_segments(&self, value: &serde_json::Value) -> Result<Vec<TimedSegment>, CoordinatorError> {
        value["segments"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|s| {
                let start = s["start"].as_f64().unwrap_or(0.0);
                let end = s["end"].as_f64().unwrap_or(start);
                let text = s["text"].as_str().unwrap_or_default().to_string();
                TimedSegment::new(start, end, text).map_err(|e| CoordinatorError::Permanent(e.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl SpeechRecognizer for WhisperCliRecognizer {
    async fn transcribe_whole(
        &self,
        path: &Path,
        language: Option<&str>,
    ) -> Result<WholeFileResult, CoordinatorError> {
        let mut cmd = tokio::process::Command::new("whisper-cli");
        self.base_args(&mut cmd, language);
        cmd.arg(path).stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .map_err(|e| CoordinatorError::Transient(format!("spawning whisper-cli failed: {e}")))?;
        if !output.status.success() {
            return Err(CoordinatorError::Permanent(format!(
                "whisper-cli exited with {}",
                output.status
            )));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| CoordinatorError::Permanent(format!("whisper-cli JSON unparseable: {e}")))?;
        let segments = self.parse_segments(&parsed)?;

        Ok(WholeFileResult {
            text: parsed["text"].as_str().unwrap_or_default().to_string(),
            segments,
            language: parsed["language"].as_str().map(str::to_string),
            language_probability: parsed["language_probability"].as_f64(),
            duration_secs: parsed["duration"].as_f64().unwrap_or(0.0),
        })
    }

    async fn transcribe_stream(
        &self,
        pcm_reader: &mut (dyn AsyncRead + Send + Unpin),
        language: Option<&str>,
        config: &StreamConfig,
    ) -> Result<StreamResult, CoordinatorError> {
        // Step 1: consume and discard the first 44 bytes (WAV header). A
        // short read here (source under 44 bytes) ends the stream
        // immediately with an empty, incomplete result.
        let mut header = [0u8; 44];
        if let Err(e) = pcm_reader.read_exact(&mut header).await {
            event!(Level::DEBUG, "PCM stream shorter than the WAV header: {e}");
            return Ok(StreamResult {
                text: String::new(),
                segments: Vec::new(),
                chunks_processed: 0,
                stream_completed: false,
            });
        }

        let bytes_per_second = f64::from(config.sample_rate) * 2.0;
        let chunk_size_bytes = (config.chunk_duration_secs * bytes_per_second) as usize;
        let min_bytes = (config.min_audio_duration_secs * bytes_per_second) as usize;

        let mut buffer: Vec<u8> = Vec::with_capacity(chunk_size_bytes);
        let mut read_buf = vec![0u8; config.buffer_size];
        let mut time_offset = 0.0_f64;
        let mut text = String::new();
        let mut segments = Vec::new();
        let mut chunks_processed = 0u32;
        let mut stream_completed = true;

        loop {
            match pcm_reader.read(&mut read_buf).await {
                Ok(0) => break,
                Ok(n) => buffer.extend_from_slice(&read_buf[..n]),
                Err(e) => {
                    // Spec §4.4 step 6: a broken pipe on read terminates the
                    // stream cleanly with stream_completed = false. This
                    // diverges deliberately from the Python source, which
                    // sets stream_completed unconditionally true regardless
                    // of break reason; the spec is explicit here, so it
                    // takes precedence (see DESIGN.md).
                    event!(Level::WARN, "Broken pipe reading PCM stream: {e}");
                    stream_completed = false;
                    break;
                }
            }

            while buffer.len() >= chunk_size_bytes {
                let chunk: Vec<u8> = buffer.drain(..chunk_size_bytes).collect();
                let (chunk_text, chunk_segments) =
                    self.transcribe_pcm_chunk(&chunk, config.sample_rate, language, time_offset).await?;
                if !text.is_empty() && !chunk_text.is_empty() {
                    text.push(' ');
                }
                text.push_str(&chunk_text);
                segments.extend(chunk_segments);
                chunks_processed += 1;
                time_offset += config.chunk_duration_secs;
            }
        }

        if stream_completed && buffer.len() >= min_bytes && !buffer.is_empty() {
            let (chunk_text, chunk_segments) =
                self.transcribe_pcm_chunk(&buffer, config.sample_rate, language, time_offset).await?;
            if !text.is_empty() && !chunk_text.is_empty() {
                text.push(' ');
            }
            text.push_str(&chunk_text);
            segments.extend(chunk_segments);
            chunks_processed += 1;
        }

        Ok(StreamResult {
            text,
            segments,
            chunks_processed,
            stream_completed,
        })
    }
}

impl WhisperCliRecognizer {
    /// Submits one chunk window of raw little-endian 16-bit PCM to the CLI
    /// over stdin, shifting returned segment timestamps by `time_offset`.
    async fn transcribe_pcm_chunk(
        &self,
        pcm: &[u8],
        sample_rate: u32,
        language: Option<&str>,
        time_offset: f64,
    ) -> Result<(String, Vec<TimedSegment>), CoordinatorError> {
        let mut cmd = tokio::process::Command::new("whisper-cli");
        self.base_args(&mut cmd, language);
        cmd.arg("--input-format")
            .arg("s16le")
            .arg("--input-sample-rate")
            .arg(sample_rate.to_string())
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| CoordinatorError::Transient(format!("spawning whisper-cli chunk failed: {e}")))?;

        {
            use tokio::io::AsyncWriteExt;
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| CoordinatorError::Permanent("whisper-cli produced no stdin handle".into()))?;
            stdin
                .write_all(pcm)
                .await
                .map_err(|e| CoordinatorError::Transient(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CoordinatorError::Transient(format!("waiting on whisper-cli chunk failed: {e}")))?;
        if !output.status.success() {
            return Err(CoordinatorError::Permanent(format!(
                "whisper-cli chunk exited with {}",
                output.status
            )));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| CoordinatorError::Permanent(format!("whisper-cli chunk JSON unparseable: {e}")))?;
        let text = parsed["text"].as_str().unwrap_or_default().to_string();
        let segments = parsed["segments"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|s| {
                let start = s["start"].as_f64().unwrap_or(0.0) + time_offset;
                let end = s["end"].as_f64().unwrap_or(start) + time_offset;
                let text = s["text"].as_str().unwrap_or_default().to_string();
                TimedSegment::new(start, end, text).map_err(|e| CoordinatorError::Permanent(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok((text, segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wav_header_under_44_bytes_yields_incomplete_empty_result() {
        let recognizer = WhisperCliRecognizer::new("small".to_string(), "cpu".to_string());
        let mut short_stream: &[u8] = &[0u8; 10];
        let config = StreamConfig {
            sample_rate: 16000,
            chunk_duration_secs: 30.0,
            min_audio_duration_secs: 5.0,
            buffer_size: 65536,
        };
        let result = recognizer
            .transcribe_stream(&mut short_stream, None, &config)
            .await
            .expect("short stream does not error");
        assert!(result.text.is_empty());
        assert_eq!(result.chunks_processed, 0);
        assert!(!result.stream_completed);
    }

    #[tokio::test]
    async fn residual_shorter_than_min_audio_duration_yields_zero_chunks_but_completes() {
        let recognizer = WhisperCliRecognizer::new("small".to_string(), "cpu".to_string());
        // 44-byte WAV header followed by far less than `min_audio_duration_secs`
        // worth of PCM: the stream ends cleanly with no chunk submitted.
        let mut stream: &[u8] = &[0u8; 44 + 100];
        let config = StreamConfig {
            sample_rate: 16000,
            chunk_duration_secs: 30.0,
            min_audio_duration_secs: 5.0,
            buffer_size: 65536,
        };
        let result = recognizer
            .transcribe_stream(&mut stream, None, &config)
            .await
            .expect("short residual does not error");
        assert_eq!(result.chunks_processed, 0);
        assert!(result.stream_completed);
        assert!(result.text.is_empty());
    }
}
