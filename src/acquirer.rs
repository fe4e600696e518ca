//! Media acquisition: two modes per spec §4.3, grounded in the teacher's
//! `download_video` (process spawning with piped stdio, `.env_clear()`,
//! client-spoofing flags) generalized from one `Command::output()` call into
//! two piped children, plus `original_source/src/discord_client.py` and
//! `discord_downloader.py` for Mode B's URL shape and chunked-download
//! behavior.

use crate::errors::CoordinatorError;
use crate::models::{Availability, MediaFile, MediaKind, VideoInfo};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{event, Level};

const YT_DLP_PLAYER_CLIENTS: &[&str] = &["android", "ios", "tv"];
const YT_DLP_USER_AGENT: &str =
    "Mozilla/5.0 (Linux; Android 10) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Mobile Safari/537.36";

fn yt_dlp_base_args(cmd: &mut tokio::process::Command) {
    cmd.env_clear()
        .arg("--no-warnings")
        .arg("--force-ipv4")
        .arg("--socket-timeout")
        .arg("20")
        .arg("--retries")
        .arg("10")
        .arg("--extractor-args")
        .arg(format!("youtube:player_client={}", YT_DLP_PLAYER_CLIENTS.join(",")))
        .arg("--user-agent")
        .arg(YT_DLP_USER_AGENT);
}

/// Metadata probe: `yt-dlp --dump-json --skip-download`.
pub(crate) async fn probe_video_info(channel: &str, url: &str) -> Result<VideoInfo, CoordinatorError> {
    let mut cmd = tokio::process::Command::new("yt-dlp");
    yt_dlp_base_args(&mut cmd);
    cmd.arg("--dump-json")
        .arg("--skip-download")
        .arg(url)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = cmd
        .output()
        .await
        .map_err(|e| CoordinatorError::Transient(format!("spawning yt-dlp info probe failed: {e}")))?;
    if !output.status.success() {
        return Err(CoordinatorError::Permanent(format!(
            "yt-dlp info probe exited with {}",
            output.status
        )));
    }

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| CoordinatorError::Permanent(format!("yt-dlp info JSON unparseable: {e}")))?;

    let title = parsed["title"].as_str().unwrap_or("Unknown Title").to_string();
    let upload_date = parsed["upload_date"]
        .as_str()
        .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y%m%d").ok())
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| chrono::Utc::now().format("%Y-%m-%d").to_string());
    let video_id = parsed["id"].as_str().unwrap_or_default().to_string();
    let duration_secs = parsed["duration"].as_f64().unwrap_or(0.0);
    let availability = match parsed["availability"].as_str() {
        Some("public") => Availability::Public,
        _ => Availability::Unlisted,
    };
    let resolution = parsed["resolution"].as_str().map(str::to_string);

    VideoInfo::from_parts(
        url.to_string(),
        title,
        upload_date,
        video_id,
        channel.to_string(),
        duration_secs,
        availability,
        resolution,
    )
    .map_err(|e| CoordinatorError::Permanent(e.to_string()))
}

/// Handle bundle returned by `stream_and_capture`: both spawned children and
/// the PCM read end, so the caller can drive transcription while the
/// transcoder is still writing the container file.
pub(crate) struct StreamPipeline {
    pub extractor: tokio::process::Child,
    pub transcoder: tokio::process::Child,
    pub pcm_reader: tokio::process::ChildStdout,
    pub scratch_video_path: PathBuf,
}

impl StreamPipeline {
    /// Tears down both children: the transcoder first (closing the PCM end
    /// it owns), then the extractor, escalating to a kill after a short
    /// timeout, per spec §4.3/§9's "supervising routine" note.
    pub(crate) async fn shutdown(mut self) {
        for child in [&mut self.transcoder, &mut self.extractor] {
            if tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
                .await
                .is_err()
            {
                let _ = child.kill().await;
            }
        }
    }
}

/// Spawns the extractor and transcoder wired stdout -> stdin. The transcoder
/// writes a codec-copy Matroska file to `scratch_video_path` and
/// simultaneously emits 16 kHz mono 16-bit PCM on its own stdout.
pub(crate) async fn stream_and_capture(
    url: &str,
    scratch_dir: &Path,
    stem: &str,
    sample_rate: u32,
) -> Result<StreamPipeline, CoordinatorError> {
    let scratch_video_path = scratch_dir.join(format!("{stem}.mkv"));

    let mut extractor_cmd = tokio::process::Command::new("yt-dlp");
    yt_dlp_base_args(&mut extractor_cmd);
    extractor_cmd
        .arg("-f")
        .arg("bv*+ba/b")
        .arg("-o")
        .arg("-")
        .arg(url)
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut extractor = extractor_cmd
        .spawn()
        .map_err(|e| CoordinatorError::Transient(format!("spawning yt-dlp extractor failed: {e}")))?;
    let mut extractor_stdout = extractor
        .stdout
        .take()
        .ok_or_else(|| CoordinatorError::Permanent("extractor produced no stdout handle".into()))?;

    let mut transcoder_cmd = tokio::process::Command::new("ffmpeg");
    transcoder_cmd
        .arg("-y")
        .arg("-i")
        .arg("pipe:0")
        .arg("-c")
        .arg("copy")
        .arg(&scratch_video_path)
        .arg("-f")
        .arg("s16le")
        .arg("-ac")
        .arg("1")
        .arg("-ar")
        .arg(sample_rate.to_string())
        .arg("pipe:1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut transcoder = transcoder_cmd
        .spawn()
        .map_err(|e| CoordinatorError::Transient(format!("spawning ffmpeg transcoder failed: {e}")))?;
    let mut transcoder_stdin = transcoder
        .stdin
        .take()
        .ok_or_else(|| CoordinatorError::Permanent("transcoder produced no stdin handle".into()))?;
    let pcm_reader = transcoder
        .stdout
        .take()
        .ok_or_else(|| CoordinatorError::Permanent("transcoder produced no stdout handle".into()))?;

    // Pump the extractor's stdout into the transcoder's stdin on a detached
    // task; dropping `transcoder_stdin` on copy completion (EOF or error)
    // signals the transcoder the way a closed pipe would natively.
    tokio::spawn(async move {
        let _ = tokio::io::copy(&mut extractor_stdout, &mut transcoder_stdin).await;
    });

    Ok(StreamPipeline {
        extractor,
        transcoder,
        pcm_reader,
        scratch_video_path,
    })
}

/// Fallback Mode A: two independent whole-file downloads (spec §4.8
/// FALLBACK), mirroring the teacher's single `Command::output()` shape but
/// invoked twice with different format preferences.
pub(crate) async fn download_video_whole(
    url: &str,
    scratch_dir: &Path,
    stem: &str,
) -> Result<MediaFile, CoordinatorError> {
    let output_path = scratch_dir.join(format!("{stem}.mp4"));
    let mut cmd = tokio::process::Command::new("yt-dlp");
    yt_dlp_base_args(&mut cmd);
    cmd.arg("-f")
        .arg("bv*[vcodec*=avc1]+ba[acodec*=mp4a]/b[ext=mp4]/b")
        .arg("--merge-output-format")
        .arg("mp4")
        .arg("-o")
        .arg(&output_path)
        .arg(url);

    run_to_completion(cmd, "yt-dlp video download").await?;
    Ok(MediaFile::new(output_path, MediaKind::Video))
}

pub(crate) async fn download_audio_whole(
    url: &str,
    scratch_dir: &Path,
    stem: &str,
    audio_bitrate: &str,
) -> Result<MediaFile, CoordinatorError> {
    let output_path = scratch_dir.join(format!("{stem}.mp3"));
    let mut cmd = tokio::process::Command::new("yt-dlp");
    yt_dlp_base_args(&mut cmd);
    cmd.arg("-f")
        .arg("bestaudio/best")
        .arg("--extract-audio")
        .arg("--audio-format")
        .arg("mp3")
        .arg("--audio-quality")
        .arg(audio_bitrate)
        .arg("-o")
        .arg(output_path.with_extension(""))
        .arg(url);

    run_to_completion(cmd, "yt-dlp audio download").await?;
    Ok(MediaFile::new(output_path, MediaKind::Audio))
}

/// Mode B: chat-message attachment. Parses `(guild, channel, message)` ids
/// from the URL shape already validated by the intake layer, then fetches
/// message/channel/guild objects and streams the first recognized video
/// attachment from the CDN.
pub(crate) struct ChatMessage {
    pub channel_name: String,
    pub attachment_url: String,
    pub attachment_filename: String,
}

const VIDEO_ATTACHMENT_EXTENSIONS: &[&str] =
    &[".mp4", ".mov", ".avi", ".mkv", ".webm", ".flv", ".m4v"];

fn parse_discord_message_url(url: &str) -> Option<(String, String, String)> {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"discord(?:app)?\.com/channels/(\d+)/(\d+)/(\d+)")
            .expect("static regex is valid")
    });
    let caps = re.captures(url)?;
    Some((
        caps.get(1)?.as_str().to_string(),
        caps.get(2)?.as_str().to_string(),
        caps.get(3)?.as_str().to_string(),
    ))
}

pub(crate) async fn fetch_chat_message(
    http: &reqwest::Client,
    user_token: &str,
    message_url: &str,
) -> Result<ChatMessage, CoordinatorError> {
    let (_guild_id, channel_id, message_id) = parse_discord_message_url(message_url)
        .ok_or_else(|| CoordinatorError::Validation("malformed chat-message URL".into()))?;

    let message: serde_json::Value = http
        .get(format!(
            "https://discord.com/api/v10/channels/{channel_id}/messages/{message_id}"
        ))
        .header("Authorization", user_token)
        .send()
        .await
        .map_err(|e| CoordinatorError::Transient(e.to_string()))?
        .json()
        .await
        .map_err(|e| CoordinatorError::Transient(e.to_string()))?;

    let channel: serde_json::Value = http
        .get(format!("https://discord.com/api/v10/channels/{channel_id}"))
        .header("Authorization", user_token)
        .send()
        .await
        .map_err(|e| CoordinatorError::Transient(e.to_string()))?
        .json()
        .await
        .map_err(|e| CoordinatorError::Transient(e.to_string()))?;
    let channel_name = channel["name"].as_str().unwrap_or("unknown-channel").to_string();

    let attachments = message["attachments"].as_array().cloned().unwrap_or_default();
    let attachment = attachments
        .iter()
        .find(|a| {
            a["filename"]
                .as_str()
                .map(|f| {
                    let lower = f.to_lowercase();
                    VIDEO_ATTACHMENT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
                })
                .unwrap_or(false)
        })
        .ok_or_else(|| CoordinatorError::Validation("message has no recognized video attachment".into()))?;

    Ok(ChatMessage {
        channel_name,
        attachment_url: attachment["url"].as_str().unwrap_or_default().to_string(),
        attachment_filename: attachment["filename"].as_str().unwrap_or_default().to_string(),
    })
}

/// Streams the CDN attachment to scratch with explicit timeout and chunked
/// writes, grounded in `discord_downloader.py::_download_file`'s
/// `stream=True` + 8192-byte-chunk pattern.
pub(crate) async fn download_chat_attachment(
    http: &reqwest::Client,
    message: &ChatMessage,
    scratch_dir: &Path,
    stem: &str,
) -> Result<MediaFile, CoordinatorError> {
    let ext = message
        .attachment_filename
        .rsplit_once('.')
        .map(|(_, e)| e)
        .unwrap_or("mp4");
    let output_path = scratch_dir.join(format!("{stem}.{ext}"));

    let resp = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        http.get(&message.attachment_url).send(),
    )
    .await
    .map_err(|_| CoordinatorError::Transient("chat attachment download timed out".into()))?
    .map_err(|e| CoordinatorError::Transient(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(CoordinatorError::Permanent(format!(
            "chat attachment download returned {}",
            resp.status()
        )));
    }

    let mut file = tokio::fs::File::create(&output_path)
        .await
        .map_err(|e| CoordinatorError::Permanent(e.to_string()))?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CoordinatorError::Transient(e.to_string()))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| CoordinatorError::Permanent(e.to_string()))?;
    }

    Ok(MediaFile::new(output_path, MediaKind::Video))
}

async fn run_to_completion(
    mut cmd: tokio::process::Command,
    label: &str,
) -> Result<(), CoordinatorError> {
    cmd.stdout(Stdio::null()).stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| CoordinatorError::Transient(format!("spawning {label} failed: {e}")))?;

    let mut stderr_buf = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut stderr_buf).await;
    }

    let status = child
        .wait()
        .await
        .map_err(|e| CoordinatorError::Transient(format!("waiting on {label} failed: {e}")))?;

    if !status.success() {
        event!(Level::WARN, "{label} exited with {status}: {stderr_buf}");
        return Err(CoordinatorError::BrokenPipe(format!("{label} exited with {status}")));
    }
    Ok(())
}

/// `extract_audio(video_path) -> MediaFile(audio)`: decode an MP3 at a
/// configured bitrate, no video.
pub(crate) async fn extract_audio(
    video_path: &Path,
    audio_bitrate: &str,
) -> Result<MediaFile, CoordinatorError> {
    let output_path = video_path.with_extension("mp3");
    let mut cmd = tokio::process::Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-i")
        .arg(video_path)
        .arg("-vn")
        .arg("-codec:a")
        .arg("libmp3lame")
        .arg("-b:a")
        .arg(audio_bitrate)
        .arg(&output_path);
    run_to_completion(cmd, "ffmpeg extract_audio").await?;
    Ok(MediaFile::new(output_path, MediaKind::Audio))
}

/// Re-encode H.264/CRF/preset, 30 fps cap, AAC audio, `moov` at head.
pub(crate) async fn compress_video(
    video_path: &Path,
    crf: u8,
    preset: &str,
    audio_bitrate: &str,
) -> Result<PathBuf, CoordinatorError> {
    let output_path = video_path.with_file_name(format!(
        "{}_compressed.mp4",
        video_path.file_stem().and_then(|s| s.to_str()).unwrap_or("output")
    ));
    let mut cmd = tokio::process::Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-i")
        .arg(video_path)
        .arg("-c:v")
        .arg("libx264")
        .arg("-crf")
        .arg(crf.to_string())
        .arg("-preset")
        .arg(preset)
        .arg("-r")
        .arg("30")
        .arg("-c:a")
        .arg("aac")
        .arg("-b:a")
        .arg(audio_bitrate)
        .arg("-movflags")
        .arg("+faststart")
        .arg(&output_path);
    run_to_completion(cmd, "ffmpeg compress_video").await?;
    Ok(output_path)
}

/// Codec-copy remux.
pub(crate) async fn convert_mkv_to_mp4(video_path: &Path) -> Result<PathBuf, CoordinatorError> {
    let output_path = video_path.with_extension("mp4");
    let mut cmd = tokio::process::Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-i")
        .arg(video_path)
        .arg("-c")
        .arg("copy")
        .arg(&output_path);
    run_to_completion(cmd, "ffmpeg convert_mkv_to_mp4").await?;
    Ok(output_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_discord_message_url_variants() {
        let (guild, channel, message) =
            parse_discord_message_url("https://discord.com/channels/1/2/3").expect("parses");
        assert_eq!((guild.as_str(), channel.as_str(), message.as_str()), ("1", "2", "3"));

        assert!(parse_discord_message_url("https://discordapp.com/channels/111/222/333").is_some());
        assert!(parse_discord_message_url("https://vimeo.com/1").is_none());
    }
}
