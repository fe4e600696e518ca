//! Writes the plain-text transcript and time-coded subtitle file to local
//! scratch from accumulated segments, grounded in
//! `original_source/src/models.py`'s `TranscriptionResult.save`/`save_srt`.

use crate::models::{MediaFile, MediaKind, TimedSegment};
use std::path::Path;

/// Plain text, UTF-8, trailing whitespace trimmed, no BOM. Always produced,
/// even for a zero-segment transcription (spec §8 boundary behavior).
pub(crate) async fn write_transcript_text(
    scratch_dir: &Path,
    stem: &str,
    text: &str,
) -> anyhow::Result<MediaFile> {
    let path = scratch_dir.join(format!("{stem}.txt"));
    tokio::fs::write(&path, text.trim_end()).await?;
    Ok(MediaFile::new(path, MediaKind::TranscriptText))
}

/// `HH:MM:SS,mmm`, truncating (not rounding) to millisecond resolution.
fn format_timestamp(seconds: f64) -> String {
    let total_millis = (seconds * 1000.0).max(0.0) as i64;
    let millis = total_millis % 1000;
    let total_secs = total_millis / 1000;
    let secs = total_secs % 60;
    let total_mins = total_secs / 60;
    let mins = total_mins % 60;
    let hours = total_mins / 60;
    format!("{hours:02}:{mins:02}:{secs:02},{millis:03}")
}

/// Writes the SRT file only when at least one segment exists; a blank line
/// separates entries, indices are 1-based.
pub(crate) async fn write_subtitles(
    scratch_dir: &Path,
    stem: &str,
    segments: &[TimedSegment],
) -> anyhow::Result<Option<MediaFile>> {
    if segments.is_empty() {
        return Ok(None);
    }

    let mut out = String::new();
    for (idx, segment) in segments.iter().enumerate() {
        out.push_str(&(idx + 1).to_string());
        out.push('\n');
        out.push_str(&format_timestamp(segment.start));
        out.push_str(" --> ");
        out.push_str(&format_timestamp(segment.end));
        out.push('\n');
        out.push_str(segment.text.trim());
        out.push('\n');
        if idx + 1 != segments.len() {
            out.push('\n');
        }
    }

    let path = scratch_dir.join(format!("{stem}.srt"));
    tokio::fs::write(&path, out).await?;
    Ok(Some(MediaFile::new(path, MediaKind::TranscriptSubtitles)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_timestamp_with_millisecond_precision() {
        assert_eq!(format_timestamp(0.0), "00:00:00,000");
        assert_eq!(format_timestamp(3661.234), "01:01:01,234");
    }

    #[tokio::test]
    async fn zero_segments_produces_no_srt_file() {
        let dir = std::env::temp_dir().join(format!("assembler-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.expect("create scratch dir");
        let result = write_subtitles(&dir, "stem", &[]).await.expect("no error");
        assert!(result.is_none());
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn zero_segment_transcript_still_writes_txt() {
        let dir = std::env::temp_dir().join(format!("assembler-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.expect("create scratch dir");
        let media = write_transcript_text(&dir, "stem", "")
            .await
            .expect("writes even when empty");
        assert!(media.exists());
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
