//! Plain data types shared across the pipeline. Ported from
//! `original_source/src/models.py`'s dataclasses using Rust idioms:
//! `Option<T>` for nullable fields, enums instead of string tags, and
//! invariant checks in constructors instead of post-hoc validation.

use std::path::PathBuf;

/// One inbound request, already canonicalized from whichever alias names the
/// submitter used.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct Submission {
    pub notion_page_id: String,
    pub video_url: String,
    pub channel_name: String,
    pub parent_drive_folder_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) enum Availability {
    Public,
    Unlisted,
}

impl Availability {
    /// The catalog's "listing status" value derived from availability.
    pub(crate) fn listing_status(self) -> &'static str {
        match self {
            Availability::Public => "Public",
            Availability::Unlisted => "Unlisted",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct VideoInfo {
    pub title: String,
    pub safe_title: String,
    /// `YYYY-MM-DD`.
    pub upload_date: String,
    pub video_id: String,
    pub channel: String,
    pub duration_secs: f64,
    pub availability: Availability,
    pub resolution: Option<String>,
    pub url: String,
}

/// Replace any character outside `[A-Za-z0-9 _-]` with `_`, mirroring
/// `original_source/utils/helpers.py::sanitize_filename`.
pub(crate) fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl VideoInfo {
    pub(crate) fn from_parts(
        url: String,
        title: String,
        upload_date: String,
        video_id: String,
        channel: String,
        duration_secs: f64,
        availability: Availability,
        resolution: Option<String>,
    ) -> anyhow::Result<Self> {
        if title.trim().is_empty() {
            anyhow::bail!("video title must not be empty");
        }
        if chrono::NaiveDate::parse_from_str(&upload_date, "%Y-%m-%d").is_err() {
            anyhow::bail!("upload date '{upload_date}' is not parseable as YYYY-MM-DD");
        }
        Ok(Self {
            safe_title: sanitize(&title),
            title,
            upload_date,
            video_id,
            channel,
            duration_secs,
            availability,
            resolution,
            url,
        })
    }

    /// `"{date} - {safe_title}"`, the stem every scratch artifact shares.
    pub(crate) fn filename_stem(&self) -> String {
        format!("{} - {}", self.upload_date, self.safe_title)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) enum MediaKind {
    Video,
    Audio,
    TranscriptText,
    TranscriptSubtitles,
    Link,
}

#[derive(Debug, Clone)]
pub(crate) struct MediaFile {
    pub path: PathBuf,
    pub filename: String,
    pub kind: MediaKind,
}

impl MediaFile {
    pub(crate) fn new(path: PathBuf, kind: MediaKind) -> Self {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            filename,
            kind,
        }
    }

    pub(crate) fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// One transcribed span. Construction enforces `start <= end`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub(crate) struct TimedSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl TimedSegment {
    pub(crate) fn new(start: f64, end: f64, text: String) -> anyhow::Result<Self> {
        if start > end {
            anyhow::bail!("segment start ({start}) must not exceed end ({end})");
        }
        Ok(Self { start, end, text })
    }
}

/// Accumulates transcript state across whole-file or chunked-stream calls
/// for the duration of exactly one job.
#[derive(Debug, Clone, Default)]
pub(crate) struct TranscriptionAccumulator {
    pub text: String,
    pub segments: Vec<TimedSegment>,
    pub chunks_processed: u32,
    pub stream_completed: bool,
    pub language: Option<String>,
    pub language_probability: Option<f64>,
}

impl TranscriptionAccumulator {
    /// Appends a chunk's text and segments. Segments are assumed already
    /// time-shifted by the caller; this only asserts the ordering invariant
    /// holds (never reorders).
    pub(crate) fn push_chunk(&mut self, text: &str, segments: Vec<TimedSegment>) {
        if !self.text.is_empty() && !text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(text);
        self.segments.extend(segments);
        self.chunks_processed += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) enum FieldType {
    Title,
    Text,
    Url,
    File,
    Select,
    Date,
    Number,
}

/// One row of a channel policy's field map: a logical key the coordinator
/// refers to internally, the catalog column name it is written to, and the
/// implied wire type.
#[derive(Debug, Clone)]
pub(crate) struct FieldMapEntry {
    pub logical_key: &'static str,
    pub column_name: &'static str,
    pub field_type: FieldType,
}

/// Ordered `logical_key -> (column_name, implied_type)`. Built once at
/// startup; every logical key appears at most once, checked in
/// `ChannelPolicy` construction.
#[derive(Debug, Clone, Default)]
pub(crate) struct FieldMap(pub Vec<FieldMapEntry>);

impl FieldMap {
    pub(crate) fn new(entries: Vec<FieldMapEntry>) -> anyhow::Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.logical_key) {
                anyhow::bail!("duplicate logical key '{}' in field map", entry.logical_key);
            }
        }
        Ok(Self(entries))
    }

    pub(crate) fn get(&self, logical_key: &str) -> Option<&FieldMapEntry> {
        self.0.iter().find(|e| e.logical_key == logical_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    CreateNew,
    UpdateExisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TitleFormat {
    Default,
    YouTube,
}

impl TitleFormat {
    pub(crate) fn render(self, date: &str, title: &str) -> String {
        match self {
            TitleFormat::Default => format!("{date} - {title}"),
            TitleFormat::YouTube => format!("YouTube Video: {title}"),
        }
    }
}

/// Static, per-channel configuration resolved once at startup and never
/// mutated. `action = CreateNew` implies `destination_id.is_some()`,
/// enforced by `ChannelPolicy::new`.
#[derive(Debug, Clone)]
pub(crate) struct ChannelPolicy {
    pub channel_name: String,
    pub action: Action,
    pub destination_id: Option<String>,
    pub folder_id: String,
    pub field_map: std::sync::Arc<FieldMap>,
    pub status_value: &'static str,
    pub title_format: TitleFormat,
    pub skip_compression: bool,
}

impl ChannelPolicy {
    pub(crate) fn new(
        channel_name: String,
        action: Action,
        destination_id: Option<String>,
        folder_id: String,
        field_map: FieldMap,
        status_value: &'static str,
        title_format: TitleFormat,
        skip_compression: bool,
    ) -> anyhow::Result<Self> {
        if action == Action::CreateNew && destination_id.is_none() {
            anyhow::bail!(
                "channel policy '{channel_name}' has action=create-new but no destination_id"
            );
        }
        Ok(Self {
            channel_name,
            action,
            destination_id,
            folder_id,
            field_map: std::sync::Arc::new(field_map),
            status_value,
            title_format,
            skip_compression,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
}

/// One row of the external catalog, referenced by id. The core never reads
/// its full property map back; it only needs the id, URL, and whether a
/// transcript has already been attached.
#[derive(Debug, Clone)]
pub(crate) struct CatalogPage {
    pub id: String,
    pub url: String,
    pub has_transcript: bool,
}
