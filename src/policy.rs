//! The channel policy table: a static `Vec<ChannelPolicy>` built once at
//! startup from a literal base policy plus per-channel overrides and
//! env-sourced folder ids, generalizing the `_VIDEOS_DB_BASE_CONFIG` spread
//! named in spec §9 into data merged once rather than dispatched per job.

use crate::config::Config;
use crate::models::{
    Action, ChannelPolicy, FieldMap, FieldMapEntry, FieldType, TitleFormat,
};

/// Logical keys the coordinator publishes by. Declared once so call sites
/// and field maps agree on spelling.
pub(crate) mod keys {
    pub(crate) const TITLE: &str = "title";
    pub(crate) const DATE: &str = "date";
    pub(crate) const VIDEO_URL: &str = "video_url";
    pub(crate) const LIVE_VIDEO_URL: &str = "live_video_url";
    pub(crate) const VIDEO_FILE_LINK: &str = "video_file_link";
    pub(crate) const AUDIO_FILE_LINK: &str = "audio_file_link";
    pub(crate) const TRANSCRIPT_FILE: &str = "transcript_file";
    pub(crate) const TRANSCRIPT_SRT_FILE: &str = "transcript_srt_file";
    pub(crate) const TRANSCRIPT_TEXT_INLINE: &str = "transcript_text_inline";
    pub(crate) const DURATION: &str = "duration";
    pub(crate) const DISCORD_CHANNEL: &str = "discord_channel";
    pub(crate) const STATUS: &str = "status";
    pub(crate) const PROCESS_ERRORS: &str = "process_errors";
    pub(crate) const YOUTUBE_LISTING_STATUS: &str = "youtube_listing_status";
}

/// Fields every policy carries unless an override drops them. Mirrors
/// `DESTINATION_DB_FIELDS`/`verify_notion_properties.py`'s required
/// properties (`Audio File Link`: url, `Transcript File`/`Transcript SRT
/// File`: files).
fn base_entries() -> Vec<FieldMapEntry> {
    vec![
        FieldMapEntry {
            logical_key: keys::TITLE,
            column_name: "Name",
            field_type: FieldType::Title,
        },
        FieldMapEntry {
            logical_key: keys::DATE,
            column_name: "Date",
            field_type: FieldType::Date,
        },
        FieldMapEntry {
            // Column name carries the source project's own typo verbatim;
            // both policies' catalog databases use this spelling.
            logical_key: keys::VIDEO_FILE_LINK,
            column_name: "Video FIle Link",
            field_type: FieldType::Url,
        },
        FieldMapEntry {
            logical_key: keys::AUDIO_FILE_LINK,
            column_name: "Audio File Link",
            field_type: FieldType::Url,
        },
        FieldMapEntry {
            logical_key: keys::TRANSCRIPT_FILE,
            column_name: "Transcript File",
            field_type: FieldType::File,
        },
        FieldMapEntry {
            logical_key: keys::TRANSCRIPT_SRT_FILE,
            column_name: "Transcript SRT File",
            field_type: FieldType::File,
        },
        FieldMapEntry {
            logical_key: keys::TRANSCRIPT_TEXT_INLINE,
            column_name: "Transcript Text",
            field_type: FieldType::Text,
        },
        FieldMapEntry {
            logical_key: keys::DURATION,
            column_name: "Duration",
            field_type: FieldType::Number,
        },
    ]
}

/// Merge a base field map with per-channel overrides: overrides replace an
/// entry sharing the same logical key, otherwise they are appended. This is
/// the Rust expression of the source's base-config-spread pattern — merged
/// once here, not recomputed per job.
fn merge(base: Vec<FieldMapEntry>, overrides: Vec<FieldMapEntry>) -> anyhow::Result<FieldMap> {
    let mut merged = base;
    for over in overrides {
        if let Some(slot) = merged
            .iter_mut()
            .find(|e| e.logical_key == over.logical_key)
        {
            *slot = over;
        } else {
            merged.push(over);
        }
    }
    FieldMap::new(merged)
}

/// Builds the full channel policy table. Called once from `main`.
pub(crate) fn build_policy_table(config: &Config) -> anyhow::Result<Vec<ChannelPolicy>> {
    let videos_field_map = merge(
        base_entries(),
        vec![
            FieldMapEntry {
                logical_key: keys::VIDEO_URL,
                column_name: "Video Link",
                field_type: FieldType::Url,
            },
            FieldMapEntry {
                logical_key: keys::YOUTUBE_LISTING_STATUS,
                column_name: "Listing Status",
                field_type: FieldType::Select,
            },
            FieldMapEntry {
                logical_key: keys::DISCORD_CHANNEL,
                column_name: "Source Channel",
                field_type: FieldType::Select,
            },
        ],
    )?;

    let market_outlook = ChannelPolicy::new(
        "market-outlook".to_string(),
        Action::CreateNew,
        Some(config.videos_db_id.clone()),
        std::env::var("DRIVE_FOLDER_MARKET_OUTLOOK").unwrap_or_default(),
        videos_field_map,
        "Complete",
        TitleFormat::Default,
        false,
    )?;

    // Per open question 2 (spec §9): the audit-process branch omits
    // `video_url`/`live_video_url` from its published fields entirely,
    // rather than writing them as null — Discord chat attachments have no
    // video-host URL to report. See DESIGN.md for the recorded decision.
    let audit_process_field_map = merge(
        base_entries(),
        vec![
            FieldMapEntry {
                logical_key: keys::STATUS,
                column_name: "Transcript Process Status",
                field_type: FieldType::Select,
            },
            FieldMapEntry {
                logical_key: keys::PROCESS_ERRORS,
                column_name: "ProcessErrors",
                field_type: FieldType::Text,
            },
        ],
    )?;

    let audit_process = ChannelPolicy::new(
        "audit-process".to_string(),
        Action::UpdateExisting,
        None,
        std::env::var("DRIVE_FOLDER_AUDIT_PROCESS").unwrap_or_default(),
        audit_process_field_map,
        "Complete",
        TitleFormat::Default,
        true,
    )?;

    Ok(vec![market_outlook, audit_process])
}

/// Pure lookup by channel name.
pub(crate) fn lookup<'a>(table: &'a [ChannelPolicy], channel_name: &str) -> Option<&'a ChannelPolicy> {
    table.iter().find(|p| p.channel_name == channel_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overrides_replace_matching_keys_and_append_others() {
        let base = base_entries();
        let overrides = vec![FieldMapEntry {
            logical_key: keys::TITLE,
            column_name: "Overridden Name",
            field_type: FieldType::Title,
        }];
        let merged = merge(base, overrides).expect("merge succeeds");
        let title_entry = merged.get(keys::TITLE).expect("title present");
        assert_eq!(title_entry.column_name, "Overridden Name");
    }

    #[test]
    fn create_new_without_destination_id_is_rejected() {
        let fm = FieldMap::new(base_entries()).expect("field map builds");
        let err = ChannelPolicy::new(
            "broken".to_string(),
            Action::CreateNew,
            None,
            String::new(),
            fm,
            "Complete",
            TitleFormat::Default,
            false,
        );
        assert!(err.is_err());
    }
}
