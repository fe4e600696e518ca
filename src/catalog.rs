//! Thin typed layer over the external catalog's REST API, grounded in
//! `original_source/src/notion_client.py`'s property-dict construction. The
//! core never hard-codes column names; callers resolve them through a
//! job-specific `FieldMap` and dispatch to the builder keyed by the
//! logical key's implied type (spec §4.6/§9).

use crate::errors::CoordinatorError;
use crate::models::{CatalogPage, FieldType};
use tracing::{event, Level};

const NOTION_VERSION: &str = "2022-06-28";
const RICH_TEXT_LIMIT: usize = 2000;

#[derive(Clone)]
pub(crate) struct CatalogClient {
    http: reqwest::Client,
    token: String,
    discord_message_db_id: String,
    videos_db_id: String,
}

impl CatalogClient {
    pub(crate) fn new(
        http: reqwest::Client,
        token: String,
        discord_message_db_id: String,
        videos_db_id: String,
    ) -> Self {
        Self {
            http,
            token,
            discord_message_db_id,
            videos_db_id,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("https://api.notion.com/v1{path}"))
            .bearer_auth(&self.token)
            .header("Notion-Version", NOTION_VERSION)
    }

    pub(crate) async fn get_page(&self, page_id: &str) -> Result<serde_json::Value, CoordinatorError> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/pages/{page_id}"))
            .send()
            .await
            .map_err(|e| CoordinatorError::Transient(e.to_string()))?;
        handle_json(resp, "get_page").await
    }

    pub(crate) async fn create_page(
        &self,
        database_id: &str,
        properties: serde_json::Value,
    ) -> Result<CatalogPage, CoordinatorError> {
        let body = serde_json::json!({
            "parent": { "database_id": database_id },
            "properties": properties,
        });
        let resp = self
            .request(reqwest::Method::POST, "/pages")
            .json(&body)
            .send()
            .await
            .map_err(|e| CoordinatorError::Transient(e.to_string()))?;
        let parsed = handle_json(resp, "create_page").await?;
        page_from_json(&parsed)
    }

    pub(crate) async fn update_properties(
        &self,
        page_id: &str,
        properties: serde_json::Value,
    ) -> Result<(), CoordinatorError> {
        let body = serde_json::json!({ "properties": properties });
        let resp = self
            .request(reqwest::Method::PATCH, &format!("/pages/{page_id}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoordinatorError::Transient(e.to_string()))?;
        handle_json(resp, "update_properties").await.map(|_| ())
    }

    /// Splits `text` at whitespace boundaries into chunks of at most
    /// `RICH_TEXT_LIMIT` characters and appends a single collapsible block
    /// titled "Transcript" containing those chunks as paragraphs.
    pub(crate) async fn append_transcript_toggle(
        &self,
        page_id: &str,
        text: &str,
    ) -> Result<(), CoordinatorError> {
        let chunks = chunk_at_whitespace(text, RICH_TEXT_LIMIT);
        let paragraphs: Vec<serde_json::Value> = chunks
            .into_iter()
            .map(|chunk| {
                serde_json::json!({
                    "object": "block",
                    "type": "paragraph",
                    "paragraph": { "rich_text": [ rich_text_fragment(&chunk) ] },
                })
            })
            .collect();

        let body = serde_json::json!({
            "children": [{
                "object": "block",
                "type": "toggle",
                "toggle": {
                    "rich_text": [ rich_text_fragment("Transcript") ],
                    "children": paragraphs,
                },
            }],
        });

        let resp = self
            .request(reqwest::Method::PATCH, &format!("/blocks/{page_id}/children"))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoordinatorError::Transient(e.to_string()))?;
        handle_json(resp, "append_transcript_toggle").await.map(|_| ())
    }

    /// Queries the two well-known destination databases filtering on the URL
    /// column and returns the first match, with `has_transcript` derived
    /// from whether either transcript column is non-empty.
    pub(crate) async fn find_by_url(
        &self,
        video_url: &str,
    ) -> Result<Option<CatalogPage>, CoordinatorError> {
        for database_id in [&self.videos_db_id, &self.discord_message_db_id] {
            let body = serde_json::json!({
                "filter": {
                    "property": "Video Link",
                    "url": { "equals": video_url },
                },
            });
            let resp = self
                .request(reqwest::Method::POST, &format!("/databases/{database_id}/query"))
                .json(&body)
                .send()
                .await
                .map_err(|e| CoordinatorError::Transient(e.to_string()))?;
            let parsed = handle_json(resp, "find_by_url").await?;
            if let Some(first) = parsed["results"].as_array().and_then(|a| a.first()) {
                return Ok(Some(page_from_json(first)?));
            }
        }
        Ok(None)
    }
}

async fn handle_json(
    resp: reqwest::Response,
    op: &str,
) -> Result<serde_json::Value, CoordinatorError> {
    let status = resp.status();
    if status.as_u16() == 429 || status.is_server_error() {
        return Err(CoordinatorError::Transient(format!("{op} returned {status}")));
    }
    if !status.is_success() {
        return Err(CoordinatorError::Permanent(format!("{op} returned {status}")));
    }
    resp.json()
        .await
        .map_err(|e| CoordinatorError::Transient(e.to_string()))
}

fn page_from_json(value: &serde_json::Value) -> Result<CatalogPage, CoordinatorError> {
    let id = value["id"]
        .as_str()
        .ok_or_else(|| CoordinatorError::Permanent("page response missing id".into()))?
        .to_string();
    let url = value["url"].as_str().unwrap_or_default().to_string();
    let props = &value["properties"];
    let has_transcript = property_is_nonempty(&props["Transcript File"])
        || property_is_nonempty(&props["Transcript SRT File"]);
    Ok(CatalogPage {
        id,
        url,
        has_transcript,
    })
}

fn property_is_nonempty(prop: &serde_json::Value) -> bool {
    prop["files"]
        .as_array()
        .is_some_and(|files| !files.is_empty())
}

fn rich_text_fragment(content: &str) -> serde_json::Value {
    serde_json::json!({ "type": "text", "text": { "content": content } })
}

fn chunk_at_whitespace(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let candidate_len = current.len() + usize::from(!current.is_empty()) + word.len();
        if candidate_len > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}

/// Truncate rich text to 2000 characters, the Notion property limit.
pub(crate) fn build_text(value: &str) -> serde_json::Value {
    let truncated: String = value.chars().take(RICH_TEXT_LIMIT).collect();
    serde_json::json!({ "rich_text": [ rich_text_fragment(&truncated) ] })
}

pub(crate) fn build_title(value: &str) -> serde_json::Value {
    serde_json::json!({ "title": [ rich_text_fragment(value) ] })
}

pub(crate) fn build_url(value: &str) -> serde_json::Value {
    serde_json::json!({ "url": value })
}

pub(crate) fn build_file(name: &str, url: &str) -> serde_json::Value {
    serde_json::json!({
        "files": [{ "name": name, "type": "external", "external": { "url": url } }],
    })
}

pub(crate) fn build_select(value: &str) -> serde_json::Value {
    serde_json::json!({ "select": { "name": value } })
}

/// Date (start only).
pub(crate) fn build_date(value: &str) -> serde_json::Value {
    serde_json::json!({ "date": { "start": value } })
}

pub(crate) fn build_number(value: f64) -> serde_json::Value {
    serde_json::json!({ "number": value })
}

/// Dispatches to the correct builder for a logical key's implied type. The
/// value is always passed pre-rendered to a string by the caller — `Number`
/// parses it back out, defaulting to zero if unparseable; unknown-type
/// dispatch is unreachable by construction since `FieldType` is exhaustive
/// here.
pub(crate) fn build_property(field_type: FieldType, text: &str) -> serde_json::Value {
    match field_type {
        FieldType::Title => build_title(text),
        FieldType::Text => build_text(text),
        FieldType::Url => build_url(text),
        FieldType::File => build_file(text, text),
        FieldType::Select => build_select(text),
        FieldType::Date => build_date(text),
        FieldType::Number => build_number(text.parse().unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_at_whitespace_respects_limit() {
        let text = "a".repeat(5).to_string() + " " + &"b".repeat(1996);
        let chunks = chunk_at_whitespace(&text, 2000);
        assert!(chunks.iter().all(|c| c.len() <= 2000));
    }

    #[test]
    fn build_text_truncates_to_2000_chars() {
        let long = "x".repeat(3000);
        let built = build_text(&long);
        let content = built["rich_text"][0]["text"]["content"].as_str().unwrap();
        assert_eq!(content.chars().count(), 2000);
    }

    #[test]
    fn build_property_number_parses_text_and_defaults_on_garbage() {
        let built = build_property(FieldType::Number, "125.5");
        assert_eq!(built["number"].as_f64(), Some(125.5));
        let garbage = build_property(FieldType::Number, "not-a-number");
        assert_eq!(garbage["number"].as_f64(), Some(0.0));
    }

    #[test]
    fn property_is_nonempty_checks_files_array() {
        let empty = serde_json::json!({ "files": [] });
        let filled = serde_json::json!({ "files": [{"name": "t.txt"}] });
        assert!(!property_is_nonempty(&empty));
        assert!(property_is_nonempty(&filled));
    }
}
