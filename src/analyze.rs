//! Single-shot object analysis.
//!
//! While the live session handles conversation, identifying the object in a
//! freshly captured frame is a one-off request/response call against the
//! non-streaming generate endpoint.

use crate::error::{LiveError, Result};
use crate::media;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

/// What the vision model saw in a captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescription {
    pub description: String,
    pub object_type: Option<String>,
}

/// Seam over the analysis backend so workflows can be tested offline.
#[async_trait]
pub trait ObjectAnalyzer: Send {
    /// Describe the object in a base64 JPEG frame.
    async fn analyze(&self, image_b64: &str) -> Result<ObjectDescription>;
}

const ANALYZE_PROMPT: &str = "Identify the single main object in this photo. Reply with JSON \
     of the form {\"description\": \"...\", \"objectType\": \"...\"} where description is one \
     short sentence and objectType is a one or two word category.";

/// REST-backed analyzer using the `generateContent` endpoint.
pub struct GeminiVisionAnalyzer {
    http: reqwest::Client,
    url: String,
}

impl GeminiVisionAnalyzer {
    pub fn new(api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!(
                "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent?key={api_key}"
            ),
        }
    }

    /// Point the analyzer at an alternate endpoint. Used by tests.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl ObjectAnalyzer for GeminiVisionAnalyzer {
    async fn analyze(&self, image_b64: &str) -> Result<ObjectDescription> {
        let body = json!({
            "contents": [{
                "parts": [
                    {"inline_data": {"mime_type": media::JPEG_MIME_TYPE, "data": image_b64}},
                    {"text": ANALYZE_PROMPT}
                ]
            }]
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LiveError::Analysis(format!("request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(LiveError::Analysis(format!("{status}: {detail}")));
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| LiveError::Analysis(format!("bad response body: {e}")))?;

        let text = value["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or("")
            .trim();
        if text.is_empty() {
            return Err(LiveError::Analysis("empty analysis response".to_string()));
        }
        debug!("analysis response: {text}");
        Ok(parse_description(text))
    }
}

/// Interpret the model's reply. JSON replies give a structured result, with
/// or without markdown fencing; anything else becomes a bare description.
fn parse_description(text: &str) -> ObjectDescription {
    let stripped = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    if let Ok(v) = serde_json::from_str::<Value>(stripped) {
        if let Some(description) = v.get("description").and_then(Value::as_str) {
            return ObjectDescription {
                description: description.to_string(),
                object_type: v
                    .get("objectType")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            };
        }
    }
    ObjectDescription {
        description: text.trim().to_string(),
        object_type: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_structured_reply() {
        let desc = parse_description(r#"{"description": "a blue mug", "objectType": "mug"}"#);
        assert_eq!(desc.description, "a blue mug");
        assert_eq!(desc.object_type.as_deref(), Some("mug"));
    }

    #[test]
    fn strips_markdown_fencing() {
        let desc = parse_description(
            "```json\n{\"description\": \"a paperback novel\", \"objectType\": \"book\"}\n```",
        );
        assert_eq!(desc.description, "a paperback novel");
        assert_eq!(desc.object_type.as_deref(), Some("book"));
    }

    #[test]
    fn plain_text_falls_back_to_bare_description() {
        let desc = parse_description("It looks like a small potted succulent.");
        assert_eq!(desc.description, "It looks like a small potted succulent.");
        assert!(desc.object_type.is_none());
    }
}
