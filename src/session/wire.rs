//! Wire format for the duplex streaming endpoint.
//!
//! Outbound messages are typed serde structs; inbound protocol messages are
//! duck-typed JSON and go through a defensive parser that maps every
//! recognized shape to a [`SessionEvent`] and every unrecognized shape to
//! nothing at all. The remote is free to evolve its envelope without
//! crashing this client.

use super::{SessionConfig, SessionEvent};
use crate::media::MediaChunk;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Serialize, Clone)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

/// Session setup payload declaring model, behavior, and response modes.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub mime_type: String,
    pub data: String,
}

/// Build the setup envelope for a new session.
pub fn setup_message(cfg: &SessionConfig) -> Value {
    let setup = Setup {
        model: cfg.model.clone(),
        generation_config: Some(GenerationConfig {
            response_modalities: cfg
                .response_modes
                .iter()
                .map(|m| m.as_str().to_string())
                .collect(),
            temperature: cfg.temperature,
        }),
        system_instruction: Some(Content {
            role: Some("SYSTEM".to_string()),
            parts: vec![Part {
                text: Some(cfg.system_instruction.clone()),
            }],
        }),
    };
    json!({ "setup": setup })
}

/// Build a realtime-input envelope from a batch of media chunks. Returns
/// `None` when the batch contains nothing transmissible.
pub fn realtime_input_message(chunks: &[MediaChunk]) -> Option<Value> {
    let mut blobs = Vec::new();
    let mut text: Option<&str> = None;
    for chunk in chunks {
        match chunk {
            MediaChunk::Audio { data, mime_type } | MediaChunk::Image { data, mime_type } => {
                blobs.push(MediaBlob {
                    mime_type: mime_type.clone(),
                    data: data.clone(),
                });
            }
            MediaChunk::Text(t) => text = Some(t),
        }
    }
    if blobs.is_empty() && text.is_none() {
        return None;
    }
    let mut input = serde_json::Map::new();
    if !blobs.is_empty() {
        input.insert("mediaChunks".to_string(), serde_json::to_value(&blobs).ok()?);
    }
    if let Some(t) = text {
        input.insert("text".to_string(), Value::String(t.to_string()));
    }
    Some(json!({ "realtimeInput": Value::Object(input) }))
}

/// Build a complete user text turn.
pub fn client_content_message(text: &str) -> Value {
    json!({
        "clientContent": {
            "turns": [{
                "role": "user",
                "parts": [{ "text": text }]
            }],
            "turnComplete": true
        }
    })
}

/// Parse one inbound protocol message into zero or more session events.
///
/// Total and defensive: malformed JSON or an unknown envelope yields an
/// empty vector, never an error.
pub fn parse_server_message(text: &str) -> Vec<SessionEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!("ignoring unparseable server message: {e}");
            return Vec::new();
        }
    };

    let mut events = Vec::new();

    if value.get("setupComplete").is_some() {
        events.push(SessionEvent::SetupComplete);
    }

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown server error")
            .to_string();
        events.push(SessionEvent::Error(message));
    }

    if let Some(server_content) = value.get("serverContent") {
        // The remote signals barge-in before anything else; subscribers are
        // expected to flush in-flight playback immediately.
        if server_content
            .get("interrupted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            events.push(SessionEvent::Interrupted);
        }

        if let Some(parts) = server_content
            .get("modelTurn")
            .and_then(|t| t.get("parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        events.push(SessionEvent::Content(text.to_string()));
                    }
                } else if let Some(data) = part
                    .get("inlineData")
                    .and_then(|d| d.get("data"))
                    .and_then(Value::as_str)
                {
                    if !data.is_empty() {
                        events.push(SessionEvent::Audio(data.to_string()));
                    }
                }
            }
        }

        if server_content
            .get("turnComplete")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            events.push(SessionEvent::TurnComplete);
        }
    }

    if events.is_empty() {
        debug!("ignoring unrecognized server message shape");
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ResponseMode;

    fn test_config() -> SessionConfig {
        SessionConfig {
            url: "wss://example.invalid/session".to_string(),
            model: "models/test-live".to_string(),
            system_instruction: "Describe what you see.".to_string(),
            response_modes: vec![ResponseMode::Audio, ResponseMode::Text],
            temperature: Some(0.7),
        }
    }

    #[test]
    fn setup_message_shape() {
        let msg = setup_message(&test_config());
        assert_eq!(msg["setup"]["model"], "models/test-live");
        assert_eq!(
            msg["setup"]["generationConfig"]["responseModalities"][0],
            "AUDIO"
        );
        assert_eq!(
            msg["setup"]["generationConfig"]["responseModalities"][1],
            "TEXT"
        );
        // f32 widens through serialization, so compare with a tolerance.
        let temperature = msg["setup"]["generationConfig"]["temperature"]
            .as_f64()
            .unwrap();
        assert!((temperature - 0.7).abs() < 1e-6);
        assert_eq!(
            msg["setup"]["systemInstruction"]["parts"][0]["text"],
            "Describe what you see."
        );
    }

    #[test]
    fn realtime_input_batches_media() {
        let chunks = vec![
            MediaChunk::pcm_audio("QUJD".to_string()),
            MediaChunk::jpeg("REVG".to_string()),
        ];
        let msg = realtime_input_message(&chunks).unwrap();
        let blobs = msg["realtimeInput"]["mediaChunks"].as_array().unwrap();
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(blobs[0]["data"], "QUJD");
        assert_eq!(blobs[1]["mimeType"], "image/jpeg");
        assert!(realtime_input_message(&[]).is_none());
    }

    #[test]
    fn client_content_is_a_complete_turn() {
        let msg = client_content_message("hello there");
        assert_eq!(msg["clientContent"]["turnComplete"], true);
        assert_eq!(
            msg["clientContent"]["turns"][0]["parts"][0]["text"],
            "hello there"
        );
        assert_eq!(msg["clientContent"]["turns"][0]["role"], "user");
    }

    #[test]
    fn parses_setup_complete() {
        let events = parse_server_message(r#"{"setupComplete": {}}"#);
        assert!(matches!(events.as_slice(), [SessionEvent::SetupComplete]));
    }

    #[test]
    fn parses_model_turn_parts() {
        let msg = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"text": "I can see a teacup."},
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAECAw=="}}
                    ]
                },
                "turnComplete": true
            }
        })
        .to_string();
        let events = parse_server_message(&msg);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], SessionEvent::Content(t) if t == "I can see a teacup."));
        assert!(matches!(&events[1], SessionEvent::Audio(d) if d == "AAECAw=="));
        assert!(matches!(&events[2], SessionEvent::TurnComplete));
    }

    #[test]
    fn parses_interrupted_before_turn_parts() {
        let msg = json!({
            "serverContent": {
                "interrupted": true,
                "modelTurn": {"parts": [{"text": "cut off"}]}
            }
        })
        .to_string();
        let events = parse_server_message(&msg);
        assert!(matches!(events[0], SessionEvent::Interrupted));
    }

    #[test]
    fn parses_error_message() {
        let events = parse_server_message(r#"{"error": {"message": "quota exceeded"}}"#);
        assert!(matches!(&events[0], SessionEvent::Error(m) if m == "quota exceeded"));
    }

    #[test]
    fn unknown_shapes_are_ignored() {
        assert!(parse_server_message(r#"{"somethingNew": {"x": 1}}"#).is_empty());
        assert!(parse_server_message("not json at all").is_empty());
        assert!(parse_server_message(r#"{"serverContent": {"modelTurn": {}}}"#).is_empty());
        assert!(parse_server_message(r#"{"serverContent": {"modelTurn": {"parts": [{}]}}}"#)
            .is_empty());
    }
}
