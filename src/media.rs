//! Media chunk value type passed between producers and the session client.

use crate::pcm;

pub const JPEG_MIME_TYPE: &str = "image/jpeg";

/// One outbound media payload: audio, image, or text. Immutable and cheap to
/// clone; producers hand copies to the session's outbound multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaChunk {
    /// Base64-encoded PCM16 microphone audio.
    Audio { data: String, mime_type: String },
    /// Base64-encoded still frame.
    Image { data: String, mime_type: String },
    /// Plain text.
    Text(String),
}

impl MediaChunk {
    /// Audio chunk in the endpoint's expected input format.
    pub fn pcm_audio(data: String) -> Self {
        Self::Audio {
            data,
            mime_type: pcm::INPUT_MIME_TYPE.to_string(),
        }
    }

    /// JPEG image chunk.
    pub fn jpeg(data: String) -> Self {
        Self::Image {
            data,
            mime_type: JPEG_MIME_TYPE.to_string(),
        }
    }

    pub fn mime_type(&self) -> Option<&str> {
        match self {
            Self::Audio { mime_type, .. } | Self::Image { mime_type, .. } => Some(mime_type),
            Self::Text(_) => None,
        }
    }
}
