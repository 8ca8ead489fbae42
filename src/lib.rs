//! Live object-memory capture core.
//!
//! A duplex streaming session client plus the audio pipeline and workflow
//! state machine around it: capture microphone audio, stream camera frames,
//! detect a stably framed object, analyze it, record the user's spoken memory
//! through a live AI session, and persist the result.

#![forbid(unsafe_code)]

pub mod analyze;
pub mod backend;
pub mod bus;
pub mod capture;
pub mod chime;
pub mod controller;
pub mod error;
pub mod media;
pub mod pcm;
pub mod playback;
pub mod session;
pub mod stability;
pub mod store;

pub use controller::{CaptureSessionController, Command, ControllerConfig, Notice, Phase};
pub use error::{LiveError, Result};
pub use media::MediaChunk;
pub use session::{DuplexSessionClient, LiveSession, SessionConfig, SessionEvent};
