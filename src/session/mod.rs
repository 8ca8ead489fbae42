//! Duplex streaming session client.
//!
//! One WebSocket session per client instance: `connect` tears down any prior
//! session before opening the next, the reader half runs as a background task
//! demultiplexing inbound frames to per-kind subscribers, and media producers
//! may keep calling `send_realtime_input` while the session closes underneath
//! them without ever seeing an error. Reconnection is caller-driven; this
//! client never retries on its own.

pub mod wire;

use crate::bus::{SharedEventBus, Subscription};
use crate::error::{LiveError, Result};
use crate::media::MediaChunk;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

type WsSink = Arc<
    AsyncMutex<
        futures_util::stream::SplitSink<
            WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
            Message,
        >,
    >,
>;

type WsStream =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Response channels requested at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    Audio,
    Text,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "AUDIO",
            Self::Text => "TEXT",
        }
    }
}

/// Configuration for one duplex session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    pub model: String,
    pub system_instruction: String,
    pub response_modes: Vec<ResponseMode>,
    pub temperature: Option<f32>,
}

impl SessionConfig {
    /// Build a config pointing at the hosted live endpoint with the given
    /// API credential.
    pub fn from_api_key(api_key: &str, system_instruction: impl Into<String>) -> Self {
        Self {
            url: format!(
                "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key={api_key}"
            ),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            system_instruction: system_instruction.into(),
            response_modes: vec![ResponseMode::Audio, ResponseMode::Text],
            temperature: Some(0.7),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    Open,
    SetupComplete,
    Audio,
    Content,
    Interrupted,
    TurnComplete,
    Error,
    Closed,
}

/// Demultiplexed inbound session events.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Open,
    SetupComplete,
    /// Inline base64 PCM16 audio extracted from a model turn part.
    Audio(String),
    /// Inline text extracted from a model turn part.
    Content(String),
    /// The user started talking over the current response; flush any
    /// in-flight playback immediately.
    Interrupted,
    /// One conversational turn finished.
    TurnComplete,
    Error(String),
    Closed,
}

impl SessionEvent {
    pub fn kind(&self) -> SessionEventKind {
        match self {
            Self::Open => SessionEventKind::Open,
            Self::SetupComplete => SessionEventKind::SetupComplete,
            Self::Audio(_) => SessionEventKind::Audio,
            Self::Content(_) => SessionEventKind::Content,
            Self::Interrupted => SessionEventKind::Interrupted,
            Self::TurnComplete => SessionEventKind::TurnComplete,
            Self::Error(_) => SessionEventKind::Error,
            Self::Closed => SessionEventKind::Closed,
        }
    }
}

/// Seam between the controller and the session client, so workflows can be
/// tested without a network.
#[async_trait]
pub trait LiveSession: Send {
    async fn connect(&mut self, cfg: &SessionConfig) -> Result<()>;
    async fn disconnect(&mut self);
    /// Fire-and-forget: a silent no-op unless the session is open.
    async fn send_realtime_input(&self, chunks: &[MediaChunk]);
    /// Requires an open session.
    async fn send_text(&self, text: &str) -> Result<()>;
    fn is_open(&self) -> bool;
    fn on(
        &self,
        kind: SessionEventKind,
        callback: Box<dyn Fn(&SessionEvent) + Send>,
    ) -> Subscription;
    fn off(&self, sub: Subscription);
}

/// WebSocket-backed duplex session client.
pub struct DuplexSessionClient {
    state: Arc<Mutex<SessionState>>,
    writer: Option<WsSink>,
    bus: SharedEventBus<SessionEventKind, SessionEvent>,
    reader: Option<JoinHandle<()>>,
}

impl DuplexSessionClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState::Closed)),
            writer: None,
            bus: SharedEventBus::new(),
            reader: None,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state poisoned")
    }

    fn set_state(&self, next: SessionState) -> SessionState {
        let mut guard = self.state.lock().expect("session state poisoned");
        std::mem::replace(&mut *guard, next)
    }

    async fn send_json(&self, value: &serde_json::Value) -> Result<()> {
        let writer = self.writer.as_ref().ok_or(LiveError::SessionClosed)?;
        let text = serde_json::to_string(value)?;
        debug!("sending: {text}");
        let mut guard = writer.lock().await;
        guard.send(Message::text(text)).await?;
        Ok(())
    }

    async fn read_loop(
        mut stream: WsStream,
        bus: SharedEventBus<SessionEventKind, SessionEvent>,
        state: Arc<Mutex<SessionState>>,
        setup_tx: oneshot::Sender<()>,
    ) {
        let mut setup_tx = Some(setup_tx);
        while let Some(message) = stream.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text.to_string(),
                // The endpoint sometimes delivers JSON frames as binary.
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        debug!("ignoring non-UTF8 binary frame ({} bytes)", bytes.len());
                        continue;
                    }
                },
                Ok(Message::Close(frame)) => {
                    info!("session closed by remote: {frame:?}");
                    break;
                }
                Ok(_) => continue, // ping/pong
                Err(e) => {
                    error!("session transport error: {e}");
                    bus.emit(
                        SessionEventKind::Error,
                        &SessionEvent::Error(e.to_string()),
                    );
                    break;
                }
            };

            for event in wire::parse_server_message(&text) {
                if matches!(event, SessionEvent::SetupComplete) {
                    if let Some(tx) = setup_tx.take() {
                        let _ = tx.send(());
                    }
                }
                bus.emit(event.kind(), &event);
            }
        }

        let prev = {
            let mut guard = state.lock().expect("session state poisoned");
            std::mem::replace(&mut *guard, SessionState::Closed)
        };
        if prev != SessionState::Closed {
            bus.emit(SessionEventKind::Closed, &SessionEvent::Closed);
        }
    }

    async fn teardown(&mut self) {
        if let Some(writer) = self.writer.take() {
            let mut guard = writer.lock().await;
            let _ = guard.close().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        let prev = self.set_state(SessionState::Closed);
        if prev != SessionState::Closed {
            self.bus.emit(SessionEventKind::Closed, &SessionEvent::Closed);
        }
    }
}

impl Default for DuplexSessionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LiveSession for DuplexSessionClient {
    /// Establish a session: handshake, spawn the reader, declare the setup,
    /// and wait for the remote's `setupComplete`. A prior session, open or
    /// half-open, is torn down first; a client never owns two sessions.
    async fn connect(&mut self, cfg: &SessionConfig) -> Result<()> {
        if self.state() != SessionState::Closed {
            info!("tearing down previous session before reconnect");
            self.disconnect().await;
        }

        self.set_state(SessionState::Connecting);
        info!("connecting to {}", cfg.url);

        let (ws, _resp) = match connect_async(cfg.url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                self.set_state(SessionState::Closed);
                return Err(LiveError::WebSocket(e));
            }
        };

        let (sink, stream) = ws.split();
        let sink: WsSink = Arc::new(AsyncMutex::new(sink));
        self.writer = Some(sink);

        let (setup_tx, setup_rx) = oneshot::channel();
        let bus = self.bus.clone();
        let state = self.state.clone();
        self.reader = Some(tokio::spawn(Self::read_loop(
            stream, bus, state, setup_tx,
        )));

        if let Err(e) = self.send_json(&wire::setup_message(cfg)).await {
            self.teardown().await;
            return Err(e);
        }

        // No client-side timeout: the remote's own close/error ends the wait
        // by dropping the sender.
        match setup_rx.await {
            Ok(()) => {
                self.set_state(SessionState::Open);
                self.bus.emit(SessionEventKind::Open, &SessionEvent::Open);
                info!("session open ({})", cfg.model);
                Ok(())
            }
            Err(_) => {
                self.teardown().await;
                Err(LiveError::Connection(
                    "session closed before setup completed".to_string(),
                ))
            }
        }
    }

    /// Tear down the session. Idempotent; the handle is never reused, a
    /// later `connect` builds a fresh one.
    async fn disconnect(&mut self) {
        if self.state() == SessionState::Closed && self.writer.is_none() {
            return;
        }
        self.set_state(SessionState::Closing);
        self.teardown().await;
        info!("session disconnected");
    }

    /// Fire-and-forget media transmission. Producers run on their own timers
    /// and may outlive a closing session by a tick, so a closed session is a
    /// silent no-op and send failures are swallowed.
    async fn send_realtime_input(&self, chunks: &[MediaChunk]) {
        if self.state() != SessionState::Open {
            return;
        }
        let Some(msg) = wire::realtime_input_message(chunks) else {
            return;
        };
        if let Err(e) = self.send_json(&msg).await {
            debug!("realtime input dropped: {e}");
        }
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if self.state() != SessionState::Open {
            return Err(LiveError::SessionClosed);
        }
        self.send_json(&wire::client_content_message(text)).await
    }

    fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    fn on(
        &self,
        kind: SessionEventKind,
        callback: Box<dyn Fn(&SessionEvent) + Send>,
    ) -> Subscription {
        self.bus.on(kind, callback)
    }

    fn off(&self, sub: Subscription) {
        self.bus.off(sub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Minimal protocol peer: accepts one WebSocket session, acknowledges
    /// setup, streams a scripted model turn, and echoes expectations about
    /// what the client sends.
    async fn spawn_peer() -> (std::net::SocketAddr, JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            // First frame must be the setup envelope.
            let msg = ws.next().await.unwrap().unwrap();
            let v: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            assert!(v.get("setup").is_some(), "expected setup, got {v}");
            assert_eq!(v["setup"]["model"], "models/test-live");

            ws.send(Message::text(json!({"setupComplete": {}}).to_string()))
                .await
                .unwrap();

            // One spoken-and-written model turn.
            ws.send(Message::text(
                json!({
                    "serverContent": {
                        "modelTurn": {"parts": [
                            {"text": "a ceramic mug"},
                            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}}
                        ]},
                        "turnComplete": true
                    }
                })
                .to_string(),
            ))
            .await
            .unwrap();

            // Expect a realtime media batch, then a text turn.
            let msg = ws.next().await.unwrap().unwrap();
            let v: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            assert!(v["realtimeInput"]["mediaChunks"].is_array());

            let msg = ws.next().await.unwrap().unwrap();
            let v: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            assert_eq!(v["clientContent"]["turnComplete"], true);

            // Drain until the client closes.
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });
        (addr, handle)
    }

    fn local_config(addr: std::net::SocketAddr) -> SessionConfig {
        SessionConfig {
            url: format!("ws://{addr}"),
            model: "models/test-live".to_string(),
            system_instruction: "test".to_string(),
            response_modes: vec![ResponseMode::Audio],
            temperature: None,
        }
    }

    // Multi-thread flavor: the test blocks on std channels while the reader
    // task must keep draining the socket.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_session_round_trip() {
        let (addr, peer) = spawn_peer().await;
        let mut client = DuplexSessionClient::new();

        let (content_tx, content_rx) = mpsc::channel();
        client.on(
            SessionEventKind::Content,
            Box::new(move |ev| {
                if let SessionEvent::Content(text) = ev {
                    let _ = content_tx.send(text.clone());
                }
            }),
        );
        let (audio_tx, audio_rx) = mpsc::channel();
        client.on(
            SessionEventKind::Audio,
            Box::new(move |ev| {
                if let SessionEvent::Audio(data) = ev {
                    let _ = audio_tx.send(data.clone());
                }
            }),
        );
        let (turn_tx, turn_rx) = mpsc::channel();
        client.on(
            SessionEventKind::TurnComplete,
            Box::new(move |_| {
                let _ = turn_tx.send(());
            }),
        );

        client.connect(&local_config(addr)).await.unwrap();
        assert!(client.is_open());

        assert_eq!(
            content_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            "a ceramic mug"
        );
        assert_eq!(audio_rx.recv_timeout(Duration::from_secs(2)).unwrap(), "AAAA");
        turn_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        client
            .send_realtime_input(&[MediaChunk::pcm_audio("AQID".to_string())])
            .await;
        client.send_text("remember this one").await.unwrap();

        client.disconnect().await;
        assert!(!client.is_open());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn sends_are_noops_or_errors_when_closed() {
        let client = DuplexSessionClient::new();
        // Fire-and-forget never errors, even with no session at all.
        client
            .send_realtime_input(&[MediaChunk::pcm_audio("AQID".to_string())])
            .await;
        // Deliberate sends do.
        assert!(matches!(
            client.send_text("hello").await,
            Err(LiveError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn connect_fails_when_peer_refuses_setup() {
        // Peer that closes immediately after the handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.next().await; // setup arrives
            let _ = ws.close(None).await;
        });

        let mut client = DuplexSessionClient::new();
        let err = client.connect(&local_config(addr)).await.unwrap_err();
        assert!(matches!(err, LiveError::Connection(_)));
        assert!(!client.is_open());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_noop() {
        let mut client = DuplexSessionClient::new();
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), SessionState::Closed);
    }
}
