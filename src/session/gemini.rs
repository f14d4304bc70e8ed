//! Gemini Live websocket connector
//!
//! Each connection runs on its own task: it sends the setup envelope, then
//! pumps outbound frames and inbound server messages until either side closes.
//! The server's `setupComplete` is what the session treats as "open".

use super::channel::{LiveConnector, LiveTransport};
use super::events::{ChannelEvent, ChannelEvents};
use crate::error::{SessionError, SessionResult};
use crate::models::{EncodedFrame, LiveConfig, RealtimeInputMessage, ServerMessage, SetupMessage};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Environment variables checked for the API key, in order
pub const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

pub fn api_key_from_env() -> Option<String> {
    API_KEY_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}

pub struct GeminiLiveConnector {
    api_key: String,
    endpoint: String,
}

impl GeminiLiveConnector {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn url(&self) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, separator, self.api_key)
    }
}

enum Outbound {
    Frame(String),
    Close,
}

/// Sender half handed to the session channel
pub struct GeminiTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl LiveTransport for GeminiTransport {
    fn send(&mut self, frame: &EncodedFrame) -> SessionResult<()> {
        let payload = serde_json::to_string(&RealtimeInputMessage::from(frame))
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        self.outbound
            .send(Outbound::Frame(payload))
            .map_err(|_| SessionError::Transport("connection task has exited".to_string()))
    }

    fn close(&mut self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

impl LiveConnector for GeminiLiveConnector {
    type Transport = GeminiTransport;

    fn connect(
        &mut self,
        config: &LiveConfig,
        events: ChannelEvents,
    ) -> SessionResult<GeminiTransport> {
        if self.api_key.is_empty() {
            return Err(SessionError::Transport("missing API key".to_string()));
        }
        let setup = serde_json::to_string(&SetupMessage::from_config(config))
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(self.url(), setup, rx, events));
        Ok(GeminiTransport { outbound: tx })
    }
}

async fn run_connection(
    url: String,
    setup: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: ChannelEvents,
) {
    let session = events.session();
    let (mut ws, _response) = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("[{}] Connection failed: {}", session, e);
            events.emit(ChannelEvent::Error(e.to_string()));
            return;
        }
    };
    debug!("[{}] Websocket connected, sending setup", session);

    if let Err(e) = ws.send(Message::Text(setup)).await {
        events.emit(ChannelEvent::Error(e.to_string()));
        return;
    }

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(payload)) => {
                    if let Err(e) = ws.send(Message::Text(payload)).await {
                        events.emit(ChannelEvent::Error(e.to_string()));
                        return;
                    }
                }
                Some(Outbound::Close) | None => {
                    debug!("[{}] Closing websocket", session);
                    let _ = ws.close(None).await;
                    return;
                }
            },
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if !dispatch(text.as_bytes(), &events) {
                        return;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if !dispatch(&bytes, &events) {
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("[{}] Server closed the connection: {:?}", session, frame);
                    events.emit(ChannelEvent::Close);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("[{}] Websocket error: {}", session, e);
                    events.emit(ChannelEvent::Error(e.to_string()));
                    return;
                }
                None => {
                    events.emit(ChannelEvent::Close);
                    return;
                }
            },
        }
    }
}

/// Forward one server envelope; false once the session loop has gone away
fn dispatch(payload: &[u8], events: &ChannelEvents) -> bool {
    match parse_server_message(payload) {
        Some(message) if message.is_setup_complete() => events.emit(ChannelEvent::Open),
        Some(message) => {
            if message.go_away.is_some() {
                info!("[{}] Server announced disconnect", events.session());
            }
            events.emit(ChannelEvent::Message(message))
        }
        None => true,
    }
}

fn parse_server_message(payload: &[u8]) -> Option<ServerMessage> {
    match serde_json::from_slice::<ServerMessage>(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            trace!("Ignoring unparseable server message: {}", e);
            None
        }
    }
}
