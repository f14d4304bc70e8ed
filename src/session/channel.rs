//! Session channel: connection lifecycle for one live session
//!
//! Idle -> Connecting -> Active -> Closing -> Closed, with Connecting -> Closed
//! when the connection fails before opening. Nothing leaves Closed.

use super::events::ChannelEvents;
use crate::error::{SessionError, SessionResult};
use crate::models::{EncodedFrame, LiveConfig, SessionId, SessionState};
use log::{debug, info};

/// Outbound half of an open connection
pub trait LiveTransport {
    fn send(&mut self, frame: &EncodedFrame) -> SessionResult<()>;

    fn close(&mut self);
}

/// Opens connections to the remote agent
pub trait LiveConnector {
    type Transport: LiveTransport;

    /// Start connecting without blocking
    ///
    /// Progress (`Open`, messages, errors, `Close`) is reported through `events`.
    fn connect(
        &mut self,
        config: &LiveConfig,
        events: ChannelEvents,
    ) -> SessionResult<Self::Transport>;
}

pub struct SessionChannel<T> {
    id: SessionId,
    state: SessionState,
    transport: Option<T>,
    frames_sent: u64,
}

impl<T: LiveTransport> SessionChannel<T> {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            transport: None,
            frames_sent: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Idle -> Connecting; a failed attempt lands in Closed
    pub fn connect<C>(
        &mut self,
        connector: &mut C,
        config: &LiveConfig,
        events: ChannelEvents,
    ) -> SessionResult<()>
    where
        C: LiveConnector<Transport = T>,
    {
        match self.state {
            SessionState::Idle => {}
            SessionState::Closed => return Err(SessionError::SessionClosed),
            other => return Err(SessionError::NotActive(other)),
        }

        self.state = SessionState::Connecting;
        info!("[{}] Connecting to {}", self.id, config.model);
        match connector.connect(config, events) {
            Ok(transport) => {
                self.transport = Some(transport);
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    /// Connecting -> Active; returns false for an unexpected open
    pub fn on_open(&mut self) -> bool {
        if self.state != SessionState::Connecting {
            debug!("[{}] Ignoring open while {}", self.id, self.state);
            return false;
        }
        self.state = SessionState::Active;
        info!("[{}] Session open", self.id);
        true
    }

    /// Forward a frame to the remote agent; only valid while Active
    pub fn send(&mut self, frame: &EncodedFrame) -> SessionResult<()> {
        match self.state {
            SessionState::Active => {}
            SessionState::Closed => return Err(SessionError::SessionClosed),
            other => return Err(SessionError::NotActive(other)),
        }

        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| SessionError::Transport("no transport".to_string()))?;
        transport.send(frame)?;
        self.frames_sent += 1;
        Ok(())
    }

    /// Terminate the channel; no-op when already closed or never connected
    pub fn close(&mut self) {
        match self.state {
            SessionState::Closed | SessionState::Closing => return,
            SessionState::Idle => {
                debug!("[{}] Close on idle channel ignored", self.id);
                return;
            }
            SessionState::Connecting | SessionState::Active => {}
        }

        self.state = SessionState::Closing;
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.state = SessionState::Closed;
        info!(
            "[{}] Session closed after {} frame(s) sent",
            self.id, self.frames_sent
        );
    }
}
