//! Tagged events delivered to the session loop
//!
//! Device threads and the network task never touch controller state; they post
//! one of these onto a single queue which the controller drains in order.

use super::scheduler::HandleId;
use crate::audio::{CaptureEvent, FrameSink};
use crate::models::{ServerMessage, SessionId};
use tokio::sync::mpsc;

/// Transport callbacks for one session channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Message(ServerMessage),
    Error(String),
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Channel {
        session: SessionId,
        event: ChannelEvent,
    },
    Capture {
        session: SessionId,
        event: CaptureEvent,
    },
    PlaybackEnded(HandleId),
}

/// User intent from the toggle control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Toggle,
    Activate,
    Deactivate,
    Quit,
}

pub type EventSender = mpsc::UnboundedSender<ControllerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ControllerEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Channel callbacks bound to one session
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    session: SessionId,
    tx: EventSender,
}

impl ChannelEvents {
    pub fn new(session: SessionId, tx: EventSender) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Deliver an event; returns false once the session loop is gone
    pub fn emit(&self, event: ChannelEvent) -> bool {
        self.tx
            .send(ControllerEvent::Channel {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// Capture sink that forwards into the session loop
pub fn capture_sink(session: SessionId, tx: EventSender) -> FrameSink {
    Box::new(move |event| {
        let _ = tx.send(ControllerEvent::Capture { session, event });
    })
}
