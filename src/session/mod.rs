//! Live voice session: channel state machine, remote connector, playback
//! scheduling and the controller that ties them to the toggle control.

mod channel;
mod controller;
mod events;
mod gemini;
mod scheduler;

pub use controller::SessionController;
pub use events::{event_channel, Command, ControllerEvent, EventReceiver, EventSender};
pub use gemini::{api_key_from_env, GeminiLiveConnector};
pub use scheduler::{AudioOutput, HandleId};
