//! Audio device I/O for the live voice session
//!
//! This module provides:
//! - Microphone capture at 16kHz mono in fixed 4096-sample frames (PipeWire)
//! - A WAV file stand-in for the microphone
//! - Timed playback of agent replies on a 24kHz output clock (PipeWire)
//! - WAV recording of finished sessions via hound

mod capture;
mod playback;
mod recorder;
mod resample;
mod wav_source;

pub use capture::PipeWireMicrophone;
pub use playback::PipeWireOutput;
pub use recorder::{SessionRecording, WavRecorder};
pub use resample::resample;
pub use wav_source::WavFileMicrophone;

use crate::error::SessionResult;
use crate::models::AudioChunk;

/// Output of a running capture stream
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Frame(AudioChunk),
    /// The device went away after capture had started
    Failed(String),
}

/// Receives capture output; invoked from the device thread
pub type FrameSink = Box<dyn FnMut(CaptureEvent) + Send>;

/// Source of microphone streams, one per session
#[allow(async_fn_in_trait)]
pub trait Microphone {
    type Stream: CaptureStream;

    /// Acquire the input device, failing with `CaptureUnavailable`
    async fn acquire(&mut self) -> SessionResult<Self::Stream>;
}

/// An acquired input device
pub trait CaptureStream {
    /// Begin delivering frames to `sink`
    fn start(&mut self, sink: FrameSink) -> SessionResult<()>;

    /// Release the device. Safe to call more than once.
    fn stop(&mut self);
}
