//! Tokio runtime for the session loop
//!
//! The controller and all of its state live on one thread. PipeWire and the
//! WAV pacer run their own threads and only talk to the loop through channels.

use tokio::runtime::Runtime;

/// Build the single-threaded runtime the session loop runs on
pub fn build() -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .thread_name("concierge-session")
        .build()
}
