//! Session controller: the toggle-driven owner of one live voice session
//!
//! The controller owns the microphone, the connector, the session channel and
//! the playback scheduler. Everything that happens elsewhere (device threads,
//! the websocket task) arrives as a `ControllerEvent` and is applied here, one
//! event at a time, on a single-threaded loop.

use super::channel::{LiveConnector, SessionChannel};
use super::events::{capture_sink, ChannelEvent, ChannelEvents, Command, ControllerEvent, EventReceiver, EventSender};
use super::scheduler::{AudioOutput, PlaybackScheduler};
use crate::audio::{resample, CaptureEvent, CaptureStream, Microphone, SessionRecording, WavRecorder};
use crate::codec::{decode_audio, encode_chunk, mime_sample_rate};
use crate::error::{SessionError, SessionResult};
use crate::models::{
    AudioChunk, LiveConfig, ServerMessage, SessionId, SessionState, ToggleStatus,
    PLAYBACK_SAMPLE_RATE,
};
use chrono::{DateTime, Local};
use log::{debug, info, trace, warn};
use std::fmt;
use tokio::sync::mpsc;

/// Why a session was torn down
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    UserRequest,
    CaptureFailed(String),
    TransportError(String),
    RemoteClosed,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::UserRequest => write!(f, "user request"),
            EndReason::CaptureFailed(e) => write!(f, "capture failed: {}", e),
            EndReason::TransportError(e) => write!(f, "transport error: {}", e),
            EndReason::RemoteClosed => write!(f, "closed by remote"),
        }
    }
}

/// Resources held by the current session
struct LiveSession<S, T> {
    channel: SessionChannel<T>,
    stream: S,
    capturing: bool,
    started_at: DateTime<Local>,
    recording: Option<SessionRecording>,
    buffers_scheduled: u64,
    interruptions: u64,
}

pub struct SessionController<M: Microphone, C: LiveConnector, O: AudioOutput> {
    config: LiveConfig,
    microphone: M,
    connector: C,
    scheduler: PlaybackScheduler<O>,
    events_tx: EventSender,
    session: Option<LiveSession<M::Stream, C::Transport>>,
    /// State reported when no session is held
    resting_state: SessionState,
    recorder: Option<WavRecorder>,
    last_error: Option<SessionError>,
    last_end: Option<EndReason>,
}

impl<M, C, O> SessionController<M, C, O>
where
    M: Microphone,
    C: LiveConnector,
    O: AudioOutput,
{
    pub fn new(
        config: LiveConfig,
        microphone: M,
        connector: C,
        output: O,
        events_tx: EventSender,
    ) -> Self {
        let recorder = config.record_sessions.then(WavRecorder::new);
        if let Some(recorder) = &recorder {
            info!("Recording sessions to {:?}", recorder.recordings_dir());
        }
        Self {
            config,
            microphone,
            connector,
            scheduler: PlaybackScheduler::new(output),
            events_tx,
            session: None,
            resting_state: SessionState::Idle,
            recorder,
            last_error: None,
            last_end: None,
        }
    }

    /// Record sessions with a specific recorder
    pub fn with_recorder(mut self, recorder: WavRecorder) -> Self {
        info!("Recording sessions to {:?}", recorder.recordings_dir());
        self.recorder = Some(recorder);
        self
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|session| session.channel.state())
            .unwrap_or(self.resting_state)
    }

    pub fn status(&self) -> ToggleStatus {
        ToggleStatus::from(self.state())
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|session| session.channel.id())
    }

    pub fn scheduler(&self) -> &PlaybackScheduler<O> {
        &self.scheduler
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn last_end(&self) -> Option<&EndReason> {
        self.last_end.as_ref()
    }

    /// Acquire the microphone and start connecting
    ///
    /// A no-op while a session is already connecting or active. Capture starts
    /// once the channel reports open.
    pub async fn activate(&mut self) -> SessionResult<()> {
        if self.session.is_some() {
            debug!("Activate ignored while {}", self.state());
            return Ok(());
        }

        let mut stream = match self.microphone.acquire().await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail_start(e)),
        };

        let id = SessionId::new();
        let mut channel = SessionChannel::new(id);
        let events = ChannelEvents::new(id, self.events_tx.clone());
        if let Err(e) = channel.connect(&mut self.connector, &self.config, events) {
            stream.stop();
            return Err(self.fail_start(e));
        }

        self.session = Some(LiveSession {
            channel,
            stream,
            capturing: false,
            started_at: Local::now(),
            recording: self.recorder.as_ref().map(|_| SessionRecording::default()),
            buffers_scheduled: 0,
            interruptions: 0,
        });
        self.last_error = None;
        Ok(())
    }

    /// Tear down the current session, if any
    pub fn deactivate(&mut self) {
        self.teardown(EndReason::UserRequest);
    }

    pub async fn toggle(&mut self) -> SessionResult<()> {
        match self.status() {
            ToggleStatus::Inactive => self.activate().await,
            ToggleStatus::Connecting | ToggleStatus::Active => {
                self.deactivate();
                Ok(())
            }
        }
    }

    pub async fn handle_command(&mut self, command: Command) {
        let result = match command {
            Command::Toggle => self.toggle().await,
            Command::Activate => self.activate().await,
            Command::Deactivate | Command::Quit => {
                self.deactivate();
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("Could not start session: {}", e);
        }
    }

    /// Apply one event from a device thread or the network task
    pub fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Channel { session, event } => {
                if self.is_current(session) {
                    self.on_channel_event(event);
                } else {
                    debug!("Dropping channel event for stale session {}", session);
                }
            }
            ControllerEvent::Capture { session, event } => {
                if self.is_current(session) {
                    self.on_capture_event(event);
                } else {
                    trace!("Dropping capture event for stale session {}", session);
                }
            }
            ControllerEvent::PlaybackEnded(handle) => {
                self.scheduler.on_ended(handle);
            }
        }
    }

    /// Drive the controller until `Quit` or until the command source closes
    ///
    /// `on_status` is called with the initial status and on every change.
    pub async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: EventReceiver,
        mut on_status: impl FnMut(ToggleStatus),
    ) {
        let mut reported = self.status();
        on_status(reported);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Quit) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }

            let status = self.status();
            if status != reported {
                reported = status;
                on_status(status);
            }
        }

        self.deactivate();
        if self.status() != reported {
            on_status(self.status());
        }
    }

    fn is_current(&self, session: SessionId) -> bool {
        self.session_id() == Some(session)
    }

    fn fail_start(&mut self, error: SessionError) -> SessionError {
        warn!("Session start aborted: {}", error);
        self.resting_state = SessionState::Closed;
        self.last_error = Some(error.clone());
        error
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => self.on_open(),
            ChannelEvent::Message(message) => self.on_message(&message),
            ChannelEvent::Error(e) => {
                self.last_error = Some(SessionError::Transport(e.clone()));
                self.teardown(EndReason::TransportError(e));
            }
            ChannelEvent::Close => self.teardown(EndReason::RemoteClosed),
        }
    }

    fn on_open(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.channel.on_open() {
            return;
        }

        let sink = capture_sink(session.channel.id(), self.events_tx.clone());
        match session.stream.start(sink) {
            Ok(()) => {
                session.capturing = true;
                info!("[{}] Assistant active, streaming microphone", session.channel.id());
            }
            Err(e) => {
                let reason = EndReason::CaptureFailed(e.to_string());
                self.last_error = Some(e);
                self.teardown(reason);
            }
        }
    }

    fn on_message(&mut self, message: &ServerMessage) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        for blob in message.inline_audio() {
            let rate = mime_sample_rate(&blob.mime_type).unwrap_or(PLAYBACK_SAMPLE_RATE);
            let buffer = match decode_audio(&blob.data, rate, 1) {
                Ok(buffer) => buffer,
                Err(e) => {
                    warn!("[{}] Skipping agent audio: {}", session.channel.id(), e);
                    continue;
                }
            };
            if buffer.data.is_empty() {
                continue;
            }

            if let Some(recording) = session.recording.as_mut() {
                recording.push_agent(&resample(&buffer.data, buffer.sample_rate, PLAYBACK_SAMPLE_RATE));
            }
            self.scheduler.enqueue(buffer);
            session.buffers_scheduled += 1;
        }

        for text in message.text_parts() {
            debug!("[{}] Agent: {}", session.channel.id(), text);
        }

        // Applied last so that audio riding on the same message is cut too
        if message.is_interrupted() {
            let stopped = self.scheduler.interrupt();
            session.interruptions += 1;
            info!("[{}] Barge-in: {} buffer(s) cut off", session.channel.id(), stopped);
        }

        if message.is_turn_complete() {
            debug!("[{}] Agent turn complete", session.channel.id());
        }
        if message.go_away.is_some() {
            info!("[{}] Server will disconnect soon", session.channel.id());
        }
    }

    fn on_capture_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Frame(chunk) => self.forward_frame(&chunk),
            CaptureEvent::Failed(e) => {
                self.last_error = Some(SessionError::CaptureUnavailable(e.clone()));
                self.teardown(EndReason::CaptureFailed(e));
            }
        }
    }

    fn forward_frame(&mut self, chunk: &AudioChunk) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if chunk.is_empty() {
            return;
        }
        if !session.capturing || session.channel.state() != SessionState::Active {
            trace!("Frame dropped while {}", session.channel.state());
            return;
        }

        match session.channel.send(&encode_chunk(chunk)) {
            Ok(()) => {
                if let Some(recording) = session.recording.as_mut() {
                    recording.push_mic(chunk.samples());
                }
            }
            Err(e) if e.is_fatal() => {
                let reason = EndReason::TransportError(e.to_string());
                self.last_error = Some(e);
                self.teardown(reason);
            }
            Err(e) => debug!("Frame not sent: {}", e),
        }
    }

    /// Release everything the session holds and settle in Closed
    fn teardown(&mut self, reason: EndReason) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let id = session.channel.id();

        session.stream.stop();
        session.channel.close();
        let cut = self.scheduler.interrupt();
        self.resting_state = SessionState::Closed;

        let elapsed = Local::now().signed_duration_since(session.started_at);
        info!(
            "[{}] Session ended ({}): {:.1}s, {} frame(s) sent, {} buffer(s) played, {} barge-in(s), {} buffer(s) cut at teardown",
            id,
            reason,
            elapsed.num_milliseconds() as f64 / 1000.0,
            session.channel.frames_sent(),
            session.buffers_scheduled,
            session.interruptions,
            cut
        );

        if let (Some(recorder), Some(recording)) = (self.recorder.as_ref(), session.recording.as_ref()) {
            if !recording.is_empty() {
                match recorder.save_session(id, session.started_at, recording) {
                    Ok(paths) => {
                        for path in paths {
                            info!("[{}] Saved recording {:?}", id, path);
                        }
                    }
                    Err(e) => warn!("[{}] Failed to save recording: {}", id, e),
                }
            }
        }

        self.last_end = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FrameSink;
    use crate::codec::{decode_base64, encode_base64, pcm16_to_bytes};
    use crate::models::CAPTURE_FRAME_SAMPLES;
    use crate::session::channel::tests::FakeConnector;
    use crate::session::events::event_channel;
    use crate::session::scheduler::tests::FakeOutput;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeMicState {
        fail_acquire: bool,
        fail_start: bool,
        acquired: usize,
        started: usize,
        released: usize,
        sink: Option<FrameSink>,
    }

    #[derive(Clone, Default)]
    struct FakeMicrophone {
        state: Arc<Mutex<FakeMicState>>,
    }

    impl FakeMicrophone {
        /// Push one frame through the sink of the most recently started stream
        fn emit(&self, event: CaptureEvent) {
            let mut state = self.state.lock().unwrap();
            let sink = state.sink.as_mut().expect("capture not started");
            sink(event);
        }

        fn outstanding(&self) -> usize {
            let state = self.state.lock().unwrap();
            state.acquired - state.released
        }
    }

    struct FakeStream {
        state: Arc<Mutex<FakeMicState>>,
        released: bool,
    }

    impl Microphone for FakeMicrophone {
        type Stream = FakeStream;

        async fn acquire(&mut self) -> SessionResult<FakeStream> {
            let mut state = self.state.lock().unwrap();
            if state.fail_acquire {
                return Err(SessionError::CaptureUnavailable("permission denied".to_string()));
            }
            state.acquired += 1;
            Ok(FakeStream {
                state: self.state.clone(),
                released: false,
            })
        }
    }

    impl CaptureStream for FakeStream {
        fn start(&mut self, sink: FrameSink) -> SessionResult<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_start {
                return Err(SessionError::CaptureUnavailable("device busy".to_string()));
            }
            state.started += 1;
            state.sink = Some(sink);
            Ok(())
        }

        fn stop(&mut self) {
            if !self.released {
                self.released = true;
                self.state.lock().unwrap().released += 1;
            }
        }
    }

    struct Harness {
        controller: SessionController<FakeMicrophone, FakeConnector, FakeOutput>,
        events: EventReceiver,
        mic: FakeMicrophone,
        connector: FakeConnector,
        output: FakeOutput,
    }

    impl Harness {
        fn new() -> Self {
            Self::build(None)
        }

        fn build(recorder: Option<WavRecorder>) -> Self {
            let (tx, events) = event_channel();
            let mic = FakeMicrophone::default();
            let connector = FakeConnector::default();
            let output = FakeOutput::default();
            let mut controller = SessionController::new(
                LiveConfig::default(),
                mic.clone(),
                connector.clone(),
                output.clone(),
                tx,
            );
            if let Some(recorder) = recorder {
                controller = controller.with_recorder(recorder);
            }
            Self {
                controller,
                events,
                mic,
                connector,
                output,
            }
        }

        /// Fire a channel callback on the most recent connection
        fn fire(&self, event: ChannelEvent) {
            let wire = self.connector.wire.lock().unwrap();
            wire.events.as_ref().expect("never connected").emit(event);
        }

        fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.controller.handle_event(event);
            }
        }

        async fn open(&mut self) {
            self.controller.activate().await.unwrap();
            self.fire(ChannelEvent::Open);
            self.pump();
            assert_eq!(self.controller.state(), SessionState::Active);
        }

        fn sent(&self) -> usize {
            self.connector.wire.lock().unwrap().sent.len()
        }
    }

    fn frame(value: i16) -> CaptureEvent {
        CaptureEvent::Frame(AudioChunk::new(16000, 1, vec![value; CAPTURE_FRAME_SAMPLES]))
    }

    fn audio_message(samples: usize) -> ChannelEvent {
        let data = encode_base64(&pcm16_to_bytes(&vec![1000i16; samples]));
        let message: ServerMessage = serde_json::from_value(serde_json::json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [{ "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": data } }]
                }
            }
        }))
        .unwrap();
        ChannelEvent::Message(message)
    }

    fn interrupted_message() -> ChannelEvent {
        let message: ServerMessage =
            serde_json::from_value(serde_json::json!({ "serverContent": { "interrupted": true } }))
                .unwrap();
        ChannelEvent::Message(message)
    }

    #[tokio::test]
    async fn test_end_to_end_barge_in() {
        let mut h = Harness::new();
        assert_eq!(h.controller.status(), ToggleStatus::Inactive);

        h.controller.activate().await.unwrap();
        assert_eq!(h.controller.status(), ToggleStatus::Connecting);
        h.fire(ChannelEvent::Open);
        h.pump();
        assert_eq!(h.controller.status(), ToggleStatus::Active);

        for _ in 0..3 {
            h.mic.emit(frame(4096));
        }
        h.pump();

        {
            let wire = h.connector.wire.lock().unwrap();
            assert_eq!(wire.sent.len(), 3);
            for sent in &wire.sent {
                assert_eq!(sent.mime_type, "audio/pcm;rate=16000");
                assert_eq!(sent.data.len(), 10924);
                let bytes = decode_base64(&sent.data).unwrap();
                assert_eq!(bytes.len(), 8192);
                assert_eq!(&bytes[..2], &4096i16.to_le_bytes());
            }
        }

        h.fire(audio_message(4800));
        h.pump();
        {
            let output = h.output.state.lock().unwrap();
            assert_eq!(output.started.len(), 1);
            assert_eq!(output.started[0].1, 0.0);
            assert_eq!(output.started[0].2, 4800);
        }
        assert_eq!(h.controller.scheduler().active_count(), 1);
        assert!((h.controller.scheduler().cursor() - 0.2).abs() < 1e-9);

        h.output.set_time(0.05);
        h.fire(interrupted_message());
        h.pump();
        assert_eq!(h.controller.scheduler().active_count(), 0);
        assert_eq!(h.controller.scheduler().cursor(), 0.05);
        assert_eq!(h.output.state.lock().unwrap().stopped.len(), 1);
        assert_eq!(h.controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_frames_before_open_are_not_sent() {
        let mut h = Harness::new();
        h.controller.activate().await.unwrap();
        // Capture only starts on open, so nothing is wired yet
        assert_eq!(h.mic.state.lock().unwrap().started, 0);

        h.fire(ChannelEvent::Open);
        h.pump();
        h.controller.deactivate();
        h.mic.emit(frame(1));
        h.pump();
        assert_eq!(h.sent(), 0);
    }

    #[tokio::test]
    async fn test_capture_unavailable_aborts_start() {
        let mut h = Harness::new();
        h.mic.state.lock().unwrap().fail_acquire = true;

        let result = h.controller.activate().await;
        assert!(matches!(result, Err(SessionError::CaptureUnavailable(_))));
        assert_eq!(h.controller.status(), ToggleStatus::Inactive);
        assert!(h.connector.wire.lock().unwrap().connects.is_empty());

        // Retrying after the device comes back works
        h.mic.state.lock().unwrap().fail_acquire = false;
        h.open().await;
    }

    #[tokio::test]
    async fn test_connect_failure_releases_microphone() {
        let mut h = Harness::new();
        h.connector.wire.lock().unwrap().fail_connect = true;

        assert!(h.controller.activate().await.is_err());
        assert_eq!(h.controller.state(), SessionState::Closed);
        assert_eq!(h.mic.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_capture_start_failure_tears_down() {
        let mut h = Harness::new();
        h.mic.state.lock().unwrap().fail_start = true;
        h.controller.activate().await.unwrap();
        h.fire(ChannelEvent::Open);
        h.pump();

        assert_eq!(h.controller.state(), SessionState::Closed);
        assert!(matches!(h.controller.last_end(), Some(EndReason::CaptureFailed(_))));
        assert_eq!(h.connector.wire.lock().unwrap().closes, 1);
        assert_eq!(h.mic.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_transport_error_tears_down_and_stops_playback() {
        let mut h = Harness::new();
        h.open().await;
        h.fire(audio_message(2400));
        h.fire(audio_message(2400));
        h.pump();
        assert_eq!(h.controller.scheduler().active_count(), 2);

        h.fire(ChannelEvent::Error("socket reset".to_string()));
        h.pump();
        assert_eq!(h.controller.state(), SessionState::Closed);
        assert_eq!(h.controller.status(), ToggleStatus::Inactive);
        assert_eq!(h.controller.scheduler().active_count(), 0);
        assert_eq!(h.mic.outstanding(), 0);
        assert!(matches!(h.controller.last_error(), Some(SessionError::Transport(_))));
    }

    #[tokio::test]
    async fn test_remote_close_and_late_events() {
        let mut h = Harness::new();
        h.open().await;
        h.fire(ChannelEvent::Close);
        h.pump();
        assert_eq!(h.controller.last_end(), Some(&EndReason::RemoteClosed));

        // The old session's callbacks can still fire after teardown
        h.fire(audio_message(2400));
        h.mic.emit(frame(1));
        h.pump();
        assert_eq!(h.controller.scheduler().scheduled_total(), 0);
        assert_eq!(h.sent(), 0);
    }

    #[tokio::test]
    async fn test_stale_session_events_are_ignored() {
        let mut h = Harness::new();
        h.open().await;
        let old_events = h.connector.wire.lock().unwrap().events.clone().unwrap();

        h.controller.deactivate();
        h.open().await;
        let current = h.controller.session_id();
        assert_ne!(current, Some(old_events.session()));

        old_events.emit(ChannelEvent::Close);
        old_events.emit(audio_message(2400));
        h.pump();
        assert_eq!(h.controller.state(), SessionState::Active);
        assert_eq!(h.controller.session_id(), current);
        assert_eq!(h.controller.scheduler().scheduled_total(), 0);
    }

    #[tokio::test]
    async fn test_rapid_toggle_releases_every_stream() {
        let mut h = Harness::new();
        for round in 0..10 {
            h.controller.toggle().await.unwrap();
            if round % 2 == 0 {
                h.fire(ChannelEvent::Open);
                h.pump();
            }
            h.controller.toggle().await.unwrap();
            h.pump();
            assert_eq!(h.controller.status(), ToggleStatus::Inactive);
        }

        let mic = h.mic.state.lock().unwrap();
        assert_eq!(mic.acquired, 10);
        assert_eq!(mic.released, 10);
        assert_eq!(h.connector.wire.lock().unwrap().closes, 10);
    }

    #[tokio::test]
    async fn test_activate_while_active_is_ignored() {
        let mut h = Harness::new();
        h.open().await;
        let id = h.controller.session_id();
        h.controller.activate().await.unwrap();
        assert_eq!(h.controller.session_id(), id);
        assert_eq!(h.mic.state.lock().unwrap().acquired, 1);
    }

    #[tokio::test]
    async fn test_send_failure_ends_session() {
        let mut h = Harness::new();
        h.open().await;
        h.connector.wire.lock().unwrap().fail_send = true;
        h.mic.emit(frame(5));
        h.pump();
        assert_eq!(h.controller.state(), SessionState::Closed);
        assert!(matches!(h.controller.last_end(), Some(EndReason::TransportError(_))));
    }

    #[tokio::test]
    async fn test_malformed_audio_is_skipped() {
        let mut h = Harness::new();
        h.open().await;
        let message: ServerMessage = serde_json::from_value(serde_json::json!({
            "serverContent": { "modelTurn": { "parts": [
                { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAAA" } },
                { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "%%%" } }
            ] } }
        }))
        .unwrap();
        h.fire(ChannelEvent::Message(message));
        h.pump();
        assert_eq!(h.controller.scheduler().scheduled_total(), 0);
        assert_eq!(h.controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_deactivate_cuts_off_scheduled_playback() {
        let mut h = Harness::new();
        h.open().await;
        h.fire(audio_message(2400));
        h.fire(audio_message(2400));
        h.pump();
        assert_eq!(h.controller.scheduler().active_count(), 2);

        h.controller.deactivate();
        assert_eq!(h.controller.scheduler().active_count(), 0);
        assert_eq!(h.output.state.lock().unwrap().stopped.len(), 2);
        assert_eq!(h.controller.last_end(), Some(&EndReason::UserRequest));
    }

    #[tokio::test]
    async fn test_interrupt_clears_audio_from_same_message() {
        let mut h = Harness::new();
        h.open().await;
        h.fire(audio_message(2400));
        h.pump();

        h.output.set_time(0.02);
        let data = encode_base64(&pcm16_to_bytes(&vec![500i16; 2400]));
        let message: ServerMessage = serde_json::from_value(serde_json::json!({
            "serverContent": {
                "modelTurn": { "parts": [{ "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": data } }] },
                "interrupted": true
            }
        }))
        .unwrap();
        h.fire(ChannelEvent::Message(message));
        h.pump();

        assert_eq!(h.controller.scheduler().scheduled_total(), 2);
        assert_eq!(h.controller.scheduler().active_count(), 0);
        assert_eq!(h.controller.scheduler().cursor(), 0.02);
        assert_eq!(h.output.state.lock().unwrap().stopped.len(), 2);
    }

    #[tokio::test]
    async fn test_audio_without_mime_type_plays_at_output_rate() {
        let mut h = Harness::new();
        h.open().await;

        let data = encode_base64(&pcm16_to_bytes(&vec![800i16; 4800]));
        let raw = format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"data":"{}"}}}}]}}}}}}"#,
            data
        );
        let message: ServerMessage = serde_json::from_str(&raw).unwrap();
        h.fire(ChannelEvent::Message(message));
        h.pump();
        {
            let output = h.output.state.lock().unwrap();
            assert_eq!(output.started.len(), 1);
            assert_eq!(output.started[0].2, 4800);
        }
        assert!((h.controller.scheduler().cursor() - 0.2).abs() < 1e-9);

        let message: ServerMessage = serde_json::from_str(
            r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"data":"AAAA"}}]},"interrupted":true}}"#,
        )
        .unwrap();
        h.fire(ChannelEvent::Message(message));
        h.pump();
        assert_eq!(h.controller.scheduler().active_count(), 0);
    }

    #[tokio::test]
    async fn test_implausible_sample_rate_is_skipped() {
        let mut h = Harness::new();
        h.open().await;

        let data = encode_base64(&pcm16_to_bytes(&vec![1000i16; 24000]));
        let message: ServerMessage = serde_json::from_value(serde_json::json!({
            "serverContent": { "modelTurn": { "parts": [
                { "inlineData": { "mimeType": "audio/pcm;rate=1", "data": data } }
            ] } }
        }))
        .unwrap();
        h.fire(ChannelEvent::Message(message));
        h.pump();

        assert_eq!(h.controller.scheduler().scheduled_total(), 0);
        assert!(h.output.state.lock().unwrap().started.is_empty());
        assert_eq!(h.controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_recording_saved_on_teardown() {
        let dir = std::env::temp_dir().join(format!("concierge_ctl_{}", uuid::Uuid::new_v4()));
        let mut h = Harness::build(Some(WavRecorder::new().with_recordings_dir(&dir)));
        h.open().await;
        h.mic.emit(frame(7));
        h.fire(audio_message(2400));
        h.pump();
        h.controller.deactivate();

        let files: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(files.len(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_run_reports_status_changes() {
        let mut h = Harness::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = event_channel();
        h.controller.events_tx = events_tx;

        commands_tx.send(Command::Toggle).unwrap();
        commands_tx.send(Command::Quit).unwrap();

        let mut seen = Vec::new();
        h.controller
            .run(commands_rx, events_rx, |status| seen.push(status))
            .await;

        assert_eq!(
            seen,
            vec![
                ToggleStatus::Inactive,
                ToggleStatus::Connecting,
                ToggleStatus::Inactive
            ]
        );
        assert_eq!(h.mic.outstanding(), 0);
    }
}
