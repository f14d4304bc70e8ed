//! Microphone capture using PipeWire
//!
//! Captures mono audio, converts it to 16-bit PCM at 16kHz and hands it to the
//! session in fixed-size frames.

use super::resample::{downmix, resample};
use super::{CaptureEvent, CaptureStream, FrameSink, Microphone};
use crate::codec::f32_to_pcm16;
use crate::error::{SessionError, SessionResult};
use crate::models::{AudioChunk, CAPTURE_FRAME_SAMPLES, CAPTURE_SAMPLE_RATE};
use log::{debug, info, trace, warn};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;

/// How long to wait for the device to start streaming
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Current state of audio capture
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    /// Device is open but frames are not forwarded yet
    Open,
    Capturing,
    Error,
}

/// Audio capture configuration
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u32,
    pub frame_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: 1,
            frame_samples: CAPTURE_FRAME_SAMPLES,
        }
    }
}

/// Splits an unbounded stream of float samples into fixed-size PCM frames
#[derive(Debug)]
pub struct FrameChunker {
    sample_rate: u32,
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameChunker {
    pub fn new(sample_rate: u32, frame_samples: usize) -> Self {
        Self {
            sample_rate,
            frame_samples: frame_samples.max(1),
            pending: Vec::with_capacity(frame_samples),
        }
    }

    /// Append samples and return every frame that is now complete
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioChunk> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let pcm: Vec<i16> = self
                .pending
                .drain(..self.frame_samples)
                .map(f32_to_pcm16)
                .collect();
            frames.push(AudioChunk::new(self.sample_rate, 1, pcm));
        }
        frames
    }

    /// Number of samples waiting for a full frame
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partial frame
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Shared state for audio capture - thread-safe
#[derive(Clone)]
pub struct SharedCaptureState {
    inner: Arc<Mutex<CaptureStateInner>>,
}

struct CaptureStateInner {
    state: CaptureState,
    error: Option<String>,
    /// Current RMS volume level (0.0 - 1.0)
    volume_level: f32,
    chunker: FrameChunker,
    sink: Option<FrameSink>,
    frames_emitted: u64,
    /// Signals the opener once the stream is live or has failed
    ready: Option<oneshot::Sender<Result<(), String>>>,
}

impl SharedCaptureState {
    fn new(config: &CaptureConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CaptureStateInner {
                state: CaptureState::Idle,
                error: None,
                volume_level: 0.0,
                chunker: FrameChunker::new(config.sample_rate, config.frame_samples),
                sink: None,
                frames_emitted: 0,
                ready: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CaptureStateInner> {
        // Tolerate poisoning from a panicking sink
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CaptureState {
        self.lock().state
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn volume_level(&self) -> f32 {
        self.lock().volume_level
    }

    pub fn frames_emitted(&self) -> u64 {
        self.lock().frames_emitted
    }

    fn set_state(&self, state: CaptureState) {
        self.lock().state = state;
    }

    fn set_ready_signal(&self, ready: oneshot::Sender<Result<(), String>>) {
        self.lock().ready = Some(ready);
    }

    fn mark_ready(&self) {
        let mut inner = self.lock();
        if let Some(ready) = inner.ready.take() {
            inner.state = CaptureState::Open;
            let _ = ready.send(Ok(()));
        }
    }

    fn attach_sink(&self, sink: FrameSink) {
        let mut inner = self.lock();
        inner.chunker.clear();
        inner.sink = Some(sink);
        inner.state = CaptureState::Capturing;
    }

    fn detach_sink(&self) {
        let mut inner = self.lock();
        inner.sink = None;
        inner.chunker.clear();
        inner.state = CaptureState::Idle;
    }

    /// Record a failure and tell whoever is listening
    fn fail(&self, error: String) {
        let mut inner = self.lock();
        inner.error = Some(error.clone());
        inner.state = CaptureState::Error;
        if let Some(ready) = inner.ready.take() {
            let _ = ready.send(Err(error));
        } else if let Some(sink) = inner.sink.as_mut() {
            sink(CaptureEvent::Failed(error));
        }
    }

    /// Process incoming mono samples at the device rate
    fn process_samples(&self, samples: &[f32], sample_rate: u32) {
        let mut inner = self.lock();
        if samples.is_empty() || inner.sink.is_none() {
            return;
        }

        let rms = calculate_rms(samples);
        inner.volume_level = inner.volume_level * 0.7 + rms * 0.3;

        let target_rate = inner.chunker.sample_rate;
        let frames = if sample_rate != 0 && sample_rate != target_rate {
            let converted = resample(samples, sample_rate, target_rate);
            inner.chunker.push(&converted)
        } else {
            inner.chunker.push(samples)
        };

        let inner = &mut *inner;
        if let Some(sink) = inner.sink.as_mut() {
            for frame in frames {
                inner.frames_emitted += 1;
                trace!(
                    "Capture frame #{} ({} samples, level {:.3})",
                    inner.frames_emitted,
                    frame.len(),
                    inner.volume_level
                );
                sink(CaptureEvent::Frame(frame));
            }
        }
    }
}

/// Opens a PipeWire capture stream per session
#[derive(Default)]
pub struct PipeWireMicrophone {
    config: CaptureConfig,
}

impl PipeWireMicrophone {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Microphone for PipeWireMicrophone {
    type Stream = AudioCapture;

    async fn acquire(&mut self) -> SessionResult<AudioCapture> {
        let mut capture = AudioCapture::new(self.config.clone());
        let ready = capture.open().map_err(SessionError::CaptureUnavailable)?;

        let outcome = match tokio::time::timeout(OPEN_TIMEOUT, ready).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(capture
                .state
                .error()
                .unwrap_or_else(|| "capture thread exited".to_string())),
            Err(_) => Err(format!(
                "microphone did not start streaming within {}s",
                OPEN_TIMEOUT.as_secs()
            )),
        };

        match outcome {
            Ok(()) => {
                info!("Microphone acquired");
                Ok(capture)
            }
            Err(e) => {
                capture.stop();
                Err(SessionError::CaptureUnavailable(e))
            }
        }
    }
}

/// Audio capture manager using PipeWire
pub struct AudioCapture {
    config: CaptureConfig,
    state: SharedCaptureState,
    is_running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    sender: Option<pw::channel::Sender<PipeWireCommand>>,
}

enum PipeWireCommand {
    Stop,
}

impl AudioCapture {
    pub fn new(config: CaptureConfig) -> Self {
        let state = SharedCaptureState::new(&config);
        Self {
            config,
            state,
            is_running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            sender: None,
        }
    }

    /// Check if the device thread is running
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Open the device on a background thread
    ///
    /// The returned receiver resolves once PipeWire reports the stream as live.
    fn open(&mut self) -> Result<oneshot::Receiver<Result<(), String>>, String> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err("Capture already running".to_string());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        self.state.set_ready_signal(ready_tx);
        self.is_running.store(true, Ordering::SeqCst);

        let state = self.state.clone();
        let is_running = self.is_running.clone();
        let config = self.config.clone();

        // Create channel for stopping the loop
        let (sender, receiver) = pw::channel::channel::<PipeWireCommand>();
        self.sender = Some(sender);

        let handle = thread::Builder::new()
            .name("pw-capture".to_string())
            .spawn(move || {
                if let Err(e) = run_capture_loop(state.clone(), config, receiver) {
                    warn!("Capture loop failed: {}", e);
                    state.fail(e);
                }
                is_running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| format!("Failed to spawn capture thread: {}", e))?;

        self.thread_handle = Some(handle);
        Ok(ready_rx)
    }
}

impl CaptureStream for AudioCapture {
    fn start(&mut self, sink: FrameSink) -> SessionResult<()> {
        if !self.is_running() {
            let reason = self
                .state
                .error()
                .unwrap_or_else(|| "capture stream is not open".to_string());
            return Err(SessionError::CaptureUnavailable(reason));
        }
        self.state.attach_sink(sink);
        debug!("Capture forwarding frames");
        Ok(())
    }

    fn stop(&mut self) {
        self.state.detach_sink();

        // Send stop command
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PipeWireCommand::Stop);
        }

        // Wait for thread to finish
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            debug!(
                "Capture stopped after {} frames (input level {:.3})",
                self.state.frames_emitted(),
                self.state.volume_level()
            );
        }

        self.is_running.store(false, Ordering::SeqCst);
        self.state.set_state(CaptureState::Idle);
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the PipeWire capture loop in a background thread
fn run_capture_loop(
    state: SharedCaptureState,
    config: CaptureConfig,
    receiver: pw::channel::Receiver<PipeWireCommand>,
) -> Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;

    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;

    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    // Set up channel receiver to stop the loop
    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        PipeWireCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    // User data for the stream callbacks
    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        state: SharedCaptureState,
    }

    let user_data = UserData {
        format: Default::default(),
        state: state.clone(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => "NovaSphere Concierge",
    };

    let stream = pw::stream::StreamBox::new(&core, "concierge-capture", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .state_changed(|_, user_data, _old, new| match new {
            pw::stream::StreamState::Streaming => user_data.state.mark_ready(),
            pw::stream::StreamState::Error(message) => {
                user_data.state.fail(format!("Capture stream error: {}", message))
            }
            _ => {}
        })
        .param_changed(|_, user_data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }

            let (media_type, media_subtype) = match format_utils::parse_format(param) {
                Ok(v) => v,
                Err(_) => return,
            };

            if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
                return;
            }

            if let Err(e) = user_data.format.parse(param) {
                warn!("Failed to parse capture format: {:?}", e);
                return;
            }
            debug!(
                "Capture format negotiated: {}Hz, {} channel(s)",
                user_data.format.rate(),
                user_data.format.channels()
            );
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1) as usize;
            let sample_rate = user_data.format.rate();
            let n_samples = data.chunk().size() as usize / std::mem::size_of::<f32>();

            if let Some(raw_samples) = data.data() {
                let interleaved: Vec<f32> = raw_samples
                    .chunks_exact(std::mem::size_of::<f32>())
                    .take(n_samples)
                    .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
                    .collect();
                let mono = downmix(&interleaved, n_channels);
                user_data.state.process_samples(&mono, sample_rate);
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    // Request F32LE mono at the capture rate; PipeWire converts from the device
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(config.sample_rate);
    audio_info.set_channels(config.channels);

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    let values: Vec<u8> = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("Failed to serialize audio format: {:?}", e))?
    .0
    .into_inner();

    let pod = Pod::from_bytes(&values).ok_or("Failed to build format pod")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    // Run until stopped
    mainloop.run();

    Ok(())
}

/// Calculate RMS volume from samples
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
