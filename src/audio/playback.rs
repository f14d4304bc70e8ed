//! Audio playback using PipeWire
//!
//! Runs a continuous 24kHz mono output stream. Buffers are placed on a frame
//! timeline and mixed in as the output clock reaches them; silence fills the
//! gaps. The clock is the number of frames PipeWire has consumed.

use super::resample::resample;
use crate::models::{AudioBuffer, PLAYBACK_SAMPLE_RATE};
use crate::session::{AudioOutput, HandleId};
use log::{debug, info, warn};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Called from the PipeWire thread when a buffer has played to the end
pub type EndedCallback = Box<dyn Fn(HandleId) + Send>;

struct Voice {
    id: HandleId,
    start_frame: u64,
    samples: Arc<[f32]>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Shared state for audio playback - thread-safe
#[derive(Clone)]
pub struct SharedPlaybackState {
    inner: Arc<Mutex<PlaybackStateInner>>,
}

struct PlaybackStateInner {
    sample_rate: u32,
    /// Output clock in frames
    frames_rendered: u64,
    voices: Vec<Voice>,
}

impl SharedPlaybackState {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PlaybackStateInner {
                sample_rate,
                frames_rendered: 0,
                voices: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlaybackStateInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sample_rate(&self) -> u32 {
        self.lock().sample_rate
    }

    /// Current output clock in seconds
    pub fn current_time(&self) -> f64 {
        let inner = self.lock();
        inner.frames_rendered as f64 / inner.sample_rate as f64
    }

    /// Number of buffers waiting or playing
    pub fn voice_count(&self) -> usize {
        self.lock().voices.len()
    }

    /// Place samples on the timeline at `at` seconds
    pub fn schedule(&self, id: HandleId, at: f64, samples: &[f32]) {
        let mut inner = self.lock();
        let start_frame = (at.max(0.0) * inner.sample_rate as f64).round() as u64;
        inner.voices.push(Voice {
            id,
            start_frame,
            samples: samples.into(),
        });
    }

    /// Switch to the rate the device actually runs at
    ///
    /// The clock and anything already queued are rescaled so their positions in
    /// seconds are unchanged.
    pub fn set_sample_rate(&self, rate: u32) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if rate == 0 || rate == inner.sample_rate {
            return;
        }
        let old_rate = inner.sample_rate;
        let scale = rate as f64 / old_rate as f64;
        inner.frames_rendered = (inner.frames_rendered as f64 * scale).round() as u64;
        for voice in &mut inner.voices {
            voice.start_frame = (voice.start_frame as f64 * scale).round() as u64;
            voice.samples = resample(&voice.samples, old_rate, rate).into();
        }
        inner.sample_rate = rate;
    }

    /// Remove a buffer from the timeline
    pub fn cancel(&self, id: HandleId) {
        self.lock().voices.retain(|voice| voice.id != id);
    }

    /// Mix the next `out.len()` frames and advance the clock
    ///
    /// Returns the buffers that finished during this block.
    pub fn render(&self, out: &mut [f32]) -> Vec<HandleId> {
        out.fill(0.0);
        let mut inner = self.lock();
        let block_start = inner.frames_rendered;
        let block_end = block_start + out.len() as u64;

        for voice in &inner.voices {
            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);
            if from >= to {
                continue;
            }
            let src = (from - voice.start_frame) as usize;
            let dst = (from - block_start) as usize;
            let len = (to - from) as usize;
            for (out_sample, sample) in out[dst..dst + len]
                .iter_mut()
                .zip(&voice.samples[src..src + len])
            {
                *out_sample += *sample;
            }
        }

        inner.frames_rendered = block_end;

        let mut ended = Vec::new();
        inner.voices.retain(|voice| {
            if voice.end_frame() <= block_end {
                ended.push(voice.id);
                false
            } else {
                true
            }
        });
        ended
    }
}

/// Continuous PipeWire output implementing the scheduler's clock
pub struct PipeWireOutput {
    state: SharedPlaybackState,
    is_running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    sender: Option<pw::channel::Sender<PlaybackCommand>>,
}

enum PlaybackCommand {
    Stop,
}

impl PipeWireOutput {
    /// Open the output stream; `on_ended` fires as buffers finish
    pub fn start(on_ended: EndedCallback) -> Result<Self, String> {
        let state = SharedPlaybackState::new(PLAYBACK_SAMPLE_RATE);
        let is_running = Arc::new(AtomicBool::new(true));

        let (sender, receiver) = pw::channel::channel::<PlaybackCommand>();

        let thread_state = state.clone();
        let thread_running = is_running.clone();
        let handle = thread::Builder::new()
            .name("pw-playback".to_string())
            .spawn(move || {
                if let Err(e) = run_playback_loop(thread_state, receiver, on_ended) {
                    warn!("Playback error: {}", e);
                }
                thread_running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| format!("Failed to spawn playback thread: {}", e))?;

        Ok(Self {
            state,
            is_running,
            thread_handle: Some(handle),
            sender: Some(sender),
        })
    }

    /// Check if the output thread is alive
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop the output stream
    pub fn stop_stream(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PlaybackCommand::Stop);
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.is_running.store(false, Ordering::SeqCst);
    }
}

impl AudioOutput for PipeWireOutput {
    fn sample_rate(&self) -> u32 {
        self.state.sample_rate()
    }

    fn current_time(&self) -> f64 {
        self.state.current_time()
    }

    fn start(&mut self, handle: HandleId, at: f64, buffer: &AudioBuffer) {
        if !self.is_running() {
            warn!("Output stream is down, dropping buffer {}", handle);
            return;
        }
        self.state.schedule(handle, at, &buffer.data);
    }

    fn stop(&mut self, handle: HandleId) {
        self.state.cancel(handle);
    }
}

impl Drop for PipeWireOutput {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

/// Run the PipeWire playback loop in a background thread
fn run_playback_loop(
    state: SharedPlaybackState,
    receiver: pw::channel::Receiver<PlaybackCommand>,
    on_ended: EndedCallback,
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
        PlaybackCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    // User data for the stream callbacks
    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        state: SharedPlaybackState,
        on_ended: EndedCallback,
        mix: Vec<f32>,
    }

    let user_data = UserData {
        format: Default::default(),
        state: state.clone(),
        on_ended,
        mix: Vec::new(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => "NovaSphere Concierge",
    };

    let stream = pw::stream::StreamBox::new(&core, "concierge-playback", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
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
                warn!("Failed to parse playback format: {:?}", e);
                return;
            }
            let rate = user_data.format.rate();
            if rate != 0 && rate != user_data.state.sample_rate() {
                info!(
                    "Playback negotiated {}Hz instead of {}Hz, rescheduling at device rate",
                    rate,
                    user_data.state.sample_rate()
                );
                user_data.state.set_sample_rate(rate);
            }
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
            let stride = std::mem::size_of::<f32>() * n_channels;

            let Some(slice) = data.data() else {
                return;
            };

            let n_frames = slice.len() / stride;
            user_data.mix.resize(n_frames, 0.0);
            let ended = user_data.state.render(&mut user_data.mix);

            for (i, &sample) in user_data.mix.iter().enumerate() {
                let bytes = sample.clamp(-1.0, 1.0).to_le_bytes();
                // Duplicate mono into every output channel
                for channel in 0..n_channels {
                    let offset = i * stride + channel * std::mem::size_of::<f32>();
                    slice[offset..offset + 4].copy_from_slice(&bytes);
                }
            }

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = (n_frames * stride) as u32;

            for id in ended {
                (user_data.on_ended)(id);
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    // Request F32LE mono at the playback rate
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(state.sample_rate());
    audio_info.set_channels(1);

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

    // Connect the stream (Output direction for playback)
    stream
        .connect(
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    debug!("Playback stream connected");
    mainloop.run();

    Ok(())
}
