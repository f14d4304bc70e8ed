//! WAV file playback into the session in place of a live microphone
//!
//! Useful for demos and headless runs: the file is streamed in real time,
//! then followed by silence so the agent can detect the end of the utterance.

use super::capture::FrameChunker;
use super::resample::{downmix, resample};
use super::{CaptureEvent, CaptureStream, FrameSink, Microphone};
use crate::error::{SessionError, SessionResult};
use crate::models::{CAPTURE_FRAME_SAMPLES, CAPTURE_SAMPLE_RATE};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Streams a WAV file as if it were the microphone
pub struct WavFileMicrophone {
    path: PathBuf,
}

impl WavFileMicrophone {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl Microphone for WavFileMicrophone {
    type Stream = WavFileStream;

    async fn acquire(&mut self) -> SessionResult<WavFileStream> {
        let path = self.path.clone();
        let samples = tokio::task::spawn_blocking(move || load_wav_as_16khz_mono(&path))
            .await
            .map_err(|e| SessionError::CaptureUnavailable(e.to_string()))?
            .map_err(SessionError::CaptureUnavailable)?;

        info!(
            "Streaming {:?} as microphone input ({:.1}s)",
            self.path,
            samples.len() as f64 / CAPTURE_SAMPLE_RATE as f64
        );
        Ok(WavFileStream::new(samples))
    }
}

/// A WAV file being replayed in real time
pub struct WavFileStream {
    samples: Arc<Vec<f32>>,
    is_running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl WavFileStream {
    fn new(samples: Vec<f32>) -> Self {
        Self {
            samples: Arc::new(samples),
            is_running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }
}

impl CaptureStream for WavFileStream {
    fn start(&mut self, mut sink: FrameSink) -> SessionResult<()> {
        if self.is_running.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.is_running.store(true, Ordering::SeqCst);

        let samples = self.samples.clone();
        let is_running = self.is_running.clone();
        let handle = thread::Builder::new()
            .name("wav-capture".to_string())
            .spawn(move || {
                let frame_duration =
                    Duration::from_secs_f64(CAPTURE_FRAME_SAMPLES as f64 / CAPTURE_SAMPLE_RATE as f64);
                let silence = vec![0.0f32; CAPTURE_FRAME_SAMPLES];
                let mut chunker = FrameChunker::new(CAPTURE_SAMPLE_RATE, CAPTURE_FRAME_SAMPLES);
                let mut blocks = samples.chunks(CAPTURE_FRAME_SAMPLES);
                let mut next_deadline = Instant::now();

                while is_running.load(Ordering::SeqCst) {
                    let block = blocks.next().unwrap_or(silence.as_slice());
                    for frame in chunker.push(block) {
                        sink(CaptureEvent::Frame(frame));
                    }

                    next_deadline += frame_duration;
                    // stop() unparks this thread
                    while is_running.load(Ordering::SeqCst) {
                        match next_deadline.checked_duration_since(Instant::now()) {
                            Some(wait) if !wait.is_zero() => thread::park_timeout(wait),
                            _ => break,
                        }
                    }
                }
                debug!("WAV capture thread finished");
            })
            .map_err(|e| SessionError::CaptureUnavailable(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for WavFileStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Load a WAV file and convert to 16kHz mono f32 samples
fn load_wav_as_16khz_mono(path: &Path) -> Result<Vec<f32>, String> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| format!("Failed to open WAV file {:?}: {}", path, e))?;

    let spec = reader.spec();
    let sample_rate = spec.sample_rate;
    let channels = spec.channels as usize;

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("Failed to read samples: {}", e))?,
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            let max_val = (1u32 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("Failed to read samples: {}", e))?
        }
    };

    let mono = downmix(&samples, channels);
    Ok(resample(&mono, sample_rate, CAPTURE_SAMPLE_RATE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn write_wav(path: &Path, rate: u32, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..frames * channels as usize {
            writer.write_sample(8192i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}_{}.wav", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_load_converts_to_16khz_mono() {
        let path = temp_path("stereo_32k");
        write_wav(&path, 32000, 2, 32000);
        let samples = load_wav_as_16khz_mono(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(samples.len(), 16000);
        assert!(samples.iter().all(|&s| (s - 0.25).abs() < 1e-4));
    }

    #[tokio::test]
    async fn test_missing_file_is_capture_unavailable() {
        let mut mic = WavFileMicrophone::new("/nonexistent/concierge/input.wav");
        assert!(matches!(
            mic.acquire().await,
            Err(SessionError::CaptureUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_emits_frames_until_stopped() {
        let path = temp_path("mono_16k");
        write_wav(&path, 16000, 1, 4096);
        let mut mic = WavFileMicrophone::new(&path);
        let mut stream = mic.acquire().await.unwrap();
        std::fs::remove_file(&path).ok();

        let (tx, rx) = mpsc::channel();
        stream
            .start(Box::new(move |event| {
                let _ = tx.send(event);
            }))
            .unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        stream.stop();

        match first {
            CaptureEvent::Frame(chunk) => {
                assert_eq!(chunk.len(), CAPTURE_FRAME_SAMPLES);
                assert_eq!(chunk.samples()[0], 8192);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_next_frame() {
        let path = temp_path("mono_16k_long");
        write_wav(&path, 16000, 1, 16000);
        let mut mic = WavFileMicrophone::new(&path);
        let mut stream = mic.acquire().await.unwrap();
        std::fs::remove_file(&path).ok();

        let (tx, rx) = mpsc::channel();
        stream
            .start(Box::new(move |event| {
                let _ = tx.send(event);
            }))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        // The pacer is now waiting out a 256ms frame interval
        let started = Instant::now();
        stream.stop();
        assert!(started.elapsed() < Duration::from_millis(100));
        stream.stop();
    }
}
