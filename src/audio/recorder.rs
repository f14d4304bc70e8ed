//! WAV recording of finished sessions using hound
//!
//! A session is saved as two files side by side: the 16kHz PCM that was sent
//! to the agent and the 24kHz audio the agent sent back.

use crate::models::{SessionId, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use chrono::{DateTime, Local};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Audio collected while a session is live
#[derive(Debug, Default)]
pub struct SessionRecording {
    mic: Vec<i16>,
    agent: Vec<f32>,
}

impl SessionRecording {
    pub fn push_mic(&mut self, samples: &[i16]) {
        self.mic.extend_from_slice(samples);
    }

    /// Agent audio at the playback rate, in the order it was scheduled
    pub fn push_agent(&mut self, samples: &[f32]) {
        self.agent.extend_from_slice(samples);
    }

    pub fn is_empty(&self) -> bool {
        self.mic.is_empty() && self.agent.is_empty()
    }

    pub fn mic_seconds(&self) -> f64 {
        WavRecorder::duration_seconds(self.mic.len(), CAPTURE_SAMPLE_RATE)
    }

    pub fn agent_seconds(&self) -> f64 {
        WavRecorder::duration_seconds(self.agent.len(), PLAYBACK_SAMPLE_RATE)
    }
}

/// Writes session recordings to disk
pub struct WavRecorder {
    recordings_dir: PathBuf,
}

impl WavRecorder {
    /// Recorder targeting `<data_local_dir>/concierge-voice/sessions`
    pub fn new() -> Self {
        let recordings_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("concierge-voice")
            .join("sessions");

        Self { recordings_dir }
    }

    pub fn with_recordings_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.recordings_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn recordings_dir(&self) -> &Path {
        &self.recordings_dir
    }

    fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.recordings_dir)
    }

    /// File stem shared by both halves of a session
    pub fn session_stem(&self, session: SessionId, started_at: DateTime<Local>) -> PathBuf {
        self.recordings_dir.join(format!(
            "session_{}_{}",
            started_at.format("%Y%m%d_%H%M%S"),
            session
        ))
    }

    /// Save whichever halves of the recording have audio
    ///
    /// Returns the paths written.
    pub fn save_session(
        &self,
        session: SessionId,
        started_at: DateTime<Local>,
        recording: &SessionRecording,
    ) -> Result<Vec<PathBuf>, String> {
        self.ensure_dir()
            .map_err(|e| format!("Failed to create recordings directory: {}", e))?;

        let stem = self.session_stem(session, started_at);
        let mut written = Vec::new();

        if !recording.mic.is_empty() {
            let path = with_suffix(&stem, "mic");
            let spec = WavSpec {
                channels: 1,
                sample_rate: CAPTURE_SAMPLE_RATE,
                bits_per_sample: 16,
                sample_format: SampleFormat::Int,
            };
            write_wav(&path, spec, &recording.mic)?;
            written.push(path);
        }

        if !recording.agent.is_empty() {
            let path = with_suffix(&stem, "agent");
            let spec = WavSpec {
                channels: 1,
                sample_rate: PLAYBACK_SAMPLE_RATE,
                bits_per_sample: 32,
                sample_format: SampleFormat::Float,
            };
            write_wav(&path, spec, &recording.agent)?;
            written.push(path);
        }

        Ok(written)
    }

    /// Get duration of samples in seconds
    pub fn duration_seconds(sample_count: usize, sample_rate: u32) -> f64 {
        sample_count as f64 / sample_rate as f64
    }
}

impl Default for WavRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut name = stem.as_os_str().to_owned();
    name.push(format!("_{}.wav", suffix));
    PathBuf::from(name)
}

fn write_wav<S: hound::Sample + Copy>(path: &Path, spec: WavSpec, samples: &[S]) -> Result<(), String> {
    let file = File::create(path).map_err(|e| format!("Failed to create {:?}: {}", path, e))?;
    let mut writer = WavWriter::new(BufWriter::new(file), spec)
        .map_err(|e| format!("Failed to create WAV writer: {}", e))?;

    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| format!("Failed to write sample: {}", e))?;
    }

    writer
        .finalize()
        .map_err(|e| format!("Failed to finalize WAV file: {}", e))
}
