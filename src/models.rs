//! Core data types for the live voice session and the Gemini Live wire format

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Microphone capture rate sent to the agent
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;
/// Rate of the agent's audio replies and of the playback output
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;
/// Samples per outbound capture frame
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Zephyr";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a luxury concierge for NovaSphere. \
Help the user browse products, check prices, and find stores.";

/// Identifies one logical voice session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is plenty for log lines and file names
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Lifecycle of a session channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What the toggle control shows to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToggleStatus {
    #[default]
    Inactive,
    Connecting,
    Active,
}

impl From<SessionState> for ToggleStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Connecting => ToggleStatus::Connecting,
            SessionState::Active => ToggleStatus::Active,
            SessionState::Idle | SessionState::Closing | SessionState::Closed => {
                ToggleStatus::Inactive
            }
        }
    }
}

/// Block of signed 16-bit PCM produced by the capture pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub sample_rate: u32,
    pub channels: u16,
    samples: Arc<[i16]>,
}

impl AudioChunk {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<i16>) -> Self {
        Self {
            sample_rate,
            channels,
            samples: samples.into(),
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        let frames = self.samples.len() / self.channels.max(1) as usize;
        frames as f64 / self.sample_rate as f64
    }

    /// MIME descriptor understood by the live API
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Text-safe audio payload ready for the session channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: String,
    pub mime_type: String,
}

/// Decoded floating point audio, interleaved when `channels > 1`
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Vec<f32>,
}

impl AudioBuffer {
    pub fn frames(&self) -> usize {
        self.data.len() / self.channels.max(1) as usize
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Average all channels down to mono
    pub fn into_mono(self) -> AudioBuffer {
        if self.channels <= 1 {
            return self;
        }
        let channels = self.channels as usize;
        let data = self
            .data
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        AudioBuffer {
            sample_rate: self.sample_rate,
            channels: 1,
            data,
        }
    }
}

/// Response modalities the live API can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
    Text,
}

/// Parameters for opening a live session
#[derive(Debug, Clone, PartialEq)]
pub struct LiveConfig {
    pub model: String,
    pub response_modality: Modality,
    pub voice: String,
    pub system_instruction: String,
    pub record_sessions: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            response_modality: Modality::Audio,
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            record_sessions: false,
        }
    }
}

// ---- outbound wire messages ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

impl SetupMessage {
    pub fn from_config(config: &LiveConfig) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };
        Self {
            setup: Setup {
                model,
                generation_config: GenerationConfig {
                    response_modalities: vec![config.response_modality],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: config.voice.clone(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![TextPart {
                        text: config.system_instruction.clone(),
                    }],
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    /// Absent on some server payloads; audio then assumes the playback rate
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

impl From<&EncodedFrame> for RealtimeInputMessage {
    fn from(frame: &EncodedFrame) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![Blob {
                    mime_type: frame.mime_type.clone(),
                    data: frame.data.clone(),
                }],
            },
        }
    }
}

// ---- inbound wire messages ----

/// Envelope received from the live API
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<Blob>,
    #[serde(default)]
    pub text: Option<String>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Inline audio blobs carried by the model turn, in order
    pub fn inline_audio(&self) -> impl Iterator<Item = &Blob> {
        self.server_content
            .iter()
            .filter_map(|content| content.model_turn.as_ref())
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .filter(|blob| blob.mime_type.is_empty() || blob.mime_type.starts_with("audio/"))
    }

    /// Text parts of the model turn (transcripts, when the server sends them)
    pub fn text_parts(&self) -> impl Iterator<Item = &str> {
        self.server_content
            .iter()
            .filter_map(|content| content.model_turn.as_ref())
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.text.as_deref())
    }

    /// The agent noticed the user talking over it
    pub fn is_interrupted(&self) -> bool {
        self.server_content
            .as_ref()
            .map(|content| content.interrupted)
            .unwrap_or(false)
    }

    pub fn is_turn_complete(&self) -> bool {
        self.server_content
            .as_ref()
            .map(|content| content.turn_complete)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_message_shape() {
        let json = serde_json::to_value(SetupMessage::from_config(&LiveConfig::default())).unwrap();
        assert_eq!(
            json["setup"]["model"],
            "models/gemini-2.5-flash-native-audio-preview-09-2025"
        );
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Zephyr"
        );
        assert!(json["setup"]["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("NovaSphere"));
    }

    #[test]
    fn test_realtime_input_shape() {
        let frame = EncodedFrame {
            data: "AAAA".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        };
        let json = serde_json::to_value(RealtimeInputMessage::from(&frame)).unwrap();
        assert_eq!(json["realtimeInput"]["mediaChunks"][0]["data"], "AAAA");
        assert_eq!(
            json["realtimeInput"]["mediaChunks"][0]["mimeType"],
            "audio/pcm;rate=16000"
        );
    }

    #[test]
    fn test_server_message_audio_and_interrupt() {
        let raw = r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}}]},"interrupted":true}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        let audio: Vec<_> = msg.inline_audio().collect();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].data, "AAA=");
        assert!(msg.is_interrupted());
        assert!(!msg.is_setup_complete());
    }

    #[test]
    fn test_inline_data_without_mime_type() {
        let raw = r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"data":"AAAA"}},{"text":"Welcome"}]},"interrupted":true}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        let audio: Vec<_> = msg.inline_audio().collect();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].mime_type, "");
        assert_eq!(msg.text_parts().collect::<Vec<_>>(), vec!["Welcome"]);
        assert!(msg.is_interrupted());
    }

    #[test]
    fn test_server_message_setup_complete() {
        let msg: ServerMessage = serde_json::from_str(r#"{"setupComplete":{}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert_eq!(msg.inline_audio().count(), 0);
        assert!(!msg.is_interrupted());
    }

    #[test]
    fn test_toggle_status_from_state() {
        assert_eq!(ToggleStatus::from(SessionState::Connecting), ToggleStatus::Connecting);
        assert_eq!(ToggleStatus::from(SessionState::Active), ToggleStatus::Active);
        assert_eq!(ToggleStatus::from(SessionState::Closed), ToggleStatus::Inactive);
    }

    #[test]
    fn test_chunk_duration() {
        let chunk = AudioChunk::new(16000, 1, vec![0; 4096]);
        assert!((chunk.duration() - 0.256).abs() < 1e-9);
        assert_eq!(chunk.mime_type(), "audio/pcm;rate=16000");
    }
}
