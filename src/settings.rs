//! Persistent session defaults using dconf
//!
//! Settings are stored in dconf under `/com/novasphere/concierge/`

use crate::models::LiveConfig;
use log::{debug, error};

const DCONF_PATH: &str = "/com/novasphere/concierge/";

/// Keys for dconf settings
mod keys {
    pub const MODEL: &str = "model";
    pub const VOICE: &str = "voice";
    pub const SYSTEM_INSTRUCTION: &str = "system-instruction";
    pub const RECORD_SESSIONS: &str = "record-sessions";
}

fn key(name: &str) -> String {
    format!("{}{}", DCONF_PATH, name)
}

/// Unset keys come back as errors or empty strings
fn get_string(name: &str) -> Option<String> {
    dconf_rs::get_string(&key(name))
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn set_string(name: &str, value: &str) {
    if let Err(e) = dconf_rs::set_string(&key(name), value) {
        error!("Failed to save {} to dconf: {}", name, e);
    }
}

pub fn get_model() -> Option<String> {
    get_string(keys::MODEL)
}

pub fn set_model(model: &str) {
    set_string(keys::MODEL, model);
}

pub fn get_voice() -> Option<String> {
    get_string(keys::VOICE)
}

pub fn set_voice(voice: &str) {
    set_string(keys::VOICE, voice);
}

pub fn get_system_instruction() -> Option<String> {
    get_string(keys::SYSTEM_INSTRUCTION)
}

pub fn set_system_instruction(instruction: &str) {
    set_string(keys::SYSTEM_INSTRUCTION, instruction);
}

/// Whether finished sessions are saved as WAV (defaults to false)
pub fn get_record_sessions() -> bool {
    dconf_rs::get_boolean(&key(keys::RECORD_SESSIONS)).unwrap_or(false)
}

pub fn set_record_sessions(record: bool) {
    if let Err(e) = dconf_rs::set_boolean(&key(keys::RECORD_SESSIONS), record) {
        error!("Failed to save record-sessions to dconf: {}", e);
    }
}

/// Built-in defaults overlaid with whatever dconf has stored
pub fn load_config() -> LiveConfig {
    let mut config = LiveConfig::default();
    if let Some(model) = get_model() {
        config.model = model;
    }
    if let Some(voice) = get_voice() {
        config.voice = voice;
    }
    if let Some(instruction) = get_system_instruction() {
        config.system_instruction = instruction;
    }
    config.record_sessions = get_record_sessions();
    debug!("Loaded settings from {}", DCONF_PATH);
    config
}

/// Persist the user-facing parts of `config`
pub fn save_config(config: &LiveConfig) {
    set_model(&config.model);
    set_voice(&config.voice);
    set_system_instruction(&config.system_instruction);
    set_record_sessions(config.record_sessions);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_live_under_app_path() {
        assert_eq!(key(keys::MODEL), "/com/novasphere/concierge/model");
        assert_eq!(
            key(keys::SYSTEM_INSTRUCTION),
            "/com/novasphere/concierge/system-instruction"
        );
    }
}
