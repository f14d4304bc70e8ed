//! Command-line interface for Concierge Voice
//!
//! Handles argument parsing and logging configuration.

use crate::models::LiveConfig;
use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

/// Concierge Voice - hands-free voice assistant for the NovaSphere store
#[derive(Parser, Debug)]
#[command(name = "concierge-voice")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = all deps
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Live model identifier
    #[arg(long)]
    pub model: Option<String>,

    /// Prebuilt voice used for agent replies
    #[arg(long)]
    pub voice: Option<String>,

    /// System instruction describing the agent's role
    #[arg(long)]
    pub instruction: Option<String>,

    /// Websocket endpoint of the live API
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Stream this WAV file instead of the microphone
    #[arg(long, value_name = "FILE")]
    pub input_wav: Option<PathBuf>,

    /// Save each session as WAV files
    #[arg(long)]
    pub record: bool,

    /// Store the given model, voice, instruction and recording choice in dconf
    #[arg(long)]
    pub remember: bool,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    /// Overlay command-line choices on top of `config`
    pub fn apply(&self, config: &mut LiveConfig) {
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(voice) = &self.voice {
            config.voice = voice.clone();
        }
        if let Some(instruction) = &self.instruction {
            config.system_instruction = instruction.clone();
        }
        if self.record {
            config.record_sessions = true;
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    builder.filter_module("concierge_voice", args.log_level());

    // Websocket and TLS internals only at -vvvv
    if args.verbose >= 4 {
        builder.filter_module("tungstenite", args.log_level());
        builder.filter_module("tokio_tungstenite", args.log_level());
        builder.filter_module("rustls", args.log_level());
    }

    builder.format_timestamp_millis().init();
}
