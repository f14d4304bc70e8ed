//! Concierge Voice - a hands-free live voice assistant for Linux
//!
//! Streams the microphone to a remote live agent and plays its spoken replies,
//! cutting playback off as soon as the user talks over it.

mod audio;
mod cli;
mod codec;
mod error;
mod models;
mod session;
mod settings;
mod tokio_runtime;

use anyhow::{anyhow, Context};
use audio::{Microphone, PipeWireMicrophone, PipeWireOutput, WavFileMicrophone};
use clap::Parser;
use log::{debug, info};
use models::{LiveConfig, ToggleStatus};
use session::{Command, ControllerEvent, EventReceiver, EventSender, GeminiLiveConnector, SessionController};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

fn main() -> anyhow::Result<()> {
    // Parse command-line arguments and initialize logging
    let args = cli::Args::parse();
    cli::init_logging(&args);

    let mut config = settings::load_config();
    args.apply(&mut config);
    if args.remember {
        settings::save_config(&config);
        info!("Saved session defaults to dconf");
    }

    let api_key = session::api_key_from_env()
        .ok_or_else(|| anyhow!("Set GEMINI_API_KEY (or API_KEY) to reach the live API"))?;
    let mut connector = GeminiLiveConnector::new(api_key);
    if let Some(endpoint) = &args.endpoint {
        connector = connector.with_endpoint(endpoint.clone());
    }

    info!(
        "Starting Concierge Voice (model {}, voice {})",
        config.model, config.voice
    );

    let runtime = tokio_runtime::build().context("Failed to create Tokio runtime")?;
    runtime.block_on(async move {
        let (events_tx, events_rx) = session::event_channel();

        let ended_tx = events_tx.clone();
        let output = PipeWireOutput::start(Box::new(move |handle| {
            let _ = ended_tx.send(ControllerEvent::PlaybackEnded(handle));
        }))
        .map_err(|e| anyhow!("Failed to open audio output: {}", e))?;

        match &args.input_wav {
            Some(path) => {
                let mic = WavFileMicrophone::new(path);
                run(config, mic, connector, output, events_tx, events_rx).await
            }
            None => {
                let mic = PipeWireMicrophone::new();
                run(config, mic, connector, output, events_tx, events_rx).await
            }
        }
    })
}

async fn run<M: Microphone>(
    config: LiveConfig,
    microphone: M,
    connector: GeminiLiveConnector,
    output: PipeWireOutput,
    events_tx: EventSender,
    events_rx: EventReceiver,
) -> anyhow::Result<()> {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_toggle_input(commands_tx));

    let mut controller = SessionController::new(config, microphone, connector, output, events_tx);
    controller.run(commands_rx, events_rx, print_status).await;

    info!("Concierge Voice stopped");
    Ok(())
}

/// Enter toggles the assistant; `q` or end of input quits
async fn read_toggle_input(commands: mpsc::UnboundedSender<Command>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let command = match lines.next_line().await {
            Ok(Some(line)) => match line.trim() {
                "q" | "quit" | "exit" => Command::Quit,
                "" => Command::Toggle,
                other => {
                    debug!("Ignoring input {:?}", other);
                    continue;
                }
            },
            Ok(None) | Err(_) => Command::Quit,
        };

        let quit = command == Command::Quit;
        if commands.send(command).is_err() || quit {
            break;
        }
    }
}

fn print_status(status: ToggleStatus) {
    match status {
        ToggleStatus::Inactive => {
            println!("Assistant idle. Press Enter to talk to the concierge, q to quit.")
        }
        ToggleStatus::Connecting => println!("Connecting to the concierge..."),
        ToggleStatus::Active => {
            println!("Assistant Active - Listening for your request... (Enter to stop)")
        }
    }
}
