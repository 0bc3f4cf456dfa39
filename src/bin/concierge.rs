//! Console client for the concierge voice and text channels.
//!
//! Usage: `concierge [--config PATH] [chat|devices]`
//!
//! In chat mode, typed lines go to the text channel. Voice commands:
//! `/talk` starts recording, `/stop` ends it, `/auto` toggles auto-listen,
//! `/connect` redials both channels, `/quit` exits.

use clap::{Parser, Subcommand};
use concierge::audio::capture::CpalMicrophone;
use concierge::audio::playback::CpalPlayer;
use concierge::channel::transport::WebSocketTransport;
use concierge::session::FileSessionStore;
use concierge::{
    AudioChatEvent, AudioChatHandle, AudioChatOrchestrator, ConciergeConfig, TextChatEvent,
    TextChatOrchestrator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Concierge: voice and text client for the travel concierge service.
#[derive(Parser)]
#[command(name = "concierge", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Chat with the concierge by text and voice.
    Chat,

    /// List available audio devices.
    Devices,
}

/// A line typed at the chat console.
#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Empty,
    Quit,
    Talk,
    Stop,
    Auto,
    Connect,
    Message(String),
}

impl ConsoleCommand {
    fn parse(line: &str) -> Self {
        match line.trim() {
            "" => Self::Empty,
            "/quit" => Self::Quit,
            "/talk" => Self::Talk,
            "/stop" => Self::Stop,
            "/auto" => Self::Auto,
            "/connect" => Self::Connect,
            message => Self::Message(message.to_owned()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout is the conversation; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("concierge=info,tungstenite=warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => ConciergeConfig::from_file(path)?,
        None => {
            let path = ConciergeConfig::default_config_path();
            if path.exists() {
                ConciergeConfig::from_file(&path)?
            } else {
                ConciergeConfig::default()
            }
        }
    }
    .with_env_overrides();
    config.validate()?;

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => run_chat(config).await,
        Command::Devices => list_devices(),
    }
}

async fn run_chat(config: ConciergeConfig) -> anyhow::Result<()> {
    println!("Concierge v{}", env!("CARGO_PKG_VERSION"));

    let session = Arc::new(FileSessionStore::load_or_create(
        &FileSessionStore::default_path(),
    )?);
    let transport = Arc::new(WebSocketTransport);

    let text = TextChatOrchestrator::spawn(&config, transport.clone(), session.clone());
    let voice = AudioChatOrchestrator::spawn(
        &config,
        transport,
        session,
        Arc::new(CpalMicrophone::new(&config.audio)),
        Arc::new(CpalPlayer::new(&config.audio)),
    );

    tokio::spawn(print_text_events(text.subscribe()));
    tokio::spawn(print_voice_events(voice.subscribe()));

    text.connect()?;
    voice.connect()?;

    println!("\nType a message, or /talk, /stop, /auto, /connect, /quit.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down...");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        match ConsoleCommand::parse(&line) {
            ConsoleCommand::Empty => {}
            ConsoleCommand::Quit => break,
            ConsoleCommand::Talk => voice.start_recording()?,
            ConsoleCommand::Stop => voice.stop_recording()?,
            ConsoleCommand::Auto => toggle_auto_listen(&voice)?,
            ConsoleCommand::Connect => {
                text.connect()?;
                voice.connect()?;
            }
            ConsoleCommand::Message(message) => {
                if let Err(e) = text.send_message(&message).await {
                    eprintln!("! {e}");
                }
            }
        }
    }

    text.shutdown();
    voice.shutdown();
    // Let both actors close their sockets.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}

fn toggle_auto_listen(voice: &AudioChatHandle) -> anyhow::Result<()> {
    let enabled = !voice.status().auto_listen;
    voice.set_auto_listen(enabled)?;
    println!("auto-listen {}", if enabled { "on" } else { "off" });
    Ok(())
}

async fn print_text_events(mut events: broadcast::Receiver<TextChatEvent>) {
    loop {
        match events.recv().await {
            Ok(TextChatEvent::Connected { .. }) => println!("[text] connected"),
            Ok(TextChatEvent::Response(text)) => println!("concierge: {text}"),
            Ok(TextChatEvent::TripPlan(plan)) => println!("[trip plan] {plan}"),
            Ok(TextChatEvent::Suggestion(data)) => println!("[suggestion] {data}"),
            Ok(TextChatEvent::Error(message)) => println!("[text] error: {message}"),
            Ok(TextChatEvent::Reconnecting { attempt, delay }) => {
                println!("[text] reconnecting in {}ms (attempt {attempt})", delay.as_millis());
            }
            Ok(TextChatEvent::Disconnected { reason }) => println!("[text] disconnected: {reason}"),
            Ok(TextChatEvent::GaveUp) => println!("[text] offline, type /connect to retry"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("text event printer lagged by {n}");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn print_voice_events(mut events: broadcast::Receiver<AudioChatEvent>) {
    loop {
        match events.recv().await {
            Ok(AudioChatEvent::Connected { .. }) => println!("[voice] connected"),
            Ok(AudioChatEvent::RecordingStarted { .. }) => println!("[voice] listening..."),
            Ok(AudioChatEvent::RecordingStopped { reason }) => match reason {
                Some(reason) => println!("[voice] stopped ({})", reason.as_str()),
                None => println!("[voice] stopped"),
            },
            Ok(AudioChatEvent::Transcription(text)) => println!("you said: {text}"),
            Ok(AudioChatEvent::ResponseText(text)) => println!("concierge: {text}"),
            Ok(AudioChatEvent::TripPlan(plan)) => println!("[trip plan] {plan}"),
            Ok(AudioChatEvent::Error { kind, message }) => {
                println!("[voice] {kind:?} error: {message}");
            }
            Ok(AudioChatEvent::Disconnected { reason }) => {
                println!("[voice] disconnected: {reason}");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("voice event printer lagged by {n}");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalMicrophone::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalPlayer::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}
