use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use rustls::crypto::{ring, CryptoProvider};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use liveclass::config::{AppConfig, ConfigStore};
use liveclass::events::{EventBus, SessionEvent, TopicSubscriber};
use liveclass::media::SyntheticMedia;
use liveclass::session::{JoinOutcome, MediaStack, SessionHandle};
use liveclass::signaling::WsSignalingChannel;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// liveclass command line arguments
#[derive(Parser, Debug)]
#[command(name = "liveclass")]
#[command(version, about = "Headless live classroom session client", long_about = None)]
struct CliArgs {
    /// Configuration file (created with defaults if missing)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Room to join
    #[arg(short = 'r', long, value_name = "ROOM")]
    room: String,

    /// Display name (overrides config)
    #[arg(short = 'n', long, value_name = "NAME")]
    name: Option<String>,

    /// Role announced to the room, e.g. teacher or student (overrides config)
    #[arg(long, value_name = "ROLE")]
    role: Option<String>,

    /// Bearer token for signaling and ICE credentials (overrides config)
    #[arg(long, value_name = "TOKEN", env = "LIVECLASS_TOKEN")]
    token: Option<String>,

    /// Signaling WebSocket URL (overrides config)
    #[arg(short = 's', long, value_name = "URL")]
    signaling_url: Option<String>,

    /// Do not publish the microphone
    #[arg(long)]
    no_audio: bool,

    /// Do not publish the camera
    #[arg(long)]
    no_video: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Session events to log, e.g. `consumer.*` or `chat.message`
    #[arg(long, value_name = "TOPIC", default_value = "*")]
    events: String,

    /// Write the overrides above back to the configuration file
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose, args.log_json);

    // Install default crypto provider (required by rustls 0.23+)
    if CryptoProvider::install_default(ring::default_provider()).is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    tracing::info!("Starting liveclass v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().unwrap_or_else(get_config_path);
    let config_store = ConfigStore::new(&config_path).await?;
    tracing::info!("Config file: {}", config_store.path().display());

    // CLI overrides apply to this run unless --save-config is given
    let config = if args.save_config {
        config_store.update(|c| apply_overrides(&args, c)).await?;
        (*config_store.get()).clone()
    } else {
        let mut config = (*config_store.get()).clone();
        apply_overrides(&args, &mut config);
        config.validate()?;
        config
    };

    let channel = Arc::new(WsSignalingChannel::new(&config.signaling));
    let media = Arc::new(SyntheticMedia::new());
    let events = EventBus::new();
    let event_task = tokio::spawn(log_events(events.subscribe_topic(args.events.clone())));

    let session = SessionHandle::spawn(
        config,
        channel,
        MediaStack {
            devices: media.clone(),
            backend: media,
        },
        events,
    );

    match session.join(&args.room).await {
        Ok(JoinOutcome::Active) => tracing::info!("Joined room {}", args.room),
        Ok(JoinOutcome::Degraded { warning }) => tracing::warn!("{}", warning),
        Err(e) => {
            tracing::error!("Failed to join room {}: {}", args.room, e);
            session.leave().await?;
            event_task.abort();
            return Err(e.into());
        }
    }

    tracing::info!("Type a line to chat, /quit or Ctrl-C to leave");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let text = line.trim();
                    if text == "/quit" {
                        break;
                    }
                    if !text.is_empty() {
                        if let Err(e) = session.send_chat(text).await {
                            tracing::warn!("Chat not sent: {}", e);
                        }
                    }
                }
                // stdin closed; keep running until Ctrl-C
                Ok(None) => {
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {}", e);
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
        }
    }

    tracing::info!("Leaving room {}", args.room);
    session.leave().await?;
    event_task.abort();
    Ok(())
}

fn apply_overrides(args: &CliArgs, config: &mut AppConfig) {
    if let Some(name) = &args.name {
        config.identity.display_name = name.clone();
    }
    if let Some(role) = &args.role {
        config.identity.role = role.clone();
    }
    if let Some(token) = &args.token {
        config.identity.token = Some(token.clone());
    }
    if let Some(url) = &args.signaling_url {
        config.signaling.url = url.clone();
    }
    if args.no_audio {
        config.media.publish_audio = false;
    }
    if args.no_video {
        config.media.publish_video = false;
    }
}

/// Log the session events of the selected topic
async fn log_events(mut rx: TopicSubscriber) {
    loop {
        match rx.recv().await {
            Ok(SessionEvent::ChatMessage {
                sender, message, ..
            }) => tracing::info!("[chat] {}: {}", sender, message),
            Ok(SessionEvent::Error { class, message }) => {
                tracing::error!("Session error ({}): {}", class, message)
            }
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::info!(event = event.event_name(), "{}", json),
                Err(e) => tracing::warn!("Failed to encode {}: {}", event.event_name(), e),
            },
            Err(RecvError::Lagged(n)) => {
                tracing::warn!("Event log lagged, {} events skipped", n)
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "liveclass=error",
        LogLevel::Warn => "liveclass=warn",
        LogLevel::Info => "liveclass=info",
        LogLevel::Verbose => "liveclass=debug,tokio_tungstenite=info",
        LogLevel::Debug => "liveclass=debug,tokio_tungstenite=debug",
        LogLevel::Trace => "liveclass=trace,tokio_tungstenite=debug,reqwest=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Default configuration file location
fn get_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("LIVECLASS_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("liveclass.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_only_given_flags() {
        let args = CliArgs::try_parse_from([
            "liveclass",
            "--room",
            "R1",
            "--name",
            "Ms. Diaz",
            "--no-video",
            "--save-config",
        ])
        .unwrap();
        let mut config = AppConfig::default();
        let url = config.signaling.url.clone();
        apply_overrides(&args, &mut config);

        assert!(args.save_config);
        assert_eq!(args.events, "*");
        assert_eq!(config.identity.display_name, "Ms. Diaz");
        assert!(!config.media.publish_video);
        assert!(config.media.publish_audio);
        assert_eq!(config.signaling.url, url);
    }

    #[tokio::test]
    async fn test_saved_overrides_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("liveclass.toml");
        let args = CliArgs::try_parse_from(["liveclass", "-r", "R1", "--role", "teacher"]).unwrap();

        let store = ConfigStore::new(&path).await.unwrap();
        store.update(|c| apply_overrides(&args, c)).await.unwrap();

        let reloaded = ConfigStore::new(&path).await.unwrap();
        assert_eq!(reloaded.get().identity.role, "teacher");
    }
}
