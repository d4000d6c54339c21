//! Operator CLI for the frolf event bus.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use frolf_eventbus::config::ConfigError;
use frolf_eventbus::metrics::EventBusMetrics;
use frolf_eventbus::{AppType, Envelope, EventBus, EventBusConfig};
use frolf_eventbus_nats::NatsBroker;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Event bus error
    #[error(transparent)]
    Bus(#[from] frolf_eventbus::Error),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Schedule delay out of range
    #[error("delay out of range: {0:?}")]
    Delay(Duration),

    /// Neither `--at` nor `--in` given
    #[error("either --at or --in is required")]
    MissingTime,

    /// NATS backend error
    #[error(transparent)]
    Nats(#[from] frolf_eventbus_nats::Error),

    /// One or more probes failed
    #[error("unhealthy: {0}")]
    Unhealthy(String),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// NATS server URL
    #[arg(long, default_value = "nats://localhost:4222", env = "FROLF_NATS_URL")]
    nats_url: String,

    /// Event bus config file (TOML)
    #[arg(long, env = "FROLF_EVENTBUS_CONFIG")]
    config: Option<PathBuf>,

    /// Role to run as, overriding the config file
    #[arg(long, env = "FROLF_APP_TYPE")]
    app_type: Option<AppType>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Create or reconcile the role's streams
    Provision,

    /// Run the liveness probes
    Health,

    /// Publish one message
    Publish {
        /// Topic to publish on
        #[arg(long)]
        topic: String,

        /// Metadata entries as key=value
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Message payload
        payload: String,
    },

    /// Print messages arriving on a topic
    Tail {
        /// Topic to subscribe to
        #[arg(long)]
        topic: String,

        /// Stop after this many messages
        #[arg(long)]
        count: Option<usize>,

        /// Reject messages instead of acknowledging them
        #[arg(long)]
        nack: bool,
    },

    /// Schedule a delayed message
    Schedule {
        /// Subject to publish on when due
        #[arg(long)]
        subject: String,

        /// Round the message belongs to
        #[arg(long)]
        round: String,

        /// Due time (RFC 3339)
        #[arg(long, conflicts_with = "delay")]
        at: Option<DateTime<Utc>>,

        /// Due after this long, e.g. `15m`
        #[arg(long = "in", value_parser = humantime::parse_duration)]
        delay: Option<Duration>,

        /// Message payload
        payload: String,
    },

    /// Cancel a round's delayed messages
    Cancel {
        /// Round to cancel
        #[arg(long)]
        round: String,
    },

    /// Restart processors for pending delayed rounds
    Recover {
        /// Keep processors running until interrupted
        #[arg(long)]
        wait: bool,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("invalid header {raw:?}, expected key=value"))
}

fn load_config(args: &Args) -> Result<EventBusConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => EventBusConfig::from_file(path)?,
        None => EventBusConfig::default(),
    };
    if let Some(app_type) = args.app_type {
        config.app_type = app_type;
    }
    config.validate()?;
    Ok(config)
}

fn due_time(at: Option<DateTime<Utc>>, delay: Option<Duration>) -> Result<DateTime<Utc>, Error> {
    match (at, delay) {
        (Some(at), _) => Ok(at),
        (None, Some(delay)) => TimeDelta::from_std(delay)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta))
            .ok_or(Error::Delay(delay)),
        (None, None) => Err(Error::MissingTime),
    }
}

async fn run(
    bus: &EventBus<NatsBroker>,
    command: Command,
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    match command {
        Command::Provision => {
            info!(app_type = %bus.app_type(), streams = ?bus.app_type().streams(), "streams provisioned");
        }
        Command::Health => {
            let mut failed = Vec::new();
            for checker in bus.health_checkers() {
                match checker.check(shutdown).await {
                    Ok(()) => println!("{}: ok", checker.name()),
                    Err(error) => {
                        println!("{}: {error}", checker.name());
                        failed.push(checker.name());
                    }
                }
            }
            if !failed.is_empty() {
                return Err(Error::Unhealthy(failed.join(", ")));
            }
        }
        Command::Publish {
            topic,
            headers,
            payload,
        } => {
            let envelope = headers
                .into_iter()
                .fold(Envelope::new(payload), |envelope, (key, value)| {
                    envelope.with_metadata(key, value)
                });
            let uuid = envelope.uuid().to_string();
            bus.publish(&topic, &[envelope]).await?;
            info!(topic, uuid, "published");
        }
        Command::Tail { topic, count, nack } => {
            let receiver = bus.subscribe(shutdown, &topic).await?;
            let mut seen = 0;
            while count.is_none_or(|count| seen < count) {
                let Ok(envelope) = receiver.recv_async().await else {
                    break;
                };
                let mut metadata: Vec<_> = envelope.metadata().iter().collect();
                metadata.sort();
                println!(
                    "{} {:?} {}",
                    envelope.uuid(),
                    metadata,
                    String::from_utf8_lossy(envelope.payload())
                );
                if nack {
                    envelope.nack();
                } else {
                    envelope.ack();
                }
                seen += 1;
            }
        }
        Command::Schedule {
            subject,
            round,
            at,
            delay,
            payload,
        } => {
            let execute_at = due_time(at, delay)?;
            bus.schedule(&subject, &round, execute_at, payload).await?;
            info!(subject, round, %execute_at, "scheduled");
        }
        Command::Cancel { round } => {
            let purged = bus.cancel(&round).await?;
            println!("purged {purged} message(s) for round {round}");
        }
        Command::Recover { wait } => {
            let summary = bus.recover(shutdown).await;
            println!(
                "started: {:?}, skipped: {:?}, malformed: {}",
                summary.started, summary.skipped, summary.malformed
            );
            if wait && !summary.started.is_empty() {
                info!("processors running, interrupt to stop");
                shutdown.cancelled().await;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let broker = NatsBroker::connect(&args.nats_url).await?;

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to listen for interrupt");
            return;
        }
        info!("Shutting down");
        signal_shutdown.cancel();
    });

    let bus = EventBus::new(broker, config, EventBusMetrics::disabled()).await?;
    let result = run(&bus, args.command, &shutdown).await;
    bus.close().await;

    result
}
