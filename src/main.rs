//! mqtt-exec - Main Entry Point
//!
//! Owns the process lifetime: loads and validates configuration (the only
//! fatal path), starts the listener and dispatcher once, then blocks until
//! an interrupt or termination signal asks for a graceful shutdown.

use clap::Parser;
use mqtt_exec::config::{self, CliOverrides, FileConfig, ListenerConfig, SubscribeQos};
use mqtt_exec::dispatch::{Dispatcher, DISPATCH_QUEUE_DEPTH};
use mqtt_exec::observability::init_listener_logging;
use mqtt_exec::transport::MqttListener;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Execute a shell command upon MQTT message reception
#[derive(Parser)]
#[command(name = "mqtt-exec")]
#[command(about = "Run a shell command for every message received on an MQTT subscription")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(long, value_name = "CONFIG-FILE", default_value = "listener.toml")]
    config: PathBuf,

    /// Broker endpoint, either 'hostname' or 'hostname:port'
    #[arg(long, value_name = "HOST[:PORT]")]
    mqtt_endpoint: Option<String>,

    /// Topic filter to subscribe to
    #[arg(long, value_name = "TOPIC")]
    mqtt_topic: Option<String>,

    /// Client identifier
    #[arg(long, value_name = "ID")]
    client_id: Option<String>,

    /// Subscription quality of service
    #[arg(long, value_name = "QOS", value_parser = parse_qos)]
    qos: Option<SubscribeQos>,

    /// Root CA file path
    #[arg(long, value_name = "PEM-FILE")]
    ssl_root_ca: Option<PathBuf>,

    /// Certificate file path
    #[arg(long, value_name = "PEM-FILE")]
    ssl_cert: Option<PathBuf>,

    /// Private key file path
    #[arg(long, value_name = "PEM-FILE")]
    ssl_key: Option<PathBuf>,

    /// Shell command to execute per message
    #[arg(long, value_name = "COMMAND")]
    command: Option<String>,

    /// Enable debugging output
    #[arg(long)]
    debug: bool,
}

fn parse_qos(value: &str) -> Result<SubscribeQos, String> {
    match value {
        "at-most-once" | "0" => Ok(SubscribeQos::AtMostOnce),
        "at-least-once" | "1" => Ok(SubscribeQos::AtLeastOnce),
        other => Err(format!(
            "invalid QoS '{other}': expected 'at-most-once'/'0' or 'at-least-once'/'1'"
        )),
    }
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            mqtt_endpoint: self.mqtt_endpoint.clone(),
            mqtt_topic: self.mqtt_topic.clone(),
            client_id: self.client_id.clone(),
            qos: self.qos,
            ssl_root_ca: self.ssl_root_ca.clone(),
            ssl_cert: self.ssl_cert.clone(),
            ssl_key: self.ssl_key.clone(),
            command: self.command.clone(),
            debug: self.debug,
        }
    }
}

/// Load, merge, and validate configuration. Every failure here is fatal and
/// happens before any network attempt.
fn load_configuration(cli: &Cli) -> Result<ListenerConfig, config::ConfigError> {
    let file = if cli.config.exists() {
        FileConfig::load(&cli.config)?
    } else {
        FileConfig::default()
    };

    let config = config::resolve(file, cli.overrides())?;
    config.validate_credentials()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The debug flag may come from the config file, so resolve configuration
    // before wiring up the subscriber.
    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            init_listener_logging(cli.debug);
            error!("configuration error: {e}");
            process::exit(1);
        }
    };
    init_listener_logging(config.debug);

    info!("starting mqtt-exec v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run_listener(config).await {
        error!("listener failed: {e}");
        process::exit(1);
    }

    info!("shutdown complete");
}

async fn run_listener(config: ListenerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.transport.host,
        port = config.transport.port,
        topic = %config.subscription.topic_filter,
        "listener starting"
    );
    if config.command.is_none() {
        info!("no command configured, received messages will only be logged (use --command)");
    }

    let (message_tx, message_rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);
    let dispatch_loop = Dispatcher::new(config.command.clone()).run(message_rx);

    // Building the client re-reads the already-validated credential files;
    // a failure between validation and here is still a startup error.
    let mut listener = MqttListener::new(
        config.transport.clone(),
        config.subscription.clone(),
        message_tx,
    )?;

    // Transient connect failures are logged and swallowed: the connection
    // supervisor keeps retrying under backoff and the listener stays up.
    match listener.connect().await {
        Ok(()) => info!("connected and subscribed, waiting for messages"),
        Err(e) => warn!(error = %e, "initial connect not confirmed yet, retrying in background"),
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down gracefully");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down gracefully");
        }
    }

    // Best-effort: a failed disconnect must not turn a clean interrupt into
    // a non-zero exit.
    listener.disconnect().await;
    dispatch_loop.abort();

    Ok(())
}
