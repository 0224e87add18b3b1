//! edgepub - device messaging entry point

use clap::{Parser, Subcommand};
use edgepub::config::DeviceConfig;
use edgepub::link::{ConnectionState, DeviceLink};
use edgepub::observability::logging::{parse_level, LogFormat};
use edgepub::observability::{init_default_logging, init_logging, HealthServer};
use edgepub::protocol::DeviceCommand;
use edgepub::transport::mqtt::MqttConnector;
use edgepub::transport::InboundMessage;
use serde_json::Value;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

/// Resilient MQTT publishing for edge devices
#[derive(Parser)]
#[command(name = "edgepub")]
#[command(about = "Publish device messages to an MQTT broker, buffering while offline")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, announce the device and publish periodic stats until stopped
    Run,
    /// Publish a single JSON message and exit
    Publish {
        /// Topic to publish to
        #[arg(short, long)]
        topic: String,
        /// JSON payload
        #[arg(short, long)]
        payload: String,
        /// Seconds to wait for the broker before giving up
        #[arg(long, default_value_t = 5)]
        wait_secs: u64,
    },
    /// Validate configuration
    Config {
        /// Show the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(parse_level("DEBUG"), LogFormat::Compact, false),
        _ => init_logging(parse_level("TRACE"), LogFormat::Compact, true),
    }

    info!("Starting edgepub v{}", env!("CARGO_PKG_VERSION"));

    let config = match DeviceConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_device(config).await,
        Commands::Publish {
            topic,
            payload,
            wait_secs,
        } => publish_once(config, &topic, &payload, wait_secs).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

async fn run_device(config: DeviceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let settings = config.messaging()?;
    let connector = MqttConnector::new(config.mqtt.clone());
    let (inbox_tx, inbox_rx) = mpsc::channel(64);
    let link = Arc::new(DeviceLink::new(&config, settings, connector, Some(inbox_tx)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.health.enabled {
        let device_id = link.device_id().unwrap_or("unconfigured").to_string();
        let health_server = Arc::new(HealthServer::new(
            device_id,
            config.health.port,
            link.metrics().clone(),
            link.outbox().clone(),
        ));
        let mut health_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let stop = async move {
                let _ = health_shutdown.wait_for(|stop| *stop).await;
            };
            if let Err(e) = health_server.start(stop).await {
                error!("Health server error: {}", e);
            }
        });
    }

    if !link.connect().await? {
        warn!("Running without messaging");
    }

    tokio::spawn(log_commands(inbox_rx));

    if config.device.stats_interval_secs > 0 && link.is_enabled() {
        let stats_link = link.clone();
        let period = Duration::from_secs(config.device.stats_interval_secs);
        tokio::spawn(publish_stats(stats_link, period, shutdown_rx.clone()));
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Device running, press Ctrl-C to stop");

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    let _ = shutdown_tx.send(true);
    link.shutdown().await;
    Ok(())
}

/// Publish a stats report every `period` until shutdown
async fn publish_stats(
    link: Arc<DeviceLink<MqttConnector>>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {
                let snapshot = link.metrics().get_metrics();
                let stats = match serde_json::to_value(&snapshot) {
                    Ok(stats) => stats,
                    Err(e) => {
                        warn!("Failed to encode stats: {}", e);
                        continue;
                    }
                };
                link.send_stats(stats).await;
            }
        }
    }
}

async fn log_commands(mut inbox: mpsc::Receiver<InboundMessage>) {
    while let Some(message) = inbox.recv().await {
        match DeviceCommand::parse(&message.payload) {
            Ok(command) => info!(
                topic = %message.topic,
                command = %command.command,
                args = %command.args,
                "Command received"
            ),
            Err(e) => warn!(topic = %message.topic, "Ignoring inbound message: {}", e),
        }
    }
}

async fn publish_once(
    config: DeviceConfig,
    topic: &str,
    payload: &str,
    wait_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let payload: Value = serde_json::from_str(payload)?;
    let settings = config
        .messaging()?
        .ok_or("messaging disabled: MQTT_BROKER_IP and MQTT_DEVICE_NAME must be set")?;

    let connector = MqttConnector::new(config.mqtt.clone());
    let link = DeviceLink::new(&config, Some(settings), connector, None);
    link.connect().await?;

    let mut states = link.manager().subscribe_state();
    let connected = matches!(
        timeout(
            Duration::from_secs(wait_secs),
            states.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await,
        Ok(Ok(_))
    );
    if !connected {
        link.shutdown().await;
        return Err(format!("broker not reachable within {wait_secs}s").into());
    }

    let outcome = link.publish(topic, payload, false).await;
    link.shutdown().await;
    println!("{outcome}");
    Ok(())
}

fn handle_config_command(config: DeviceConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    match config.messaging()? {
        Some(settings) => info!(
            device = %settings.device_name,
            broker = %format!("{}:{}", settings.broker_host, settings.broker_port),
            "Messaging enabled"
        ),
        None => warn!("Messaging disabled: MQTT_BROKER_IP or MQTT_DEVICE_NAME missing"),
    }

    info!("Configuration validation complete");
    Ok(())
}
