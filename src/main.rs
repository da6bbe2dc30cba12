//! tinymqtt command line tool
//!
//! Publishes or subscribes using a TOML configuration file, and validates
//! configuration without connecting.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tinymqtt::client::qos_from_level;
use tinymqtt::config::ConfigError;
use tinymqtt::error::{error_chain, sanitize_error_message};
use tinymqtt::observability::init_cli_logging;
use tinymqtt::{
    ClientBuilder, Message, MqttConfig, QoS, SubscribeIntent, TinyMqttError, TinyMqttResult,
};
use tokio::signal;
use tracing::{error, info};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["tinymqtt.toml", "config/tinymqtt.toml"];

/// Configuration-driven MQTT client
#[derive(Parser)]
#[command(name = "tinymqtt")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TINYMQTT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one message and print the result as JSON
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        message: String,
        #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
        #[arg(long)]
        retain: bool,
    },
    /// Subscribe and print messages until interrupted
    Subscribe {
        #[arg(short, long, required = true, num_args = 1..)]
        topic: Vec<String>,
        #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
    },
    /// Validate configuration and resolve session options
    Config {
        /// Print the configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_cli_logging(cli.verbose > 0);

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            let message = sanitize_error_message(&error_chain(&e));
            error!("Failed to load configuration: {}", message);
            eprintln!("error: {message}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
        } => publish(&config, &topic, level(qos), retain, message).await,
        Commands::Subscribe { topic, qos } => subscribe(&config, topic, level(qos)).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        let message = sanitize_error_message(&error_chain(&e));
        error!("Command failed: {}", message);
        eprintln!("error: {message}");
        process::exit(1);
    }
}

fn level(qos: u8) -> QoS {
    qos_from_level(qos).unwrap_or(QoS::AtMostOnce)
}

fn load_configuration(path: Option<&Path>) -> TinyMqttResult<MqttConfig> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(MqttConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(MqttConfig::load_from_file(path)?);
        }
    }

    Err(ConfigError::FileRead(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!(
            "no configuration file found, pass -c/--config or create {}",
            DEFAULT_CONFIG_PATHS.join(" or ")
        ),
    ))
    .into())
}

async fn publish(
    config: &MqttConfig,
    topic: &str,
    qos: QoS,
    retain: bool,
    message: String,
) -> TinyMqttResult<()> {
    let mut client = ClientBuilder::new(config).build()?;
    client.start().await?;

    let sent = client.send_message(topic, qos, retain, message).await;
    // Stop regardless of the publish outcome; the publish error wins
    let stopped = client.stop().await;

    let result = sent?;
    let json = serde_json::to_string_pretty(&result)
        .map_err(|e| TinyMqttError::Output(e.to_string()))?;
    println!("{json}");
    stopped?;
    Ok(())
}

async fn subscribe(
    config: &MqttConfig,
    topics: Vec<String>,
    qos: QoS,
) -> TinyMqttResult<()> {
    let printer: Arc<dyn Fn(Message) + Send + Sync> = Arc::new(|message: Message| {
        info!(topic = %message.topic, qos = ?message.qos, retain = message.retain, "Message received");
        println!(
            "{} {}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        );
    });
    let intents = topics
        .iter()
        .map(|topic| SubscribeIntent::new(topic, qos, printer.clone()));

    let mut client = ClientBuilder::new(config).intents(intents).build()?;
    if let Err(e) = client.start().await {
        // A partial start still holds a connection
        let _ = client.stop().await;
        return Err(e.into());
    }

    info!(?topics, "Subscribed, waiting for messages (Ctrl-C to stop)");
    signal::ctrl_c().await?;
    info!("Interrupted, stopping");

    client.stop().await?;
    Ok(())
}

fn handle_config_command(
    config: &MqttConfig,
    show: bool,
) -> TinyMqttResult<()> {
    let options = ClientBuilder::new(config).session_options()?;
    info!(?options, "Configuration resolved");

    if show {
        let shown = toml::to_string_pretty(&config.redacted())
            .map_err(|e| TinyMqttError::Output(e.to_string()))?;
        println!("{shown}");
    }
    println!("Configuration OK (client id '{}')", options.client_id);
    Ok(())
}
