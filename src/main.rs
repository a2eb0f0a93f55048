use std::path::PathBuf;
use std::sync::Arc;

use a3s_relay::{
    DeliveryCycle, HttpSender, Ingestor, MqttIngest, NatsIngest, PersistentBuffer, RelayConfig,
    RelayService, Result, ServiceIntervals,
};
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[derive(Parser)]
#[command(
    name = "a3s-relay",
    about = "a3s-relay: store-and-forward relay from MQTT or NATS to an HTTP endpoint"
)]
struct Cli {
    /// Path to the JSON config file (defaults to $A3S_RELAY_CONFIG or config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let env_filter = std::env::var_os(EnvFilter::DEFAULT_ENV).is_some();
    let filter = init_tracing();

    let path = cli.config.unwrap_or_else(RelayConfig::path_from_env);
    let config = match RelayConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    apply_config_level(&filter, &config.logging.level, env_filter);
    tracing::info!(
        path = %path.display(),
        buffer_file = %config.buffer.persist_file.display(),
        "Configuration loaded"
    );

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "Relay failed");
        std::process::exit(1);
    }
}

/// Install the subscriber at `RUST_LOG` or `info` until the config is read
fn init_tracing() -> FilterHandle {
    let initial = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(initial);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
    handle
}

/// Switch to the configured level unless `RUST_LOG` was given
fn apply_config_level(handle: &FilterHandle, level: &str, env_filter: bool) {
    if env_filter {
        return;
    }
    let result = match EnvFilter::try_new(level) {
        Ok(filter) => handle.reload(filter),
        Err(e) => {
            tracing::warn!(level, error = %e, "Invalid logging.level, keeping info");
            return;
        }
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "Failed to apply logging.level");
    }
}

async fn run(config: RelayConfig) -> Result<()> {
    let buffer = Arc::new(PersistentBuffer::open(
        config.buffer_config(),
        config.buffer.persist_file.clone(),
    )?);

    let sender = HttpSender::new(config.sender_config())?;
    let cycle = Arc::new(DeliveryCycle::new(buffer.clone(), Arc::new(sender)));
    let service = RelayService::start(cycle, ServiceIntervals::from_config(&config));
    let ingestor = Ingestor::new(buffer.clone());

    let mqtt = if config.mqtt.enabled() {
        match MqttIngest::start(&config.mqtt, &config.topics, ingestor.clone()) {
            Ok(ingest) => Some(ingest),
            Err(e) => {
                service.shutdown().await;
                return Err(e);
            }
        }
    } else {
        None
    };

    let nats = if config.bus.enabled() {
        match NatsIngest::start(&config.bus, ingestor).await {
            Ok(ingest) => Some(ingest),
            Err(e) => {
                if let Some(mqtt) = mqtt {
                    mqtt.shutdown().await;
                }
                service.shutdown().await;
                return Err(e);
            }
        }
    } else {
        None
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down");

    let mut ingested = 0;
    if let Some(mqtt) = mqtt {
        ingested += mqtt.shutdown().await;
    }
    if let Some(nats) = nats {
        ingested += nats.shutdown().await;
    }
    service.shutdown().await;

    let stats = buffer.stats().await;
    tracing::info!(
        ingested,
        remaining = stats.total_messages,
        dropped = stats.dropped_total,
        "Relay stopped"
    );
    Ok(())
}
