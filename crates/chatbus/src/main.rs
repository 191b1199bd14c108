//! `chatbus`: operate the event backbone from a terminal.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use chatbus_amqp::AmqpConnector;
use chatbus_core::{
    config::Config,
    connection::{ConnectionManager, ConnectionSettings},
    domain::CorrelationId,
    publisher::{Publisher, PublisherSettings},
    subscriber::{handler_fn, Subscriber, SubscriberSettings},
};

#[derive(Parser)]
#[command(name = "chatbus")]
#[command(about = "Publish and inspect chat-bot events on the message broker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to events and print every envelope as one JSON line
    Tap {
        /// Queue to declare and consume (defaults to `<SERVICE_NAME>.tap`)
        #[arg(short, long)]
        queue: Option<String>,
        /// Routing key pattern to bind; repeatable
        #[arg(short = 'k', long = "routing-key", default_value = "#")]
        routing_keys: Vec<String>,
    },
    /// Publish one event and print its event id
    Publish {
        /// Event type, e.g. `message.send`
        event_type: String,
        /// Event data as a JSON object
        data: String,
        /// Correlation id to continue an existing chain
        #[arg(short, long)]
        correlation_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = Config::load().context("loading configuration")?;
    chatbus_core::logging::init(&cfg.service_name, cfg.log_format)?;

    let connector = Arc::new(AmqpConnector::from_config(&cfg.broker));
    let manager = ConnectionManager::new(connector, ConnectionSettings::from_config(&cfg));
    manager.start();

    let outcome = match cli.command {
        Commands::Tap {
            queue,
            routing_keys,
        } => {
            let queue = queue.unwrap_or_else(|| format!("{}.tap", cfg.service_name));
            tap(&cfg, &manager, &queue, routing_keys).await
        }
        Commands::Publish {
            event_type,
            data,
            correlation_id,
        } => publish(&cfg, &manager, &event_type, &data, correlation_id).await,
    };

    if let Err(e) = manager.close().await {
        warn!(error = %e, "closing broker connection failed");
    }
    outcome
}

async fn tap(
    cfg: &Config,
    manager: &ConnectionManager,
    queue: &str,
    routing_keys: Vec<String>,
) -> Result<()> {
    let subscriber = Subscriber::new(manager.clone(), SubscriberSettings::from_config(cfg));
    let handle = subscriber
        .subscribe(
            queue,
            routing_keys,
            handler_fn(|envelope| async move {
                println!("{}", serde_json::to_string(&envelope)?);
                Ok(())
            }),
        )
        .await
        .with_context(|| format!("subscribing to `{queue}`"))?;
    info!(queue, "tapping events, ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;

    let stats = handle.stats();
    handle.stop().await;
    info!(
        acked = stats.acked,
        requeued = stats.requeued,
        dead_lettered = stats.dead_lettered,
        "tap stopped"
    );
    Ok(())
}

async fn publish(
    cfg: &Config,
    manager: &ConnectionManager,
    event_type: &str,
    data: &str,
    correlation_id: Option<String>,
) -> Result<()> {
    let data: serde_json::Value =
        serde_json::from_str(data).context("event data is not valid JSON")?;
    let publisher = Publisher::new(manager.clone(), PublisherSettings::from_config(cfg));
    let event_id = publisher
        .publish_raw(event_type, data, correlation_id.map(CorrelationId))
        .await
        .with_context(|| format!("publishing `{event_type}`"))?;
    println!("{event_id}");
    publisher.close().await?;
    Ok(())
}
