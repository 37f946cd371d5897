//--------------------------------------------------------------------------------------------------
// EVENT CONSUMER
//--------------------------------------------------------------------------------------------------
// Runs the subscriptions of one service against RabbitMQ until Ctrl+C.
//
// Every entity named in the routing file gets an in-memory store, so the default CRUD handlers
// have somewhere to write. A `logEvent` handler is registered for routing files that name it.
//--------------------------------------------------------------------------------------------------

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use event_routing::adapters::{AmqpTransport, InMemoryEntityStore};
use event_routing::domain::services::retry_with_policy;
use event_routing::{
    CallbackManager, Config, ConsumerMetrics, DispatchError, DispatchResult, EventBus, FnCallback,
    HandlerRegistry, ModelRegistry, RoutingKeyCatalog, RoutingTable, SubscriptionInitializer,
};

/// Command line arguments of the consumer
#[derive(Parser, Debug)]
#[command(author, version, about = "Consumes entity events and applies them to local stores")]
struct Args {
    /// Routing file; overrides ROUTING_CONFIG
    #[arg(short, long)]
    routing: Option<PathBuf>,

    /// Unacknowledged deliveries per consumer; overrides PREFETCH_COUNT
    #[arg(short, long)]
    prefetch: Option<u16>,

    /// Print the routing key catalog of the routing file and exit
    #[arg(long)]
    print_keys: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = Config::try_from_env().context("failed to load configuration")?;
    if let Some(routing) = args.routing {
        config.routing_config = routing;
    }
    if let Some(prefetch) = args.prefetch {
        config.prefetch_count = prefetch.max(1);
    }

    let table = RoutingTable::from_path(&config.routing_config)
        .with_context(|| format!("failed to load {}", config.routing_config.display()))?;

    if args.print_keys {
        let catalog = RoutingKeyCatalog::generate(&table);
        println!("{}", serde_json::to_string_pretty(&catalog)?);
        return Ok(());
    }

    let mut models = ModelRegistry::new();
    for entity in table.entity_configs().keys() {
        models.register(entity, Arc::new(InMemoryEntityStore::new(entity)));
    }

    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(FnCallback::new("logEvent", |event| async move {
        info!(routing_key = %event.routing_key, data = ?event.data, "Event received");
        Ok::<_, DispatchError>(DispatchResult::skipped("logged"))
    })));

    let retry = config.retry_policy();
    let manager = Arc::new(
        CallbackManager::new(models, registry, retry.clone())
            .with_strict_callbacks(config.strict_callbacks),
    );

    let metrics = Arc::new(ConsumerMetrics::new());
    let transport = Arc::new(AmqpTransport::new(&config.rabbit_url, &config.service_name));
    let bus = Arc::new(EventBus::new(transport, config.bus_options(), Arc::clone(&metrics)));

    info!(url = %config.rabbit_url, service = %config.service_name, "Connecting to broker");
    retry_with_policy(&retry, "connect", || bus.connect())
        .await
        .map_err(|failure| failure.error)
        .context("broker unreachable")?;

    let initializer = SubscriptionInitializer::new(
        Arc::clone(&bus),
        manager,
        Arc::new(table),
        config.service_name.clone(),
    )
    .with_queue_mode(config.queue_mode);

    let handles = initializer
        .start_all_consumers()
        .await
        .context("failed to start consumers")?;
    info!(consumers = handles.len(), "Consumers running. Press Ctrl+C to stop.");

    signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping...");

    if let Err(err) = bus.close().await {
        error!(error = %err, "Failed to close event bus");
    }
    info!(metrics = ?metrics.snapshot(), "Consumer stopped");
    Ok(())
}
