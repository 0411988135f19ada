use clap::Parser;
use reflex_bridge::{Bridge, Cli, ReflexConfig};
use reflex_bus::Bus;
use reflex_protocol::{EventOptions, Topic};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // .env must be loaded before clap reads the environment
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = ReflexConfig::load(&cli)?;

    tracing::info!(
        url = ?config.bridge.url,
        role = %config.bridge.role,
        queue = %config.bridge.queue_path.display(),
        muted = config.bus.muted,
        "reflex-bridge starting"
    );

    let bus = Bus::new(config.bus.clone())?;
    bus.start()?;

    let bridge = Bridge::new(config.bridge.clone(), bus.clone())?;
    let handle = bridge.handle();

    // Ask the remote memory service to hydrate this node
    bus.emit_as(
        &config.bus.source,
        &config.bus.channel,
        Topic::MEMORY_STATE_REQUEST,
        json!({ "reason": "startup" }),
        EventOptions::default().tags(["startup"]),
    )?;

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        tracing::info!("received ctrl-c, shutting down");
        handle.shutdown();
    });

    let result = bridge.run().await;
    bus.stop().await;

    let stats = bus.stats();
    tracing::info!(
        emitted = stats.emitted,
        deliveries = stats.deliveries,
        handler_failures = stats.handler_failures,
        dropped = stats.dropped,
        "reflex-bridge stopped"
    );
    result.map_err(Into::into)
}
