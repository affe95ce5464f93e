use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use chainwatch_ingest::api::{self, AppState};
use chainwatch_ingest::config::{Config, LogFormat};
use chainwatch_ingest::db::{MemoryStore, PgStore, Store};
use chainwatch_ingest::decoders::DecoderRegistry;
use chainwatch_ingest::indexer::{Controller, StartFrom};
use chainwatch_ingest::rpc::HttpTransport;

async fn open_store(config: &Config) -> eyre::Result<Arc<dyn Store>> {
    if config.database.is_memory() {
        tracing::warn!("Using in-memory store, nothing will be persisted");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;

    tracing::info!("Connected to PostgreSQL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| eyre::eyre!("Failed to run migrations: {}", e))?;

    tracing::info!("Database migrations complete");
    Ok(Arc::new(PgStore::new(pool)))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    // Initialize structured logging (set RUST_LOG=debug for per-block output,
    // RUST_LOG_FORMAT=json for one JSON object per line)
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true);
    match LogFormat::from_env()? {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Plain => subscriber.init(),
    }

    tracing::info!("ChainWatch ingest starting");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path)?;
    tracing::info!(
        chains = config.chains.len(),
        "Configuration loaded from {}",
        config_path
    );

    let store = open_store(&config).await?;

    for chain in &config.chains {
        store.seed_chain(chain).await?;
    }
    tracing::info!("Chain configuration seeded");

    let registry = Arc::new(DecoderRegistry::standard()?);
    tracing::info!(
        log_decoders = registry.log_decoder_count(),
        "Decoder registry built"
    );

    let shutdown = CancellationToken::new();
    let controller = Arc::new(Controller::new(
        store.clone(),
        Arc::new(HttpTransport::new()?),
        registry,
        config.scheduler.clone(),
        config.chains.clone(),
        shutdown.clone(),
    ));

    for chain in config.chains.iter().filter(|c| c.autostart) {
        if let Err(e) = controller
            .start(chain.chain_id as i64, StartFrom::Configured)
            .await
        {
            tracing::error!(chain = %chain.name, error = %e, "Failed to start chain");
        }
    }

    if config.api.enabled {
        let state = AppState {
            store: store.clone(),
            controller: controller.clone(),
        };
        let host = config.api.host.clone();
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, &host, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        });
    }

    tracing::info!("Ingestion running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping all chains...");
    controller.stop_all().await;
    shutdown.cancel();

    tracing::info!("ChainWatch ingest stopped gracefully");
    Ok(())
}
