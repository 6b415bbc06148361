mod config;

use clap::Parser as _;
use config::Config;
use std::sync::Arc;
use tallyproxy::{
    AppState,
    aliases::{Aliases, ConfigSnapshot, WatchedFile},
    build_metrics_layer_and_handle, build_metrics_router, build_router,
    client::create_hyper_client,
    engine::http::{DEFAULT_API_BASE, HttpEngine},
    engine::retry::Retrying,
    store::SqliteStore,
};
use tokio::net::TcpListener;
use tracing::{info, instrument};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!("Starting tallyproxy with config: {:?}", config);

    let snapshot = ConfigSnapshot::from_config_file(&config.config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load aliases from config: {}", e))?;
    let aliases = Aliases::new(snapshot);

    if config.watch {
        aliases
            .receive_updates(WatchedFile(config.config.clone()))
            .await?;
    }

    let store = SqliteStore::open(&config.db).map_err(|e| {
        anyhow::anyhow!("Failed to open database {}: {}", config.db.display(), e)
    })?;

    let engine = Retrying::new(
        HttpEngine::new(create_hyper_client(config.pool()), DEFAULT_API_BASE.parse()?),
        config.retries,
    );
    let app_state = AppState::new(aliases, Arc::new(engine), store, config.defaults());
    let mut router = build_router(app_state);

    if config.metrics {
        let (prometheus_layer, handle) =
            build_metrics_layer_and_handle(config.metrics_prefix.clone());
        router = router.layer(prometheus_layer);

        let metrics_addr = format!("{}:{}", config.host, config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr).await?;
        info!("Metrics endpoint listening on {}", metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, build_metrics_router(handle)).await {
                tracing::error!("Metrics server stopped: {}", e);
            }
        });
    }

    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("tallyproxy listening on {}", bind_addr);

    axum::serve(listener, router).await?;

    Ok(())
}
