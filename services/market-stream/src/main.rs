use std::sync::Arc;

use market_stream::config::NodeConfig;
use market_stream::service::MarketStream;
use market_stream::store::PgBarStore;
use market_stream::websocket::{router, WsState};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use types::errors::StoreError;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = NodeConfig::from_env()?;
    tracing::info!(
        version = market_stream::SERVICE_VERSION,
        bind_addr = %config.bind_addr,
        "Starting market stream node"
    );

    let store_config = config.persistence.clone();
    let stream = MarketStream::start(config.stream.clone(), config.persistence.clone(), move || async move {
        let store = PgBarStore::connect_lazy(&store_config)?;
        // Boot without the schema check; failed writes are retried and counted.
        if let Err(err) = store.ensure_schema().await {
            tracing::warn!(error = %err, "Schema check failed, continuing");
        }
        Ok::<_, StoreError>(Arc::new(store))
    })?;

    let app = router(WsState {
        registry: stream.registry(),
        outbound_capacity: config.stream.session_outbound_capacity,
    });

    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!("Listening on {}", config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    stream.shutdown().await;
    Ok(())
}
