//! Node assembly
//!
//! Wires the ingest adapter, event buffer, subscription registry, pull
//! distributor and persistence sink together and owns their lifecycles.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use types::errors::{ConfigError, StoreError};

use crate::buffer::EventBuffer;
use crate::config::{PersistenceConfig, StreamConfig};
use crate::distributor::{DistributorConfig, PullDistributor};
use crate::ingestion::IngestAdapter;
use crate::metrics::{watch_thresholds, AlertThresholds, ServiceMetrics};
use crate::persistence::PersistenceSink;
use crate::store::BarStore;
use crate::subscriptions::{RegistryConfig, SubscriptionRegistry};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to start persistence thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A running stream node.
///
/// Must be started from within a Tokio runtime; the distributor runs as a
/// task on it. The persistence sink runs on its own thread.
pub struct MarketStream {
    ingest: Arc<IngestAdapter>,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<ServiceMetrics>,
    stream_config: StreamConfig,
    shutdown_tx: watch::Sender<bool>,
    distributor: JoinHandle<()>,
    alerts: JoinHandle<()>,
    sink: PersistenceSink,
}

impl MarketStream {
    pub fn start<F, Fut, S>(
        stream_config: StreamConfig,
        persistence_config: PersistenceConfig,
        make_store: F,
    ) -> Result<Self, ServiceError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<S, StoreError>>,
        S: BarStore + 'static,
    {
        stream_config.validate()?;
        persistence_config.validate()?;

        let metrics = Arc::new(ServiceMetrics::new());
        let (publisher, drain) = EventBuffer::new(stream_config.buffer_capacity, Arc::clone(&metrics));
        let registry = Arc::new(SubscriptionRegistry::new(
            RegistryConfig::from(&stream_config),
            Arc::clone(&metrics),
        ));

        let sink = PersistenceSink::spawn(persistence_config, Arc::clone(&metrics), make_store)?;
        let ingest = Arc::new(IngestAdapter::new(publisher, sink.queue(), Arc::clone(&metrics)));

        let distributor = PullDistributor::new(
            drain,
            Arc::clone(&registry),
            Arc::clone(&metrics),
            DistributorConfig::from(&stream_config),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let alerts = tokio::spawn(watch_thresholds(
            Arc::clone(&metrics),
            AlertThresholds::default(),
            stream_config.alert_check_interval,
            shutdown_rx.clone(),
        ));
        let distributor = tokio::spawn(distributor.run(shutdown_rx));

        info!(
            buffer_capacity = stream_config.buffer_capacity,
            tick_interval_ms = stream_config.tick_interval.as_millis() as u64,
            "Market stream started"
        );

        Ok(Self {
            ingest,
            registry,
            metrics,
            stream_config,
            shutdown_tx,
            distributor,
            alerts,
            sink,
        })
    }

    /// Entry point for the upstream detector.
    pub fn ingest(&self) -> Arc<IngestAdapter> {
        Arc::clone(&self.ingest)
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn metrics(&self) -> Arc<ServiceMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn stream_config(&self) -> &StreamConfig {
        &self.stream_config
    }

    /// Stop distribution after the in-flight cycle, then flush persistence.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.distributor.await {
            warn!(error = %err, "Distributor task ended abnormally");
        }
        if let Err(err) = self.alerts.await {
            warn!(error = %err, "Threshold watch ended abnormally");
        }
        self.sink.shutdown().await;
        info!(metrics = ?self.metrics.export(), "Market stream stopped");
    }
}
