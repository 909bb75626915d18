//! Wiring of the store and replay engine, and their shutdown.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use chronicle_events::{InMemoryMessageBus, MessageBus, TopicRouter};
use chronicle_security::{EncryptionService, SensitiveFieldCodec};

use crate::config::{ChronicleConfig, ConfigError};
use crate::event_store::{EventRepository, EventStore, EventStoreError, InMemoryEventRepository, StoreSettings};
use crate::lock::{DistributedLockManager, InMemoryLockManager};
use crate::metrics::{InMemoryMetrics, MetricsSink};
use crate::replay::ReplayEngine;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("sensitive-data encryption is enabled but no encryption key was provided")]
    MissingEncryptionKey,

    #[error("shutdown did not finish before the deadline")]
    ShutdownTimedOut,

    #[error(transparent)]
    EventStore(#[from] EventStoreError),
}

/// Deadline for a graceful shutdown.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownContext {
    pub deadline: Instant,
}

impl ShutdownContext {
    pub fn within(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }
}

/// The event store and replay engine built from one configuration.
///
/// Construct once at startup, hand out the `Arc`s, and call `shutdown`
/// before exiting.
#[derive(Debug, Clone)]
pub struct EventSourcingRuntime {
    store: Arc<EventStore>,
    replay: Arc<ReplayEngine>,
}

impl EventSourcingRuntime {
    pub fn new(
        config: &ChronicleConfig,
        repository: Arc<dyn EventRepository>,
        bus: Arc<dyn MessageBus>,
        lock_manager: Arc<dyn DistributedLockManager>,
        encryption: Option<Arc<dyn EncryptionService>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let router = TopicRouter::new().with_overrides(config.store.topic_overrides.clone());
        let mut store = EventStore::new(repository, bus, metrics.clone())
            .with_router(router)
            .with_settings(StoreSettings::from(config));

        if config.store.encrypt_sensitive_data {
            let encryption = encryption.ok_or(RuntimeError::MissingEncryptionKey)?;
            store = store.with_codec(SensitiveFieldCodec::new(encryption));
        } else {
            warn!("sensitive-data encryption disabled; payloads are stored in plaintext");
        }

        let store = Arc::new(store);
        let replay = Arc::new(
            ReplayEngine::new(store.clone(), lock_manager, metrics).with_config(config.replay.clone()),
        );

        info!(
            client_id = %config.store.client_id,
            encrypt_sensitive_data = config.store.encrypt_sensitive_data,
            "event sourcing runtime ready"
        );
        Ok(Self { store, replay })
    }

    /// Everything in memory: repository, bus, locks and metrics.
    pub fn in_memory(
        config: &ChronicleConfig,
        encryption: Option<Arc<dyn EncryptionService>>,
    ) -> Result<Self, RuntimeError> {
        Self::new(
            config,
            Arc::new(InMemoryEventRepository::new()),
            Arc::new(InMemoryMessageBus::with_partitions(config.bus.partitions_per_topic)),
            Arc::new(InMemoryLockManager::new()),
            encryption,
            Arc::new(InMemoryMetrics::new()),
        )
    }

    pub fn store(&self) -> Arc<EventStore> {
        self.store.clone()
    }

    pub fn replay(&self) -> Arc<ReplayEngine> {
        self.replay.clone()
    }

    /// Stop subscriptions and close the store, giving up at the deadline.
    pub async fn shutdown(&self, ctx: ShutdownContext) -> Result<(), RuntimeError> {
        info!("shutting down event sourcing runtime");
        match tokio::time::timeout_at(ctx.deadline, self.store.close()).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!("shutdown deadline exceeded");
                Err(RuntimeError::ShutdownTimedOut)
            }
        }
    }
}
