use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use chronicle_core::{EventId, StreamKey};
use chronicle_events::{BusMessage, DomainEvent, EventDraft, EventHandler, MessageBus, TopicRouter};
use chronicle_security::SensitiveFieldCodec;

use crate::config::{ChronicleConfig, SubscriptionConfig};
use crate::metrics::{MetricsSink, names};

use super::query::Pagination;
use super::subscription::{self, SubscriptionHandle, WorkerContext};
use super::r#trait::{EventRepository, EventStoreError};

/// Store-level settings (derived from `ChronicleConfig`).
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub client_id: String,
    pub consumer_group_prefix: String,
    pub subscription: SubscriptionConfig,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::from(&ChronicleConfig::default())
    }
}

impl From<&ChronicleConfig> for StoreSettings {
    fn from(config: &ChronicleConfig) -> Self {
        Self {
            client_id: config.store.client_id.clone(),
            consumer_group_prefix: config.store.consumer_group_prefix.clone(),
            subscription: config.subscription.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Reuse a group to resume from its committed offsets; a fresh
    /// `<prefix>-<8 hex>` id is generated when absent.
    pub group_id: Option<String>,
    /// Where a group without committed offsets starts.
    pub from_beginning: bool,
}

impl SubscribeOptions {
    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            from_beginning: false,
        }
    }

    pub fn from_beginning(mut self) -> Self {
        self.from_beginning = true;
        self
    }
}

/// Applies the sensitive-field codec on the way in and out of the store.
pub(crate) struct PayloadCipher {
    codec: Option<SensitiveFieldCodec>,
    metrics: Arc<dyn MetricsSink>,
}

impl PayloadCipher {
    pub(crate) fn new(codec: Option<SensitiveFieldCodec>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { codec, metrics }
    }

    /// Copy of `event` with sensitive leaves encrypted.
    pub(crate) fn seal(&self, event: &DomainEvent) -> Result<DomainEvent, EventStoreError> {
        let mut sealed = event.clone();
        if let Some(codec) = &self.codec {
            sealed.data = codec
                .encrypt(&event.data)
                .map_err(|e| EventStoreError::Encryption(e.to_string()))?;
        }
        Ok(sealed)
    }

    /// Decrypt in place; leaves that fail stay as ciphertext and are counted.
    pub(crate) fn open(&self, mut event: DomainEvent) -> DomainEvent {
        let Some(codec) = &self.codec else {
            return event;
        };

        let outcome = codec.decrypt(&event.data);
        if !outcome.failures.is_empty() {
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                failed_fields = outcome.failures.len(),
                "event delivered with undecryptable fields"
            );
            self.metrics.increment_counter(
                names::DECRYPTION_FAILURES,
                outcome.failures.len() as u64,
                &[("event_type", event.event_type.as_str())],
            );
        }
        event.data = outcome.data;
        event
    }
}

/// Durable append, topic-routed publish, point reads and subscriptions.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct EventStore {
    repository: Arc<dyn EventRepository>,
    bus: Arc<dyn MessageBus>,
    router: TopicRouter,
    cipher: Arc<PayloadCipher>,
    metrics: Arc<dyn MetricsSink>,
    settings: StoreSettings,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    closed: AtomicBool,
}

impl core::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventStore")
            .field("router", &self.router)
            .field("settings", &self.settings)
            .field("encrypting", &self.cipher.codec.is_some())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl EventStore {
    /// Store without payload encryption and with default settings.
    pub fn new(
        repository: Arc<dyn EventRepository>,
        bus: Arc<dyn MessageBus>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            repository,
            bus,
            router: TopicRouter::new(),
            cipher: Arc::new(PayloadCipher::new(None, metrics.clone())),
            metrics,
            settings: StoreSettings::default(),
            subscriptions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Encrypt sensitive fields before persist/publish and decrypt on read.
    pub fn with_codec(mut self, codec: SensitiveFieldCodec) -> Self {
        self.cipher = Arc::new(PayloadCipher::new(Some(codec), self.metrics.clone()));
        self
    }

    pub fn with_router(mut self, router: TopicRouter) -> Self {
        self.router = router;
        self
    }

    pub fn with_settings(mut self, settings: StoreSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), EventStoreError> {
        if self.is_closed() {
            return Err(EventStoreError::Closed);
        }
        Ok(())
    }

    /// Persist `draft` as the next event of its stream, then publish it.
    ///
    /// Returns the persisted event with plaintext data. A publish failure is
    /// logged and counted but does not fail the call: the event is durable.
    #[instrument(
        skip(self, draft),
        fields(
            event_type = %draft.event_type,
            aggregate_type = %draft.aggregate_type,
            aggregate_id = %draft.aggregate_id,
            version = draft.version
        ),
        err
    )]
    pub async fn append(&self, draft: EventDraft) -> Result<DomainEvent, EventStoreError> {
        self.ensure_open()?;
        draft
            .validate()
            .map_err(|e| EventStoreError::from_domain(&draft.stream_key(), e))?;

        let event = draft.into_event(EventId::new(), Utc::now());
        let labels = [
            ("aggregate_type", event.aggregate_type.as_str()),
            ("event_type", event.event_type.as_str()),
        ];

        let sealed = self.cipher.seal(&event)?;
        let message = BusMessage::from_event(&sealed)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

        if let Err(e) = self.repository.insert(&sealed).await {
            error!(event_id = %event.id, error = %e, "failed to persist event");
            self.metrics.increment_counter(names::SAVE_ERRORS, 1, &labels);
            return Err(e);
        }
        self.metrics.increment_counter(names::EVENTS_SAVED, 1, &labels);

        let topic = self.router.topic_for(&event.aggregate_type);
        match self.bus.publish(&topic, message).await {
            Ok(receipt) => debug!(
                event_id = %event.id,
                topic = %receipt.topic,
                partition = receipt.partition,
                offset = receipt.offset,
                "event published"
            ),
            Err(e) => {
                warn!(
                    event_id = %event.id,
                    topic = %topic,
                    error = %e,
                    "event persisted but not published; consumers recover it through replay"
                );
                self.metrics.increment_counter(names::PUBLISH_FAILURES, 1, &labels);
            }
        }

        Ok(event)
    }

    /// Full stream of one aggregate in ascending version order.
    pub async fn read_for_aggregate(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.ensure_open()?;
        let stream = StreamKey::new(aggregate_id, aggregate_type);
        let events = self
            .repository
            .load_stream(&stream)
            .await
            .inspect_err(|e| self.retrieval_failed("read_for_aggregate", e))?;

        self.metrics.increment_counter(
            names::EVENTS_RETRIEVED,
            events.len() as u64,
            &[("aggregate_type", aggregate_type)],
        );
        Ok(self.open_all(events))
    }

    /// Events of one type in ascending timestamp order.
    pub async fn read_by_type(
        &self,
        event_type: &str,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.ensure_open()?;
        let events = self
            .repository
            .load_by_type(event_type, Pagination::new(limit, offset))
            .await
            .inspect_err(|e| self.retrieval_failed("read_by_type", e))?;

        self.metrics.increment_counter(
            names::EVENTS_RETRIEVED_BY_TYPE,
            events.len() as u64,
            &[("event_type", event_type)],
        );
        Ok(self.open_all(events))
    }

    /// Every event of an aggregate type, ordered by `(aggregate_id, version)`.
    pub async fn read_by_aggregate_type(
        &self,
        aggregate_type: &str,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.ensure_open()?;
        let events = self
            .repository
            .load_by_aggregate_type(aggregate_type, Pagination::new(limit, offset))
            .await
            .inspect_err(|e| self.retrieval_failed("read_by_aggregate_type", e))?;

        self.metrics.increment_counter(
            names::EVENTS_RETRIEVED,
            events.len() as u64,
            &[("aggregate_type", aggregate_type)],
        );
        Ok(self.open_all(events))
    }

    pub async fn get_event(&self, id: EventId) -> Result<Option<DomainEvent>, EventStoreError> {
        self.ensure_open()?;
        let event = self
            .repository
            .get(id)
            .await
            .inspect_err(|e| self.retrieval_failed("get_event", e))?;
        Ok(event.map(|e| self.cipher.open(e)))
    }

    /// Last persisted version of a stream (0 when empty).
    pub async fn stream_version(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
    ) -> Result<u64, EventStoreError> {
        self.ensure_open()?;
        self.repository
            .stream_version(&StreamKey::new(aggregate_id, aggregate_type))
            .await
            .inspect_err(|e| self.retrieval_failed("stream_version", e))
    }

    /// Deliver decrypted events of `event_types` to `handler`.
    ///
    /// Within one partition events are handled one at a time in offset
    /// order; a handler error is logged and counted and the subscription
    /// carries on.
    pub async fn subscribe<S: AsRef<str>>(
        &self,
        event_types: &[S],
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, EventStoreError> {
        self.ensure_open()?;
        if event_types.is_empty() {
            return Err(EventStoreError::Subscription(
                "at least one event type is required".to_string(),
            ));
        }

        let topics = self.router.topics_for_event_types(event_types);
        let group_id = options
            .group_id
            .unwrap_or_else(|| generate_group_id(&self.settings.consumer_group_prefix));

        let consumer = self
            .bus
            .consumer(&group_id, &topics, options.from_beginning)
            .await
            .map_err(|e| {
                error!(group_id = %group_id, error = %e, "failed to create consumer");
                self.metrics.increment_counter(
                    names::SUBSCRIPTION_ERRORS,
                    1,
                    &[("group_id", group_id.as_str())],
                );
                EventStoreError::Subscription(e.to_string())
            })?;

        let ctx = WorkerContext {
            group_id: group_id.clone(),
            event_types: event_types.iter().map(|t| t.as_ref().to_string()).collect(),
            handler,
            cipher: self.cipher.clone(),
            metrics: self.metrics.clone(),
            settings: self.settings.subscription.clone(),
        };
        let handle = subscription::spawn(consumer, topics, ctx);

        info!(
            group_id = %group_id,
            topics = ?handle.topics(),
            from_beginning = options.from_beginning,
            client_id = %self.settings.client_id,
            "subscription started"
        );

        self.subscriptions.lock().await.push(handle.clone());
        Ok(handle)
    }

    /// Stop every subscription, close the bus and release connections.
    ///
    /// Idempotent; later operations fail with `Closed`.
    pub async fn close(&self) -> Result<(), EventStoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let handles: Vec<SubscriptionHandle> = self.subscriptions.lock().await.drain(..).collect();
        for handle in handles {
            handle.unsubscribe().await;
        }

        if let Err(e) = self.bus.close().await {
            warn!(error = %e, "message bus did not close cleanly");
        }
        self.repository.close().await;

        info!(client_id = %self.settings.client_id, "event store closed");
        Ok(())
    }

    fn open_all(&self, events: Vec<DomainEvent>) -> Vec<DomainEvent> {
        events.into_iter().map(|e| self.cipher.open(e)).collect()
    }

    fn retrieval_failed(&self, operation: &str, err: &EventStoreError) {
        error!(operation, error = %err, "event retrieval failed");
        self.metrics
            .increment_counter(names::RETRIEVAL_ERRORS, 1, &[("operation", operation)]);
    }
}

fn generate_group_id(prefix: &str) -> String {
    let random = Uuid::now_v7().simple().to_string();
    format!("{prefix}-{}", &random[random.len() - 8..])
}
