use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use chronicle_core::{EventId, StreamKey, StreamVersion};
use chronicle_events::DomainEvent;

use super::query::Pagination;
use super::r#trait::{EventRepository, EventStoreError};

#[derive(Debug, Default)]
struct Inner {
    /// Ordered by `(aggregate_id, aggregate_type)`, so a type scan comes out
    /// in `(aggregate_id, version)` order.
    streams: BTreeMap<StreamKey, Vec<DomainEvent>>,
    /// Event id → (stream, index into the stream).
    by_id: HashMap<EventId, (StreamKey, usize)>,
    /// Every event in insertion order.
    log: Vec<(StreamKey, usize)>,
}

/// In-memory append-only event repository.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventRepository {
    inner: RwLock<Inner>,
    fail_writes: AtomicBool,
}

impl InMemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `insert` fail with `Persistence` (outage simulation).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of persisted events across all streams.
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> EventStoreError {
        EventStoreError::Persistence("lock poisoned".to_string())
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn insert(&self, event: &DomainEvent) -> Result<(), EventStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EventStoreError::Persistence(
                "in-memory repository is rejecting writes".to_string(),
            ));
        }

        let key = event.stream_key();
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;

        if inner.by_id.contains_key(&event.id) {
            return Err(EventStoreError::InvalidEvent(format!(
                "event id {} already exists",
                event.id
            )));
        }

        let stream = inner.streams.entry(key.clone()).or_default();
        let current = StreamVersion::new(stream.last().map(|e| e.version).unwrap_or(0));
        current
            .check_next(event.version)
            .map_err(|e| EventStoreError::from_domain(&key, e))?;

        stream.push(event.clone());
        let index = stream.len() - 1;
        inner.by_id.insert(event.id, (key.clone(), index));
        inner.log.push((key, index));
        Ok(())
    }

    async fn load_stream(&self, stream: &StreamKey) -> Result<Vec<DomainEvent>, EventStoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner.streams.get(stream).cloned().unwrap_or_default())
    }

    async fn load_by_type(
        &self,
        event_type: &str,
        page: Pagination,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;

        let mut matching: Vec<&DomainEvent> = inner
            .log
            .iter()
            .filter_map(|(key, index)| inner.streams.get(key).and_then(|s| s.get(*index)))
            .filter(|e| e.event_type == event_type)
            .collect();
        matching.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        Ok(page.slice(matching.into_iter().cloned()))
    }

    async fn load_by_aggregate_type(
        &self,
        aggregate_type: &str,
        page: Pagination,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;

        let ordered = inner
            .streams
            .iter()
            .filter(|(key, _)| key.aggregate_type == aggregate_type)
            .flat_map(|(_, events)| events.iter().cloned());

        Ok(page.slice(ordered))
    }

    async fn get(&self, id: EventId) -> Result<Option<DomainEvent>, EventStoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner
            .by_id
            .get(&id)
            .and_then(|(key, index)| inner.streams.get(key).and_then(|s| s.get(*index)))
            .cloned())
    }

    async fn stream_version(&self, stream: &StreamKey) -> Result<u64, EventStoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner
            .streams
            .get(stream)
            .and_then(|s| s.last())
            .map(|e| e.version)
            .unwrap_or(0))
    }
}
