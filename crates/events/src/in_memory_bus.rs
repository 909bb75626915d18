//! In-memory partitioned bus for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::bus::{BusError, Consumer, Delivery, MessageBus, PublishReceipt};
use crate::envelope::BusMessage;

const DEFAULT_PARTITIONS: u32 = 3;

#[derive(Debug, Default)]
struct BusState {
    /// topic → partitions → append-only log.
    topics: HashMap<String, Vec<Vec<BusMessage>>>,
    /// (group, topic, partition) → next offset to read.
    committed: HashMap<(String, String, u32), u64>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BusState>,
    published: Notify,
    partitions: u32,
    closed: AtomicBool,
    reject_publishes: AtomicBool,
}

impl Shared {
    fn ensure_topic<'a>(&self, state: &'a mut BusState, topic: &str) -> &'a mut Vec<Vec<BusMessage>> {
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); self.partitions as usize])
    }
}

/// In-memory pub/sub bus with topics, keyed partitions and consumer groups.
///
/// - No IO; logs live for the lifetime of the bus
/// - Committed offsets are kept per group, so re-subscribing with the same
///   group id resumes
/// - `reject_publishes(true)` simulates a broker outage
#[derive(Debug, Clone)]
pub struct InMemoryMessageBus {
    shared: Arc<Shared>,
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState::default()),
                published: Notify::new(),
                partitions: partitions.max(1),
                closed: AtomicBool::new(false),
                reject_publishes: AtomicBool::new(false),
            }),
        }
    }

    /// Make every subsequent publish fail with a transport error (or stop doing so).
    pub fn reject_publishes(&self, reject: bool) {
        self.shared.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Partition for a message key (stable across runs).
    pub fn partition_for(&self, key: &str) -> u32 {
        partition_for_key(key, self.shared.partitions)
    }

    /// All messages currently in `topic`, partition by partition.
    pub fn messages(&self, topic: &str) -> Vec<BusMessage> {
        match self.shared.state.lock() {
            Ok(state) => state
                .topics
                .get(topic)
                .map(|parts| parts.iter().flatten().cloned().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Committed offset (next to read) of a group on one partition.
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: u32) -> Option<u64> {
        let state = self.shared.state.lock().ok()?;
        state
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }
}

/// FNV-1a over the key bytes.
fn partition_for_key(key: &str, partitions: u32) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in key.as_bytes() {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % partitions
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<PublishReceipt, BusError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if self.shared.reject_publishes.load(Ordering::SeqCst) {
            return Err(BusError::Transport(format!("broker unavailable for topic '{topic}'")));
        }

        let partition = partition_for_key(&message.key, self.shared.partitions);
        let offset = {
            let mut state = self
                .shared
                .state
                .lock()
                .map_err(|_| BusError::Transport("lock poisoned".to_string()))?;
            let log = &mut self.shared.ensure_topic(&mut state, topic)[partition as usize];
            log.push(message);
            (log.len() - 1) as u64
        };

        self.shared.published.notify_waiters();

        Ok(PublishReceipt {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    async fn consumer(
        &self,
        group_id: &str,
        topics: &[String],
        from_beginning: bool,
    ) -> Result<Box<dyn Consumer>, BusError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if topics.is_empty() {
            return Err(BusError::InvalidRequest("consumer needs at least one topic".to_string()));
        }

        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| BusError::Transport("lock poisoned".to_string()))?;

        let mut positions = HashMap::new();
        for topic in topics {
            let ends: Vec<u64> = self
                .shared
                .ensure_topic(&mut state, topic)
                .iter()
                .map(|log| log.len() as u64)
                .collect();

            for (partition, end) in ends.into_iter().enumerate() {
                let partition = partition as u32;
                let key = (group_id.to_string(), topic.clone(), partition);
                let start = match state.committed.get(&key) {
                    Some(committed) => *committed,
                    None if from_beginning => 0,
                    None => end,
                };
                positions.insert((topic.clone(), partition), start);
            }
        }

        debug!(group_id, ?topics, from_beginning, "consumer joined");
        Ok(Box::new(InMemoryConsumer {
            shared: self.shared.clone(),
            group_id: group_id.to_string(),
            topics: topics.to_vec(),
            positions,
            closed: false,
        }))
    }

    async fn close(&self) -> Result<(), BusError> {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!("in-memory bus closed");
        }
        self.shared.published.notify_waiters();
        Ok(())
    }
}

struct InMemoryConsumer {
    shared: Arc<Shared>,
    group_id: String,
    topics: Vec<String>,
    /// (topic, partition) → next offset this consumer will hand out.
    positions: HashMap<(String, u32), u64>,
    closed: bool,
}

impl InMemoryConsumer {
    fn take_available(&mut self, max: usize) -> Result<Vec<Delivery>, BusError> {
        let state = self
            .shared
            .state
            .lock()
            .map_err(|_| BusError::Transport("lock poisoned".to_string()))?;

        let mut out = Vec::new();
        for topic in &self.topics {
            let Some(partitions) = state.topics.get(topic) else {
                continue;
            };
            for (partition, log) in partitions.iter().enumerate() {
                let partition = partition as u32;
                let pos = self
                    .positions
                    .entry((topic.clone(), partition))
                    .or_insert(0);

                while (*pos as usize) < log.len() && out.len() < max {
                    out.push(Delivery {
                        topic: topic.clone(),
                        partition,
                        offset: *pos,
                        message: log[*pos as usize].clone(),
                    });
                    *pos += 1;
                }
                if out.len() >= max {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn poll(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery>, BusError> {
        let deadline = Instant::now() + wait;
        let shared = self.shared.clone();

        loop {
            if self.closed || shared.closed.load(Ordering::SeqCst) {
                return Err(BusError::Closed);
            }

            // Register interest before checking, so a publish in between is not missed.
            let notified = shared.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_available(max.max(1))?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&mut self, topic: &str, partition: u32, offset: u64) -> Result<(), BusError> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| BusError::Transport("lock poisoned".to_string()))?;

        let key = (self.group_id.clone(), topic.to_string(), partition);
        let next = offset + 1;
        let entry = state.committed.entry(key).or_insert(0);
        if next > *entry {
            *entry = next;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
