use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures::{FutureExt, StreamExt};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use chronicle_events::{BusError, Consumer, Delivery, EventHandler};

use crate::config::SubscriptionConfig;
use crate::metrics::{MetricsSink, names};

use super::store::PayloadCipher;

/// Counters of one subscription since it started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Handled successfully.
    pub delivered: u64,
    /// Undecodable, or the handler returned an error or panicked.
    pub failed: u64,
    /// On a subscribed topic but of a type nobody asked for.
    pub skipped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SubscriptionStats {
        SubscriptionStats {
            delivered: self.delivered.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
        }
    }
}

/// Everything a worker needs besides its consumer.
pub(crate) struct WorkerContext {
    pub(crate) group_id: String,
    pub(crate) event_types: Vec<String>,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) cipher: Arc<PayloadCipher>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) settings: SubscriptionConfig,
}

/// Handle to a running subscription. Clones share the same worker.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    group_id: String,
    topics: Vec<String>,
    counters: Arc<Counters>,
    shutdown: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl core::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("group_id", &self.inner.group_id)
            .field("topics", &self.inner.topics)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn group_id(&self) -> &str {
        &self.inner.group_id
    }

    pub fn topics(&self) -> &[String] {
        &self.inner.topics
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.inner.counters.snapshot()
    }

    /// Stop the worker after its in-flight batch and wait for it to exit.
    ///
    /// Safe to call more than once.
    pub async fn unsubscribe(&self) {
        let _ = self.inner.shutdown.send(true);

        let join = self.inner.join.lock().await.take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                warn!(group_id = %self.inner.group_id, error = %e, "subscription worker aborted");
            }
        }
    }
}

pub(crate) fn spawn(
    consumer: Box<dyn Consumer>,
    topics: Vec<String>,
    ctx: WorkerContext,
) -> SubscriptionHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let counters = Arc::new(Counters::default());
    let group_id = ctx.group_id.clone();

    let span = info_span!("subscription", group_id = %group_id);
    let join = tokio::spawn(
        worker_loop(consumer, shutdown_rx, Arc::new(ctx), counters.clone()).instrument(span),
    );

    SubscriptionHandle {
        inner: Arc::new(HandleInner {
            group_id,
            topics,
            counters,
            shutdown: shutdown_tx,
            join: Mutex::new(Some(join)),
        }),
    }
}

async fn worker_loop(
    mut consumer: Box<dyn Consumer>,
    mut shutdown: watch::Receiver<bool>,
    ctx: Arc<WorkerContext>,
    counters: Arc<Counters>,
) {
    let batch_size = ctx.settings.poll_batch_size;
    let wait = ctx.settings.poll_interval();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let polled = tokio::select! {
            _ = shutdown.changed() => break,
            polled = consumer.poll(batch_size, wait) => polled,
        };

        match polled {
            Ok(batch) if batch.is_empty() => continue,
            Ok(batch) => {
                for (topic, partition, offset) in process_batch(&ctx, &counters, batch).await {
                    if let Err(e) = consumer.commit(&topic, partition, offset).await {
                        warn!(topic = %topic, partition, offset, error = %e, "offset commit failed");
                        ctx.metrics.increment_counter(
                            names::SUBSCRIPTION_ERRORS,
                            1,
                            &[("group_id", ctx.group_id.as_str())],
                        );
                    }
                }
            }
            Err(BusError::Closed) => {
                debug!("message bus closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "poll failed");
                ctx.metrics.increment_counter(
                    names::SUBSCRIPTION_ERRORS,
                    1,
                    &[("group_id", ctx.group_id.as_str())],
                );
                tokio::time::sleep(wait).await;
            }
        }
    }

    consumer.close().await;
    info!("subscription stopped");
}

/// Handle a batch, partitions in parallel and each partition in order.
///
/// Returns the last offset handled per partition, ready to commit.
async fn process_batch(
    ctx: &WorkerContext,
    counters: &Counters,
    batch: Vec<Delivery>,
) -> Vec<(String, u32, u64)> {
    let mut partitions: BTreeMap<(String, u32), Vec<Delivery>> = BTreeMap::new();
    for delivery in batch {
        partitions
            .entry((delivery.topic.clone(), delivery.partition))
            .or_default()
            .push(delivery);
    }

    futures::stream::iter(partitions)
        .map(|((topic, partition), deliveries)| async move {
            let mut last = None;
            for delivery in deliveries {
                last = Some(delivery.offset);
                process_delivery(ctx, counters, delivery).await;
            }
            last.map(|offset| (topic, partition, offset))
        })
        .buffer_unordered(ctx.settings.partitions_consumed_concurrently.max(1))
        .filter_map(|committed| async move { committed })
        .collect()
        .await
}

async fn process_delivery(ctx: &WorkerContext, counters: &Counters, delivery: Delivery) {
    let subscribed = delivery
        .message
        .event_type()
        .is_some_and(|t| ctx.event_types.iter().any(|wanted| wanted == t));
    if !subscribed {
        counters.skipped.fetch_add(1, Ordering::SeqCst);
        return;
    }

    let event = match delivery.message.decode() {
        Ok(event) => ctx.cipher.open(event),
        Err(e) => {
            warn!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                error = %e,
                "undecodable message skipped"
            );
            ctx.metrics.increment_counter(
                names::CONSUMER_ERRORS,
                1,
                &[("topic", delivery.topic.as_str())],
            );
            counters.failed.fetch_add(1, Ordering::SeqCst);
            return;
        }
    };

    let event_id = event.id;
    let event_type = event.event_type.clone();
    let started = Instant::now();

    let outcome = AssertUnwindSafe(ctx.handler.handle(event))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("handler panicked")));

    ctx.metrics.record_timer(
        names::EVENT_PROCESSING_TIME,
        started.elapsed(),
        &[("event_type", event_type.as_str())],
    );

    match outcome {
        Ok(()) => {
            counters.delivered.fetch_add(1, Ordering::SeqCst);
        }
        Err(e) => {
            warn!(
                event_id = %event_id,
                event_type = %event_type,
                offset = delivery.offset,
                error = %e,
                "event handler failed"
            );
            ctx.metrics.increment_counter(
                names::CONSUMER_ERRORS,
                1,
                &[("event_type", event_type.as_str())],
            );
            counters.failed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
