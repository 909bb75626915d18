use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use chronicle_events::{DomainEvent, EventHandler};

use crate::config::ReplayConfig;
use crate::event_store::EventStore;
use crate::lock::DistributedLockManager;
use crate::metrics::{MetricsSink, names};

use super::consistency::{ConsistencyReport, Difference};
use super::error::ReplayError;
use super::report::{
    HandlerFailurePolicy, RecoveryProgress, RecoveryProgressFn, RecoveryReport, RecoveryStep,
    ReplayProgress, ReplayReport, ReplayState, TypeReplayOptions,
};

const RECOVERY_LOCK_KEY: &str = "disaster-recovery";

fn aggregate_lock_key(aggregate_type: &str, aggregate_id: &str) -> String {
    format!("replay:{aggregate_type}:{aggregate_id}")
}

fn type_lock_key(aggregate_type: &str) -> String {
    format!("replay:{aggregate_type}:all")
}

fn view_lock_key(view_name: &str) -> String {
    format!("view-rebuild:{view_name}")
}

/// Running totals of one replay unit.
#[derive(Debug, Default)]
struct Tally {
    processed: u64,
    failed: u64,
}

/// Rebuilds state from the event log under distributed locks.
///
/// Every unit (one aggregate, one aggregate type, one view, a full recovery)
/// holds its lock for the whole run and releases it on every exit path,
/// panics included.
pub struct ReplayEngine {
    store: Arc<EventStore>,
    locks: Arc<dyn DistributedLockManager>,
    metrics: Arc<dyn MetricsSink>,
    config: ReplayConfig,
}

impl core::fmt::Debug for ReplayEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReplayEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReplayEngine {
    pub fn new(
        store: Arc<EventStore>,
        locks: Arc<dyn DistributedLockManager>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            locks,
            metrics,
            config: ReplayConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ReplayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// Feed one aggregate's stream, in version order, to `handler`.
    pub async fn replay_aggregate(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
        handler: &dyn EventHandler,
    ) -> Result<ReplayReport, ReplayError> {
        let started = Instant::now();
        let key = aggregate_lock_key(aggregate_type, aggregate_id);

        let result = self
            .with_lock(&key, self.config.aggregate_lock_ttl(), async {
                let events = self.store.read_for_aggregate(aggregate_id, aggregate_type).await?;
                let mut tally = Tally::default();
                for event in events {
                    self.apply(handler, event, HandlerFailurePolicy::Continue, &mut tally)
                        .await?;
                }
                Ok(ReplayReport::new(tally.processed, tally.failed, started.elapsed()))
            })
            .await;

        self.finish(
            "replay_aggregate",
            names::AGGREGATE_REPLAY_TIME,
            aggregate_type,
            started.elapsed(),
            &result,
        );
        if let Ok(report) = &result {
            info!(
                aggregate_type,
                aggregate_id,
                processed = report.processed,
                failed = report.failed,
                "aggregate replay finished"
            );
        }
        result
    }

    /// Feed every event of `aggregate_type`, ordered by `(aggregate_id,
    /// version)`, to `handler`, one page at a time.
    pub async fn replay_all_of_type(
        &self,
        aggregate_type: &str,
        handler: &dyn EventHandler,
        options: TypeReplayOptions,
    ) -> Result<ReplayReport, ReplayError> {
        let started = Instant::now();
        let key = type_lock_key(aggregate_type);
        let batch_size = options.batch_size.unwrap_or(self.config.batch_size).max(1);

        info!(aggregate_type, batch_size, "starting type replay");
        let result = self
            .with_lock(&key, self.config.type_lock_ttl(), async {
                let mut tally = Tally::default();
                let mut offset = 0u64;
                loop {
                    let page = self
                        .store
                        .read_by_aggregate_type(aggregate_type, batch_size, offset)
                        .await?;
                    let page_len = page.len();
                    for event in page {
                        self.apply(handler, event, options.policy, &mut tally).await?;
                    }
                    offset += page_len as u64;

                    if page_len > 0 {
                        if let Some(on_progress) = &options.on_progress {
                            on_progress(&ReplayProgress {
                                aggregate_type: aggregate_type.to_string(),
                                processed: tally.processed,
                            });
                        }
                    }
                    if page_len < batch_size as usize {
                        break;
                    }
                }
                Ok(ReplayReport::new(tally.processed, tally.failed, started.elapsed()))
            })
            .await;

        self.finish(
            "replay_all_of_type",
            names::FULL_REPLAY_TIME,
            aggregate_type,
            started.elapsed(),
            &result,
        );
        if let Ok(report) = &result {
            info!(
                aggregate_type,
                processed = report.processed,
                failed = report.failed,
                "type replay finished"
            );
        }
        result
    }

    /// Rebuild a read model from the given event types.
    ///
    /// Types are processed one after another in the order given, each in
    /// timestamp order, so every event of `event_types[0]` is handled before
    /// any event of `event_types[1]`.
    pub async fn rebuild_view<S: AsRef<str>>(
        &self,
        view_name: &str,
        event_types: &[S],
        handler: &dyn EventHandler,
    ) -> Result<ReplayReport, ReplayError> {
        let started = Instant::now();
        let key = view_lock_key(view_name);
        let page_size = self.config.view_page_size.max(1);

        info!(view = view_name, types = event_types.len(), "starting view rebuild");
        let result = self
            .with_lock(&key, self.config.view_lock_ttl(), async {
                let mut tally = Tally::default();
                for event_type in event_types {
                    let event_type = event_type.as_ref();
                    let mut offset = 0u64;
                    loop {
                        let page = self.store.read_by_type(event_type, page_size, offset).await?;
                        let page_len = page.len();
                        for event in page {
                            self.apply(handler, event, HandlerFailurePolicy::Continue, &mut tally)
                                .await?;
                        }
                        offset += page_len as u64;
                        if page_len < page_size as usize {
                            break;
                        }
                    }
                    debug!(view = view_name, event_type, processed = tally.processed, "event type rebuilt");
                }
                Ok(ReplayReport::new(tally.processed, tally.failed, started.elapsed()))
            })
            .await;

        self.finish(
            "rebuild_view",
            names::VIEW_REBUILD_TIME,
            view_name,
            started.elapsed(),
            &result,
        );
        if let Ok(report) = &result {
            info!(
                view = view_name,
                processed = report.processed,
                failed = report.failed,
                "view rebuild finished"
            );
        }
        result
    }

    /// Replay every listed aggregate type, strictly in order, under one
    /// global lock.
    ///
    /// A type without a handler is skipped with a warning. A handler failure
    /// aborts that type only; recovery moves on and finally reports
    /// `RecoveryIncomplete` naming every failed type.
    pub async fn recover_all<S: AsRef<str>>(
        &self,
        aggregate_types: &[S],
        handlers: &HashMap<String, Arc<dyn EventHandler>>,
        on_progress: Option<RecoveryProgressFn>,
    ) -> Result<RecoveryReport, ReplayError> {
        let started = Instant::now();
        let notify = |step: RecoveryStep, aggregate_type: &str, processed: u64| {
            if let Some(on_progress) = &on_progress {
                on_progress(&RecoveryProgress {
                    step,
                    aggregate_type: aggregate_type.to_string(),
                    processed,
                });
            }
        };

        warn!(types = aggregate_types.len(), "starting disaster recovery");
        let result = self
            .with_lock(RECOVERY_LOCK_KEY, self.config.recovery_lock_ttl(), async {
                let mut per_type = Vec::new();
                let mut skipped = Vec::new();
                let mut failed = Vec::new();

                for aggregate_type in aggregate_types {
                    let aggregate_type = aggregate_type.as_ref();
                    let Some(handler) = handlers.get(aggregate_type) else {
                        warn!(aggregate_type, "no recovery handler registered; skipping");
                        skipped.push(aggregate_type.to_string());
                        notify(RecoveryStep::Skipped, aggregate_type, 0);
                        continue;
                    };

                    notify(RecoveryStep::Start, aggregate_type, 0);
                    let mut options = TypeReplayOptions::default().with_policy(HandlerFailurePolicy::Abort);
                    if let Some(on_progress) = on_progress.clone() {
                        options = options.with_progress(move |p: &ReplayProgress| {
                            on_progress(&RecoveryProgress {
                                step: RecoveryStep::Progress,
                                aggregate_type: p.aggregate_type.clone(),
                                processed: p.processed,
                            });
                        });
                    }

                    match self.replay_all_of_type(aggregate_type, handler.as_ref(), options).await {
                        Ok(report) => {
                            notify(RecoveryStep::Complete, aggregate_type, report.processed);
                            per_type.push((aggregate_type.to_string(), report));
                        }
                        Err(e) => {
                            error!(aggregate_type, error = %e, "recovery of aggregate type failed");
                            failed.push(aggregate_type.to_string());
                        }
                    }
                }

                if !failed.is_empty() {
                    return Err(ReplayError::RecoveryIncomplete { failed });
                }
                Ok(RecoveryReport {
                    per_type,
                    skipped,
                    duration: started.elapsed(),
                })
            })
            .await;

        self.finish(
            "recover_all",
            names::DISASTER_RECOVERY_TIME,
            RECOVERY_LOCK_KEY,
            started.elapsed(),
            &result,
        );
        if let Ok(report) = &result {
            info!(
                processed = report.total_processed(),
                skipped = report.skipped.len(),
                "disaster recovery finished"
            );
        }
        result
    }

    /// Compare materialized state with state rebuilt from the aggregate's
    /// events. Read-only; takes no lock.
    pub async fn validate<S, G, Fut, B, C>(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
        get_current_state: G,
        build_state_from_events: B,
        compare: C,
    ) -> Result<ConsistencyReport, ReplayError>
    where
        G: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<S>>,
        B: FnOnce(&[DomainEvent]) -> anyhow::Result<S>,
        C: FnOnce(&S, &S) -> Vec<Difference>,
    {
        let current = get_current_state()
            .await
            .map_err(|e| ReplayError::Validation(format!("loading current state: {e:#}")))?;
        let events = self.store.read_for_aggregate(aggregate_id, aggregate_type).await?;
        let rebuilt = build_state_from_events(&events)
            .map_err(|e| ReplayError::Validation(format!("rebuilding state: {e:#}")))?;

        let report = ConsistencyReport::from_differences(compare(&current, &rebuilt));
        let outcome = if report.is_consistent { "consistent" } else { "inconsistent" };
        self.metrics.increment_counter(
            names::CONSISTENCY_CHECKS,
            1,
            &[("aggregate_type", aggregate_type), ("outcome", outcome)],
        );
        if !report.is_consistent {
            warn!(
                aggregate_type,
                aggregate_id,
                differences = report.differences.len(),
                "materialized state diverges from event log"
            );
        }
        Ok(report)
    }

    /// Run `work` while holding `key`; the lock is released on every path.
    async fn with_lock<T, F>(&self, key: &str, ttl: Duration, work: F) -> Result<T, ReplayError>
    where
        F: Future<Output = Result<T, ReplayError>>,
    {
        let grant = self.locks.acquire(key, ttl).await?;
        let token = match grant.token {
            Some(token) if grant.granted => token,
            _ => {
                info!(lock_key = key, "replay already in progress elsewhere");
                return Err(ReplayError::AlreadyInProgress {
                    lock_key: key.to_string(),
                });
            }
        };
        transition(key, ReplayState::Idle, ReplayState::LockAcquired);
        transition(key, ReplayState::LockAcquired, ReplayState::Running);

        let outcome = AssertUnwindSafe(work)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(ReplayError::Handler {
                    event_id: None,
                    message: "replay panicked".to_string(),
                })
            });

        let finished = if outcome.is_ok() {
            ReplayState::Completed
        } else {
            ReplayState::Failed
        };
        transition(key, ReplayState::Running, finished);

        match self.locks.release(key, &token).await {
            Ok(true) => {}
            Ok(false) => warn!(lock_key = key, "lock expired before release"),
            Err(e) => {
                error!(lock_key = key, error = %e, "failed to release lock");
                self.metrics
                    .increment_counter(names::LOCK_RELEASE_ERRORS, 1, &[("lock_key", key)]);
            }
        }
        transition(key, finished, ReplayState::LockReleased);

        outcome
    }

    /// Hand one event to `handler`, applying `policy` on failure.
    async fn apply(
        &self,
        handler: &dyn EventHandler,
        event: DomainEvent,
        policy: HandlerFailurePolicy,
        tally: &mut Tally,
    ) -> Result<(), ReplayError> {
        let event_id = event.id;
        let aggregate_type = event.aggregate_type.clone();
        tally.processed += 1;

        let outcome = AssertUnwindSafe(handler.handle(event))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("handler panicked")));

        let Err(e) = outcome else {
            return Ok(());
        };

        tally.failed += 1;
        warn!(event_id = %event_id, aggregate_type = %aggregate_type, error = %e, "replay handler failed");
        self.metrics.increment_counter(
            names::HANDLER_ERRORS,
            1,
            &[("aggregate_type", aggregate_type.as_str())],
        );

        match policy {
            HandlerFailurePolicy::Continue => Ok(()),
            HandlerFailurePolicy::Abort => Err(ReplayError::Handler {
                event_id: Some(event_id),
                message: format!("{e:#}"),
            }),
        }
    }

    fn finish<T>(
        &self,
        operation: &'static str,
        timer: &'static str,
        target: &str,
        elapsed: Duration,
        result: &Result<T, ReplayError>,
    ) {
        match result {
            Err(ReplayError::AlreadyInProgress { .. }) => return,
            Ok(_) => {}
            Err(e) => {
                error!(operation, target, error = %e, "replay failed");
                self.metrics
                    .increment_counter(names::REPLAY_ERRORS, 1, &[("operation", operation)]);
            }
        }
        self.metrics.record_timer(timer, elapsed, &[("target", target)]);
    }
}

fn transition(lock_key: &str, from: ReplayState, to: ReplayState) {
    debug!(lock_key, ?from, ?to, "replay state transition");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventRepository;
    use crate::lock::{InMemoryLockManager, LockError, LockGrant};
    use crate::metrics::InMemoryMetrics;
    use async_trait::async_trait;
    use chronicle_events::{EventDraft, InMemoryMessageBus};
    use serde_json::json;
    use std::sync::Mutex;

    struct Fixture {
        engine: ReplayEngine,
        store: Arc<EventStore>,
        locks: Arc<InMemoryLockManager>,
        metrics: Arc<InMemoryMetrics>,
    }

    fn fixture() -> Fixture {
        let metrics = Arc::new(InMemoryMetrics::new());
        let store = Arc::new(EventStore::new(
            Arc::new(InMemoryEventRepository::new()),
            Arc::new(InMemoryMessageBus::new()),
            metrics.clone(),
        ));
        let locks = Arc::new(InMemoryLockManager::new());
        let engine = ReplayEngine::new(store.clone(), locks.clone(), metrics.clone());
        Fixture {
            engine,
            store,
            locks,
            metrics,
        }
    }

    async fn seed(store: &EventStore, aggregate_type: &str, id: &str, versions: u64) {
        for version in 1..=versions {
            let verb = if version == 1 { "created" } else { "updated" };
            store
                .append(EventDraft::new(
                    format!("{aggregate_type}.{verb}"),
                    id,
                    aggregate_type,
                    version,
                    json!({ "step": version }),
                ))
                .await
                .unwrap();
        }
    }

    fn collector() -> (Arc<Mutex<Vec<DomainEvent>>>, impl EventHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |event: DomainEvent| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event);
                anyhow::Ok(())
            }
        };
        (seen, handler)
    }

    #[tokio::test]
    async fn aggregate_replay_releases_lock_and_reports() {
        let f = fixture();
        seed(&f.store, "patient", "P1", 3).await;
        let (seen, handler) = collector();

        let report = f.engine.replay_aggregate("P1", "patient", &handler).await.unwrap();

        assert_eq!(report.processed, 3);
        assert_eq!(report.final_state, ReplayState::Completed);
        let versions: Vec<_> = seen.lock().unwrap().iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert!(!f.locks.is_held("replay:patient:P1").await);
        assert_eq!(f.metrics.timer_samples(names::AGGREGATE_REPLAY_TIME), 1);
    }

    #[tokio::test]
    async fn held_lock_yields_already_in_progress() {
        let f = fixture();
        f.locks
            .acquire("replay:patient:P1", Duration::from_secs(60))
            .await
            .unwrap();
        let (seen, handler) = collector();

        let err = f.engine.replay_aggregate("P1", "patient", &handler).await.unwrap_err();

        assert!(err.is_already_in_progress());
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(f.metrics.counter(names::REPLAY_ERRORS), 0);
        assert_eq!(f.metrics.timer_samples(names::AGGREGATE_REPLAY_TIME), 0);
    }

    #[tokio::test]
    async fn failing_events_are_counted_and_skipped_past() {
        let f = fixture();
        seed(&f.store, "patient", "P1", 3).await;
        let handler = |event: DomainEvent| async move {
            if event.version == 2 {
                anyhow::bail!("cannot apply v2");
            }
            Ok(())
        };

        let report = f.engine.replay_aggregate("P1", "patient", &handler).await.unwrap();

        assert_eq!(report.processed, 3);
        assert_eq!(report.failed, 1);
        assert!(!report.is_clean());
        assert_eq!(report.final_state, ReplayState::Completed);
        assert_eq!(f.metrics.counter(names::HANDLER_ERRORS), 1);
    }

    #[tokio::test]
    async fn panicking_handler_still_releases_lock() {
        let f = fixture();
        seed(&f.store, "patient", "P1", 1).await;
        let handler = |event: DomainEvent| async move {
            if event.version == 1 {
                panic!("handler blew up");
            }
            anyhow::Ok(())
        };

        let report = f.engine.replay_aggregate("P1", "patient", &handler).await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(!f.locks.is_held("replay:patient:P1").await);
    }

    #[tokio::test]
    async fn type_replay_pages_until_short_page() {
        let f = fixture();
        seed(&f.store, "patient", "P1", 3).await;
        seed(&f.store, "patient", "P2", 2).await;
        let (seen, handler) = collector();
        let pages = Arc::new(Mutex::new(Vec::new()));
        let progress = pages.clone();

        let options = TypeReplayOptions::default()
            .with_batch_size(2)
            .with_progress(move |p: &ReplayProgress| progress.lock().unwrap().push(p.processed));
        let report = f.engine.replay_all_of_type("patient", &handler, options).await.unwrap();

        assert_eq!(report.processed, 5);
        assert_eq!(*pages.lock().unwrap(), vec![2, 4, 5]);
        let order: Vec<_> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.aggregate_id.clone(), e.version))
            .collect();
        assert_eq!(
            order,
            vec![
                ("P1".to_string(), 1),
                ("P1".to_string(), 2),
                ("P1".to_string(), 3),
                ("P2".to_string(), 1),
                ("P2".to_string(), 2),
            ]
        );
        assert!(!f.locks.is_held("replay:patient:all").await);
    }

    #[tokio::test]
    async fn abort_policy_stops_the_unit() {
        let f = fixture();
        seed(&f.store, "patient", "P1", 3).await;
        let handler = |event: DomainEvent| async move {
            anyhow::ensure!(event.version < 2, "bad state at v{}", event.version);
            Ok(())
        };

        let err = f
            .engine
            .replay_all_of_type(
                "patient",
                &handler,
                TypeReplayOptions::default().with_policy(HandlerFailurePolicy::Abort),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ReplayError::Handler { event_id: Some(_), .. }));
        assert_eq!(f.metrics.counter(names::REPLAY_ERRORS), 1);
        assert!(!f.locks.is_held("replay:patient:all").await);
    }

    struct StuckReleaseLocks(InMemoryLockManager);

    #[async_trait]
    impl DistributedLockManager for StuckReleaseLocks {
        async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGrant, LockError> {
            self.0.acquire(key, ttl).await
        }

        async fn release(&self, _key: &str, _token: &str) -> Result<bool, LockError> {
            Err(LockError::Backend("connection reset".to_string()))
        }
    }

    #[tokio::test]
    async fn release_failure_does_not_mask_result() {
        let f = fixture();
        seed(&f.store, "patient", "P1", 1).await;
        let engine = ReplayEngine::new(
            f.store.clone(),
            Arc::new(StuckReleaseLocks(InMemoryLockManager::new())),
            f.metrics.clone(),
        );
        let (_seen, handler) = collector();

        let report = engine.replay_aggregate("P1", "patient", &handler).await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(f.metrics.counter(names::LOCK_RELEASE_ERRORS), 1);
    }

    #[tokio::test]
    async fn recovery_skips_types_without_handlers() {
        let f = fixture();
        seed(&f.store, "patient", "P1", 2).await;
        let (seen, handler) = collector();
        let mut handlers: HashMap<String, Arc<dyn EventHandler>> = HashMap::new();
        handlers.insert("patient".to_string(), Arc::new(handler));

        let steps = Arc::new(Mutex::new(Vec::new()));
        let sink = steps.clone();
        let on_progress: RecoveryProgressFn = Arc::new(move |p: &RecoveryProgress| {
            sink.lock().unwrap().push((p.step, p.aggregate_type.clone()));
        });

        let report = f
            .engine
            .recover_all(&["organization", "patient"], &handlers, Some(on_progress))
            .await
            .unwrap();

        assert_eq!(report.skipped, vec!["organization".to_string()]);
        assert_eq!(report.total_processed(), 2);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(
            *steps.lock().unwrap(),
            vec![
                (RecoveryStep::Skipped, "organization".to_string()),
                (RecoveryStep::Start, "patient".to_string()),
                (RecoveryStep::Progress, "patient".to_string()),
                (RecoveryStep::Complete, "patient".to_string()),
            ]
        );
        assert!(!f.locks.is_held("disaster-recovery").await);
    }

    #[tokio::test]
    async fn recovery_reports_failed_types_after_finishing_the_rest() {
        let f = fixture();
        seed(&f.store, "patient", "P1", 1).await;
        seed(&f.store, "encounter", "E1", 1).await;

        let failing =
            |_event: DomainEvent| async move { Err::<(), _>(anyhow::anyhow!("corrupt projection")) };
        let (seen, ok) = collector();
        let mut handlers: HashMap<String, Arc<dyn EventHandler>> = HashMap::new();
        handlers.insert("patient".to_string(), Arc::new(failing));
        handlers.insert("encounter".to_string(), Arc::new(ok));

        let err = f
            .engine
            .recover_all(&["patient", "encounter"], &handlers, None)
            .await
            .unwrap_err();

        match err {
            ReplayError::RecoveryIncomplete { failed } => assert_eq!(failed, vec!["patient".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(!f.locks.is_held("disaster-recovery").await);
    }

    #[tokio::test]
    async fn validate_reports_divergence_without_locking() {
        let f = fixture();
        seed(&f.store, "patient", "P1", 2).await;
        let rebuild = |events: &[DomainEvent]| {
            let last = events.last().map(|e| e.data.clone()).unwrap_or_default();
            anyhow::Ok(last)
        };

        let healthy = f
            .engine
            .validate(
                "P1",
                "patient",
                || async { anyhow::Ok(json!({"step": 2})) },
                rebuild,
                |a, b| crate::replay::json_differences(a, b),
            )
            .await
            .unwrap();
        assert!(healthy.is_consistent);

        let corrupted = f
            .engine
            .validate(
                "P1",
                "patient",
                || async { anyhow::Ok(json!({"step": 7})) },
                rebuild,
                |a, b| crate::replay::json_differences(a, b),
            )
            .await
            .unwrap();
        assert!(!corrupted.is_consistent);
        assert_eq!(corrupted.differences[0].path, "step");
        assert_eq!(f.metrics.counter(names::CONSISTENCY_CHECKS), 2);
    }

    #[tokio::test]
    async fn validate_surfaces_state_loader_errors() {
        let f = fixture();
        let err = f
            .engine
            .validate(
                "P1",
                "patient",
                || async { Err::<serde_json::Value, _>(anyhow::anyhow!("read model offline")) },
                |_events: &[DomainEvent]| anyhow::Ok(json!({})),
                |a, b| crate::replay::json_differences(a, b),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Validation(msg) if msg.contains("read model offline")));
    }
}
