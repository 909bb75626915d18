//! End-to-end tests of the event-sourced pipeline.
//!
//! append → EventRepository → MessageBus → subscription handler
//! append → EventRepository → ReplayEngine → handler / read model
//!
//! Verifies:
//! - sensitive fields are ciphertext at rest and on the wire, plaintext for handlers
//! - replay order, locking and disaster recovery ordering
//! - at-least-once delivery across publish failures and group restarts

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use proptest::prelude::*;
    use serde_json::{Value as JsonValue, json};
    use tokio::sync::Notify;

    use chronicle_events::{DomainEvent, EventDraft, EventHandler, InMemoryMessageBus};
    use chronicle_security::{AesCtrHmacEncryption, CIPHERTEXT_PREFIX, SensitiveFieldCodec};

    use crate::event_store::{EventRepository, EventStore, EventStoreError, InMemoryEventRepository, SubscribeOptions};
    use crate::lock::InMemoryLockManager;
    use crate::metrics::{InMemoryMetrics, names};
    use crate::replay::{ReplayEngine, ReplayError, json_differences};

    struct Harness {
        store: Arc<EventStore>,
        replay: Arc<ReplayEngine>,
        repo: Arc<InMemoryEventRepository>,
        bus: Arc<InMemoryMessageBus>,
        metrics: Arc<InMemoryMetrics>,
    }

    fn harness() -> Harness {
        chronicle_observability::init();

        let repo = Arc::new(InMemoryEventRepository::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let codec = SensitiveFieldCodec::new(Arc::new(AesCtrHmacEncryption::new([7u8; 32])));
        let store = Arc::new(EventStore::new(repo.clone(), bus.clone(), metrics.clone()).with_codec(codec));
        let replay = Arc::new(ReplayEngine::new(
            store.clone(),
            Arc::new(InMemoryLockManager::new()),
            metrics.clone(),
        ));
        Harness {
            store,
            replay,
            repo,
            bus,
            metrics,
        }
    }

    type Seen = Arc<Mutex<Vec<DomainEvent>>>;

    fn recorder() -> (Seen, Arc<dyn EventHandler>) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |event: DomainEvent| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event);
                anyhow::Ok(())
            }
        };
        (seen, Arc::new(handler))
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}");
    }

    fn draft(event_type: &str, id: &str, version: u64, data: JsonValue) -> EventDraft {
        let aggregate_type = event_type.split('.').next().unwrap_or_default();
        EventDraft::new(event_type, id, aggregate_type, version, data)
    }

    #[tokio::test]
    async fn appended_history_replays_in_version_order() {
        let h = harness();
        h.store
            .append(draft("patient.created", "P1", 1, json!({"name": "Ada", "ssn": "123-45-6789"})))
            .await
            .unwrap();
        h.store
            .append(draft("patient.updated", "P1", 2, json!({"name": "Ada L."})))
            .await
            .unwrap();

        let (seen, handler) = recorder();
        let report = h.replay.replay_aggregate("P1", "patient", handler.as_ref()).await.unwrap();

        assert_eq!(report.processed, 2);
        let seen = seen.lock().unwrap();
        let types: Vec<_> = seen.iter().map(|e| (e.event_type.as_str(), e.version)).collect();
        assert_eq!(types, vec![("patient.created", 1), ("patient.updated", 2)]);
        assert_eq!(seen[0].data["ssn"], json!("123-45-6789"));
    }

    #[tokio::test]
    async fn concurrent_replays_of_one_stream_are_exclusive() {
        let h = harness();
        h.store.append(draft("patient.created", "P1", 1, json!({}))).await.unwrap();

        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let (entered_tx, release_rx) = (entered.clone(), release.clone());
        let blocking = move |_event: DomainEvent| {
            let (entered, release) = (entered_tx.clone(), release_rx.clone());
            async move {
                entered.notify_one();
                release.notified().await;
                anyhow::Ok(())
            }
        };

        let replay = h.replay.clone();
        let first = tokio::spawn(async move { replay.replay_aggregate("P1", "patient", &blocking).await });
        entered.notified().await;

        let (_seen, handler) = recorder();
        let second = h.replay.replay_aggregate("P1", "patient", handler.as_ref()).await;
        assert!(matches!(second, Err(ReplayError::AlreadyInProgress { ref lock_key }) if lock_key == "replay:patient:P1"));

        release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.processed, 1);

        // Released: a new replay gets through.
        assert!(h.replay.replay_aggregate("P1", "patient", handler.as_ref()).await.is_ok());
    }

    #[tokio::test]
    async fn disaster_recovery_finishes_each_type_before_the_next() {
        let h = harness();
        for (event_type, id) in [
            ("encounter.opened", "E1"),
            ("patient.created", "P1"),
            ("organization.created", "O1"),
            ("patient.created", "P2"),
            ("encounter.opened", "E2"),
        ] {
            h.store.append(draft(event_type, id, 1, json!({}))).await.unwrap();
        }

        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut handlers: HashMap<String, Arc<dyn EventHandler>> = HashMap::new();
        for aggregate_type in ["organization", "patient", "encounter"] {
            let order = order.clone();
            let handler = move |event: DomainEvent| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(event.aggregate_type);
                    anyhow::Ok(())
                }
            };
            handlers.insert(aggregate_type.to_string(), Arc::new(handler));
        }

        let report = h
            .replay
            .recover_all(&["organization", "patient", "encounter"], &handlers, None)
            .await
            .unwrap();

        assert_eq!(report.total_processed(), 5);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["organization", "patient", "patient", "encounter", "encounter"]
        );
        assert_eq!(h.metrics.timer_samples(names::DISASTER_RECOVERY_TIME), 1);
    }

    #[tokio::test]
    async fn validate_flags_corrupted_read_model() {
        let h = harness();
        h.store
            .append(draft("patient.created", "P1", 1, json!({"status": "active", "name": "Ada"})))
            .await
            .unwrap();
        h.store
            .append(draft("patient.discharged", "P1", 2, json!({"status": "discharged"})))
            .await
            .unwrap();

        let read_model: Arc<Mutex<HashMap<String, JsonValue>>> = Arc::new(Mutex::new(HashMap::new()));
        read_model
            .lock()
            .unwrap()
            .insert("P1".to_string(), json!({"status": "active", "name": "Ada"}));

        let fold = |events: &[DomainEvent]| {
            let mut state = serde_json::Map::new();
            for event in events {
                if let Some(fields) = event.data.as_object() {
                    state.extend(fields.clone());
                }
            }
            anyhow::Ok(JsonValue::Object(state))
        };
        let current = || {
            let read_model = read_model.clone();
            async move {
                read_model
                    .lock()
                    .unwrap()
                    .get("P1")
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("P1 missing from read model"))
            }
        };

        let report = h
            .replay
            .validate("P1", "patient", current, fold, |a, b| json_differences(a, b))
            .await
            .unwrap();

        assert!(!report.is_consistent);
        assert_eq!(report.differences.len(), 1);
        assert_eq!(report.differences[0].path, "status");
        assert_eq!(report.differences[0].rebuilt, Some(json!("discharged")));
    }

    #[tokio::test]
    async fn view_rebuild_processes_event_types_in_sequence() {
        let h = harness();
        h.store.append(draft("patient.created", "P1", 1, json!({}))).await.unwrap();
        h.store.append(draft("patient.created", "P2", 1, json!({}))).await.unwrap();
        h.store.append(draft("patient.discharged", "P1", 2, json!({}))).await.unwrap();
        h.store.append(draft("patient.created", "P3", 1, json!({}))).await.unwrap();

        let active: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let trace: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let (view, log) = (active.clone(), trace.clone());
        let apply = move |event: DomainEvent| {
            let (view, log) = (view.clone(), log.clone());
            async move {
                log.lock().unwrap().push(event.event_type.clone());
                let mut view = view.lock().unwrap();
                match event.event_type.as_str() {
                    "patient.created" => view.push(event.aggregate_id),
                    "patient.discharged" => view.retain(|id| *id != event.aggregate_id),
                    _ => {}
                }
                anyhow::Ok(())
            }
        };

        let report = h
            .replay
            .rebuild_view("activePatients", &["patient.created", "patient.discharged"], &apply)
            .await
            .unwrap();

        assert_eq!(report.processed, 4);
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["patient.created", "patient.created", "patient.created", "patient.discharged"]
        );
        assert_eq!(*active.lock().unwrap(), vec!["P2", "P3"]);
    }

    #[tokio::test]
    async fn unpublished_event_is_still_durable_and_replayable() {
        let h = harness();
        h.bus.reject_publishes(true);
        let event = h.store.append(draft("billing.charged", "B1", 1, json!({"amount": 12}))).await.unwrap();
        h.bus.reject_publishes(false);

        assert_eq!(h.metrics.counter(names::PUBLISH_FAILURES), 1);
        assert_eq!(h.repo.stream_version(&event.stream_key()).await.unwrap(), 1);

        let (seen, handler) = recorder();
        h.replay.replay_aggregate("B1", "billing", handler.as_ref()).await.unwrap();
        assert_eq!(seen.lock().unwrap()[0].id, event.id);
    }

    #[tokio::test]
    async fn subscribers_receive_decrypted_payloads() {
        let h = harness();
        let (seen, handler) = recorder();
        let sub = h
            .store
            .subscribe(&["patient.created"], handler, SubscribeOptions::default())
            .await
            .unwrap();
        assert!(sub.group_id().starts_with("chronicle-consumer-"));

        h.store
            .append(draft("patient.created", "P1", 1, json!({"pii": {"email": "ada@example.org"}, "ssn": "123"})))
            .await
            .unwrap();

        eventually("delivery", || seen.lock().unwrap().len() == 1).await;
        let delivered = seen.lock().unwrap()[0].clone();
        assert_eq!(delivered.data["ssn"], json!("123"));
        assert_eq!(delivered.data["pii"]["email"], json!("ada@example.org"));

        let on_wire = h.bus.messages("patient-events")[0].decode().unwrap();
        assert!(on_wire.data["pii"]["email"].as_str().unwrap().starts_with(CIPHERTEXT_PREFIX));
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_delivery() {
        let h = harness();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let flaky = move |event: DomainEvent| {
            let sink = sink.clone();
            async move {
                anyhow::ensure!(event.aggregate_id != "P2", "projection rejected {}", event.aggregate_id);
                sink.lock().unwrap().push(event.aggregate_id);
                Ok(())
            }
        };
        let sub = h
            .store
            .subscribe(&["patient.created"], Arc::new(flaky), SubscribeOptions::default())
            .await
            .unwrap();

        for id in ["P1", "P2", "P3"] {
            h.store.append(draft("patient.created", id, 1, json!({}))).await.unwrap();
        }

        eventually("all deliveries", || {
            let stats = sub.stats();
            stats.delivered == 2 && stats.failed == 1
        })
        .await;
        let mut ok = delivered.lock().unwrap().clone();
        ok.sort();
        assert_eq!(ok, vec!["P1", "P3"]);
        assert_eq!(h.metrics.counter(names::CONSUMER_ERRORS), 1);
    }

    #[tokio::test]
    async fn reusing_a_group_resumes_after_committed_offsets() {
        let h = harness();
        let (seen, handler) = recorder();
        let first = h
            .store
            .subscribe(&["patient.created"], handler.clone(), SubscribeOptions::group("audit-view").from_beginning())
            .await
            .unwrap();
        for id in ["P1", "P2"] {
            h.store.append(draft("patient.created", id, 1, json!({}))).await.unwrap();
        }
        eventually("first two deliveries", || seen.lock().unwrap().len() == 2).await;
        first.unsubscribe().await;

        h.store.append(draft("patient.created", "P3", 1, json!({}))).await.unwrap();
        let second = h
            .store
            .subscribe(&["patient.created"], handler, SubscribeOptions::group("audit-view").from_beginning())
            .await
            .unwrap();

        eventually("resumed delivery", || seen.lock().unwrap().len() == 3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let ids: Vec<_> = seen.lock().unwrap().iter().map(|e| e.aggregate_id.clone()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[2], "P3");
        assert_eq!(second.stats().delivered, 1);
    }

    #[tokio::test]
    async fn close_stops_subscriptions_and_is_idempotent() {
        let h = harness();
        let (seen, handler) = recorder();
        let sub = h
            .store
            .subscribe(&["patient.created"], handler, SubscribeOptions::default())
            .await
            .unwrap();

        h.store.close().await.unwrap();
        h.store.close().await.unwrap();
        sub.unsubscribe().await;

        assert!(matches!(
            h.store.append(draft("patient.created", "P1", 1, json!({}))).await,
            Err(EventStoreError::Closed)
        ));
        assert!(matches!(
            h.store.subscribe(&["patient.created"], recorder().1, SubscribeOptions::default()).await,
            Err(EventStoreError::Closed)
        ));
        assert!(seen.lock().unwrap().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Whatever versions producers attempt, the stream holds exactly the
        /// accepted ones: 1, 2, 3, ... in append order.
        #[test]
        fn streams_stay_gap_free(attempts in prop::collection::vec(0u64..8, 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let h = harness();
                let mut expected_next = 1u64;
                for version in attempts {
                    let result = h.store.append(draft("patient.updated", "P1", version, json!({}))).await;
                    if version == expected_next {
                        prop_assert!(result.is_ok());
                        expected_next += 1;
                    } else {
                        prop_assert!(
                            matches!(result, Err(EventStoreError::VersionConflict { .. })),
                            "expected VersionConflict, got {:?}",
                            result
                        );
                    }
                }

                let versions: Vec<u64> = h
                    .store
                    .read_for_aggregate("P1", "patient")
                    .await
                    .unwrap()
                    .iter()
                    .map(|e| e.version)
                    .collect();
                prop_assert_eq!(versions, (1..expected_next).collect::<Vec<_>>());
                Ok(())
            })?;
        }
    }
}
