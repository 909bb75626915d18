use std::future::Future;

use async_trait::async_trait;

use crate::event::DomainEvent;

/// Consumes one decrypted event at a time (subscriptions, replay, view rebuilds).
///
/// Delivery is at-least-once and replay may re-apply history, so handlers
/// must be idempotent: applying the same event twice leaves the same state.
///
/// Any `Fn(DomainEvent) -> impl Future<Output = anyhow::Result<()>>` is a handler:
///
/// ```ignore
/// let handler = |event: DomainEvent| async move {
///     println!("{} v{}", event.aggregate_id, event.version);
///     Ok(())
/// };
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: DomainEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(DomainEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: DomainEvent) -> anyhow::Result<()> {
        (self)(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventDraft;
    use chrono::Utc;
    use chronicle_core::EventId;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn closures_are_handlers() {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let handler = move |event: DomainEvent| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(event.version, Ordering::SeqCst);
                anyhow::Ok(())
            }
        };

        let boxed: Arc<dyn EventHandler> = Arc::new(handler);
        let event = EventDraft::new("patient.created", "P1", "patient", 3, serde_json::json!({}))
            .into_event(EventId::new(), Utc::now());
        boxed.handle(event).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
