//! In-process event bus.

use async_trait::async_trait;
use futures::stream;
use gridline_core::Result;
use gridline_core::events::{Event, subject_matches};
use gridline_core::ports::{EventBus, EventStream};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// [`EventBus`] backed by a `tokio` broadcast channel.
pub struct InMemoryEventBus {
    sender: broadcast::Sender<Event>,
}

impl InMemoryEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        let subject = event.subject();
        // No subscribers is not an error.
        let receivers = self.sender.send(event).unwrap_or(0);
        trace!(%subject, receivers, "Event published");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        let receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let events = stream::unfold(receiver, move |mut receiver| {
            let pattern = pattern.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) if subject_matches(&pattern, &event.subject()) => {
                            return Some((Ok(event), receiver));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%pattern, skipped, "Event subscriber lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;
    use gridline_core::events::{BuildCompletedPayload, TriggerCancelledPayload};
    use gridline_core::ids::{BuildId, TriggerId};

    #[tokio::test]
    async fn test_subscribe_filters_by_pattern() {
        let bus = InMemoryEventBus::default();
        let mut cancelled = bus.subscribe("trigger.*.cancelled").await.unwrap();

        bus.publish(Event::BuildCompleted(BuildCompletedPayload {
            build_id: BuildId::new(),
            backends: Default::default(),
            succeeded: true,
            error: None,
            completed_at: Utc::now(),
        }))
        .await
        .unwrap();

        let trigger_id = TriggerId::new();
        bus.publish(Event::TriggerCancelled(TriggerCancelledPayload {
            trigger_id,
            reference: "refs/heads/main".into(),
            superseded_by: None,
            cancelled_at: Utc::now(),
        }))
        .await
        .unwrap();

        match cancelled.next().await {
            Some(Ok(Event::TriggerCancelled(p))) => assert_eq!(p.trigger_id, trigger_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = InMemoryEventBus::new(4);
        let result = bus
            .publish(Event::BuildCompleted(BuildCompletedPayload {
                build_id: BuildId::new(),
                backends: Default::default(),
                succeeded: false,
                error: Some("unsatisfiable".into()),
                completed_at: Utc::now(),
            }))
            .await;
        assert!(result.is_ok());
    }
}
