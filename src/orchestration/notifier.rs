//! "Wait for a state change" abstraction.
//!
//! The store stays the source of truth: agents always re-read it after waking,
//! so a notifier only shortens the wait. [`PollingNotifier`] just sleeps;
//! [`BroadcastNotifier`] wakes waiters as soon as any state machine publishes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

use crate::state_machine::registry::EntityType;

/// One applied transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub event: String,
    pub entity: EntityType,
    pub entity_id: i64,
    pub workflow_id: Option<i64>,
    pub from: char,
    pub to: char,
    pub at: DateTime<Utc>,
}

impl StateChange {
    pub fn new(
        event: impl Into<String>,
        entity: EntityType,
        entity_id: i64,
        workflow_id: Option<i64>,
        from: char,
        to: char,
    ) -> Self {
        Self {
            event: event.into(),
            entity,
            entity_id,
            workflow_id,
            from,
            to,
            at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait StateChangeNotifier: Send + Sync + std::fmt::Debug {
    fn notify(&self, change: StateChange);

    /// Wait up to `timeout`; true when woken early by a change
    async fn wait(&self, timeout: Duration) -> bool;
}

/// Store polling only: `wait` always sleeps the full interval
#[derive(Debug, Default, Clone, Copy)]
pub struct PollingNotifier;

#[async_trait]
impl StateChangeNotifier for PollingNotifier {
    fn notify(&self, _change: StateChange) {}

    async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::sleep(timeout).await;
        false
    }
}

/// In-process push notification over a tokio broadcast channel
#[derive(Debug)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<StateChange>,
    wakeup: Notify,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            wakeup: Notify::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl StateChangeNotifier for BroadcastNotifier {
    fn notify(&self, change: StateChange) {
        // no subscribers is fine
        let _ = self.sender.send(change);
        // stores a permit when nobody is waiting, so the next wait returns at once
        self.wakeup.notify_one();
    }

    async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wakeup.notified())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change() -> StateChange {
        StateChange::new("task.queued", EntityType::Task, 1, Some(2), 'G', 'Q')
    }

    #[tokio::test]
    async fn test_broadcast_wakes_waiter_and_subscribers() {
        let notifier = BroadcastNotifier::default();
        let mut receiver = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 1);

        notifier.notify(change());
        assert!(notifier.wait(Duration::from_secs(5)).await);
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.to, 'Q');

        assert!(!notifier.wait(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_polling_waits_full_interval() {
        let notifier = PollingNotifier;
        notifier.notify(change());
        assert!(!notifier.wait(Duration::from_millis(1)).await);
    }
}
