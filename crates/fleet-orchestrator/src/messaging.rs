//! Durable Agent-to-Agent Message Queue
//!
//! At-least-once delivery over the store: `send` inserts pending rows,
//! `receive` claims them in priority+FIFO order and flips them to
//! `delivered`, receivers acknowledge with `mark_processed`. A crash between
//! delivery and processing leaves rows in `delivered`; receivers re-read
//! those with `unacknowledged` on restart, so handlers must be idempotent.

use crate::model::MessageRecord;
use crate::store::Store;
use crate::Result;
use crate::RetentionConfig;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub struct MessageQueue {
    store: Arc<Store>,
}

impl MessageQueue {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Enqueue one message. Both sender and recipient must exist.
    pub async fn send(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<MessageRecord> {
        let message = self
            .store
            .enqueue_message(sender_id, recipient_id, payload, priority)
            .await?;
        debug!(
            message_id = %message.id,
            sender = %sender_id,
            recipient = %recipient_id,
            priority,
            "message enqueued"
        );
        Ok(message)
    }

    /// Fan a payload out to every live agent except the sender, atomically.
    pub async fn broadcast(
        &self,
        sender_id: Uuid,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<Vec<MessageRecord>> {
        let messages = self
            .store
            .enqueue_broadcast(sender_id, payload, priority)
            .await?;
        debug!(sender = %sender_id, recipients = messages.len(), "broadcast enqueued");
        Ok(messages)
    }

    /// Claim up to `limit` pending messages for an agent. Higher priority is
    /// served first; within a priority, strictly FIFO. Claimed rows move to
    /// `delivered` in the same transaction, so concurrent receivers never
    /// see the same message twice.
    pub async fn receive(&self, agent_id: Uuid, limit: usize) -> Vec<MessageRecord> {
        self.store.claim_messages(agent_id, limit).await
    }

    /// Delivered-but-unacknowledged messages, for redelivery after restart.
    pub async fn unacknowledged(&self, agent_id: Uuid) -> Vec<MessageRecord> {
        self.store.delivered_messages(agent_id).await
    }

    /// Acknowledge a delivered message as fully processed.
    pub async fn mark_processed(&self, message_id: Uuid) -> Result<MessageRecord> {
        self.store.mark_message_processed(message_id).await
    }

    /// Delete processed messages older than the retention window. Returns
    /// the number of rows removed.
    pub async fn sweep(&self, retention: chrono::Duration) -> usize {
        let removed = self.store.sweep_processed(Utc::now() - retention).await;
        if removed > 0 {
            debug!(removed, "retention sweep removed processed messages");
        }
        removed
    }
}

/// Background retention sweep. Runs until cancelled.
pub async fn run_retention_sweeper(
    queue: Arc<MessageQueue>,
    config: RetentionConfig,
    cancel: CancellationToken,
) {
    let retention = chrono::Duration::from_std(config.max_age).unwrap_or(chrono::Duration::hours(24));
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval = ?config.interval, max_age = ?config.max_age, "retention sweeper started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                queue.sweep(retention).await;
            }
        }
    }
    info!("retention sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageStatus;
    use crate::store::NewAgent;
    use serde_json::json;

    async fn two_agents(store: &Store) -> (Uuid, Uuid) {
        let a = store
            .spawn_agent(
                &NewAgent {
                    id: None,
                    role: "sender".into(),
                    task: "t".into(),
                    budget: 10,
                    parent_id: None,
                    model_hint: None,
                },
                None,
                10,
            )
            .await
            .unwrap();
        let b = store
            .spawn_agent(
                &NewAgent {
                    id: None,
                    role: "receiver".into(),
                    task: "t".into(),
                    budget: 10,
                    parent_id: None,
                    model_hint: None,
                },
                None,
                10,
            )
            .await
            .unwrap();
        (a.id, b.id)
    }

    #[tokio::test]
    async fn priority_beats_fifo_across_priorities() {
        let store = Arc::new(Store::new());
        let queue = MessageQueue::new(store.clone());
        let (sender, recipient) = two_agents(&store).await;

        let m1 = queue.send(sender, recipient, json!({"n": 1}), 0).await.unwrap();
        let m2 = queue.send(sender, recipient, json!({"n": 2}), 0).await.unwrap();
        let m3 = queue.send(sender, recipient, json!({"n": 3}), 5).await.unwrap();

        let received = queue.receive(recipient, 10).await;
        let ids: Vec<Uuid> = received.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![m3.id, m1.id, m2.id]);
        assert!(received.iter().all(|m| m.status == MessageStatus::Delivered));
    }

    #[tokio::test]
    async fn broadcast_reaches_live_agents_only() {
        let store = Arc::new(Store::new());
        let queue = MessageQueue::new(store.clone());
        let (sender, peer) = two_agents(&store).await;
        let (extra, finished) = two_agents(&store).await;
        store
            .transition_agent(finished, crate::model::AgentStatus::Completed, None)
            .await
            .unwrap();

        let sent = queue.broadcast(sender, json!({"note": "fan out"}), 1).await.unwrap();
        let recipients: Vec<Uuid> = sent.iter().map(|m| m.recipient_id).collect();
        assert_eq!(sent.len(), 2);
        assert!(recipients.contains(&peer));
        assert!(recipients.contains(&extra));
        assert!(!recipients.contains(&sender));
        assert!(!recipients.contains(&finished));
    }

    #[tokio::test]
    async fn unknown_recipient_is_rejected() {
        let store = Arc::new(Store::new());
        let queue = MessageQueue::new(store.clone());
        let (sender, _) = two_agents(&store).await;
        assert!(queue
            .send(sender, Uuid::new_v4(), json!({}), 0)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn delivered_rows_survive_until_acknowledged() {
        let store = Arc::new(Store::new());
        let queue = MessageQueue::new(store.clone());
        let (sender, recipient) = two_agents(&store).await;
        let message = queue.send(sender, recipient, json!({"k": "v"}), 0).await.unwrap();

        let received = queue.receive(recipient, 1).await;
        assert_eq!(received.len(), 1);
        // Crash before processing: the row stays visible as unacknowledged.
        let redelivered = queue.unacknowledged(recipient).await;
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].id, message.id);

        queue.mark_processed(message.id).await.unwrap();
        assert!(queue.unacknowledged(recipient).await.is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_only_old_processed_rows() {
        let store = Arc::new(Store::new());
        let queue = MessageQueue::new(store.clone());
        let (sender, recipient) = two_agents(&store).await;

        let processed = queue.send(sender, recipient, json!({}), 0).await.unwrap();
        queue.receive(recipient, 1).await;
        queue.mark_processed(processed.id).await.unwrap();
        let pending = queue.send(sender, recipient, json!({}), 0).await.unwrap();

        // A zero-width retention window sweeps everything already processed.
        let removed = queue.sweep(chrono::Duration::zero()).await;
        assert_eq!(removed, 1);
        let left = queue.receive(recipient, 10).await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, pending.id);
    }
}
