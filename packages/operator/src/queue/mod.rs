//! Relay queue adapter
//!
//! Named queues with at-least-once delivery. A received message stays stored and
//! becomes visible again after the visibility timeout unless it is deleted first.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bridge_core::{BridgeError, Chain, CollectedSignature, Receipt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::metrics;

pub mod postgres;

pub use postgres::PgRelayQueue;

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of every relay queue message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    pub receipt: Receipt,
    /// Ledger the receipt was observed on
    pub origin_chain: Chain,
    pub enqueued_at: DateTime<Utc>,
    /// Quorum signatures, present on hand-offs after execution
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<CollectedSignature>,
}

impl RelayMessage {
    pub fn new(receipt: Receipt, origin_chain: Chain) -> Self {
        Self {
            receipt,
            origin_chain,
            enqueued_at: Utc::now(),
            signatures: Vec::new(),
        }
    }

    pub fn with_signatures(mut self, signatures: Vec<CollectedSignature>) -> Self {
        self.signatures = signatures;
        self
    }

    pub fn to_body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_body(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}

/// A well-formed message that no retry can make acceptable
#[derive(Debug, Error)]
#[error("rejected relay message: {0}")]
pub struct RejectedMessage(pub String);

/// A message handed out by `receive`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub body: String,
    /// Number of times this message has been received, including this one
    pub receive_count: u32,
}

#[async_trait]
pub trait RelayQueue: Send + Sync {
    /// Create the queue if it does not exist
    async fn ensure_queue(&self, name: &str) -> Result<(), BridgeError>;

    async fn send(&self, name: &str, body: &str) -> Result<String, BridgeError>;

    /// Claim the oldest visible message, hiding it for the visibility timeout
    async fn receive(&self, name: &str) -> Result<Option<QueueMessage>, BridgeError>;

    /// Returns false if the message was already gone
    async fn delete(&self, name: &str, id: &str) -> Result<bool, BridgeError>;

    /// Messages stored, visible or not
    async fn depth(&self, name: &str) -> Result<u64, BridgeError>;
}

/// Serialize and send a relay message, recording queue metrics
pub async fn send_relay_message(
    queue: &dyn RelayQueue,
    name: &str,
    message: &RelayMessage,
) -> Result<String, BridgeError> {
    let body = message
        .to_body()
        .map_err(|e| BridgeError::QueueUnavailable(format!("unencodable message: {}", e)))?;
    let id = queue.send(name, &body).await?;
    metrics::record_queue_message(name, "sent");
    debug!(
        queue = name,
        id = %id,
        receipt_hash = %message.receipt.hash(),
        direction = %message.receipt.direction,
        "Relay message sent"
    );
    Ok(id)
}

// ============================================================================
// In-memory queue
// ============================================================================

#[derive(Debug)]
struct StoredMessage {
    id: u64,
    body: String,
    receive_count: u32,
    visible_at: Instant,
}

/// Process-local queue with the same delivery semantics as the Postgres queue
pub struct MemoryRelayQueue {
    queues: Mutex<HashMap<String, VecDeque<StoredMessage>>>,
    next_id: AtomicU64,
    visibility_timeout: Duration,
    unavailable: AtomicBool,
}

impl MemoryRelayQueue {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            visibility_timeout,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every operation fail with `QueueUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), BridgeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BridgeError::QueueUnavailable("queue offline".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryRelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn missing_queue(name: &str) -> BridgeError {
    BridgeError::QueueUnavailable(format!("queue {} does not exist", name))
}

#[async_trait]
impl RelayQueue for MemoryRelayQueue {
    async fn ensure_queue(&self, name: &str) -> Result<(), BridgeError> {
        self.check_available()?;
        self.queues
            .lock()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn send(&self, name: &str, body: &str) -> Result<String, BridgeError> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        let queue = queues.get_mut(name).ok_or_else(|| missing_queue(name))?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        queue.push_back(StoredMessage {
            id,
            body: body.to_string(),
            receive_count: 0,
            visible_at: Instant::now(),
        });
        Ok(id.to_string())
    }

    async fn receive(&self, name: &str) -> Result<Option<QueueMessage>, BridgeError> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        let queue = queues.get_mut(name).ok_or_else(|| missing_queue(name))?;
        let now = Instant::now();

        // Ids are assigned in send order, so the first visible entry is the oldest
        let Some(message) = queue.iter_mut().find(|m| m.visible_at <= now) else {
            return Ok(None);
        };
        message.receive_count += 1;
        message.visible_at = now + self.visibility_timeout;

        Ok(Some(QueueMessage {
            id: message.id.to_string(),
            body: message.body.clone(),
            receive_count: message.receive_count,
        }))
    }

    async fn delete(&self, name: &str, id: &str) -> Result<bool, BridgeError> {
        self.check_available()?;
        let Ok(id) = id.parse::<u64>() else {
            return Ok(false);
        };
        let mut queues = self.queues.lock().await;
        let queue = queues.get_mut(name).ok_or_else(|| missing_queue(name))?;
        match queue.iter().position(|m| m.id == id) {
            Some(i) => {
                queue.remove(i);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn depth(&self, name: &str) -> Result<u64, BridgeError> {
        self.check_available()?;
        let queues = self.queues.lock().await;
        let queue = queues.get(name).ok_or_else(|| missing_queue(name))?;
        Ok(queue.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, B256, U256};

    const Q: &str = "evm";

    fn lock_message() -> RelayMessage {
        RelayMessage::new(
            Receipt::lock(
                Address::repeat_byte(0x11),
                U256::from(1_000u64),
                B256::repeat_byte(0x22),
            ),
            Chain::Ckb,
        )
    }

    async fn queue() -> MemoryRelayQueue {
        let queue = MemoryRelayQueue::with_visibility_timeout(Duration::from_secs(30));
        queue.ensure_queue(Q).await.unwrap();
        queue
    }

    #[test]
    fn test_relay_message_body_is_camel_case() {
        let body = lock_message().to_body().unwrap();
        assert!(body.contains("\"originChain\":\"ckb\""));
        assert!(body.contains("\"sourceTxRef\""));
        assert!(!body.contains("signatures"));

        let decoded = RelayMessage::from_body(&body).unwrap();
        assert_eq!(decoded, lock_message_with_time(decoded.enqueued_at));
    }

    fn lock_message_with_time(at: DateTime<Utc>) -> RelayMessage {
        RelayMessage {
            enqueued_at: at,
            ..lock_message()
        }
    }

    #[test]
    fn test_relay_message_rejects_garbage() {
        assert!(RelayMessage::from_body("{\"receipt\":42}").is_err());
    }

    #[tokio::test]
    async fn test_ensure_queue_is_idempotent() {
        let queue = queue().await;
        queue.send(Q, "a").await.unwrap();
        queue.ensure_queue(Q).await.unwrap();
        assert_eq!(queue.depth(Q).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_receive_hides_message_until_deleted() {
        let queue = queue().await;
        let id = queue.send(Q, "a").await.unwrap();

        let message = queue.receive(Q).await.unwrap().unwrap();
        assert_eq!(message.id, id);
        assert_eq!(message.receive_count, 1);
        assert!(queue.receive(Q).await.unwrap().is_none());
        assert_eq!(queue.depth(Q).await.unwrap(), 1);

        assert!(queue.delete(Q, &id).await.unwrap());
        assert!(!queue.delete(Q, &id).await.unwrap());
        assert_eq!(queue.depth(Q).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_redelivered_after_visibility_timeout() {
        let queue = queue().await;
        queue.send(Q, "a").await.unwrap();

        let first = queue.receive(Q).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(queue.receive(Q).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(2)).await;
        let second = queue.receive(Q).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.receive_count, 2);
    }

    #[tokio::test]
    async fn test_receive_returns_oldest_first() {
        let queue = queue().await;
        let a = queue.send(Q, "a").await.unwrap();
        let b = queue.send(Q, "b").await.unwrap();

        assert_eq!(queue.receive(Q).await.unwrap().unwrap().id, a);
        assert_eq!(queue.receive(Q).await.unwrap().unwrap().id, b);
    }

    #[tokio::test]
    async fn test_unknown_queue_and_outage_are_unavailable() {
        let queue = queue().await;
        assert!(matches!(
            queue.send("missing", "a").await,
            Err(BridgeError::QueueUnavailable(_))
        ));

        queue.set_unavailable(true);
        let err = queue.receive(Q).await.unwrap_err();
        assert!(err.is_transient());

        queue.set_unavailable(false);
        assert!(queue.receive(Q).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_relay_message_round_trips_through_queue() {
        let queue = queue().await;
        let message = lock_message();
        send_relay_message(&queue, Q, &message).await.unwrap();

        let received = queue.receive(Q).await.unwrap().unwrap();
        let decoded = RelayMessage::from_body(&received.body).unwrap();
        assert_eq!(decoded.receipt, message.receipt);
        assert_eq!(decoded.origin_chain, Chain::Ckb);
    }
}
