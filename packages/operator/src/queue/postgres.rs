//! Postgres-backed relay queue

use std::time::Duration;

use async_trait::async_trait;
use bridge_core::BridgeError;
use sqlx::PgPool;

use super::{QueueMessage, RelayQueue, DEFAULT_VISIBILITY_TIMEOUT};
use crate::db;

/// Relay queue stored in `relay_messages`. Claims use `FOR UPDATE SKIP LOCKED`,
/// so several consumers may poll one queue.
#[derive(Clone)]
pub struct PgRelayQueue {
    pool: PgPool,
    visibility_timeout: Duration,
}

impl PgRelayQueue {
    pub fn new(pool: PgPool) -> Self {
        Self::with_visibility_timeout(pool, DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }
}

fn unavailable(e: eyre::Report) -> BridgeError {
    BridgeError::QueueUnavailable(format!("{:#}", e))
}

#[async_trait]
impl RelayQueue for PgRelayQueue {
    async fn ensure_queue(&self, name: &str) -> Result<(), BridgeError> {
        db::create_relay_queue(&self.pool, name)
            .await
            .map_err(unavailable)
    }

    async fn send(&self, name: &str, body: &str) -> Result<String, BridgeError> {
        db::insert_relay_message(&self.pool, name, body)
            .await
            .map(|id| id.to_string())
            .map_err(unavailable)
    }

    async fn receive(&self, name: &str) -> Result<Option<QueueMessage>, BridgeError> {
        let row = db::claim_relay_message(&self.pool, name, self.visibility_timeout)
            .await
            .map_err(unavailable)?;

        Ok(row.map(|r| QueueMessage {
            id: r.id.to_string(),
            body: r.body,
            receive_count: r.receive_count.max(0) as u32,
        }))
    }

    async fn delete(&self, name: &str, id: &str) -> Result<bool, BridgeError> {
        let Ok(id) = id.parse::<i64>() else {
            return Ok(false);
        };
        db::delete_relay_message(&self.pool, name, id)
            .await
            .map_err(unavailable)
    }

    async fn depth(&self, name: &str) -> Result<u64, BridgeError> {
        db::count_relay_messages(&self.pool, name)
            .await
            .map(|n| n.max(0) as u64)
            .map_err(unavailable)
    }
}
