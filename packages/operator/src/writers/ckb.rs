//! Cell-ledger side of the Unlock flow
//!
//! An executed Unlock receipt is handed to the cell-ledger queue together with its
//! quorum signatures. The queue consumer records a payout request that the external
//! transaction builder turns into a cell transfer.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::B256;
use async_trait::async_trait;
use bridge_core::{BridgeError, Chain, CollectedSignature, QuorumEffect, Receipt};
use eyre::Result;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::info;

use crate::db::{self, NewCellPayout};
use crate::queue::{send_relay_message, RelayMessage, RelayQueue};

/// Hands an executed Unlock receipt to the cell-ledger relay queue
pub struct UnlockRelayEffect {
    queue: Arc<dyn RelayQueue>,
    queue_name: String,
}

impl UnlockRelayEffect {
    pub fn new(queue: Arc<dyn RelayQueue>, queue_name: impl Into<String>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
        }
    }
}

#[async_trait]
impl QuorumEffect for UnlockRelayEffect {
    async fn execute(
        &self,
        receipt: &Receipt,
        signatures: &[CollectedSignature],
    ) -> Result<(), BridgeError> {
        let message = RelayMessage::new(*receipt, Chain::Evm).with_signatures(signatures.to_vec());
        let id = send_relay_message(self.queue.as_ref(), &self.queue_name, &message).await?;
        info!(
            receipt_hash = %receipt.hash(),
            queue = %self.queue_name,
            id = %id,
            signatures = signatures.len(),
            "Unlock receipt handed to cell-ledger queue"
        );
        Ok(())
    }
}

// ============================================================================
// Payout requests
// ============================================================================

#[async_trait]
pub trait PayoutStore: Send + Sync {
    /// Record a payout once per receipt. Returns false if it already exists.
    async fn record(&self, payout: &NewCellPayout) -> Result<bool>;

    async fn pending_count(&self) -> Result<u64>;
}

#[derive(Default)]
pub struct MemoryPayoutStore {
    payouts: Mutex<HashMap<B256, NewCellPayout>>,
}

impl MemoryPayoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, receipt_hash: &B256) -> Option<NewCellPayout> {
        self.payouts.lock().await.get(receipt_hash).cloned()
    }
}

#[async_trait]
impl PayoutStore for MemoryPayoutStore {
    async fn record(&self, payout: &NewCellPayout) -> Result<bool> {
        let mut payouts = self.payouts.lock().await;
        if payouts.contains_key(&payout.receipt_hash) {
            return Ok(false);
        }
        payouts.insert(payout.receipt_hash, payout.clone());
        Ok(true)
    }

    async fn pending_count(&self) -> Result<u64> {
        Ok(self.payouts.lock().await.len() as u64)
    }
}

#[derive(Clone)]
pub struct PgPayoutStore {
    pool: PgPool,
}

impl PgPayoutStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PayoutStore for PgPayoutStore {
    async fn record(&self, payout: &NewCellPayout) -> Result<bool> {
        db::insert_cell_payout(&self.pool, payout).await
    }

    async fn pending_count(&self) -> Result<u64> {
        Ok(db::count_pending_cell_payouts(&self.pool).await?.max(0) as u64)
    }
}
