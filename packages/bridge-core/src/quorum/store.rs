//! Quorum record persistence

use std::collections::HashMap;

use alloy::primitives::B256;
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CollectedSignature, QuorumRecord};
use crate::error::BridgeError;
use crate::types::Receipt;

/// Keyed storage for quorum records.
///
/// Implementations must make `mark_executed` a compare-and-set so that only one caller
/// across all processes ever observes the `false -> true` transition. Nothing clears it.
#[async_trait]
pub trait QuorumStore: Send + Sync {
    async fn load(&self, receipt_hash: &B256) -> Result<Option<QuorumRecord>, BridgeError>;

    /// Record a signature, creating the record if absent.
    ///
    /// Returns `false` when this signer is already present.
    async fn add_signature(
        &self,
        receipt_hash: &B256,
        receipt: &Receipt,
        signature: &CollectedSignature,
    ) -> Result<bool, BridgeError>;

    /// Flip `executed` from false to true. Returns `true` only for the caller that flipped it.
    async fn mark_executed(&self, receipt_hash: &B256) -> Result<bool, BridgeError>;

    async fn mark_effect_applied(&self, receipt_hash: &B256) -> Result<(), BridgeError>;

    /// Executed records whose effect has not completed, oldest first
    async fn pending_effects(&self, limit: usize) -> Result<Vec<QuorumRecord>, BridgeError>;
}

/// In-memory store for tests and single-process deployments
#[derive(Default)]
pub struct MemoryQuorumStore {
    records: Mutex<HashMap<B256, QuorumRecord>>,
    /// Order in which records were executed
    executed_order: Mutex<Vec<B256>>,
}

impl MemoryQuorumStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl QuorumStore for MemoryQuorumStore {
    async fn load(&self, receipt_hash: &B256) -> Result<Option<QuorumRecord>, BridgeError> {
        Ok(self.records.lock().await.get(receipt_hash).cloned())
    }

    async fn add_signature(
        &self,
        receipt_hash: &B256,
        receipt: &Receipt,
        signature: &CollectedSignature,
    ) -> Result<bool, BridgeError> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(*receipt_hash)
            .or_insert_with(|| QuorumRecord::new(*receipt));

        if record.executed || record.has_signed(&signature.signer) {
            return Ok(false);
        }
        record.signatures.push(*signature);
        Ok(true)
    }

    async fn mark_executed(&self, receipt_hash: &B256) -> Result<bool, BridgeError> {
        let mut records = self.records.lock().await;
        match records.get_mut(receipt_hash) {
            Some(record) if !record.executed => {
                record.executed = true;
                self.executed_order.lock().await.push(*receipt_hash);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BridgeError::Storage(format!(
                "no quorum record for {}",
                receipt_hash
            ))),
        }
    }

    async fn mark_effect_applied(&self, receipt_hash: &B256) -> Result<(), BridgeError> {
        match self.records.lock().await.get_mut(receipt_hash) {
            Some(record) if record.executed => {
                record.effect_applied = true;
                Ok(())
            }
            _ => Err(BridgeError::Storage(format!(
                "no executed quorum record for {}",
                receipt_hash
            ))),
        }
    }

    async fn pending_effects(&self, limit: usize) -> Result<Vec<QuorumRecord>, BridgeError> {
        let records = self.records.lock().await;
        let order = self.executed_order.lock().await;
        Ok(order
            .iter()
            .filter_map(|hash| records.get(hash))
            .filter(|r| r.executed && !r.effect_applied)
            .take(limit)
            .cloned()
            .collect())
    }
}
