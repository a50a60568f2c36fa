//! Recording quorum effect

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::BridgeError;
use crate::quorum::{CollectedSignature, QuorumEffect};
use crate::types::Receipt;

/// Records every execution. When `fail_next` is set the next execution fails with
/// `ExecutionFailed` and is not recorded. `fail_after_apply` records the next execution
/// and then fails it, like a transfer whose confirmation is lost.
#[derive(Default)]
pub struct RecordingEffect {
    executed: Mutex<Vec<(Receipt, Vec<CollectedSignature>)>>,
    fail: AtomicBool,
    fail_after: AtomicBool,
}

impl RecordingEffect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn fail_after_apply(&self, fail: bool) {
        self.fail_after.store(fail, Ordering::SeqCst);
    }

    pub async fn executed(&self) -> Vec<(Receipt, Vec<CollectedSignature>)> {
        self.executed.lock().await.clone()
    }
}

#[async_trait]
impl QuorumEffect for RecordingEffect {
    async fn execute(
        &self,
        receipt: &Receipt,
        signatures: &[CollectedSignature],
    ) -> Result<(), BridgeError> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(BridgeError::ExecutionFailed {
                receipt_hash: receipt.hash(),
                reason: "injected failure".to_string(),
            });
        }
        self.executed
            .lock()
            .await
            .push((*receipt, signatures.to_vec()));
        if self.fail_after.swap(false, Ordering::SeqCst) {
            return Err(BridgeError::ExecutionFailed {
                receipt_hash: receipt.hash(),
                reason: "confirmation lost".to_string(),
            });
        }
        Ok(())
    }
}
