//! Validator-quorum signature collection
//!
//! Each receipt identity moves through `Unseen -> Collecting -> Quorate -> Executed`.
//! `QuorumEngine::collect` is the only writer. It recovers the signer, rejects
//! non-members and replays, records the signature and, when the threshold is met,
//! flips `executed` and hands the receipt to the ledger-side effect.
//!
//! Concurrent `collect` calls for one receipt are serialized by a per-receipt async
//! lock inside the process, and across processes by the store's compare-and-set on
//! `executed`. The flip is permanent. An effect that fails after the flip is left
//! pending and finished by [`QuorumEngine::resume_pending`], never by re-collecting.

mod store;

pub use store::{MemoryQuorumStore, QuorumStore};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::types::{Direction, Receipt, RecoverableSignature};
use crate::verification::recover_signer;

// ============================================================================
// Validator Set and Threshold Policy
// ============================================================================

/// Ordered, duplicate-free set of validator addresses
#[derive(Debug, Clone)]
pub struct ValidatorSet {
    members: Vec<Address>,
    index: HashSet<Address>,
}

impl ValidatorSet {
    pub fn new(members: Vec<Address>) -> Result<Self, String> {
        if members.is_empty() {
            return Err("validator set must not be empty".to_string());
        }
        let mut index = HashSet::with_capacity(members.len());
        for member in &members {
            if !index.insert(*member) {
                return Err(format!("duplicate validator {}", member));
            }
        }
        Ok(Self { members, index })
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.index.contains(address)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false; construction rejects empty sets
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[Address] {
        &self.members
    }
}

/// How many distinct validator signatures make a quorum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuorumPolicy {
    /// Strictly more than half: `floor(n / 2) + 1`
    #[default]
    Majority,
    /// Every validator
    Unanimous,
    /// A fixed count, clamped to `1..=n`
    Fixed(usize),
}

impl QuorumPolicy {
    pub fn threshold(&self, validators: usize) -> usize {
        match self {
            QuorumPolicy::Majority => validators / 2 + 1,
            QuorumPolicy::Unanimous => validators,
            QuorumPolicy::Fixed(k) => (*k).clamp(1, validators.max(1)),
        }
    }
}

impl fmt::Display for QuorumPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumPolicy::Majority => f.write_str("majority"),
            QuorumPolicy::Unanimous => f.write_str("unanimous"),
            QuorumPolicy::Fixed(k) => write!(f, "fixed:{}", k),
        }
    }
}

impl FromStr for QuorumPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "majority" => Ok(QuorumPolicy::Majority),
            "unanimous" | "all" => Ok(QuorumPolicy::Unanimous),
            other => match other.strip_prefix("fixed:") {
                Some(k) => k
                    .parse::<usize>()
                    .ok()
                    .filter(|k| *k > 0)
                    .map(QuorumPolicy::Fixed)
                    .ok_or_else(|| format!("invalid fixed quorum: {}", other)),
                None => Err(format!("unknown quorum policy: {}", other)),
            },
        }
    }
}

// ============================================================================
// Records, States and Events
// ============================================================================

/// A validator signature whose signer has been recovered and checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedSignature {
    pub signer: Address,
    pub signature: RecoverableSignature,
}

/// Everything known about one receipt identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumRecord {
    pub receipt: Receipt,
    /// Collection order is preserved
    pub signatures: Vec<CollectedSignature>,
    pub executed: bool,
    /// The ledger effect completed after `executed` was flipped
    pub effect_applied: bool,
}

impl QuorumRecord {
    pub fn new(receipt: Receipt) -> Self {
        Self {
            receipt,
            signatures: Vec::new(),
            executed: false,
            effect_applied: false,
        }
    }

    pub fn has_signed(&self, signer: &Address) -> bool {
        self.signatures.iter().any(|s| &s.signer == signer)
    }

    pub fn signers(&self) -> Vec<Address> {
        self.signatures.iter().map(|s| s.signer).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuorumState {
    Unseen,
    Collecting,
    Quorate,
    Executed,
}

impl QuorumState {
    fn of(record: Option<&QuorumRecord>, threshold: usize) -> Self {
        match record {
            None => QuorumState::Unseen,
            Some(r) if r.executed => QuorumState::Executed,
            Some(r) if r.signatures.len() >= threshold => QuorumState::Quorate,
            Some(r) if r.signatures.is_empty() => QuorumState::Unseen,
            Some(_) => QuorumState::Collecting,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum QuorumEvent {
    #[serde(rename_all = "camelCase")]
    SignatureCollected {
        receipt_hash: B256,
        signer: Address,
        signatures: usize,
        threshold: usize,
    },
    #[serde(rename_all = "camelCase")]
    QuorumReached {
        receipt_hash: B256,
        receipt: Receipt,
        signers: Vec<Address>,
    },
}

/// Result of a successful `collect` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub receipt_hash: B256,
    pub signer: Address,
    pub state: QuorumState,
    /// `SignatureCollected`, followed by `QuorumReached` when this call executed the receipt
    pub events: Vec<QuorumEvent>,
}

impl Collection {
    pub fn quorum_reached(&self) -> bool {
        self.state == QuorumState::Executed
    }
}

// ============================================================================
// Ledger Effects
// ============================================================================

/// Ledger-side action run when a receipt reaches quorum.
///
/// An execution can be cut short after its side effect landed (a timeout, a crash),
/// and the engine then runs it again from [`QuorumEngine::resume_pending`].
/// Implementations must therefore be idempotent per receipt hash.
#[async_trait]
pub trait QuorumEffect: Send + Sync {
    async fn execute(
        &self,
        receipt: &Receipt,
        signatures: &[CollectedSignature],
    ) -> Result<(), BridgeError>;
}

/// Routes Lock and Unlock receipts to different effects
pub struct DirectionalEffect {
    pub lock: Arc<dyn QuorumEffect>,
    pub unlock: Arc<dyn QuorumEffect>,
}

#[async_trait]
impl QuorumEffect for DirectionalEffect {
    async fn execute(
        &self,
        receipt: &Receipt,
        signatures: &[CollectedSignature],
    ) -> Result<(), BridgeError> {
        match receipt.direction {
            Direction::Lock => self.lock.execute(receipt, signatures).await,
            Direction::Unlock => self.unlock.execute(receipt, signatures).await,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Lazily created async mutex per receipt hash
#[derive(Default)]
struct ReceiptLocks {
    locks: Mutex<HashMap<B256, Arc<Mutex<()>>>>,
}

impl ReceiptLocks {
    const PRUNE_AT: usize = 1024;

    async fn acquire(&self, receipt_hash: B256) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            if locks.len() >= Self::PRUNE_AT {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks.entry(receipt_hash).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct QuorumEngine {
    validators: ValidatorSet,
    policy: QuorumPolicy,
    store: Arc<dyn QuorumStore>,
    effect: Arc<dyn QuorumEffect>,
    locks: ReceiptLocks,
}

impl QuorumEngine {
    pub fn new(
        validators: ValidatorSet,
        policy: QuorumPolicy,
        store: Arc<dyn QuorumStore>,
        effect: Arc<dyn QuorumEffect>,
    ) -> Self {
        info!(
            validators = validators.len(),
            policy = %policy,
            threshold = policy.threshold(validators.len()),
            "Quorum engine initialized"
        );
        Self {
            validators,
            policy,
            store,
            effect,
            locks: ReceiptLocks::default(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.policy.threshold(self.validators.len())
    }

    pub fn policy(&self) -> QuorumPolicy {
        self.policy
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub async fn record(&self, receipt_hash: &B256) -> Result<Option<QuorumRecord>, BridgeError> {
        self.store.load(receipt_hash).await
    }

    pub async fn state(&self, receipt_hash: &B256) -> Result<QuorumState, BridgeError> {
        let record = self.store.load(receipt_hash).await?;
        Ok(QuorumState::of(record.as_ref(), self.threshold()))
    }

    /// Count one validator signature toward a receipt's quorum.
    ///
    /// Fails with `NotAValidator` or `InvalidSignature` without touching the record,
    /// and with `AlreadyExecuted` / `AlreadyCollected` on replays. When this signature
    /// completes the quorum the record is flipped to executed and the effect runs before
    /// returning. If the effect fails the record stays executed with its effect pending,
    /// and `ExecutionFailed` is returned.
    pub async fn collect(
        &self,
        receipt: &Receipt,
        signature: &RecoverableSignature,
    ) -> Result<Collection, BridgeError> {
        let receipt_hash = receipt.hash();
        let signer = recover_signer(&receipt_hash, signature)?;
        if !self.validators.contains(&signer) {
            warn!(
                receipt_hash = %receipt_hash,
                signer = %signer,
                "Rejected signature from non-validator"
            );
            return Err(BridgeError::NotAValidator(signer));
        }

        let _guard = self.locks.acquire(receipt_hash).await;

        let record = self
            .store
            .load(&receipt_hash)
            .await?
            .unwrap_or_else(|| QuorumRecord::new(*receipt));

        if record.executed {
            return Err(BridgeError::AlreadyExecuted(receipt_hash));
        }
        if record.has_signed(&signer) {
            return Err(BridgeError::AlreadyCollected {
                receipt_hash,
                signer,
            });
        }

        let collected = CollectedSignature {
            signer,
            signature: *signature,
        };
        if !self
            .store
            .add_signature(&receipt_hash, receipt, &collected)
            .await?
        {
            // Another process got there between load and insert
            return match self.store.load(&receipt_hash).await? {
                Some(r) if r.executed => Err(BridgeError::AlreadyExecuted(receipt_hash)),
                _ => Err(BridgeError::AlreadyCollected {
                    receipt_hash,
                    signer,
                }),
            };
        }

        // Re-read: operators sharing the store may have added signatures since the load
        let signatures = match self.store.load(&receipt_hash).await? {
            Some(r) => r.signatures,
            None => {
                let mut signatures = record.signatures;
                signatures.push(collected);
                signatures
            }
        };
        let threshold = self.threshold();

        let mut events = vec![QuorumEvent::SignatureCollected {
            receipt_hash,
            signer,
            signatures: signatures.len(),
            threshold,
        }];

        if signatures.len() < threshold {
            debug!(
                receipt_hash = %receipt_hash,
                signer = %signer,
                signatures = signatures.len(),
                threshold,
                "Signature collected"
            );
            return Ok(Collection {
                receipt_hash,
                signer,
                state: QuorumState::Collecting,
                events,
            });
        }

        if !self.store.mark_executed(&receipt_hash).await? {
            // Another operator sharing the store flipped it first
            return Err(BridgeError::AlreadyExecuted(receipt_hash));
        }

        self.apply_effect(receipt, &signatures).await?;

        info!(
            receipt_hash = %receipt_hash,
            direction = %receipt.direction,
            account = %receipt.account,
            amount = %receipt.amount,
            signatures = signatures.len(),
            "Quorum reached, receipt executed"
        );

        events.push(QuorumEvent::QuorumReached {
            receipt_hash,
            receipt: *receipt,
            signers: signatures.iter().map(|s| s.signer).collect(),
        });

        Ok(Collection {
            receipt_hash,
            signer,
            state: QuorumState::Executed,
            events,
        })
    }

    /// Re-run effects of executed receipts whose effect never completed.
    ///
    /// Returns how many were applied. A failure is logged and left for the next call.
    pub async fn resume_pending(&self, limit: usize) -> Result<usize, BridgeError> {
        let pending = self.store.pending_effects(limit).await?;
        let mut applied = 0;

        for candidate in pending {
            let receipt_hash = candidate.receipt.hash();
            let _guard = self.locks.acquire(receipt_hash).await;

            // A concurrent collect in this process may still be running it
            let Some(record) = self.store.load(&receipt_hash).await? else {
                continue;
            };
            if !record.executed || record.effect_applied {
                continue;
            }

            match self.apply_effect(&record.receipt, &record.signatures).await {
                Ok(()) => {
                    info!(
                        receipt_hash = %receipt_hash,
                        direction = %record.receipt.direction,
                        "Pending quorum effect applied"
                    );
                    applied += 1;
                }
                Err(e) => warn!(
                    receipt_hash = %receipt_hash,
                    error = %e,
                    "Pending quorum effect failed again"
                ),
            }
        }
        Ok(applied)
    }

    async fn apply_effect(
        &self,
        receipt: &Receipt,
        signatures: &[CollectedSignature],
    ) -> Result<(), BridgeError> {
        let receipt_hash = receipt.hash();
        if let Err(e) = self.effect.execute(receipt, signatures).await {
            warn!(
                receipt_hash = %receipt_hash,
                direction = %receipt.direction,
                error = %e,
                "Quorum effect failed, left pending"
            );
            return Err(match e {
                BridgeError::ExecutionFailed { .. } => e,
                other => BridgeError::ExecutionFailed {
                    receipt_hash,
                    reason: other.to_string(),
                },
            });
        }
        self.store.mark_effect_applied(&receipt_hash).await
    }
}
