//! Relay queue consumers
//!
//! A consumer claims one message at a time and deletes it only after the handler
//! finished or the message can never succeed. Transient failures leave the message
//! in place; it is redelivered once its visibility timeout expires.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_core::{
    recover_signer, BridgeError, Direction, QuorumEngine, QuorumPolicy, Receipt, ValidatorSet,
};
use eyre::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::db::NewCellPayout;
use crate::metrics;
use crate::queue::{QueueMessage, RejectedMessage, RelayMessage, RelayQueue};
use crate::relay::sign_and_collect;
use crate::writers::{classify_report, ErrorClass, PayoutStore, RetryConfig, ValidatorSigner};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &RelayMessage) -> Result<()>;
}

/// What one `process_next` call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Nothing visible on the queue
    Empty,
    /// Handled (or already handled before) and deleted
    Completed { id: String },
    /// Could never succeed; logged and deleted
    DeadLettered { id: String },
    /// Left on the queue for redelivery
    Retained { id: String },
}

pub struct QueueConsumer {
    queue: Arc<dyn RelayQueue>,
    queue_name: String,
    handler: Arc<dyn MessageHandler>,
    idle_interval: Duration,
    retry: RetryConfig,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn RelayQueue>,
        queue_name: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        idle_interval: Duration,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            handler,
            idle_interval,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Claim and handle at most one message
    pub async fn process_next(&self) -> Result<ConsumeOutcome> {
        let Some(message) = self.queue.receive(&self.queue_name).await? else {
            return Ok(ConsumeOutcome::Empty);
        };
        metrics::record_queue_message(&self.queue_name, "received");

        let relay = match RelayMessage::from_body(&message.body) {
            Ok(relay) => relay,
            Err(e) => {
                error!(
                    queue = %self.queue_name,
                    id = %message.id,
                    error = %e,
                    body = %message.body,
                    "Undecodable relay message, dead-lettering"
                );
                return self.dead_letter(&message, "decode").await;
            }
        };

        let receipt_hash = relay.receipt.hash();
        match self.handler.handle(&relay).await {
            Ok(()) => {
                debug!(queue = %self.queue_name, id = %message.id, receipt_hash = %receipt_hash, "Relay message handled");
                self.complete(&message, "handled").await
            }
            Err(e) => match classify_report(&e) {
                ErrorClass::Benign => {
                    debug!(
                        queue = %self.queue_name,
                        receipt_hash = %receipt_hash,
                        reason = %e,
                        "Relay message already handled"
                    );
                    self.complete(&message, "duplicate").await
                }
                ErrorClass::Permanent => {
                    error!(
                        queue = %self.queue_name,
                        id = %message.id,
                        receipt_hash = %receipt_hash,
                        error = %format!("{:#}", e),
                        "Relay message rejected, dead-lettering"
                    );
                    self.dead_letter(&message, "rejected").await
                }
                ErrorClass::Transient | ErrorClass::Unknown => {
                    warn!(
                        queue = %self.queue_name,
                        id = %message.id,
                        receipt_hash = %receipt_hash,
                        receive_count = message.receive_count,
                        error = %format!("{:#}", e),
                        "Relay message failed, leaving it for redelivery"
                    );
                    metrics::record_queue_message(&self.queue_name, "retained");
                    Ok(ConsumeOutcome::Retained { id: message.id })
                }
            },
        }
    }

    async fn complete(&self, message: &QueueMessage, action: &str) -> Result<ConsumeOutcome> {
        self.queue.delete(&self.queue_name, &message.id).await?;
        metrics::record_queue_message(&self.queue_name, action);
        Ok(ConsumeOutcome::Completed {
            id: message.id.clone(),
        })
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<ConsumeOutcome> {
        self.queue.delete(&self.queue_name, &message.id).await?;
        metrics::record_queue_message(&self.queue_name, "dead_lettered");
        metrics::record_error(&format!("{}_consumer", self.queue_name), reason);
        Ok(ConsumeOutcome::DeadLettered {
            id: message.id.clone(),
        })
    }

    /// Drain the queue until `stop` flips
    pub async fn run(self, stop: watch::Receiver<bool>) -> Result<()> {
        let mut failures: u32 = 0;
        info!(queue = %self.queue_name, "Queue consumer started");

        loop {
            if *stop.borrow() {
                info!(queue = %self.queue_name, "Queue consumer stopped");
                return Ok(());
            }

            let delay = match self.process_next().await {
                Ok(ConsumeOutcome::Empty) => {
                    failures = 0;
                    self.refresh_depth().await;
                    self.idle_interval
                }
                Ok(ConsumeOutcome::Retained { .. }) => {
                    let backoff = self.retry.backoff_for_attempt(failures);
                    failures = failures.saturating_add(1);
                    backoff
                }
                Ok(_) => {
                    failures = 0;
                    Duration::ZERO
                }
                Err(e) => {
                    let backoff = self.retry.backoff_for_attempt(failures);
                    failures = failures.saturating_add(1);
                    metrics::record_error(&format!("{}_consumer", self.queue_name), "queue");
                    error!(
                        queue = %self.queue_name,
                        failures,
                        ?backoff,
                        error = %format!("{:#}", e),
                        "Queue operation failed"
                    );
                    backoff
                }
            };

            tokio::time::sleep(delay).await;
        }
    }

    async fn refresh_depth(&self) {
        if let Ok(depth) = self.queue.depth(&self.queue_name).await {
            metrics::set_queue_depth(&self.queue_name, depth);
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn expect_direction(message: &RelayMessage, direction: Direction) -> Result<()> {
    if message.receipt.direction != direction {
        return Err(RejectedMessage(format!(
            "expected a {} receipt, got {} for {}",
            direction,
            message.receipt.direction,
            message.receipt.hash()
        ))
        .into());
    }
    Ok(())
}

/// Signs queued Lock receipts with the local key and collects them toward quorum
pub struct LockCollectHandler {
    engine: Arc<QuorumEngine>,
    signer: ValidatorSigner,
}

impl LockCollectHandler {
    pub fn new(engine: Arc<QuorumEngine>, signer: ValidatorSigner) -> Self {
        Self { engine, signer }
    }
}

#[async_trait]
impl MessageHandler for LockCollectHandler {
    async fn handle(&self, message: &RelayMessage) -> Result<()> {
        expect_direction(message, Direction::Lock)?;
        if let Some(collection) = sign_and_collect(&self.engine, &self.signer, &message.receipt).await? {
            info!(
                receipt_hash = %collection.receipt_hash,
                account = %message.receipt.account,
                amount = %message.receipt.amount,
                state = ?collection.state,
                "Signed Lock receipt"
            );
        }
        Ok(())
    }
}

/// Records executed Unlock receipts as cell-ledger payout requests.
///
/// A hand-off is only trusted when it carries a quorum of distinct validator
/// signatures over the receipt.
pub struct PayoutHandler {
    store: Arc<dyn PayoutStore>,
    validators: ValidatorSet,
    policy: QuorumPolicy,
}

impl PayoutHandler {
    pub fn new(
        store: Arc<dyn PayoutStore>,
        validators: ValidatorSet,
        policy: QuorumPolicy,
    ) -> Self {
        Self {
            store,
            validators,
            policy,
        }
    }

    fn check_signatures(&self, message: &RelayMessage) -> Result<()> {
        let receipt_hash = message.receipt.hash();
        let mut signers = HashSet::new();
        for collected in &message.signatures {
            let signer = recover_signer(&receipt_hash, &collected.signature)?;
            if signer != collected.signer {
                return Err(RejectedMessage(format!(
                    "signature for {} recovers to {}, not {}",
                    receipt_hash, signer, collected.signer
                ))
                .into());
            }
            if !self.validators.contains(&signer) {
                return Err(BridgeError::NotAValidator(signer).into());
            }
            signers.insert(signer);
        }

        let threshold = self.policy.threshold(self.validators.len());
        if signers.len() < threshold {
            return Err(RejectedMessage(format!(
                "hand-off for {} carries {} distinct validator signatures, {} required",
                receipt_hash,
                signers.len(),
                threshold
            ))
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for PayoutHandler {
    async fn handle(&self, message: &RelayMessage) -> Result<()> {
        expect_direction(message, Direction::Unlock)?;
        self.check_signatures(message)?;

        let receipt: &Receipt = &message.receipt;
        let payout = NewCellPayout {
            receipt_hash: receipt.hash(),
            account: receipt.account,
            amount: receipt.amount,
            source_tx_ref: receipt.source_tx_ref,
            signatures: message.signatures.clone(),
        };

        if self.store.record(&payout).await? {
            info!(
                receipt_hash = %payout.receipt_hash,
                account = %payout.account,
                amount = %payout.amount,
                signatures = payout.signatures.len(),
                "Cell payout recorded"
            );
        } else {
            debug!(receipt_hash = %payout.receipt_hash, "Cell payout already recorded");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{send_relay_message, MemoryRelayQueue};
    use crate::writers::MemoryPayoutStore;
    use alloy::primitives::{Address, B256, U256};
    use bridge_core::testing::{sign, validator_signers, RecordingEffect};
    use bridge_core::{Chain, CollectedSignature, MemoryQuorumStore};
    use tokio::sync::Mutex;

    const Q: &str = "relay";

    /// Handler that replays scripted results
    struct Scripted {
        results: Mutex<Vec<Result<()>>>,
        seen: Mutex<Vec<RelayMessage>>,
    }

    impl Scripted {
        fn new(results: Vec<Result<()>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for Scripted {
        async fn handle(&self, message: &RelayMessage) -> Result<()> {
            self.seen.lock().await.push(message.clone());
            let mut results = self.results.lock().await;
            if results.is_empty() {
                Ok(())
            } else {
                results.remove(0)
            }
        }
    }

    fn lock_receipt() -> Receipt {
        Receipt::lock(
            Address::repeat_byte(0x11),
            U256::from(300u64),
            B256::repeat_byte(0x0c),
        )
    }

    fn unlock_receipt() -> Receipt {
        Receipt::unlock(
            Address::repeat_byte(0x22),
            U256::from(700u64),
            B256::repeat_byte(0x0e),
        )
    }

    async fn queue_with(messages: &[RelayMessage]) -> Arc<MemoryRelayQueue> {
        let queue = Arc::new(MemoryRelayQueue::with_visibility_timeout(Duration::from_secs(5)));
        queue.ensure_queue(Q).await.unwrap();
        for message in messages {
            send_relay_message(queue.as_ref(), Q, message).await.unwrap();
        }
        queue
    }

    fn consumer(queue: Arc<MemoryRelayQueue>, handler: Arc<dyn MessageHandler>) -> QueueConsumer {
        QueueConsumer::new(queue, Q, handler, Duration::from_millis(10))
    }

    fn engine(effect: Arc<RecordingEffect>) -> Arc<QuorumEngine> {
        let members = validator_signers().iter().map(|s| s.address()).collect();
        Arc::new(QuorumEngine::new(
            ValidatorSet::new(members).unwrap(),
            QuorumPolicy::Majority,
            Arc::new(MemoryQuorumStore::new()),
            effect,
        ))
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let queue = queue_with(&[]).await;
        let consumer = consumer(queue, Scripted::new(vec![]));
        assert_eq!(consumer.process_next().await.unwrap(), ConsumeOutcome::Empty);
    }

    #[tokio::test]
    async fn test_success_deletes_message() {
        let queue = queue_with(&[RelayMessage::new(lock_receipt(), Chain::Ckb)]).await;
        let handler = Scripted::new(vec![]);
        let consumer = consumer(queue.clone(), handler.clone());

        assert!(matches!(
            consumer.process_next().await.unwrap(),
            ConsumeOutcome::Completed { .. }
        ));
        assert_eq!(queue.depth(Q).await.unwrap(), 0);
        assert_eq!(handler.seen.lock().await[0].receipt, lock_receipt());
    }

    #[tokio::test]
    async fn test_benign_failure_deletes_message() {
        let queue = queue_with(&[RelayMessage::new(lock_receipt(), Chain::Ckb)]).await;
        let handler = Scripted::new(vec![Err(
            BridgeError::AlreadyExecuted(lock_receipt().hash()).into()
        )]);
        let consumer = consumer(queue.clone(), handler);

        assert!(matches!(
            consumer.process_next().await.unwrap(),
            ConsumeOutcome::Completed { .. }
        ));
        assert_eq!(queue.depth(Q).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_redelivered() {
        let queue = queue_with(&[RelayMessage::new(lock_receipt(), Chain::Ckb)]).await;
        let handler = Scripted::new(vec![Err(
            BridgeError::Storage("connection reset".into()).into()
        )]);
        let consumer = consumer(queue.clone(), handler.clone());

        assert!(matches!(
            consumer.process_next().await.unwrap(),
            ConsumeOutcome::Retained { .. }
        ));
        assert_eq!(queue.depth(Q).await.unwrap(), 1);
        // Hidden until the visibility timeout passes
        assert_eq!(consumer.process_next().await.unwrap(), ConsumeOutcome::Empty);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(
            consumer.process_next().await.unwrap(),
            ConsumeOutcome::Completed { .. }
        ));
        assert_eq!(handler.seen.lock().await.len(), 2);
        assert_eq!(queue.depth(Q).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_dead_lettered() {
        let queue = queue_with(&[]).await;
        queue.send(Q, "not json").await.unwrap();
        let handler = Scripted::new(vec![]);
        let consumer = consumer(queue.clone(), handler.clone());

        assert!(matches!(
            consumer.process_next().await.unwrap(),
            ConsumeOutcome::DeadLettered { .. }
        ));
        assert_eq!(queue.depth(Q).await.unwrap(), 0);
        assert!(handler.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_queue_outage_is_an_error() {
        let queue = queue_with(&[]).await;
        queue.set_unavailable(true);
        let consumer = consumer(queue, Scripted::new(vec![]));
        assert!(consumer.process_next().await.is_err());
    }

    #[tokio::test]
    async fn test_lock_handler_collects_local_signature() {
        let effect = Arc::new(RecordingEffect::new());
        let engine = engine(effect.clone());
        let signer = ValidatorSigner::new(validator_signers()[0].clone());
        let handler = LockCollectHandler::new(engine.clone(), signer);

        let message = RelayMessage::new(lock_receipt(), Chain::Ckb);
        handler.handle(&message).await.unwrap();
        // Redelivery of the same message
        handler.handle(&message).await.unwrap();

        let record = engine.record(&lock_receipt().hash()).await.unwrap().unwrap();
        assert_eq!(record.signatures.len(), 1);
        assert!(effect.executed().await.is_empty());
    }

    #[tokio::test]
    async fn test_lock_handler_rejects_unlock_receipts() {
        let engine = engine(Arc::new(RecordingEffect::new()));
        let signer = ValidatorSigner::new(validator_signers()[0].clone());
        let queue = queue_with(&[RelayMessage::new(unlock_receipt(), Chain::Evm)]).await;
        let consumer = consumer(queue.clone(), Arc::new(LockCollectHandler::new(engine, signer)));

        assert!(matches!(
            consumer.process_next().await.unwrap(),
            ConsumeOutcome::DeadLettered { .. }
        ));
    }

    #[tokio::test]
    async fn test_lock_handler_retains_on_failed_release() {
        let effect = Arc::new(RecordingEffect::new());
        effect.fail_next(true);
        let engine = engine(effect.clone());
        let receipt = lock_receipt();

        // Two remote validators already signed; the local one completes quorum
        for s in &validator_signers()[1..3] {
            engine.collect(&receipt, &sign(s, &receipt)).await.unwrap();
        }
        let signer = ValidatorSigner::new(validator_signers()[0].clone());
        let queue = queue_with(&[RelayMessage::new(receipt, Chain::Ckb)]).await;
        let consumer = consumer(queue.clone(), Arc::new(LockCollectHandler::new(engine, signer)));

        assert!(matches!(
            consumer.process_next().await.unwrap(),
            ConsumeOutcome::Retained { .. }
        ));
        assert_eq!(queue.depth(Q).await.unwrap(), 1);
        assert!(effect.executed().await.is_empty());
    }

    #[tokio::test]
    async fn test_payout_handler_records_once() {
        let store = Arc::new(MemoryPayoutStore::new());
        let validators =
            ValidatorSet::new(validator_signers().iter().map(|s| s.address()).collect()).unwrap();
        let handler = PayoutHandler::new(store.clone(), validators, QuorumPolicy::Majority);

        let receipt = unlock_receipt();
        let signatures: Vec<_> = validator_signers()[..3]
            .iter()
            .map(|s| CollectedSignature {
                signer: s.address(),
                signature: sign(s, &receipt),
            })
            .collect();
        let message = RelayMessage::new(receipt, Chain::Evm).with_signatures(signatures);

        handler.handle(&message).await.unwrap();
        handler.handle(&message).await.unwrap();

        assert_eq!(store.pending_count().await.unwrap(), 1);
        let payout = store.get(&receipt.hash()).await.unwrap();
        assert_eq!(payout.amount, U256::from(700u64));
        assert_eq!(payout.signatures.len(), 3);
    }

    #[tokio::test]
    async fn test_payout_handler_rejects_foreign_signatures() {
        let store = Arc::new(MemoryPayoutStore::new());
        let validators = ValidatorSet::new(vec![validator_signers()[0].address()]).unwrap();
        let handler = PayoutHandler::new(store.clone(), validators, QuorumPolicy::Majority);

        let receipt = unlock_receipt();
        let outsider = &validator_signers()[1];
        let message = RelayMessage::new(receipt, Chain::Evm).with_signatures(vec![
            CollectedSignature {
                signer: outsider.address(),
                signature: sign(outsider, &receipt),
            },
        ]);

        let err = handler.handle(&message).await.unwrap_err();
        assert_eq!(classify_report(&err), ErrorClass::Permanent);
        assert_eq!(store.pending_count().await.unwrap(), 0);

        let lock = RelayMessage::new(lock_receipt(), Chain::Ckb);
        let err = handler.handle(&lock).await.unwrap_err();
        assert_eq!(classify_report(&err), ErrorClass::Permanent);
    }

    fn collected(signer: &alloy::signers::local::PrivateKeySigner, receipt: &Receipt) -> CollectedSignature {
        CollectedSignature {
            signer: signer.address(),
            signature: sign(signer, receipt),
        }
    }

    #[tokio::test]
    async fn test_payout_handler_requires_quorum_of_distinct_signers() {
        let store = Arc::new(MemoryPayoutStore::new());
        let signers = validator_signers();
        let validators = ValidatorSet::new(signers.iter().map(|s| s.address()).collect()).unwrap();
        let handler = PayoutHandler::new(store.clone(), validators, QuorumPolicy::Majority);
        let receipt = unlock_receipt();

        // No signatures at all
        let bare = RelayMessage::new(receipt, Chain::Evm);
        let err = handler.handle(&bare).await.unwrap_err();
        assert_eq!(classify_report(&err), ErrorClass::Permanent);

        // One validator repeated up to the threshold
        let one = collected(&signers[0], &receipt);
        let repeated = RelayMessage::new(receipt, Chain::Evm).with_signatures(vec![one, one, one]);
        let err = handler.handle(&repeated).await.unwrap_err();
        assert_eq!(classify_report(&err), ErrorClass::Permanent);

        // Two distinct of four is below the majority of three
        let short = RelayMessage::new(receipt, Chain::Evm).with_signatures(vec![
            collected(&signers[0], &receipt),
            collected(&signers[1], &receipt),
        ]);
        assert!(handler.handle(&short).await.is_err());
        assert_eq!(store.pending_count().await.unwrap(), 0);

        let quorate = RelayMessage::new(receipt, Chain::Evm).with_signatures(vec![
            collected(&signers[2], &receipt),
            collected(&signers[0], &receipt),
            collected(&signers[1], &receipt),
        ]);
        handler.handle(&quorate).await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unsigned_handoff_is_dead_lettered() {
        let store = Arc::new(MemoryPayoutStore::new());
        let validators =
            ValidatorSet::new(validator_signers().iter().map(|s| s.address()).collect()).unwrap();
        let handler = PayoutHandler::new(store.clone(), validators, QuorumPolicy::Majority);
        let queue = queue_with(&[RelayMessage::new(unlock_receipt(), Chain::Evm)]).await;
        let consumer = consumer(queue.clone(), Arc::new(handler));

        assert!(matches!(
            consumer.process_next().await.unwrap(),
            ConsumeOutcome::DeadLettered { .. }
        ));
        assert_eq!(queue.depth(Q).await.unwrap(), 0);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }
}
