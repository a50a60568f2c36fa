//! Cross-ledger relay
//!
//! Ledger subscribers turn classified events into receipts:
//! - a cell-ledger deposit becomes a Lock receipt on the account-ledger queue,
//! - an account-ledger burn is signed locally as an Unlock receipt,
//! - an on-chain quorum for a burn is handed to the cell-ledger queue together with
//!   the locally collected signatures that prove it.
//!
//! Queue consumers on both sides finish the work, see [`consumer`]. Quorum effects
//! that failed after execution are finished by [`EffectResumer`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_core::{
    BridgeError, BridgeEvent, Chain, Collection, LedgerEvent, QuorumEngine, Receipt,
};
use eyre::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::queue::{send_relay_message, RelayMessage, RelayQueue};
use crate::watchers::EventSubscriber;
use crate::writers::ValidatorSigner;

pub mod consumer;

pub use consumer::{LockCollectHandler, MessageHandler, PayoutHandler, QueueConsumer};

/// Sign a receipt with the local key and count it toward quorum.
///
/// Replays come back as `Ok(None)`. Any other failure is counted and returned,
/// with the `BridgeError` kept inside the report for classification.
pub async fn sign_and_collect(
    engine: &QuorumEngine,
    signer: &ValidatorSigner,
    receipt: &Receipt,
) -> Result<Option<Collection>> {
    let signature = signer.sign(receipt)?;
    match engine.collect(receipt, &signature).await {
        Ok(collection) => {
            metrics::record_signature_collected(receipt.direction.as_str());
            if collection.quorum_reached() {
                metrics::record_quorum_reached(receipt.direction.as_str());
            }
            Ok(Some(collection))
        }
        Err(e) if e.is_benign() => {
            debug!(receipt_hash = %receipt.hash(), reason = %e, "Receipt already handled");
            Ok(None)
        }
        Err(e @ BridgeError::NotAValidator(_)) => {
            error!(
                receipt_hash = %receipt.hash(),
                signer = %signer.address(),
                "Local key is not in the validator set"
            );
            metrics::record_error("quorum", e.kind());
            Err(e.into())
        }
        Err(e) => {
            metrics::record_error("quorum", e.kind());
            Err(e.into())
        }
    }
}

/// Cell-ledger deposits become Lock receipts on the account-ledger queue
pub struct LockRelay {
    queue: Arc<dyn RelayQueue>,
    queue_name: String,
}

impl LockRelay {
    pub fn new(queue: Arc<dyn RelayQueue>, queue_name: impl Into<String>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
        }
    }
}

#[async_trait]
impl EventSubscriber for LockRelay {
    async fn on_event(&self, event: &LedgerEvent) -> Result<()> {
        let (Chain::Ckb, BridgeEvent::NewDeposit(deposit)) = (event.chain, &event.event) else {
            return Ok(());
        };

        let Some(recipient) = deposit.recipient else {
            warn!(
                tx_hash = %event.tx_hash,
                depositor = %deposit.depositor,
                "Deposit cell does not name an EVM recipient, not relaying"
            );
            metrics::record_error("lock_relay", "missing_recipient");
            return Ok(());
        };

        let receipt = Receipt::lock(recipient, deposit.amount, event.tx_hash);
        send_relay_message(
            self.queue.as_ref(),
            &self.queue_name,
            &RelayMessage::new(receipt, Chain::Ckb),
        )
        .await?;

        info!(
            tx_hash = %event.tx_hash,
            height = event.block_number,
            receipt_hash = %receipt.hash(),
            depositor = %deposit.depositor,
            recipient = %recipient,
            amount = %receipt.amount,
            "Relayed deposit as Lock receipt"
        );
        Ok(())
    }
}

/// Account-ledger burns are signed with the local key and collected as Unlock receipts
pub struct UnlockCollector {
    engine: Arc<QuorumEngine>,
    signer: ValidatorSigner,
}

impl UnlockCollector {
    pub fn new(engine: Arc<QuorumEngine>, signer: ValidatorSigner) -> Self {
        Self { engine, signer }
    }
}

#[async_trait]
impl EventSubscriber for UnlockCollector {
    async fn on_event(&self, event: &LedgerEvent) -> Result<()> {
        let (Chain::Evm, BridgeEvent::NewDeposit(burn)) = (event.chain, &event.event) else {
            return Ok(());
        };

        let receipt = Receipt::unlock(burn.depositor, burn.amount, event.tx_hash);
        match sign_and_collect(&self.engine, &self.signer, &receipt).await {
            Ok(Some(collection)) => {
                info!(
                    tx_hash = %event.tx_hash,
                    receipt_hash = %collection.receipt_hash,
                    state = ?collection.state,
                    "Signed burn as Unlock receipt"
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            // A bad local key must not hold the watermark back forever
            Err(e) if is_permanent(&e) => {
                warn!(tx_hash = %event.tx_hash, error = %e, "Burn not signed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn is_permanent(report: &eyre::Report) -> bool {
    report
        .downcast_ref::<BridgeError>()
        .is_some_and(|e| e.is_permanent())
}

/// On-chain burn quorums are handed to the cell-ledger queue.
///
/// The payout side only accepts hand-offs that carry a quorum of validator
/// signatures, so the receipt is forwarded with the signatures held in the local
/// quorum store. Without a local quorum the event is skipped; the operators that
/// do hold one forward it.
pub struct QuorumHandoff {
    engine: Arc<QuorumEngine>,
    queue: Arc<dyn RelayQueue>,
    queue_name: String,
}

impl QuorumHandoff {
    pub fn new(
        engine: Arc<QuorumEngine>,
        queue: Arc<dyn RelayQueue>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            queue,
            queue_name: queue_name.into(),
        }
    }
}

#[async_trait]
impl EventSubscriber for QuorumHandoff {
    async fn on_event(&self, event: &LedgerEvent) -> Result<()> {
        let (Chain::Evm, BridgeEvent::QuorumReached(receipt)) = (event.chain, &event.event) else {
            return Ok(());
        };
        let receipt_hash = receipt.hash();

        let signatures = self
            .engine
            .record(&receipt_hash)
            .await?
            .map(|r| r.signatures)
            .unwrap_or_default();
        if signatures.len() < self.engine.threshold() {
            warn!(
                tx_hash = %event.tx_hash,
                receipt_hash = %receipt_hash,
                signatures = signatures.len(),
                threshold = self.engine.threshold(),
                "On-chain burn quorum without a local quorum, not handing off"
            );
            metrics::record_error("quorum_handoff", "no_local_quorum");
            return Ok(());
        }

        send_relay_message(
            self.queue.as_ref(),
            &self.queue_name,
            &RelayMessage::new(*receipt, Chain::Evm).with_signatures(signatures),
        )
        .await?;
        info!(
            tx_hash = %event.tx_hash,
            receipt_hash = %receipt_hash,
            "Handed on-chain burn quorum to cell-ledger queue"
        );
        Ok(())
    }
}

/// Periodically re-runs quorum effects left pending by a failure
pub struct EffectResumer {
    engine: Arc<QuorumEngine>,
    interval: Duration,
    batch_size: usize,
}

impl EffectResumer {
    const DEFAULT_BATCH_SIZE: usize = 50;

    pub fn new(engine: Arc<QuorumEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            batch_size: Self::DEFAULT_BATCH_SIZE,
        }
    }

    pub async fn run(self, stop: watch::Receiver<bool>) -> Result<()> {
        info!(interval = ?self.interval, "Effect resumer started");
        loop {
            if *stop.borrow() {
                info!("Effect resumer stopped");
                return Ok(());
            }

            match self.engine.resume_pending(self.batch_size).await {
                Ok(0) => {}
                Ok(applied) => info!(applied, "Resumed pending quorum effects"),
                Err(e) => {
                    metrics::record_error("effect_resumer", e.kind());
                    error!(error = %e, "Failed to list pending quorum effects");
                }
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryRelayQueue;
    use alloy::primitives::{Address, B256, U256};
    use bridge_core::testing::{sign, validator_signers, RecordingEffect};
    use bridge_core::{Account, Deposit, MemoryQuorumStore, QuorumPolicy, ValidatorSet};

    fn event(chain: Chain, event: BridgeEvent) -> LedgerEvent {
        LedgerEvent {
            chain,
            block_number: 9,
            tx_index: 0,
            tx_hash: B256::repeat_byte(0x99),
            event,
        }
    }

    fn deposit(depositor: Account, amount: u64) -> BridgeEvent {
        BridgeEvent::NewDeposit(Deposit {
            depositor,
            amount: U256::from(amount),
            recipient: None,
        })
    }

    /// A cell deposit from a real lock hash, released to `recipient`
    fn cell_deposit(recipient: Address, amount: u64) -> BridgeEvent {
        BridgeEvent::NewDeposit(Deposit {
            depositor: Account::from_hex(
                "0x32e555f3ff8e135cece1351a6a2971518392c1e30375c1e006ad0ce8eac07947",
            )
            .unwrap(),
            amount: U256::from(amount),
            recipient: Some(recipient),
        })
    }

    async fn queue(name: &str) -> Arc<MemoryRelayQueue> {
        let queue = Arc::new(MemoryRelayQueue::new());
        queue.ensure_queue(name).await.unwrap();
        queue
    }

    fn engine(validators: usize, effect: Arc<RecordingEffect>) -> Arc<QuorumEngine> {
        let members = validator_signers()
            .iter()
            .take(validators)
            .map(|s| s.address())
            .collect();
        Arc::new(QuorumEngine::new(
            ValidatorSet::new(members).unwrap(),
            QuorumPolicy::Majority,
            Arc::new(MemoryQuorumStore::new()),
            effect,
        ))
    }

    #[tokio::test]
    async fn test_cell_deposit_is_relayed_as_lock() {
        let queue = queue("evm").await;
        let relay = LockRelay::new(queue.clone(), "evm");
        let alice = Address::repeat_byte(0xa1);

        relay
            .on_event(&event(Chain::Ckb, cell_deposit(alice, 500)))
            .await
            .unwrap();

        let message = queue.receive("evm").await.unwrap().unwrap();
        let decoded = RelayMessage::from_body(&message.body).unwrap();
        assert_eq!(
            decoded.receipt,
            Receipt::lock(alice, U256::from(500u64), B256::repeat_byte(0x99))
        );
        assert_eq!(decoded.origin_chain, Chain::Ckb);
    }

    #[tokio::test]
    async fn test_lock_relay_ignores_other_events() {
        let queue = queue("evm").await;
        let relay = LockRelay::new(queue.clone(), "evm");

        relay
            .on_event(&event(Chain::Evm, cell_deposit(Address::repeat_byte(0xa1), 500)))
            .await
            .unwrap();
        // No recipient in the cell data
        relay
            .on_event(&event(Chain::Ckb, deposit(Account([0xff; 32]), 500)))
            .await
            .unwrap();
        assert_eq!(queue.depth("evm").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lock_relay_propagates_queue_outage() {
        let queue = queue("evm").await;
        queue.set_unavailable(true);
        let relay = LockRelay::new(queue.clone(), "evm");
        assert!(relay
            .on_event(&event(Chain::Ckb, cell_deposit(Address::repeat_byte(0xa1), 500)))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_burn_is_signed_and_collected_once() {
        let effect = Arc::new(RecordingEffect::new());
        let engine = engine(1, effect.clone());
        let signer = ValidatorSigner::new(validator_signers()[0].clone());
        let collector = UnlockCollector::new(engine.clone(), signer);
        let burner = Account::from_evm(Address::repeat_byte(0xb1));
        let burn = event(Chain::Evm, deposit(burner, 42));

        collector.on_event(&burn).await.unwrap();
        // Replayed batch
        collector.on_event(&burn).await.unwrap();

        let executed = effect.executed().await;
        assert_eq!(executed.len(), 1);
        assert_eq!(
            executed[0].0,
            Receipt::unlock(burner, U256::from(42u64), B256::repeat_byte(0x99))
        );
    }

    #[tokio::test]
    async fn test_burn_with_foreign_key_does_not_stall() {
        let effect = Arc::new(RecordingEffect::new());
        let engine = engine(1, effect.clone());
        let outsider = ValidatorSigner::new(validator_signers()[3].clone());
        let collector = UnlockCollector::new(engine, outsider);
        let burn = event(Chain::Evm, deposit(Account::from_evm(Address::repeat_byte(1)), 1));

        collector.on_event(&burn).await.unwrap();
        assert!(effect.executed().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_effect_is_left_for_resume() {
        let effect = Arc::new(RecordingEffect::new());
        effect.fail_next(true);
        let engine = engine(1, effect.clone());
        let signer = ValidatorSigner::new(validator_signers()[0].clone());
        let collector = UnlockCollector::new(engine.clone(), signer);
        let burn = event(Chain::Evm, deposit(Account::from_evm(Address::repeat_byte(1)), 1));

        assert!(collector.on_event(&burn).await.is_err());
        // The replayed batch does not run it again
        collector.on_event(&burn).await.unwrap();
        assert!(effect.executed().await.is_empty());

        assert_eq!(engine.resume_pending(10).await.unwrap(), 1);
        assert_eq!(effect.executed().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumer_applies_pending_effects_until_stopped() {
        let effect = Arc::new(RecordingEffect::new());
        effect.fail_next(true);
        let engine = engine(1, effect.clone());
        let receipt = Receipt::lock(Address::repeat_byte(0x21), U256::from(3u64), B256::ZERO);
        assert!(engine
            .collect(&receipt, &sign(&validator_signers()[0], &receipt))
            .await
            .is_err());

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(
            EffectResumer::new(engine.clone(), Duration::from_secs(5)).run(stop_rx),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(effect.executed().await.len(), 1);

        stop_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        handle.await.unwrap().unwrap();
        assert_eq!(effect.executed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_on_chain_quorum_is_handed_off_with_local_signatures() {
        let queue = queue("ckb").await;
        let engine = engine(4, Arc::new(RecordingEffect::new()));
        let handoff = QuorumHandoff::new(engine.clone(), queue.clone(), "ckb");
        let receipt = Receipt::unlock(
            Address::repeat_byte(0x22),
            U256::from(7u64),
            B256::repeat_byte(0x44),
        );
        let on_chain = event(Chain::Evm, BridgeEvent::QuorumReached(receipt));

        // Nothing collected locally yet
        handoff.on_event(&on_chain).await.unwrap();
        assert_eq!(queue.depth("ckb").await.unwrap(), 0);

        for s in &validator_signers()[..3] {
            engine.collect(&receipt, &sign(s, &receipt)).await.unwrap();
        }
        // The engine's own effect is a recorder here, so the queue only sees the hand-off
        handoff.on_event(&on_chain).await.unwrap();

        let message = queue.receive("ckb").await.unwrap().unwrap();
        let decoded = RelayMessage::from_body(&message.body).unwrap();
        assert_eq!(decoded.receipt, receipt);
        assert_eq!(decoded.signatures.len(), 3);
    }
}
