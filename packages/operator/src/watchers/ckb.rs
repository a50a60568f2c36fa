//! Cell-ledger event source
//!
//! Gathers transactions touching the bridge cell or any deposit lock, resolves the
//! cells they consume and runs them through the bridge classifier.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bridge_core::{
    classify_batch, order_batch, BridgeEvent, BridgeIdentity, Chain, LedgerEvent, Script,
};
use eyre::{Result, WrapErr};
use futures::future::try_join_all;
use tracing::{debug, warn};

use super::EventSource;
use crate::ledger::{CellFilter, CellLedger};
use crate::metrics;

pub struct CkbEventSource {
    ledger: Arc<dyn CellLedger>,
    bridge: BridgeIdentity,
    /// Deposit lock with empty args, matched by prefix
    deposit_search: Script,
    finality_blocks: u64,
}

impl CkbEventSource {
    pub fn new(
        ledger: Arc<dyn CellLedger>,
        bridge: BridgeIdentity,
        deposit_search: Script,
        finality_blocks: u64,
    ) -> Self {
        Self {
            ledger,
            bridge,
            deposit_search,
            finality_blocks,
        }
    }

    fn filters(&self) -> [CellFilter; 2] {
        [
            CellFilter::Type(self.bridge.bridge_type.clone()),
            CellFilter::Lock(self.deposit_search.clone()),
        ]
    }
}

#[async_trait]
impl EventSource for CkbEventSource {
    fn chain(&self) -> Chain {
        Chain::Ckb
    }

    async fn tip(&self) -> Result<u64> {
        let tip = self
            .ledger
            .tip()
            .await
            .wrap_err("Failed to get indexer tip")?;
        Ok(tip.saturating_sub(self.finality_blocks))
    }

    async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<LedgerEvent>> {
        let mut found = Vec::new();
        for filter in self.filters() {
            found.extend(
                self.ledger
                    .transactions_in_range(&filter, from, to)
                    .await
                    .wrap_err_with(|| format!("Failed to search cells for {:?}", filter))?,
            );
        }

        // A collect transaction matches both filters
        let batch = order_batch(found);

        let resolved = try_join_all(batch.into_iter().map(|tx| async move {
            let consumed = try_join_all(tx.inputs.iter().map(|i| self.ledger.resolve_output(i)))
                .await
                .wrap_err_with(|| format!("Failed to resolve inputs of {}", tx.hash))?;
            tx.resolve(consumed).map_err(eyre::Report::new)
        }))
        .await?;

        let events = classify_batch(resolved, &self.bridge);
        let duplicates = report_duplicate_deposits(&events);
        debug!(from, to, events = events.len(), duplicates, "Classified cell-ledger range");
        Ok(events)
    }
}

/// Deposits of one transaction that map to the same Lock receipt.
///
/// A receipt is `(recipient, amount, tx hash)`, so only the first of them is paid out
/// and the rest are absorbed as replays. Each extra one is logged and counted.
fn report_duplicate_deposits(events: &[LedgerEvent]) -> usize {
    let mut seen = HashSet::new();
    let mut duplicates = 0;
    for event in events {
        let BridgeEvent::NewDeposit(deposit) = &event.event else {
            continue;
        };
        let Some(recipient) = deposit.recipient else {
            continue;
        };
        if !seen.insert((event.tx_hash, recipient, deposit.amount)) {
            warn!(
                tx_hash = %event.tx_hash,
                depositor = %deposit.depositor,
                recipient = %recipient,
                amount = %deposit.amount,
                "Duplicate deposit in one transaction will not be paid out separately"
            );
            metrics::record_error("ckb_watcher", "duplicate_deposit");
            duplicates += 1;
        }
    }
    duplicates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerError;
    use alloy::primitives::{Address, Bytes, B256, U256};
    use bridge_core::testing::{bridge_identity, collect_tx, deploy_tx, deposit_tx, deposit_tx_to};
    use bridge_core::{
        Account, CellOutput, CellTransaction, HashType, OutPoint, ResolvedTransaction,
    };
    use std::collections::HashMap;

    /// Serves resolved fixture transactions as if they came from an indexer
    struct FixtureLedger {
        tip: u64,
        txs: Vec<ResolvedTransaction>,
        outputs: HashMap<OutPoint, CellOutput>,
    }

    impl FixtureLedger {
        fn new(tip: u64, txs: Vec<ResolvedTransaction>) -> Self {
            let mut outputs = HashMap::new();
            for tx in &txs {
                for (i, out) in tx.outputs.iter().enumerate() {
                    outputs.insert(
                        OutPoint {
                            tx_hash: tx.hash,
                            index: i as u32,
                        },
                        out.clone(),
                    );
                }
            }
            Self { tip, txs, outputs }
        }

        /// Input out-points are synthesized and registered so they resolve back
        fn unresolved(&mut self, tx: &ResolvedTransaction) -> CellTransaction {
            let inputs = tx
                .inputs
                .iter()
                .enumerate()
                .map(|(i, cell)| {
                    let point = OutPoint {
                        tx_hash: B256::from(bridge_core::keccak256(
                            &[tx.hash.as_slice(), &[i as u8]].concat(),
                        )),
                        index: 0,
                    };
                    self.outputs.insert(point, cell.clone());
                    point
                })
                .collect();
            CellTransaction {
                hash: tx.hash,
                block_number: tx.block_number,
                tx_index: tx.tx_index,
                inputs,
                outputs: tx.outputs.clone(),
            }
        }
    }

    struct Fixture {
        tip: u64,
        txs: Vec<CellTransaction>,
        outputs: HashMap<OutPoint, CellOutput>,
    }

    fn fixture(tip: u64, txs: Vec<ResolvedTransaction>) -> Fixture {
        let mut ledger = FixtureLedger::new(tip, txs.clone());
        let unresolved = txs.iter().map(|tx| ledger.unresolved(tx)).collect();
        Fixture {
            tip: ledger.tip,
            txs: unresolved,
            outputs: ledger.outputs,
        }
    }

    #[async_trait]
    impl CellLedger for Fixture {
        async fn tip(&self) -> Result<u64, LedgerError> {
            Ok(self.tip)
        }

        async fn transactions_in_range(
            &self,
            filter: &CellFilter,
            from: u64,
            to: u64,
        ) -> Result<Vec<CellTransaction>, LedgerError> {
            let matches = |cell: &CellOutput| match filter {
                CellFilter::Type(script) => cell.type_script.as_ref() == Some(script),
                CellFilter::Lock(script) => {
                    cell.lock.code_hash == script.code_hash
                        && cell.lock.args.starts_with(&script.args)
                }
            };
            Ok(self
                .txs
                .iter()
                .filter(|tx| (from..=to).contains(&tx.block_number))
                .filter(|tx| {
                    tx.outputs.iter().any(matches)
                        || tx.inputs.iter().any(|i| self.outputs.get(i).is_some_and(matches))
                })
                .cloned()
                .collect())
        }

        async fn resolve_output(&self, out_point: &OutPoint) -> Result<CellOutput, LedgerError> {
            self.outputs
                .get(out_point)
                .cloned()
                .ok_or(LedgerError::OutputNotFound {
                    tx_hash: out_point.tx_hash,
                    index: out_point.index,
                })
        }
    }

    fn source(ledger: Fixture) -> CkbEventSource {
        let bridge = bridge_identity();
        let search = Script {
            code_hash: bridge.deposit_code_hash,
            hash_type: HashType::Type,
            args: Bytes::new(),
        };
        CkbEventSource::new(Arc::new(ledger), bridge, search, 2)
    }

    #[tokio::test]
    async fn test_tip_lags_by_finality() {
        let src = source(fixture(10, vec![]));
        assert_eq!(src.tip().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_classifies_deploy_deposits_and_collect() {
        let bridge = bridge_identity();
        let alice = Account([0xa1; 32]);
        let bob = Account([0xb0; 32]);
        let txs = vec![
            collect_tx(&bridge, 4, 0, 1_000, &[(alice, 500), (bob, 700)]),
            deposit_tx(&bridge, 2, 1, bob, 700),
            deploy_tx(&bridge, 1, 0, 1_000),
            deposit_tx(&bridge, 2, 0, alice, 500),
        ];
        let src = source(fixture(10, txs));

        let events = src.events_in_range(1, 4).await.unwrap();
        let kinds: Vec<_> = events
            .iter()
            .map(|e| (e.block_number, e.tx_index, e.event.kind()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (1, 0, "bridge_deployed"),
                (2, 0, "new_deposit"),
                (2, 1, "new_deposit"),
                (4, 0, "deposits_collected"),
            ]
        );
        assert_eq!(
            events[1].event,
            BridgeEvent::NewDeposit(bridge_core::Deposit {
                depositor: alice,
                amount: U256::from(500u64),
                recipient: None,
            })
        );
    }

    #[tokio::test]
    async fn test_range_excludes_other_blocks() {
        let bridge = bridge_identity();
        let txs = vec![
            deposit_tx(&bridge, 2, 0, Account([0xa1; 32]), 500),
            deposit_tx(&bridge, 6, 0, Account([0xa2; 32]), 600),
        ];
        let src = source(fixture(10, txs));
        let events = src.events_in_range(3, 6).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].block_number, 6);
    }

    #[tokio::test]
    async fn test_unresolvable_input_fails_batch() {
        let bridge = bridge_identity();
        let mut ledger = fixture(10, vec![deposit_tx(&bridge, 2, 0, Account([0xa1; 32]), 500)]);
        ledger.outputs.clear();
        let src = source(ledger);
        assert!(src.events_in_range(1, 5).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_deposits_in_one_transaction_are_counted() {
        let bridge = bridge_identity();
        let recipient = Address::repeat_byte(0xa1);
        let mut tx = deposit_tx_to(&bridge, 3, 0, Account([0x11; 32]), recipient, 500);
        // Same recipient and amount from another depositor lock
        let mut twin = tx.outputs[0].clone();
        twin.lock.args = [&[0x22u8; 32][..], &twin.lock.args[32..]].concat().into();
        tx.outputs.push(twin);
        let other = deposit_tx_to(&bridge, 3, 1, Account([0x11; 32]), recipient, 500);

        let src = source(fixture(10, vec![tx, other]));
        let events = src.events_in_range(1, 5).await.unwrap();

        assert_eq!(events.len(), 3);
        assert_eq!(report_duplicate_deposits(&events), 1);
    }
}
