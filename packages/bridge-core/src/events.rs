//! Cell-ledger transaction model and bridge event classification
//!
//! Classification is a pure function of a transaction whose inputs have been resolved
//! to the cells they consume. Fetching and resolution live in the operator.

use std::collections::HashSet;

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::types::{Account, Chain, Receipt};

// ============================================================================
// Cell Model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashType {
    Data,
    Type,
    Data1,
    Data2,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Script {
    pub code_hash: B256,
    pub hash_type: HashType,
    pub args: Bytes,
}

/// Reference to an output of an earlier transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_hash: B256,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellOutput {
    /// Capacity in shannons
    pub capacity: u64,
    pub lock: Script,
    pub type_script: Option<Script>,
    pub data: Bytes,
}

/// A confirmed transaction as returned by the indexer, inputs not yet resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellTransaction {
    pub hash: B256,
    pub block_number: u64,
    pub tx_index: u32,
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<CellOutput>,
}

impl CellTransaction {
    /// Attach the cells consumed by this transaction, one per input in order
    pub fn resolve(self, consumed: Vec<CellOutput>) -> Result<ResolvedTransaction, BridgeError> {
        if consumed.len() != self.inputs.len() {
            return Err(BridgeError::ClassificationFailure(format!(
                "transaction {} has {} inputs but {} were resolved",
                self.hash,
                self.inputs.len(),
                consumed.len()
            )));
        }
        Ok(ResolvedTransaction {
            hash: self.hash,
            block_number: self.block_number,
            tx_index: self.tx_index,
            inputs: consumed,
            outputs: self.outputs,
        })
    }
}

/// A transaction with both consumed and produced cells
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTransaction {
    pub hash: B256,
    pub block_number: u64,
    pub tx_index: u32,
    pub inputs: Vec<CellOutput>,
    pub outputs: Vec<CellOutput>,
}

/// The scripts that identify one bridge instance on the cell ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeIdentity {
    /// Type script of the bridge state cell
    pub bridge_type: Script,
    /// Hash of `bridge_type`, as stored in deposit lock args
    pub bridge_type_hash: B256,
    /// Code hash of the deposit lock
    pub deposit_code_hash: B256,
}

impl BridgeIdentity {
    fn is_bridge_cell(&self, cell: &CellOutput) -> bool {
        cell.type_script.as_ref() == Some(&self.bridge_type)
    }

    /// Deposit lock args are `depositor_lock_hash(32) ‖ bridge_type_hash(32)`. The cell
    /// data holds the 20-byte account-ledger recipient; any other length leaves it unset.
    fn deposit_of(&self, cell: &CellOutput) -> Option<Deposit> {
        if cell.lock.code_hash != self.deposit_code_hash || cell.lock.args.len() != 64 {
            return None;
        }
        if cell.lock.args[32..] != self.bridge_type_hash[..] {
            return None;
        }
        let mut depositor = [0u8; 32];
        depositor.copy_from_slice(&cell.lock.args[..32]);
        let recipient = (cell.data.len() == 20)
            .then(|| Address::from_slice(&cell.data));
        Some(Deposit {
            depositor: Account(depositor),
            amount: U256::from(cell.capacity),
            recipient,
        })
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Deposit {
    pub depositor: Account,
    pub amount: U256,
    /// Account-ledger address a cell deposit is released to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    BridgeDeployed { initial_capacity: U256 },
    NewDeposit(Deposit),
    DepositsCollected(Vec<Deposit>),
    /// A receipt reached quorum on the account ledger and must be paid out here
    QuorumReached(Receipt),
}

impl BridgeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeEvent::BridgeDeployed { .. } => "bridge_deployed",
            BridgeEvent::NewDeposit(_) => "new_deposit",
            BridgeEvent::DepositsCollected(_) => "deposits_collected",
            BridgeEvent::QuorumReached(_) => "quorum_reached",
        }
    }
}

/// A classified event with its position on the source ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEvent {
    pub chain: Chain,
    pub block_number: u64,
    pub tx_index: u32,
    pub tx_hash: B256,
    pub event: BridgeEvent,
}

/// Classify one resolved cell-ledger transaction.
///
/// Emits, in order: `BridgeDeployed` when the bridge cell is created, a single
/// `DepositsCollected` for tagged deposit cells consumed and not re-created, and one
/// `NewDeposit` per tagged deposit cell produced.
pub fn classify_cell_transaction(
    tx: &ResolvedTransaction,
    bridge: &BridgeIdentity,
) -> Vec<BridgeEvent> {
    let mut events = Vec::new();

    let bridge_in_inputs = tx.inputs.iter().any(|c| bridge.is_bridge_cell(c));
    if !bridge_in_inputs {
        if let Some(cell) = tx.outputs.iter().find(|c| bridge.is_bridge_cell(c)) {
            events.push(BridgeEvent::BridgeDeployed {
                initial_capacity: U256::from(cell.capacity),
            });
        }
    }

    let mut produced: Vec<Option<Deposit>> =
        tx.outputs.iter().map(|c| bridge.deposit_of(c)).collect();

    let mut collected = Vec::new();
    for deposit in tx.inputs.iter().filter_map(|c| bridge.deposit_of(c)) {
        // An identical deposit cell in the outputs is a re-creation, not a collection
        match produced.iter().position(|p| p.as_ref() == Some(&deposit)) {
            Some(i) => produced[i] = None,
            None => collected.push(deposit),
        }
    }
    if !collected.is_empty() {
        events.push(BridgeEvent::DepositsCollected(collected));
    }

    events.extend(produced.into_iter().flatten().map(BridgeEvent::NewDeposit));
    events
}

// ============================================================================
// Batch Ordering
// ============================================================================

/// Position of a transaction on its ledger
pub trait Positioned {
    fn tx_hash(&self) -> B256;
    fn position(&self) -> (u64, u32);
}

impl Positioned for CellTransaction {
    fn tx_hash(&self) -> B256 {
        self.hash
    }

    fn position(&self) -> (u64, u32) {
        (self.block_number, self.tx_index)
    }
}

impl Positioned for ResolvedTransaction {
    fn tx_hash(&self) -> B256 {
        self.hash
    }

    fn position(&self) -> (u64, u32) {
        (self.block_number, self.tx_index)
    }
}

/// De-duplicate by transaction hash and sort by `(height, tx_index)`.
///
/// The first occurrence of a hash wins. Sorting is stable.
pub fn order_batch<T, I>(txs: I) -> Vec<T>
where
    T: Positioned,
    I: IntoIterator<Item = T>,
{
    let mut seen = HashSet::new();
    let mut batch: Vec<T> = txs
        .into_iter()
        .filter(|tx| seen.insert(tx.tx_hash()))
        .collect();
    batch.sort_by_key(|tx| tx.position());
    batch
}

/// Order a resolved batch and classify every transaction into ledger events
pub fn classify_batch(
    txs: Vec<ResolvedTransaction>,
    bridge: &BridgeIdentity,
) -> Vec<LedgerEvent> {
    order_batch(txs)
        .into_iter()
        .flat_map(|tx| {
            classify_cell_transaction(&tx, bridge)
                .into_iter()
                .map(move |event| LedgerEvent {
                    chain: Chain::Ckb,
                    block_number: tx.block_number,
                    tx_index: tx.tx_index,
                    tx_hash: tx.hash,
                    event,
                })
        })
        .collect()
}
