//! Cell-ledger read access

use alloy::primitives::B256;
use async_trait::async_trait;
use bridge_core::{CellOutput, CellTransaction, OutPoint, Script};
use thiserror::Error;

pub mod ckb;

pub use ckb::CkbIndexerClient;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger rpc failed: {0}")]
    Rpc(String),

    #[error("ledger rpc returned an error: {code} {message}")]
    Remote { code: i64, message: String },

    #[error("malformed ledger response: {0}")]
    Decode(String),

    #[error("transaction {0} not found")]
    TransactionNotFound(B256),

    #[error("output {index} of transaction {tx_hash} does not exist")]
    OutputNotFound { tx_hash: B256, index: u32 },
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        LedgerError::Rpc(e.to_string())
    }
}

/// Which cells an indexer search matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellFilter {
    /// Cells whose lock matches this script, args compared by prefix
    Lock(Script),
    /// Cells whose type script matches, args compared by prefix
    Type(Script),
}

#[async_trait]
pub trait CellLedger: Send + Sync {
    /// Highest indexed block
    async fn tip(&self) -> Result<u64, LedgerError>;

    /// Transactions with a matching input or output in `[from, to]`, unordered
    async fn transactions_in_range(
        &self,
        filter: &CellFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<CellTransaction>, LedgerError>;

    /// The cell created at `out_point`
    async fn resolve_output(&self, out_point: &OutPoint) -> Result<CellOutput, LedgerError>;
}
