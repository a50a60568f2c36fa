//! Bridge-Core: Shared Library for the Cell/Account Ledger Bridge
//!
//! This crate holds everything the operator needs that does not touch a network:
//!
//! - **Types** - `Receipt`, `Direction`, `Account`, `RecoverableSignature`, `Chain`
//! - **Hash Computation** - Canonical receipt encoding and keccak256 identity
//! - **Verification** - Signer recovery from a receipt hash and a `{v, r, s}` triple
//! - **Quorum** - Validator set, threshold policy and the signature-collection engine
//! - **Events** - Cell-ledger transaction model, event classification and batch ordering
//! - **Testing Module** - Well-known validator keys and a recording quorum effect
//!
//! ## Feature Flags
//!
//! - `testing` - Enable testing utilities for downstream integration tests

pub mod error;
pub mod events;
pub mod hash;
pub mod quorum;
pub mod types;
pub mod verification;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{BridgeError, CodecError};
pub use events::{
    classify_batch, classify_cell_transaction, order_batch, BridgeEvent, BridgeIdentity, CellOutput,
    CellTransaction, Deposit, HashType, LedgerEvent, OutPoint, Positioned, ResolvedTransaction,
    Script,
};
pub use hash::{bytes32_to_hex, encode_receipt, keccak256, receipt_hash};
pub use quorum::{
    Collection, CollectedSignature, DirectionalEffect, MemoryQuorumStore, QuorumEffect,
    QuorumEngine, QuorumEvent, QuorumPolicy, QuorumRecord, QuorumState, QuorumStore,
    ValidatorSet,
};
pub use types::{Account, Chain, Direction, Receipt, RecoverableSignature};
pub use verification::{recover_signer, sign_receipt};
