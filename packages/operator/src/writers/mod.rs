//! Ledger-side effects run when a receipt reaches quorum, plus the local validator key

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use bridge_core::{sign_receipt, BridgeError, Receipt, RecoverableSignature};
use eyre::{Result, WrapErr};
use std::fmt;

pub mod ckb;
pub mod evm;
pub mod retry;

pub use ckb::{MemoryPayoutStore, PayoutStore, PgPayoutStore, UnlockRelayEffect};
pub use evm::{
    EvmReleaseEffect, MemoryReleaseJournal, PgReleaseJournal, ReleaseJournal, ReleaseTransport,
    RpcReleaseTransport,
};
pub use retry::{classify_error, classify_report, ErrorClass, RetryConfig};

/// This operator's validator key
#[derive(Clone)]
pub struct ValidatorSigner {
    signer: PrivateKeySigner,
}

/// Only the address is printed
impl fmt::Debug for ValidatorSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorSigner")
            .field("address", &self.address())
            .finish()
    }
}

impl ValidatorSigner {
    pub fn from_private_key(key: &str) -> Result<Self> {
        let signer: PrivateKeySigner = key
            .trim_start_matches("0x")
            .parse()
            .wrap_err("Invalid validator private key")?;
        Ok(Self { signer })
    }

    pub fn new(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn sign(&self, receipt: &Receipt) -> Result<RecoverableSignature, BridgeError> {
        sign_receipt(&self.signer, receipt)
    }

    pub fn inner(&self) -> &PrivateKeySigner {
        &self.signer
    }
}
