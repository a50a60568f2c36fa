//! Error taxonomy shared by the quorum engine, the classifier and the relay.
//!
//! Each variant falls into one of three buckets that drive retry decisions:
//! benign (an idempotent replay, treat as success), permanent (never retry),
//! and transient (leave state untouched and retry later).

use alloy::primitives::{Address, B256};
use thiserror::Error;

/// Malformed raw input for receipts, accounts and hashes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("account must be 20 or 32 bytes, got {0}")]
    InvalidAccountLength(usize),

    #[error("32-byte account has non-zero padding where an EVM address is required")]
    NonZeroPadding,

    #[error("hash must be 32 bytes, got {0}")]
    InvalidHashLength(usize),

    #[error("signature must be 65 bytes, got {0}")]
    InvalidSignatureLength(usize),

    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

impl From<hex::FromHexError> for CodecError {
    fn from(err: hex::FromHexError) -> Self {
        CodecError::InvalidHex(err.to_string())
    }
}

/// Errors produced by the bridge core
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The recovered signer is not a member of the validator set
    #[error("signer {0} is not part of the validator set")]
    NotAValidator(Address),

    /// This validator already signed this receipt
    #[error("signature already collected from {signer} for receipt {receipt_hash}")]
    AlreadyCollected { receipt_hash: B256, signer: Address },

    /// The receipt already reached quorum and executed
    #[error("receipt {0} already executed")]
    AlreadyExecuted(B256),

    /// Malformed signature or failed public key recovery
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Malformed or unresolvable ledger data while classifying a batch
    #[error("classification failure: {0}")]
    ClassificationFailure(String),

    /// Relay transport error
    #[error("relay queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Quorum record persistence failed
    #[error("quorum store error: {0}")]
    Storage(String),

    /// The ledger-side effect failed; the quorum record was rolled back
    #[error("execution failed for receipt {receipt_hash}: {reason}")]
    ExecutionFailed { receipt_hash: B256, reason: String },
}

impl BridgeError {
    /// Replays of work that already happened. A relay consumer treats these as success.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            BridgeError::AlreadyCollected { .. } | BridgeError::AlreadyExecuted(_)
        )
    }

    /// Inputs that can never become valid. Surfaced to the caller, never retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BridgeError::NotAValidator(_) | BridgeError::InvalidSignature(_) | BridgeError::Codec(_)
        )
    }

    /// Failures that leave watermark and queue state untouched so the same work is retried.
    pub fn is_transient(&self) -> bool {
        !self.is_benign() && !self.is_permanent()
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::NotAValidator(_) => "not_a_validator",
            BridgeError::AlreadyCollected { .. } => "already_collected",
            BridgeError::AlreadyExecuted(_) => "already_executed",
            BridgeError::InvalidSignature(_) => "invalid_signature",
            BridgeError::ClassificationFailure(_) => "classification_failure",
            BridgeError::QueueUnavailable(_) => "queue_unavailable",
            BridgeError::Codec(_) => "codec",
            BridgeError::Storage(_) => "storage",
            BridgeError::ExecutionFailed { .. } => "execution_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_buckets() {
        let hash = B256::repeat_byte(0x11);
        let signer = Address::repeat_byte(0x22);

        assert!(BridgeError::AlreadyCollected {
            receipt_hash: hash,
            signer
        }
        .is_benign());
        assert!(BridgeError::AlreadyExecuted(hash).is_benign());

        assert!(BridgeError::NotAValidator(signer).is_permanent());
        assert!(BridgeError::InvalidSignature("bad v".into()).is_permanent());
        assert!(BridgeError::Codec(CodecError::InvalidHashLength(31)).is_permanent());

        assert!(BridgeError::QueueUnavailable("down".into()).is_transient());
        assert!(BridgeError::ClassificationFailure("missing cell".into()).is_transient());
        assert!(BridgeError::Storage("pool timeout".into()).is_transient());
        assert!(BridgeError::ExecutionFailed {
            receipt_hash: hash,
            reason: "rpc".into()
        }
        .is_transient());
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(
            BridgeError::NotAValidator(Address::ZERO).kind(),
            "not_a_validator"
        );
        assert_eq!(
            BridgeError::QueueUnavailable(String::new()).kind(),
            "queue_unavailable"
        );
    }
}
