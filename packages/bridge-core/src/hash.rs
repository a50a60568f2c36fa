//! Receipt hash computation
//!
//! The canonical encoding matches the bridge contract's
//! `keccak256(abi.encode(bool isLock, address account, uint256 amount, bytes32 txHash))`:
//! four 32-byte words, no packing.

use alloy::primitives::B256;
use tiny_keccak::{Hasher, Keccak};

use crate::error::CodecError;
use crate::types::Receipt;

/// Length of the canonical receipt encoding (4 ABI words)
pub const RECEIPT_ENCODED_LEN: usize = 128;

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Canonical 128-byte encoding of a receipt.
///
/// Layout:
/// - word 0: direction flag (`1` = Lock, `0` = Unlock) in the last byte
/// - word 1: account, left-padded
/// - word 2: amount, big-endian
/// - word 3: source transaction reference
pub fn encode_receipt(receipt: &Receipt) -> [u8; RECEIPT_ENCODED_LEN] {
    let mut data = [0u8; RECEIPT_ENCODED_LEN];

    data[31] = receipt.direction.flag();
    data[32..64].copy_from_slice(receipt.account.as_bytes32());
    data[64..96].copy_from_slice(&receipt.amount.to_be_bytes::<32>());
    data[96..128].copy_from_slice(receipt.source_tx_ref.as_slice());

    data
}

/// Receipt identity
pub fn receipt_hash(receipt: &Receipt) -> B256 {
    B256::from(keccak256(&encode_receipt(receipt)))
}

/// Convert bytes32 to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a hex string (with or without 0x prefix) into exactly 32 bytes
pub fn parse_bytes32(s: &str) -> Result<[u8; 32], CodecError> {
    let bytes = hex::decode(s.trim_start_matches("0x"))?;
    if bytes.len() != 32 {
        return Err(CodecError::InvalidHashLength(bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
