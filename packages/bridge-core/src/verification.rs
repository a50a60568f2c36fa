//! Signer recovery for receipt signatures
//!
//! Validators sign the raw receipt hash (no `\x19Ethereum Signed Message` prefix).
//! The signer is always derived by public key recovery; a caller-supplied identity is
//! never consulted.

use alloy::primitives::{uint, Address, PrimitiveSignature, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;

use crate::error::BridgeError;
use crate::types::{Receipt, RecoverableSignature};

/// secp256k1 group order
const SECP256K1_N: U256 =
    uint!(0xFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEBAAEDCE6AF48A03BBFD25E8CD0364141_U256);

/// Recover the address that produced `signature` over `receipt_hash`
pub fn recover_signer(
    receipt_hash: &B256,
    signature: &RecoverableSignature,
) -> Result<Address, BridgeError> {
    let y_parity = match signature.v {
        0 | 27 => false,
        1 | 28 => true,
        v => {
            return Err(BridgeError::InvalidSignature(format!(
                "unsupported recovery id v={}",
                v
            )))
        }
    };

    let r = U256::from_be_bytes(signature.r.0);
    let s = U256::from_be_bytes(signature.s.0);
    if r.is_zero() || r >= SECP256K1_N {
        return Err(BridgeError::InvalidSignature("r out of range".into()));
    }
    if s.is_zero() || s >= SECP256K1_N {
        return Err(BridgeError::InvalidSignature("s out of range".into()));
    }

    PrimitiveSignature::new(r, s, y_parity)
        .recover_address_from_prehash(receipt_hash)
        .map_err(|e| BridgeError::InvalidSignature(e.to_string()))
}

/// Sign a receipt's canonical hash with a validator key
pub fn sign_receipt(
    signer: &PrivateKeySigner,
    receipt: &Receipt,
) -> Result<RecoverableSignature, BridgeError> {
    let signature = signer
        .sign_hash_sync(&receipt.hash())
        .map_err(|e| BridgeError::InvalidSignature(e.to_string()))?;

    Ok(RecoverableSignature {
        v: 27 + signature.v() as u8,
        r: B256::from(signature.r().to_be_bytes::<32>()),
        s: B256::from(signature.s().to_be_bytes::<32>()),
    })
}
