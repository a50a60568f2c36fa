//! Well-known validator keys
//!
//! These keys are public test fixtures. Never fund them.

use alloy::signers::local::PrivateKeySigner;

use crate::types::{Receipt, RecoverableSignature};
use crate::verification::sign_receipt;

pub const VALIDATOR_KEYS: [&str; 4] = [
    "278a5de700e29faae8e40e366ec5012b5ec63d36ec77e8a2417154cc1d25383f",
    "7bc8feb5e1ce2927480de19d8bc1dc6874678c016ae53a2eec6a6e9df717bfac",
    "71d2b12dad610fc929e0596b6e887dfb711eec286b7b8b0bdd742c0421a9c425",
    "94890218f2b0d04296f30aeafd13655eba4c5bbf1770273276fee52cbe3f2cb4",
];

/// Signers for all four fixture keys, in order
pub fn validator_signers() -> Vec<PrivateKeySigner> {
    VALIDATOR_KEYS
        .iter()
        .map(|k| k.parse().expect("fixture key is valid"))
        .collect()
}

/// Sign a receipt with a fixture signer
pub fn sign(signer: &PrivateKeySigner, receipt: &Receipt) -> RecoverableSignature {
    sign_receipt(signer, receipt).expect("local signing never fails")
}
