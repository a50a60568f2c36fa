//! Core types shared between the ledger watchers, the quorum engine and the relay queue

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CodecError;
use crate::hash::{encode_receipt, parse_bytes32, receipt_hash, RECEIPT_ENCODED_LEN};

/// Ledger identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Account-based ledger
    Evm,
    /// Cell/UTXO ledger
    Ckb,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Evm => "evm",
            Chain::Ckb => "ckb",
        }
    }

    /// The ledger on the other side of the bridge
    pub fn counterpart(&self) -> Chain {
        match self {
            Chain::Evm => Chain::Ckb,
            Chain::Ckb => Chain::Evm,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "evm" => Ok(Chain::Evm),
            "ckb" => Ok(Chain::Ckb),
            other => Err(format!("unknown chain: {}", other)),
        }
    }
}

/// Transfer direction of a receipt.
///
/// `Lock` receipts originate from deposits on the cell ledger and release value on the
/// account ledger. `Unlock` receipts originate from burns on the account ledger and pay
/// out on the cell ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Lock,
    Unlock,
}

impl Direction {
    /// Value of the first ABI word in the canonical encoding
    pub fn flag(&self) -> u8 {
        match self {
            Direction::Lock => 1,
            Direction::Unlock => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Lock => "lock",
            Direction::Unlock => "unlock",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account identifier as a 32-byte word.
///
/// EVM addresses are stored left-padded with 12 zero bytes. Cell-ledger lock hashes use
/// the full 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Account(pub [u8; 32]);

impl Account {
    pub const ZERO: Account = Account([0u8; 32]);

    pub fn from_evm(address: Address) -> Self {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(address.as_slice());
        Account(word)
    }

    /// Accepts a 20-byte address or a full 32-byte word
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        match bytes.len() {
            20 => Ok(Self::from_evm(Address::from_slice(bytes))),
            32 => {
                let mut word = [0u8; 32];
                word.copy_from_slice(bytes);
                Ok(Account(word))
            }
            n => Err(CodecError::InvalidAccountLength(n)),
        }
    }

    pub fn from_hex(s: &str) -> Result<Self, CodecError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes32(&self) -> &[u8; 32] {
        &self.0
    }

    /// True when the upper 12 bytes are zero, i.e. the word is a padded EVM address
    pub fn is_evm(&self) -> bool {
        self.0[..12].iter().all(|b| *b == 0)
    }

    pub fn to_evm_address(&self) -> Result<Address, CodecError> {
        if !self.is_evm() {
            return Err(CodecError::NonZeroPadding);
        }
        Ok(Address::from_slice(&self.0[12..]))
    }

    /// Hex with `0x` prefix; padded EVM addresses render as 20 bytes
    pub fn to_hex(&self) -> String {
        if self.is_evm() {
            format!("0x{}", hex::encode(&self.0[12..]))
        } else {
            format!("0x{}", hex::encode(self.0))
        }
    }
}

impl From<Address> for Account {
    fn from(address: Address) -> Self {
        Account::from_evm(address)
    }
}

impl From<B256> for Account {
    fn from(word: B256) -> Self {
        Account(word.0)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Account({})", self.to_hex())
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Account {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Account {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Account::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Canonical description of a cross-ledger transfer intent.
///
/// Identity is the keccak256 of the 128-byte encoding. A receipt carries no signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub direction: Direction,
    pub account: Account,
    pub amount: U256,
    pub source_tx_ref: B256,
}

impl Receipt {
    pub fn new(direction: Direction, account: Account, amount: U256, source_tx_ref: B256) -> Self {
        Self {
            direction,
            account,
            amount,
            source_tx_ref,
        }
    }

    pub fn lock(account: impl Into<Account>, amount: U256, source_tx_ref: B256) -> Self {
        Self::new(Direction::Lock, account.into(), amount, source_tx_ref)
    }

    pub fn unlock(account: impl Into<Account>, amount: U256, source_tx_ref: B256) -> Self {
        Self::new(Direction::Unlock, account.into(), amount, source_tx_ref)
    }

    /// Build a receipt from raw ledger bytes
    pub fn from_raw(
        direction: Direction,
        account: &[u8],
        amount: U256,
        source_tx_ref: &[u8],
    ) -> Result<Self, CodecError> {
        let account = Account::from_slice(account)?;
        if source_tx_ref.len() != 32 {
            return Err(CodecError::InvalidHashLength(source_tx_ref.len()));
        }
        Ok(Self::new(
            direction,
            account,
            amount,
            B256::from_slice(source_tx_ref),
        ))
    }

    /// Parse the hex form of a source reference, as found in relay payloads
    pub fn source_from_hex(s: &str) -> Result<B256, CodecError> {
        parse_bytes32(s).map(B256::from)
    }

    pub fn encode(&self) -> [u8; RECEIPT_ENCODED_LEN] {
        encode_receipt(self)
    }

    pub fn hash(&self) -> B256 {
        receipt_hash(self)
    }
}

/// Recoverable ECDSA signature over a receipt hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecoverableSignature {
    /// Recovery id, `0`/`1` or the legacy `27`/`28`
    pub v: u8,
    pub r: B256,
    pub s: B256,
}

impl RecoverableSignature {
    /// Parse the 65-byte `r ‖ s ‖ v` layout
    pub fn from_bytes65(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != 65 {
            return Err(CodecError::InvalidSignatureLength(bytes.len()));
        }
        Ok(Self {
            r: B256::from_slice(&bytes[..32]),
            s: B256::from_slice(&bytes[32..64]),
            v: bytes[64],
        })
    }

    pub fn to_bytes65(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(self.r.as_slice());
        out[32..64].copy_from_slice(self.s.as_slice());
        out[64] = self.v;
        out
    }
}
