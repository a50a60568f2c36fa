use alloy::primitives::{Address, Bytes, B256, U256};
use bridge_core::{
    Account, CollectedSignature, Direction, QuorumRecord, Receipt, RecoverableSignature,
};
use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use serde::Serialize;
use sqlx::FromRow;
use std::str::FromStr;

// Amounts are NUMERIC(78,0) in the database. Inserts cast text with `$n::NUMERIC`,
// reads select `amount::TEXT`.

/// A stored quorum record header
#[derive(Debug, Clone, FromRow)]
pub struct QuorumRecordRow {
    pub receipt_hash: Vec<u8>,
    pub direction: String,
    pub account: Vec<u8>,
    pub amount: String,
    pub source_tx_ref: Vec<u8>,
    pub executed: bool,
    pub executed_at: Option<DateTime<Utc>>,
    pub effect_applied: bool,
    pub created_at: DateTime<Utc>,
}

impl QuorumRecordRow {
    pub fn receipt(&self) -> Result<Receipt> {
        let direction = match self.direction.as_str() {
            "lock" => Direction::Lock,
            "unlock" => Direction::Unlock,
            other => return Err(eyre!("Unknown receipt direction {}", other)),
        };
        Ok(Receipt::from_raw(
            direction,
            &self.account,
            U256::from_str(&self.amount)?,
            &self.source_tx_ref,
        )?)
    }

    pub fn into_record(self, signatures: Vec<QuorumSignatureRow>) -> Result<QuorumRecord> {
        Ok(QuorumRecord {
            receipt: self.receipt()?,
            signatures: signatures
                .into_iter()
                .map(|s| s.collected())
                .collect::<Result<Vec<_>>>()?,
            executed: self.executed,
            effect_applied: self.effect_applied,
        })
    }
}

/// One validator signature on a receipt
#[derive(Debug, Clone, FromRow)]
pub struct QuorumSignatureRow {
    pub signer: Vec<u8>,
    pub v: i16,
    pub r: Vec<u8>,
    pub s: Vec<u8>,
}

impl QuorumSignatureRow {
    pub fn collected(&self) -> Result<CollectedSignature> {
        if self.signer.len() != 20 || self.r.len() != 32 || self.s.len() != 32 {
            return Err(eyre!("Malformed stored signature"));
        }
        Ok(CollectedSignature {
            signer: Address::from_slice(&self.signer),
            signature: RecoverableSignature {
                v: u8::try_from(self.v)?,
                r: B256::from_slice(&self.r),
                s: B256::from_slice(&self.s),
            },
        })
    }
}

/// A message claimed from a relay queue
#[derive(Debug, Clone, FromRow)]
pub struct RelayMessageRow {
    pub id: i64,
    pub body: String,
    pub receive_count: i32,
}

/// A signed account-ledger release, journaled before broadcast
#[derive(Debug, Clone, FromRow)]
pub struct EvmReleaseRow {
    pub receipt_hash: Vec<u8>,
    pub sender: Vec<u8>,
    pub nonce: i64,
    pub tx_hash: Vec<u8>,
    pub raw_tx: Vec<u8>,
    pub confirmed: bool,
}

impl EvmReleaseRow {
    pub fn into_release(self) -> Result<SignedRelease> {
        if self.receipt_hash.len() != 32 || self.sender.len() != 20 || self.tx_hash.len() != 32 {
            return Err(eyre!("Malformed stored release"));
        }
        Ok(SignedRelease {
            receipt_hash: B256::from_slice(&self.receipt_hash),
            sender: Address::from_slice(&self.sender),
            nonce: u64::try_from(self.nonce)?,
            tx_hash: B256::from_slice(&self.tx_hash),
            raw_tx: Bytes::from(self.raw_tx),
            confirmed: self.confirmed,
        })
    }
}

/// A release transaction signed for exactly one receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRelease {
    pub receipt_hash: B256,
    pub sender: Address,
    pub nonce: u64,
    pub tx_hash: B256,
    pub raw_tx: Bytes,
    pub confirmed: bool,
}

/// A quorum-authorized payout waiting for the cell-ledger transaction builder
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CellPayoutRow {
    #[serde(serialize_with = "serialize_hex")]
    pub receipt_hash: Vec<u8>,
    #[serde(serialize_with = "serialize_hex")]
    pub account: Vec<u8>,
    pub amount: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// For inserting new payouts
#[derive(Debug, Clone)]
pub struct NewCellPayout {
    pub receipt_hash: B256,
    pub account: Account,
    pub amount: U256,
    pub source_tx_ref: B256,
    pub signatures: Vec<CollectedSignature>,
}

fn serialize_hex<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
}
