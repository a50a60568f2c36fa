//! EVM release effect
//!
//! Pays out a Lock receipt on the account ledger once it reaches quorum: a native
//! value transfer from the operator wallet to the receipt's account.
//!
//! Every release is signed once and journaled before it is broadcast. A retry for the
//! same receipt rebroadcasts the journaled transaction and waits for its receipt, so a
//! lost confirmation can never turn into a second transfer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::consensus::TxEnvelope;
use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use bridge_core::{BridgeError, CollectedSignature, QuorumEffect, Receipt};
use eyre::{eyre, Result, WrapErr};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::EvmConfig;
use crate::db::{self, SignedRelease};
use crate::metrics;
use crate::writers::ValidatorSigner;

/// Plain value transfer
const RELEASE_GAS_LIMIT: u64 = 21_000;

const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// Release journal
// ============================================================================

/// Signed releases keyed by receipt hash, shared by every operator of the set
#[async_trait]
pub trait ReleaseJournal: Send + Sync {
    async fn load(&self, receipt_hash: &B256) -> Result<Option<SignedRelease>>;

    /// Returns false if the receipt already has a release
    async fn insert(&self, release: &SignedRelease) -> Result<bool>;

    async fn max_nonce(&self, sender: &Address) -> Result<Option<u64>>;

    async fn mark_confirmed(&self, receipt_hash: &B256) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryReleaseJournal {
    releases: Mutex<HashMap<B256, SignedRelease>>,
}

impl MemoryReleaseJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.releases.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.releases.lock().await.is_empty()
    }
}

#[async_trait]
impl ReleaseJournal for MemoryReleaseJournal {
    async fn load(&self, receipt_hash: &B256) -> Result<Option<SignedRelease>> {
        Ok(self.releases.lock().await.get(receipt_hash).cloned())
    }

    async fn insert(&self, release: &SignedRelease) -> Result<bool> {
        let mut releases = self.releases.lock().await;
        if releases.contains_key(&release.receipt_hash) {
            return Ok(false);
        }
        releases.insert(release.receipt_hash, release.clone());
        Ok(true)
    }

    async fn max_nonce(&self, sender: &Address) -> Result<Option<u64>> {
        Ok(self
            .releases
            .lock()
            .await
            .values()
            .filter(|r| &r.sender == sender)
            .map(|r| r.nonce)
            .max())
    }

    async fn mark_confirmed(&self, receipt_hash: &B256) -> Result<()> {
        if let Some(release) = self.releases.lock().await.get_mut(receipt_hash) {
            release.confirmed = true;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgReleaseJournal {
    pool: PgPool,
}

impl PgReleaseJournal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReleaseJournal for PgReleaseJournal {
    async fn load(&self, receipt_hash: &B256) -> Result<Option<SignedRelease>> {
        db::get_evm_release(&self.pool, receipt_hash).await
    }

    async fn insert(&self, release: &SignedRelease) -> Result<bool> {
        db::insert_evm_release(&self.pool, release).await
    }

    async fn max_nonce(&self, sender: &Address) -> Result<Option<u64>> {
        db::get_max_release_nonce(&self.pool, sender).await
    }

    async fn mark_confirmed(&self, receipt_hash: &B256) -> Result<()> {
        db::mark_evm_release_confirmed(&self.pool, receipt_hash).await
    }
}

// ============================================================================
// Transport
// ============================================================================

/// The account-ledger calls a release needs
#[async_trait]
pub trait ReleaseTransport: Send + Sync {
    async fn pending_nonce(&self, sender: Address) -> Result<u64>;

    async fn gas_price(&self) -> Result<u128>;

    async fn broadcast(&self, raw_tx: &Bytes) -> Result<()>;

    /// `None` until the transaction is mined
    async fn receipt_status(&self, tx_hash: B256) -> Result<Option<bool>>;
}

/// JSON-RPC transport over HTTP
pub struct RpcReleaseTransport {
    rpc_url: String,
}

impl RpcReleaseTransport {
    pub fn new(rpc_url: &str) -> Result<Self> {
        reqwest::Url::parse(rpc_url).wrap_err("Invalid RPC URL")?;
        Ok(Self {
            rpc_url: rpc_url.to_string(),
        })
    }
}

#[async_trait]
impl ReleaseTransport for RpcReleaseTransport {
    async fn pending_nonce(&self, sender: Address) -> Result<u64> {
        ProviderBuilder::new()
            .on_http(self.rpc_url.parse().wrap_err("Invalid RPC URL")?)
            .get_transaction_count(sender)
            .pending()
            .await
            .map_err(|e| eyre!("Failed to get nonce: {}", e))
    }

    async fn gas_price(&self) -> Result<u128> {
        ProviderBuilder::new()
            .on_http(self.rpc_url.parse().wrap_err("Invalid RPC URL")?)
            .get_gas_price()
            .await
            .map_err(|e| eyre!("Failed to get gas price: {}", e))
    }

    async fn broadcast(&self, raw_tx: &Bytes) -> Result<()> {
        ProviderBuilder::new()
            .on_http(self.rpc_url.parse().wrap_err("Invalid RPC URL")?)
            .send_raw_transaction(raw_tx)
            .await
            .map_err(|e| eyre!("Failed to broadcast transaction: {}", e))?;
        Ok(())
    }

    async fn receipt_status(&self, tx_hash: B256) -> Result<Option<bool>> {
        let receipt = ProviderBuilder::new()
            .on_http(self.rpc_url.parse().wrap_err("Invalid RPC URL")?)
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| eyre!("Failed to get receipt: {}", e))?;
        Ok(receipt.map(|r| r.status()))
    }
}

// ============================================================================
// Effect
// ============================================================================

pub struct EvmReleaseEffect {
    transport: Arc<dyn ReleaseTransport>,
    journal: Arc<dyn ReleaseJournal>,
    wallet: EthereumWallet,
    sender: Address,
    chain_id: u64,
    confirmation_timeout: Duration,
    poll_interval: Duration,
    /// Serializes nonce allocation inside the process
    nonce_lock: Mutex<()>,
}

impl EvmReleaseEffect {
    pub fn new(
        config: &EvmConfig,
        signer: ValidatorSigner,
        journal: Arc<dyn ReleaseJournal>,
    ) -> Result<Self> {
        let transport = Arc::new(RpcReleaseTransport::new(&config.rpc_url)?);
        Ok(Self::with_transport(transport, journal, signer, config.chain_id))
    }

    pub fn with_transport(
        transport: Arc<dyn ReleaseTransport>,
        journal: Arc<dyn ReleaseJournal>,
        signer: ValidatorSigner,
        chain_id: u64,
    ) -> Self {
        Self {
            transport,
            journal,
            sender: signer.address(),
            wallet: EthereumWallet::from(signer.inner().clone()),
            chain_id,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            poll_interval: DEFAULT_RECEIPT_POLL_INTERVAL,
            nonce_lock: Mutex::new(()),
        }
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// The receipt's journaled release, signing and journaling one if none exists
    async fn journaled_release(&self, receipt: &Receipt) -> Result<SignedRelease> {
        let receipt_hash = receipt.hash();
        if let Some(release) = self.journal.load(&receipt_hash).await? {
            return Ok(release);
        }

        let _guard = self.nonce_lock.lock().await;
        if let Some(release) = self.journal.load(&receipt_hash).await? {
            return Ok(release);
        }

        let to = receipt
            .account
            .to_evm_address()
            .map_err(|e| eyre!("Receipt account is not an EVM address: {}", e))?;

        // Journaled releases may not be mined yet
        let chain_nonce = self.transport.pending_nonce(self.sender).await?;
        let nonce = match self.journal.max_nonce(&self.sender).await? {
            Some(highest) => chain_nonce.max(highest + 1),
            None => chain_nonce,
        };
        let gas_price = self.transport.gas_price().await?;

        let request = TransactionRequest::default()
            .with_from(self.sender)
            .with_to(to)
            .with_value(receipt.amount)
            .with_chain_id(self.chain_id)
            .with_nonce(nonce)
            .with_gas_limit(RELEASE_GAS_LIMIT)
            .with_gas_price(gas_price);
        let envelope: TxEnvelope = request
            .build(&self.wallet)
            .await
            .map_err(|e| eyre!("Failed to sign release: {}", e))?;

        let release = SignedRelease {
            receipt_hash,
            sender: self.sender,
            nonce,
            tx_hash: *envelope.tx_hash(),
            raw_tx: Bytes::from(envelope.encoded_2718()),
            confirmed: false,
        };

        if self.journal.insert(&release).await? {
            debug!(
                receipt_hash = %receipt_hash,
                tx_hash = %release.tx_hash,
                nonce,
                to = %to,
                amount = %receipt.amount,
                "Release signed and journaled"
            );
            return Ok(release);
        }

        // Another operator journaled one first
        self.journal
            .load(&receipt_hash)
            .await?
            .ok_or_else(|| eyre!("Release for {} vanished from the journal", receipt_hash))
    }

    /// Broadcast the journaled transaction unless mined and wait for its receipt
    async fn confirm(&self, release: &SignedRelease) -> Result<()> {
        let status = match self.transport.receipt_status(release.tx_hash).await? {
            Some(status) => status,
            None => {
                if let Err(e) = self.transport.broadcast(&release.raw_tx).await {
                    // Already known or already mined; the receipt decides
                    warn!(tx_hash = %release.tx_hash, error = %e, "Release broadcast rejected");
                }
                info!(tx_hash = %release.tx_hash, "Release sent, waiting for confirmation");
                self.wait_for_receipt(release.tx_hash).await?
            }
        };

        if !status {
            error!(
                receipt_hash = %release.receipt_hash,
                tx_hash = %release.tx_hash,
                "Release transaction reverted"
            );
            return Err(eyre!("Release transaction {} reverted", release.tx_hash));
        }
        self.journal.mark_confirmed(&release.receipt_hash).await
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<bool> {
        let poll = async {
            loop {
                if let Some(status) = self.transport.receipt_status(tx_hash).await? {
                    return Ok::<bool, eyre::Report>(status);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        match tokio::time::timeout(self.confirmation_timeout, poll).await {
            Ok(result) => result,
            Err(_) => {
                metrics::record_error("evm_release", "confirmation_timeout");
                Err(eyre!(
                    "Release {} not confirmed within {:?}",
                    tx_hash,
                    self.confirmation_timeout
                ))
            }
        }
    }
}

#[async_trait]
impl QuorumEffect for EvmReleaseEffect {
    async fn execute(
        &self,
        receipt: &Receipt,
        signatures: &[CollectedSignature],
    ) -> Result<(), BridgeError> {
        let receipt_hash = receipt.hash();
        let to_failure = |e: eyre::Report| BridgeError::ExecutionFailed {
            receipt_hash,
            reason: format!("{:#}", e),
        };

        let release = self.journaled_release(receipt).await.map_err(to_failure)?;
        if release.confirmed {
            debug!(receipt_hash = %receipt_hash, "Release already confirmed");
            return Ok(());
        }
        self.confirm(&release).await.map_err(to_failure)?;

        info!(
            receipt_hash = %receipt_hash,
            account = %receipt.account,
            amount = %receipt.amount,
            signatures = signatures.len(),
            tx_hash = %release.tx_hash,
            nonce = release.nonce,
            "Lock receipt released on EVM"
        );
        Ok(())
    }
}
