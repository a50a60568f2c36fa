use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use bridge_core::{BridgeError, Chain, CollectedSignature, QuorumRecord, QuorumStore, Receipt};
use eyre::{eyre, Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::error;

pub mod models;

pub use models::*;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

// ============================================================================
// Watermarks
// ============================================================================

/// Get an operator's last fully processed height for a ledger
pub async fn get_watermark(pool: &PgPool, operator: &Address, chain: Chain) -> Result<Option<u64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"SELECT height FROM watermarks WHERE operator = $1 AND chain = $2"#,
    )
    .bind(operator.as_slice())
    .bind(chain.as_str())
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to get watermark")?;

    Ok(row.map(|r| r.0 as u64))
}

/// Advance an operator's watermark. Returns false if `height` is below the stored value.
pub async fn advance_watermark(
    pool: &PgPool,
    operator: &Address,
    chain: Chain,
    height: u64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO watermarks (operator, chain, height)
        VALUES ($1, $2, $3)
        ON CONFLICT (operator, chain) DO UPDATE SET height = EXCLUDED.height, updated_at = NOW()
        WHERE watermarks.height <= EXCLUDED.height
        "#,
    )
    .bind(operator.as_slice())
    .bind(chain.as_str())
    .bind(height as i64)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to advance watermark for {}", chain))?;

    Ok(result.rows_affected() == 1)
}

// ============================================================================
// Quorum Records
// ============================================================================

pub async fn load_quorum_record(pool: &PgPool, receipt_hash: &B256) -> Result<Option<QuorumRecord>> {
    let header = sqlx::query_as::<_, QuorumRecordRow>(
        r#"SELECT receipt_hash, direction, account, amount::TEXT AS amount, source_tx_ref,
                  executed, executed_at, effect_applied, created_at
           FROM quorum_records WHERE receipt_hash = $1"#,
    )
    .bind(receipt_hash.as_slice())
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to load quorum record")?;

    let Some(header) = header else {
        return Ok(None);
    };

    let signatures = sqlx::query_as::<_, QuorumSignatureRow>(
        r#"SELECT signer, v, r, s FROM quorum_signatures WHERE receipt_hash = $1 ORDER BY id"#,
    )
    .bind(receipt_hash.as_slice())
    .fetch_all(pool)
    .await
    .wrap_err("Failed to load quorum signatures")?;

    header.into_record(signatures).map(Some)
}

/// Insert a signature, creating the record if needed.
///
/// Returns false when the signer is already present or the record has executed.
pub async fn insert_quorum_signature(
    pool: &PgPool,
    receipt_hash: &B256,
    receipt: &Receipt,
    signature: &CollectedSignature,
) -> Result<bool> {
    let mut tx = pool.begin().await.wrap_err("Failed to begin transaction")?;

    sqlx::query(
        r#"
        INSERT INTO quorum_records (receipt_hash, direction, account, amount, source_tx_ref)
        VALUES ($1, $2, $3, $4::NUMERIC, $5)
        ON CONFLICT (receipt_hash) DO NOTHING
        "#,
    )
    .bind(receipt_hash.as_slice())
    .bind(receipt.direction.as_str())
    .bind(receipt.account.as_bytes32().as_slice())
    .bind(receipt.amount.to_string())
    .bind(receipt.source_tx_ref.as_slice())
    .execute(&mut *tx)
    .await
    .wrap_err("Failed to insert quorum record")?;

    let executed: bool =
        sqlx::query(r#"SELECT executed FROM quorum_records WHERE receipt_hash = $1 FOR UPDATE"#)
            .bind(receipt_hash.as_slice())
            .fetch_one(&mut *tx)
            .await
            .wrap_err("Failed to lock quorum record")?
            .get("executed");

    if executed {
        tx.rollback().await.wrap_err("Failed to roll back")?;
        return Ok(false);
    }

    let inserted = sqlx::query(
        r#"
        INSERT INTO quorum_signatures (receipt_hash, signer, v, r, s)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (receipt_hash, signer) DO NOTHING
        "#,
    )
    .bind(receipt_hash.as_slice())
    .bind(signature.signer.as_slice())
    .bind(signature.signature.v as i16)
    .bind(signature.signature.r.as_slice())
    .bind(signature.signature.s.as_slice())
    .execute(&mut *tx)
    .await
    .wrap_err("Failed to insert quorum signature")?
    .rows_affected()
        == 1;

    tx.commit().await.wrap_err("Failed to commit signature")?;
    Ok(inserted)
}

/// Compare-and-set `executed` from false to true
pub async fn mark_quorum_executed(pool: &PgPool, receipt_hash: &B256) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE quorum_records SET executed = TRUE, executed_at = NOW()
           WHERE receipt_hash = $1 AND executed = FALSE"#,
    )
    .bind(receipt_hash.as_slice())
    .execute(pool)
    .await
    .wrap_err("Failed to mark quorum executed")?;

    Ok(result.rows_affected() == 1)
}

pub async fn mark_quorum_effect_applied(pool: &PgPool, receipt_hash: &B256) -> Result<()> {
    let result = sqlx::query(
        r#"UPDATE quorum_records SET effect_applied = TRUE WHERE receipt_hash = $1 AND executed"#,
    )
    .bind(receipt_hash.as_slice())
    .execute(pool)
    .await
    .wrap_err("Failed to mark quorum effect applied")?;

    if result.rows_affected() == 0 {
        return Err(eyre!("No executed quorum record for {}", receipt_hash));
    }
    Ok(())
}

/// Executed records whose effect never completed, oldest execution first
pub async fn get_pending_quorum_effects(pool: &PgPool, limit: i64) -> Result<Vec<QuorumRecord>> {
    let hashes: Vec<(Vec<u8>,)> = sqlx::query_as(
        r#"SELECT receipt_hash FROM quorum_records
           WHERE executed AND NOT effect_applied
           ORDER BY executed_at LIMIT $1"#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to get pending quorum effects")?;

    let mut records = Vec::with_capacity(hashes.len());
    for (hash,) in hashes {
        if hash.len() != 32 {
            return Err(eyre!("Malformed stored receipt hash"));
        }
        if let Some(record) = load_quorum_record(pool, &B256::from_slice(&hash)).await? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Postgres-backed quorum store shared by every operator of the validator set
#[derive(Clone)]
pub struct PgQuorumStore {
    pool: PgPool,
}

impl PgQuorumStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage_error(e: eyre::Report) -> BridgeError {
    error!(error = %format!("{:#}", e), "Quorum store failure");
    BridgeError::Storage(format!("{:#}", e))
}

#[async_trait]
impl QuorumStore for PgQuorumStore {
    async fn load(&self, receipt_hash: &B256) -> Result<Option<QuorumRecord>, BridgeError> {
        load_quorum_record(&self.pool, receipt_hash)
            .await
            .map_err(storage_error)
    }

    async fn add_signature(
        &self,
        receipt_hash: &B256,
        receipt: &Receipt,
        signature: &CollectedSignature,
    ) -> Result<bool, BridgeError> {
        insert_quorum_signature(&self.pool, receipt_hash, receipt, signature)
            .await
            .map_err(storage_error)
    }

    async fn mark_executed(&self, receipt_hash: &B256) -> Result<bool, BridgeError> {
        mark_quorum_executed(&self.pool, receipt_hash)
            .await
            .map_err(storage_error)
    }

    async fn mark_effect_applied(&self, receipt_hash: &B256) -> Result<(), BridgeError> {
        mark_quorum_effect_applied(&self.pool, receipt_hash)
            .await
            .map_err(storage_error)
    }

    async fn pending_effects(&self, limit: usize) -> Result<Vec<QuorumRecord>, BridgeError> {
        get_pending_quorum_effects(&self.pool, limit as i64)
            .await
            .map_err(storage_error)
    }
}

// ============================================================================
// Relay Queue
// ============================================================================

pub async fn create_relay_queue(pool: &PgPool, name: &str) -> Result<()> {
    sqlx::query(r#"INSERT INTO relay_queues (name) VALUES ($1) ON CONFLICT (name) DO NOTHING"#)
        .bind(name)
        .execute(pool)
        .await
        .wrap_err_with(|| format!("Failed to create relay queue {}", name))?;
    Ok(())
}

pub async fn insert_relay_message(pool: &PgPool, queue: &str, body: &str) -> Result<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO relay_messages (queue_name, body)
        SELECT name, $2 FROM relay_queues WHERE name = $1
        RETURNING id
        "#,
    )
    .bind(queue)
    .bind(body)
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to insert relay message")?;

    row.map(|r| r.get("id"))
        .ok_or_else(|| eyre!("Relay queue {} does not exist", queue))
}

/// Claim the oldest visible message and hide it for `visibility_timeout`
pub async fn claim_relay_message(
    pool: &PgPool,
    queue: &str,
    visibility_timeout: Duration,
) -> Result<Option<RelayMessageRow>> {
    sqlx::query_as::<_, RelayMessageRow>(
        r#"
        UPDATE relay_messages
        SET receive_count = receive_count + 1,
            visible_at = NOW() + make_interval(secs => $2)
        WHERE id = (
            SELECT id FROM relay_messages
            WHERE queue_name = $1 AND visible_at <= NOW()
            ORDER BY id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, body, receive_count
        "#,
    )
    .bind(queue)
    .bind(visibility_timeout.as_secs_f64())
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to claim relay message")
}

pub async fn delete_relay_message(pool: &PgPool, queue: &str, id: i64) -> Result<bool> {
    let result = sqlx::query(r#"DELETE FROM relay_messages WHERE queue_name = $1 AND id = $2"#)
        .bind(queue)
        .bind(id)
        .execute(pool)
        .await
        .wrap_err("Failed to delete relay message")?;
    Ok(result.rows_affected() == 1)
}

pub async fn count_relay_messages(pool: &PgPool, queue: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM relay_messages WHERE queue_name = $1"#)
        .bind(queue)
        .fetch_one(pool)
        .await
        .wrap_err("Failed to count relay messages")?;
    Ok(row.0)
}

// ============================================================================
// Cell Payouts
// ============================================================================

/// Record a payout once per receipt. Returns false if it was already recorded.
pub async fn insert_cell_payout(pool: &PgPool, payout: &NewCellPayout) -> Result<bool> {
    let signatures =
        serde_json::to_value(&payout.signatures).wrap_err("Failed to encode signatures")?;

    let result = sqlx::query(
        r#"
        INSERT INTO cell_payouts (receipt_hash, account, amount, source_tx_ref, signatures)
        VALUES ($1, $2, $3::NUMERIC, $4, $5)
        ON CONFLICT (receipt_hash) DO NOTHING
        "#,
    )
    .bind(payout.receipt_hash.as_slice())
    .bind(payout.account.as_bytes32().as_slice())
    .bind(payout.amount.to_string())
    .bind(payout.source_tx_ref.as_slice())
    .bind(signatures)
    .execute(pool)
    .await
    .wrap_err("Failed to insert cell payout")?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_pending_cell_payouts(pool: &PgPool, limit: i64) -> Result<Vec<CellPayoutRow>> {
    sqlx::query_as::<_, CellPayoutRow>(
        r#"SELECT receipt_hash, account, amount::TEXT AS amount, status, created_at
           FROM cell_payouts WHERE status = 'pending' ORDER BY created_at LIMIT $1"#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to get pending cell payouts")
}

pub async fn count_pending_cell_payouts(pool: &PgPool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM cell_payouts WHERE status = 'pending'"#)
        .fetch_one(pool)
        .await
        .wrap_err("Failed to count pending cell payouts")?;
    Ok(row.0)
}

// ============================================================================
// EVM Releases
// ============================================================================

pub async fn get_evm_release(pool: &PgPool, receipt_hash: &B256) -> Result<Option<SignedRelease>> {
    let row = sqlx::query_as::<_, EvmReleaseRow>(
        r#"SELECT receipt_hash, sender, nonce, tx_hash, raw_tx, confirmed
           FROM evm_releases WHERE receipt_hash = $1"#,
    )
    .bind(receipt_hash.as_slice())
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to get EVM release")?;

    row.map(EvmReleaseRow::into_release).transpose()
}

/// Journal a signed release. Returns false if the receipt already has one.
pub async fn insert_evm_release(pool: &PgPool, release: &SignedRelease) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO evm_releases (receipt_hash, sender, nonce, tx_hash, raw_tx)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (receipt_hash) DO NOTHING
        "#,
    )
    .bind(release.receipt_hash.as_slice())
    .bind(release.sender.as_slice())
    .bind(release.nonce as i64)
    .bind(release.tx_hash.as_slice())
    .bind(release.raw_tx.as_ref())
    .execute(pool)
    .await
    .wrap_err("Failed to insert EVM release")?;

    Ok(result.rows_affected() == 1)
}

/// Highest journaled nonce for a sender
pub async fn get_max_release_nonce(pool: &PgPool, sender: &Address) -> Result<Option<u64>> {
    let row: (Option<i64>,) =
        sqlx::query_as(r#"SELECT MAX(nonce) FROM evm_releases WHERE sender = $1"#)
            .bind(sender.as_slice())
            .fetch_one(pool)
            .await
            .wrap_err("Failed to get max release nonce")?;

    Ok(row.0.map(|n| n as u64))
}

pub async fn mark_evm_release_confirmed(pool: &PgPool, receipt_hash: &B256) -> Result<()> {
    sqlx::query(r#"UPDATE evm_releases SET confirmed = TRUE WHERE receipt_hash = $1"#)
        .bind(receipt_hash.as_slice())
        .execute(pool)
        .await
        .wrap_err("Failed to mark EVM release confirmed")?;
    Ok(())
}
