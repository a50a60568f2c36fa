//! CKB indexer JSON-RPC client

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::{Bytes, B256};
use async_trait::async_trait;
use bridge_core::{CellOutput, CellTransaction, HashType, OutPoint, Script};
use futures::future::try_join_all;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use super::{CellFilter, CellLedger, LedgerError};
use crate::bounded_cache::BoundedCache;

/// Page size for `get_transactions`
const PAGE_LIMIT: u64 = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Talks to a node with the built-in indexer (`get_indexer_tip`, `get_transactions`)
pub struct CkbIndexerClient {
    client: Client,
    url: String,
    next_id: AtomicU64,
    transactions: Mutex<BoundedCache<B256, FetchedTransaction>>,
}

#[derive(Debug, Clone)]
struct FetchedTransaction {
    inputs: Vec<OutPoint>,
    outputs: Vec<CellOutput>,
    block_hash: Option<B256>,
}

impl CkbIndexerClient {
    pub fn new(url: &str) -> Result<Self, LedgerError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
            transactions: Mutex::new(BoundedCache::default()),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "id": id,
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });

        let response = self.client.post(&self.url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(LedgerError::Rpc(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }

        let body: RpcResponse<T> = response.json().await?;
        if let Some(error) = body.error {
            return Err(LedgerError::Remote {
                code: error.code,
                message: error.message,
            });
        }
        body.result
            .ok_or_else(|| LedgerError::Decode(format!("{} returned no result", method)))
    }

    /// Fetch a transaction, consulting the cache first. `None` if the node does not know it.
    async fn fetch_transaction(&self, tx_hash: &B256) -> Result<Option<FetchedTransaction>, LedgerError> {
        if let Some(tx) = self.transactions.lock().await.get(tx_hash) {
            return Ok(Some(tx));
        }

        let view: Option<TransactionWithStatus> =
            self.call("get_transaction", json!([tx_hash])).await?;
        let Some(view) = view.and_then(|v| v.into_fetched().transpose()) else {
            return Ok(None);
        };
        let tx = view?;

        // Only committed transactions are stable enough to cache
        if tx.block_hash.is_some() {
            self.transactions.lock().await.insert(*tx_hash, tx.clone());
        }
        Ok(Some(tx))
    }

    async fn search(
        &self,
        filter: &CellFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<IndexerTransaction>, LedgerError> {
        let (script, script_type) = match filter {
            CellFilter::Lock(script) => (script, "lock"),
            CellFilter::Type(script) => (script, "type"),
        };
        let search_key = json!({
            "script": ScriptDto::from(script),
            "script_type": script_type,
            // block_range is half-open
            "filter": { "block_range": [hex_u64(from), hex_u64(to + 1)] },
        });

        let mut found = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page: Pagination<IndexerTransaction> = self
                .call(
                    "get_transactions",
                    json!([search_key, "asc", hex_u64(PAGE_LIMIT), cursor]),
                )
                .await?;
            let count = page.objects.len() as u64;
            found.extend(page.objects);
            if count < PAGE_LIMIT {
                break;
            }
            cursor = Some(page.last_cursor);
        }
        Ok(found)
    }
}

#[async_trait]
impl CellLedger for CkbIndexerClient {
    async fn tip(&self) -> Result<u64, LedgerError> {
        let tip: Option<IndexerTip> = self.call("get_indexer_tip", json!([])).await?;
        match tip {
            Some(tip) => parse_hex_u64(&tip.block_number),
            None => Ok(0),
        }
    }

    async fn transactions_in_range(
        &self,
        filter: &CellFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<CellTransaction>, LedgerError> {
        if from > to {
            return Ok(Vec::new());
        }

        // One entry per matching cell; collapse to one per transaction
        let mut positions: HashMap<B256, (u64, u32)> = HashMap::new();
        for object in self.search(filter, from, to).await? {
            let hash = parse_b256(&object.tx_hash)?;
            let position = (
                parse_hex_u64(&object.block_number)?,
                parse_hex_u32(&object.tx_index)?,
            );
            positions.insert(hash, position);
        }

        debug!(
            from,
            to,
            transactions = positions.len(),
            "Indexer search complete"
        );

        let fetches = positions.iter().map(|(hash, (block_number, tx_index))| async move {
            let tx = self
                .fetch_transaction(hash)
                .await?
                .ok_or(LedgerError::TransactionNotFound(*hash))?;
            Ok::<_, LedgerError>(CellTransaction {
                hash: *hash,
                block_number: *block_number,
                tx_index: *tx_index,
                inputs: tx.inputs,
                outputs: tx.outputs,
            })
        });
        try_join_all(fetches).await
    }

    async fn resolve_output(&self, out_point: &OutPoint) -> Result<CellOutput, LedgerError> {
        let tx = self
            .fetch_transaction(&out_point.tx_hash)
            .await?
            .ok_or(LedgerError::TransactionNotFound(out_point.tx_hash))?;
        tx.outputs
            .get(out_point.index as usize)
            .cloned()
            .ok_or(LedgerError::OutputNotFound {
                tx_hash: out_point.tx_hash,
                index: out_point.index,
            })
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct IndexerTip {
    block_number: String,
}

#[derive(Debug, Deserialize)]
struct Pagination<T> {
    objects: Vec<T>,
    last_cursor: String,
}

#[derive(Debug, Deserialize)]
struct IndexerTransaction {
    tx_hash: String,
    block_number: String,
    tx_index: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScriptDto {
    code_hash: String,
    hash_type: String,
    args: String,
}

impl From<&Script> for ScriptDto {
    fn from(script: &Script) -> Self {
        let hash_type = match script.hash_type {
            HashType::Data => "data",
            HashType::Type => "type",
            HashType::Data1 => "data1",
            HashType::Data2 => "data2",
        };
        Self {
            code_hash: format!("{:#x}", script.code_hash),
            hash_type: hash_type.to_string(),
            args: format!("0x{}", hex::encode(&script.args)),
        }
    }
}

impl TryFrom<ScriptDto> for Script {
    type Error = LedgerError;

    fn try_from(dto: ScriptDto) -> Result<Self, Self::Error> {
        let hash_type = match dto.hash_type.as_str() {
            "data" => HashType::Data,
            "type" => HashType::Type,
            "data1" => HashType::Data1,
            "data2" => HashType::Data2,
            other => return Err(LedgerError::Decode(format!("unknown hash_type {}", other))),
        };
        Ok(Script {
            code_hash: parse_b256(&dto.code_hash)?,
            hash_type,
            args: parse_bytes(&dto.args)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OutPointDto {
    tx_hash: String,
    index: String,
}

#[derive(Debug, Deserialize)]
struct InputDto {
    previous_output: OutPointDto,
}

#[derive(Debug, Deserialize)]
struct OutputDto {
    capacity: String,
    lock: ScriptDto,
    #[serde(rename = "type")]
    type_script: Option<ScriptDto>,
}

#[derive(Debug, Deserialize)]
struct TransactionDto {
    inputs: Vec<InputDto>,
    outputs: Vec<OutputDto>,
    #[serde(default)]
    outputs_data: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TxStatusDto {
    block_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionWithStatus {
    transaction: Option<TransactionDto>,
    tx_status: TxStatusDto,
}

impl TransactionWithStatus {
    fn into_fetched(self) -> Result<Option<FetchedTransaction>, LedgerError> {
        let Some(tx) = self.transaction else {
            return Ok(None);
        };

        let inputs = tx
            .inputs
            .into_iter()
            .map(|i| {
                Ok(OutPoint {
                    tx_hash: parse_b256(&i.previous_output.tx_hash)?,
                    index: parse_hex_u32(&i.previous_output.index)?,
                })
            })
            .collect::<Result<Vec<_>, LedgerError>>()?;

        if !tx.outputs_data.is_empty() && tx.outputs_data.len() != tx.outputs.len() {
            return Err(LedgerError::Decode(format!(
                "{} outputs but {} outputs_data entries",
                tx.outputs.len(),
                tx.outputs_data.len()
            )));
        }
        let mut data = tx.outputs_data.into_iter();
        let outputs = tx
            .outputs
            .into_iter()
            .map(|o| {
                Ok(CellOutput {
                    capacity: parse_hex_u64(&o.capacity)?,
                    lock: o.lock.try_into()?,
                    type_script: o.type_script.map(Script::try_from).transpose()?,
                    data: match data.next() {
                        Some(d) => parse_bytes(&d)?,
                        None => Bytes::new(),
                    },
                })
            })
            .collect::<Result<Vec<_>, LedgerError>>()?;

        let block_hash = self
            .tx_status
            .block_hash
            .as_deref()
            .map(parse_b256)
            .transpose()?;

        Ok(Some(FetchedTransaction {
            inputs,
            outputs,
            block_hash,
        }))
    }
}

// ============================================================================
// Hex helpers
// ============================================================================

fn hex_u64(value: u64) -> String {
    format!("{:#x}", value)
}

pub(crate) fn parse_hex_u64(value: &str) -> Result<u64, LedgerError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| LedgerError::Decode(format!("expected 0x-prefixed number, got {}", value)))?;
    u64::from_str_radix(digits, 16)
        .map_err(|e| LedgerError::Decode(format!("invalid hex number {}: {}", value, e)))
}

fn parse_hex_u32(value: &str) -> Result<u32, LedgerError> {
    let n = parse_hex_u64(value)?;
    u32::try_from(n).map_err(|_| LedgerError::Decode(format!("{} does not fit in u32", value)))
}

fn parse_b256(value: &str) -> Result<B256, LedgerError> {
    B256::from_str(value).map_err(|e| LedgerError::Decode(format!("invalid hash {}: {}", value, e)))
}

fn parse_bytes(value: &str) -> Result<Bytes, LedgerError> {
    hex::decode(value.trim_start_matches("0x"))
        .map(Bytes::from)
        .map_err(|e| LedgerError::Decode(format!("invalid bytes {}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(parse_hex_u64("0x0").unwrap(), 0);
        assert_eq!(parse_hex_u64("0x174876e800").unwrap(), 100_000_000_000);
        assert!(parse_hex_u64("100").is_err());
        assert!(parse_hex_u64("0xzz").is_err());
    }

    #[test]
    fn test_script_dto_round_trip() {
        let script = Script {
            code_hash: B256::repeat_byte(0xd1),
            hash_type: HashType::Data,
            args: Bytes::from(vec![0xab; 4]),
        };
        let dto = ScriptDto::from(&script);
        assert_eq!(dto.hash_type, "data");
        assert_eq!(dto.args, "0xabababab");
        assert_eq!(Script::try_from(dto).unwrap(), script);
    }

    #[test]
    fn test_transaction_view_decoding() {
        let raw = json!({
            "transaction": {
                "version": "0x0",
                "cell_deps": [],
                "header_deps": [],
                "inputs": [{
                    "previous_output": {
                        "tx_hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
                        "index": "0x1"
                    },
                    "since": "0x0"
                }],
                "outputs": [{
                    "capacity": "0x2540be400",
                    "lock": {
                        "code_hash": "0x9bd7e06f3ecf4be0f2fcd2188b23f1b9fcc88e5d4b65a8637b17723bbda3cce8",
                        "hash_type": "type",
                        "args": "0xdb223ec5ff9194b9e2940ddf1b6f85521b9f9336"
                    },
                    "type": null
                }],
                "outputs_data": ["0x00ff"],
                "witnesses": []
            },
            "tx_status": {
                "block_hash": "0x2222222222222222222222222222222222222222222222222222222222222222",
                "status": "committed"
            }
        });

        let view: TransactionWithStatus = serde_json::from_value(raw).unwrap();
        let tx = view.into_fetched().unwrap().unwrap();
        assert_eq!(tx.inputs[0].index, 1);
        assert_eq!(tx.outputs[0].capacity, 10_000_000_000);
        assert_eq!(tx.outputs[0].lock.hash_type, HashType::Type);
        assert!(tx.outputs[0].type_script.is_none());
        assert_eq!(tx.outputs[0].data, Bytes::from(vec![0x00, 0xff]));
        assert_eq!(tx.block_hash, Some(B256::repeat_byte(0x22)));
    }

    #[test]
    fn test_pending_transaction_has_no_block() {
        let raw = json!({
            "transaction": { "inputs": [], "outputs": [] },
            "tx_status": { "block_hash": null, "status": "pending" }
        });
        let view: TransactionWithStatus = serde_json::from_value(raw).unwrap();
        assert_eq!(view.into_fetched().unwrap().unwrap().block_hash, None);
    }
}
