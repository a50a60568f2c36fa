use alloy::primitives::{Address, Bytes, B256};
use bridge_core::{BridgeIdentity, HashType, QuorumPolicy, Script, ValidatorSet};
use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for the operator
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub evm: EvmConfig,
    pub ckb: CkbConfig,
    pub quorum: QuorumConfig,
    pub relayer: RelayerConfig,
    pub api: ApiConfig,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// Account-ledger configuration
#[derive(Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub bridge_address: String,
    /// Validator key; signs receipts and sends releases
    pub private_key: String,
    pub finality_blocks: u64,
    /// Initial watermark when none is stored
    pub start_block: u64,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for EvmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmConfig")
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("bridge_address", &self.bridge_address)
            .field("private_key", &"<redacted>")
            .field("finality_blocks", &self.finality_blocks)
            .field("start_block", &self.start_block)
            .finish()
    }
}

impl EvmConfig {
    pub fn bridge_address(&self) -> Result<Address> {
        Address::from_str(&self.bridge_address).wrap_err("Invalid bridge address")
    }
}

/// Cell-ledger configuration
#[derive(Debug, Clone)]
pub struct CkbConfig {
    pub indexer_url: String,
    pub bridge_code_hash: String,
    pub bridge_hash_type: String,
    pub bridge_args: String,
    pub bridge_type_hash: String,
    pub deposit_code_hash: String,
    pub deposit_hash_type: String,
    pub finality_blocks: u64,
    pub start_block: u64,
}

impl CkbConfig {
    /// Scripts that identify this bridge instance
    pub fn bridge_identity(&self) -> Result<BridgeIdentity> {
        Ok(BridgeIdentity {
            bridge_type: Script {
                code_hash: parse_b256(&self.bridge_code_hash, "CKB_BRIDGE_CODE_HASH")?,
                hash_type: parse_hash_type(&self.bridge_hash_type)?,
                args: Bytes::from(
                    hex::decode(self.bridge_args.trim_start_matches("0x"))
                        .wrap_err("CKB_BRIDGE_ARGS must be hex")?,
                ),
            },
            bridge_type_hash: parse_b256(&self.bridge_type_hash, "CKB_BRIDGE_TYPE_HASH")?,
            deposit_code_hash: parse_b256(&self.deposit_code_hash, "CKB_DEPOSIT_CODE_HASH")?,
        })
    }

    /// Indexer search key matching every deposit lock, whatever its args
    pub fn deposit_search_script(&self) -> Result<Script> {
        Ok(Script {
            code_hash: parse_b256(&self.deposit_code_hash, "CKB_DEPOSIT_CODE_HASH")?,
            hash_type: parse_hash_type(&self.deposit_hash_type)?,
            args: Bytes::new(),
        })
    }
}

/// Validator set and threshold
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    pub validators: Vec<String>,
    pub policy: String,
}

impl QuorumConfig {
    pub fn validator_set(&self) -> Result<ValidatorSet> {
        let members = self
            .validators
            .iter()
            .map(|v| Address::from_str(v).wrap_err_with(|| format!("Invalid validator {}", v)))
            .collect::<Result<Vec<_>>>()?;
        ValidatorSet::new(members).map_err(|e| eyre!(e))
    }

    pub fn policy(&self) -> Result<QuorumPolicy> {
        QuorumPolicy::from_str(&self.policy).map_err(|e| eyre!(e))
    }
}

/// Relayer configuration
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub poll_interval_ms: u64,
    /// Caps one poll cycle's block range
    pub max_blocks_per_batch: Option<u64>,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub queue_visibility_timeout_secs: u64,
    /// Queue consumed on the account-ledger side (Lock receipts)
    pub evm_queue_name: String,
    /// Queue consumed on the cell-ledger side (quorum hand-offs)
    pub ckb_queue_name: String,
}

impl RelayerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_visibility_timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
}

/// Default functions
fn default_finality_blocks() -> u64 {
    1
}

fn default_poll_interval() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2000
}

fn default_visibility_timeout() -> u64 {
    30
}

fn default_api_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

fn parse_hash_type(value: &str) -> Result<HashType> {
    match value.to_ascii_lowercase().as_str() {
        "data" => Ok(HashType::Data),
        "type" => Ok(HashType::Type),
        "data1" => Ok(HashType::Data1),
        "data2" => Ok(HashType::Data2),
        other => Err(eyre!("Unknown CKB hash type: {}", other)),
    }
}

fn parse_b256(value: &str, name: &str) -> Result<B256> {
    B256::from_str(value).wrap_err_with(|| format!("{} must be a 32-byte hex value", name))
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn optional<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: required("DATABASE_URL")?,
        };

        let evm = EvmConfig {
            rpc_url: required("EVM_RPC_URL")?,
            chain_id: required("EVM_CHAIN_ID")?
                .parse()
                .wrap_err("EVM_CHAIN_ID must be a valid u64")?,
            bridge_address: required("EVM_BRIDGE_ADDRESS")?,
            private_key: required("EVM_PRIVATE_KEY")?,
            finality_blocks: optional("EVM_FINALITY_BLOCKS").unwrap_or(default_finality_blocks()),
            start_block: optional("EVM_START_BLOCK").unwrap_or(0),
        };

        let ckb = CkbConfig {
            indexer_url: required("CKB_INDEXER_URL")?,
            bridge_code_hash: required("CKB_BRIDGE_CODE_HASH")?,
            bridge_hash_type: env::var("CKB_BRIDGE_HASH_TYPE").unwrap_or_else(|_| "type".into()),
            bridge_args: env::var("CKB_BRIDGE_ARGS").unwrap_or_else(|_| "0x".into()),
            bridge_type_hash: required("CKB_BRIDGE_TYPE_HASH")?,
            deposit_code_hash: required("CKB_DEPOSIT_CODE_HASH")?,
            deposit_hash_type: env::var("CKB_DEPOSIT_HASH_TYPE").unwrap_or_else(|_| "data".into()),
            finality_blocks: optional("CKB_FINALITY_BLOCKS").unwrap_or(default_finality_blocks()),
            start_block: optional("CKB_START_BLOCK").unwrap_or(0),
        };

        let quorum = QuorumConfig {
            validators: required("VALIDATORS")?
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect(),
            policy: env::var("QUORUM_POLICY").unwrap_or_else(|_| "majority".into()),
        };

        // Queue names follow the bridge instance so two bridges never share a queue
        let relayer = RelayerConfig {
            poll_interval_ms: optional("POLL_INTERVAL_MS").unwrap_or(default_poll_interval()),
            max_blocks_per_batch: optional("MAX_BLOCKS_PER_BATCH"),
            retry_attempts: optional("RETRY_ATTEMPTS").unwrap_or(default_retry_attempts()),
            retry_delay_ms: optional("RETRY_DELAY_MS").unwrap_or(default_retry_delay()),
            queue_visibility_timeout_secs: optional("QUEUE_VISIBILITY_TIMEOUT_SECS")
                .unwrap_or(default_visibility_timeout()),
            evm_queue_name: env::var("EVM_QUEUE_NAME")
                .unwrap_or_else(|_| evm.bridge_address.to_lowercase()),
            ckb_queue_name: env::var("CKB_QUEUE_NAME")
                .unwrap_or_else(|_| ckb.bridge_type_hash.to_lowercase()),
        };

        let api = ApiConfig {
            bind_addr: match env::var("API_BIND_ADDR") {
                Ok(addr) => addr
                    .parse()
                    .wrap_err_with(|| format!("Invalid API_BIND_ADDR {}", addr))?,
                Err(_) => default_api_bind_addr(),
            },
        };

        let config = Config {
            database,
            evm,
            ckb,
            quorum,
            relayer,
            api,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if self.evm.rpc_url.is_empty() {
            return Err(eyre!("evm.rpc_url cannot be empty"));
        }

        if self.evm.bridge_address.len() != 42 || !self.evm.bridge_address.starts_with("0x") {
            return Err(eyre!(
                "evm.bridge_address must be a valid hex address (42 chars with 0x prefix)"
            ));
        }

        if self.evm.private_key.len() != 66 || !self.evm.private_key.starts_with("0x") {
            return Err(eyre!("evm.private_key must be 66 chars (0x + 64 hex chars)"));
        }

        if self.ckb.indexer_url.is_empty() {
            return Err(eyre!("ckb.indexer_url cannot be empty"));
        }

        self.ckb.bridge_identity()?;
        self.ckb.deposit_search_script()?;

        let validators = self.quorum.validator_set()?;
        let policy = self.quorum.policy()?;
        if let QuorumPolicy::Fixed(k) = policy {
            if k > validators.len() {
                return Err(eyre!(
                    "quorum.policy requires {} signatures but only {} validators are configured",
                    k,
                    validators.len()
                ));
            }
        }

        if self.relayer.poll_interval_ms == 0 {
            return Err(eyre!("relayer.poll_interval_ms must be positive"));
        }

        if self.relayer.max_blocks_per_batch == Some(0) {
            return Err(eyre!("relayer.max_blocks_per_batch must be positive when set"));
        }

        if self.relayer.evm_queue_name == self.relayer.ckb_queue_name {
            return Err(eyre!("EVM and CKB relay queues must have different names"));
        }

        Ok(())
    }
}
