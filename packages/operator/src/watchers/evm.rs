use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use bridge_core::{Account, BridgeEvent, Chain, Deposit, LedgerEvent, Receipt};
use eyre::{eyre, Result, WrapErr};

use super::EventSource;
use crate::config::EvmConfig;
use crate::contracts::ChildBridge;

/// Account-ledger event source for the bridge token's Burn and BurnQuorum logs
pub struct EvmEventSource {
    provider: RootProvider<Http<Client>>,
    bridge_address: Address,
    finality_blocks: u64,
}

impl EvmEventSource {
    pub fn new(config: &EvmConfig) -> Result<Self> {
        let url = config.rpc_url.parse().wrap_err("Failed to parse RPC URL")?;
        let provider = ProviderBuilder::new().on_http(url);

        Ok(Self {
            provider,
            bridge_address: config.bridge_address()?,
            finality_blocks: config.finality_blocks,
        })
    }
}

#[async_trait]
impl EventSource for EvmEventSource {
    fn chain(&self) -> Chain {
        Chain::Evm
    }

    async fn tip(&self) -> Result<u64> {
        let block = self
            .provider
            .get_block_number()
            .await
            .wrap_err("Failed to get block number")?;
        Ok(block.saturating_sub(self.finality_blocks))
    }

    async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<LedgerEvent>> {
        let filter = Filter::new()
            .address(self.bridge_address)
            .from_block(from)
            .to_block(to);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .wrap_err("Failed to get logs")?;

        tracing::debug!(from, to, logs = logs.len(), "Fetched bridge logs");
        classify_logs(logs)
    }
}

/// Classify bridge logs into ledger events, ordered by position.
///
/// A log without block, transaction or log index fails the whole batch.
pub fn classify_logs(logs: Vec<Log>) -> Result<Vec<LedgerEvent>> {
    let mut positioned = Vec::with_capacity(logs.len());

    for log in logs {
        let Some(event) = classify_log(&log)? else {
            continue;
        };

        let block_number = log
            .block_number
            .ok_or_else(|| eyre!("Missing block number"))?;
        let tx_index = log
            .transaction_index
            .ok_or_else(|| eyre!("Missing transaction index"))?;
        let log_index = log.log_index.ok_or_else(|| eyre!("Missing log index"))?;
        let tx_hash = log
            .transaction_hash
            .ok_or_else(|| eyre!("Missing transaction hash"))?;

        positioned.push((
            (block_number, tx_index, log_index),
            LedgerEvent {
                chain: Chain::Evm,
                block_number,
                tx_index: tx_index as u32,
                tx_hash,
                event,
            },
        ));
    }

    positioned.sort_by_key(|(position, _)| *position);
    Ok(positioned.into_iter().map(|(_, e)| e).collect())
}

fn classify_log(log: &Log) -> Result<Option<BridgeEvent>> {
    let Some(topic) = log.topics().first() else {
        return Ok(None);
    };

    if *topic == ChildBridge::Burn::SIGNATURE_HASH {
        let burn = ChildBridge::Burn::decode_log_data(log.data(), true)
            .wrap_err("Failed to decode Burn log")?;
        return Ok(Some(BridgeEvent::NewDeposit(Deposit {
            depositor: Account::from_evm(burn.sender),
            amount: burn.value,
            recipient: None,
        })));
    }

    if *topic == ChildBridge::BurnQuorum::SIGNATURE_HASH {
        let quorum = ChildBridge::BurnQuorum::decode_log_data(log.data(), true)
            .wrap_err("Failed to decode BurnQuorum log")?;
        return Ok(Some(BridgeEvent::QuorumReached(Receipt::unlock(
            quorum.from,
            quorum.amount,
            quorum.txHash,
        ))));
    }

    Ok(None)
}
