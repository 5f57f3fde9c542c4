//! ERC-20 `Transfer(address,address,uint256)` decoder.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chainsync_core::{BlockHeader, Filter, Log, SyncError, Transaction, Verdict};

use crate::sink::{ChainEvent, EventSink};

/// `keccak256("Transfer(address,address,uint256)")`
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Publishes one [`ChainEvent`] per ERC-20 transfer log of a successful
/// transaction. ERC-721 transfers (three indexed topics) are ignored.
pub struct TransferFilter {
    contracts: Option<HashSet<String>>,
    sink: Arc<dyn EventSink>,
}

impl TransferFilter {
    /// Decode transfers from any contract.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            contracts: None,
            sink,
        }
    }

    /// Only decode transfers emitted by `contracts`.
    pub fn for_contracts<I, S>(contracts: I, sink: Arc<dyn EventSink>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            contracts: Some(contracts.into_iter().map(|c| c.as_ref().to_lowercase()).collect()),
            sink,
        }
    }

    fn watches(&self, contract: &str) -> bool {
        self.contracts
            .as_ref()
            .map_or(true, |set| set.contains(&contract.to_lowercase()))
    }
}

/// Right-most 20 bytes of a 32-byte topic, as a lowercase address.
fn topic_address(topic: &str) -> Option<String> {
    let hex = topic.strip_prefix("0x").unwrap_or(topic);
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{}", hex[24..].to_lowercase()))
}

/// Minimal hex quantity for a 32-byte word (`0x0` for zero).
fn word_quantity(data: &str) -> Option<String> {
    let hex = data.strip_prefix("0x").unwrap_or(data);
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let trimmed = hex.trim_start_matches('0').to_lowercase();
    Some(if trimmed.is_empty() {
        "0x0".to_string()
    } else {
        format!("0x{trimmed}")
    })
}

/// Decode `log` into `(from, to, value)` if it is an ERC-20 transfer.
pub fn decode_transfer(log: &Log) -> Option<(String, String, String)> {
    if log.topics.len() != 3 || !log.topics[0].eq_ignore_ascii_case(TRANSFER_TOPIC) {
        return None;
    }
    Some((
        topic_address(&log.topics[1])?,
        topic_address(&log.topics[2])?,
        word_quantity(&log.data)?,
    ))
}

#[async_trait]
impl Filter for TransferFilter {
    async fn execute(&self, header: &BlockHeader, tx: &Transaction) -> Result<Verdict, SyncError> {
        if !tx.success {
            return Ok(Verdict::Continue);
        }

        for log in tx.logs.iter().filter(|l| self.watches(&l.address)) {
            let Some((from, to, value)) = decode_transfer(log) else {
                continue;
            };
            let event = ChainEvent {
                id: ChainEvent::event_id(&tx.hash, log.log_index),
                kind: "Transfer".into(),
                block_number: header.number,
                block_hash: header.hash.clone(),
                timestamp: header.timestamp,
                tx_hash: tx.hash.clone(),
                log_index: log.log_index,
                contract: log.address.to_lowercase(),
                fields: HashMap::from([
                    ("from".to_string(), from),
                    ("to".to_string(), to),
                    ("value".to_string(), value),
                ]),
            };
            self.sink
                .publish(&event)
                .await
                .map_err(|e| SyncError::filter(self.name(), format!("sink {}: {e}", self.sink.name())))?;
        }
        Ok(Verdict::Continue)
    }

    fn name(&self) -> &str {
        "erc20-transfer"
    }
}

impl std::fmt::Debug for TransferFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferFilter")
            .field("contracts", &self.contracts)
            .field("sink", &self.sink.name())
            .finish()
    }
}
