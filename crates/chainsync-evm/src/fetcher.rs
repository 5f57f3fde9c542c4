//! `BlockFetcher` over EVM JSON-RPC.
//!
//! A block is assembled from `eth_getBlockByNumber(n, true)` plus the block's
//! receipts, so filters see each transaction's status and logs. Nodes without
//! `eth_getBlockReceipts` fall back to one `eth_getTransactionReceipt` per
//! transaction; the fallback is remembered after the first refusal.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chainsync_core::types::parse_hex_u64;
use chainsync_core::{BlockFetcher, BlockHeader, FetchedBlock, Log, SyncError, Transaction};

use crate::error::TransportError;
use crate::rpc::{hex_quantity, RpcTransport};

pub struct EvmBlockFetcher {
    transport: Arc<dyn RpcTransport>,
    block_receipts: AtomicBool,
}

impl EvmBlockFetcher {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            transport,
            block_receipts: AtomicBool::new(true),
        }
    }

    async fn fetch(&self, block_number: u64) -> Result<FetchedBlock, TransportError> {
        let tag = Value::String(hex_quantity(block_number));
        let raw = self
            .transport
            .call("eth_getBlockByNumber", vec![tag, Value::Bool(true)])
            .await?;
        if raw.is_null() {
            return Err(TransportError::Decode("block not found".into()));
        }

        let header = parse_header(&raw)?;
        if header.number != block_number {
            return Err(TransportError::Decode(format!(
                "node returned block {} for {block_number}",
                header.number
            )));
        }

        let mut transactions = raw["transactions"]
            .as_array()
            .map(|txs| txs.iter().map(parse_transaction).collect::<Result<Vec<_>, _>>())
            .transpose()?
            .unwrap_or_default();

        if !transactions.is_empty() {
            let receipts = self.receipts(block_number, &transactions).await?;
            merge_receipts(&mut transactions, &receipts)?;
        }

        Ok(FetchedBlock {
            header,
            transactions,
        })
    }

    async fn receipts(
        &self,
        block_number: u64,
        transactions: &[Transaction],
    ) -> Result<Vec<Value>, TransportError> {
        if self.block_receipts.load(Ordering::Relaxed) {
            let tag = Value::String(hex_quantity(block_number));
            match self.transport.call("eth_getBlockReceipts", vec![tag]).await {
                Ok(Value::Array(receipts)) => return Ok(receipts),
                Ok(other) => {
                    return Err(TransportError::Decode(format!(
                        "eth_getBlockReceipts returned {other}"
                    )))
                }
                Err(e) if e.is_method_not_found() => {
                    tracing::info!(
                        url = self.transport.url(),
                        "eth_getBlockReceipts unsupported, using per-transaction receipts"
                    );
                    self.block_receipts.store(false, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }

        let mut receipts = Vec::with_capacity(transactions.len());
        for tx in transactions {
            let receipt = self
                .transport
                .call(
                    "eth_getTransactionReceipt",
                    vec![Value::String(tx.hash.clone())],
                )
                .await?;
            receipts.push(receipt);
        }
        Ok(receipts)
    }
}

#[async_trait]
impl BlockFetcher for EvmBlockFetcher {
    async fn fetch_block(&self, block_number: u64) -> Result<FetchedBlock, SyncError> {
        self.fetch(block_number)
            .await
            .map_err(|e| SyncError::fetch(block_number, e.to_string()))
    }
}

impl std::fmt::Debug for EvmBlockFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmBlockFetcher")
            .field("url", &self.transport.url())
            .finish_non_exhaustive()
    }
}

// ─── Decoding ─────────────────────────────────────────────────────────────────

fn str_field<'a>(value: &'a Value, field: &str) -> Result<&'a str, TransportError> {
    value[field]
        .as_str()
        .ok_or_else(|| TransportError::Decode(format!("missing field `{field}`")))
}

fn quantity_field(value: &Value, field: &str) -> Result<u64, TransportError> {
    let raw = str_field(value, field)?;
    parse_hex_u64(raw)
        .ok_or_else(|| TransportError::Decode(format!("field `{field}` is not a quantity: {raw}")))
}

/// Parse a block or `newHeads` header object.
pub fn parse_header(value: &Value) -> Result<BlockHeader, TransportError> {
    Ok(BlockHeader {
        number: quantity_field(value, "number")?,
        hash: str_field(value, "hash")?.to_string(),
        parent_hash: str_field(value, "parentHash")?.to_string(),
        timestamp: quantity_field(value, "timestamp")?,
    })
}

fn parse_transaction(value: &Value) -> Result<Transaction, TransportError> {
    Ok(Transaction {
        hash: str_field(value, "hash")?.to_string(),
        from: str_field(value, "from")?.to_lowercase(),
        to: value["to"].as_str().map(str::to_lowercase),
        value: value["value"].as_str().unwrap_or("0x0").to_string(),
        input: value["input"].as_str().unwrap_or("0x").to_string(),
        index: quantity_field(value, "transactionIndex")? as u32,
        // Filled in from the receipt.
        success: true,
        logs: Vec::new(),
    })
}

fn parse_log(value: &Value) -> Result<Log, TransportError> {
    Ok(Log {
        address: str_field(value, "address")?.to_lowercase(),
        topics: value["topics"]
            .as_array()
            .map(|t| t.iter().filter_map(|v| v.as_str().map(str::to_lowercase)).collect())
            .unwrap_or_default(),
        data: value["data"].as_str().unwrap_or("0x").to_string(),
        log_index: quantity_field(value, "logIndex")? as u32,
    })
}

fn merge_receipts(transactions: &mut [Transaction], receipts: &[Value]) -> Result<(), TransportError> {
    let mut by_hash: HashMap<String, &Value> = HashMap::with_capacity(receipts.len());
    for receipt in receipts {
        by_hash.insert(str_field(receipt, "transactionHash")?.to_lowercase(), receipt);
    }

    for tx in transactions.iter_mut() {
        let receipt = by_hash
            .get(&tx.hash.to_lowercase())
            .ok_or_else(|| TransportError::Decode(format!("no receipt for {}", tx.hash)))?;
        // Pre-Byzantium receipts carry a state root instead of a status.
        tx.success = receipt["status"]
            .as_str()
            .and_then(parse_hex_u64)
            .map(|s| s == 1)
            .unwrap_or(true);
        tx.logs = receipt["logs"]
            .as_array()
            .map(|logs| logs.iter().map(parse_log).collect::<Result<Vec<_>, _>>())
            .transpose()?
            .unwrap_or_default();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{NodeError, RpcRequest, RpcResponse};
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers by method name; methods missing from the table are reported
    /// as unsupported (-32601).
    struct CannedNode {
        answers: HashMap<&'static str, Value>,
        calls: Mutex<Vec<String>>,
    }

    impl CannedNode {
        fn new(answers: Vec<(&'static str, Value)>) -> Arc<Self> {
            Arc::new(Self {
                answers: answers.into_iter().collect(),
                calls: Mutex::new(vec![]),
            })
        }

        fn calls(&self, method: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|m| *m == method).count()
        }
    }

    #[async_trait]
    impl RpcTransport for CannedNode {
        async fn send(&self, req: RpcRequest) -> Result<RpcResponse, TransportError> {
            self.calls.lock().unwrap().push(req.method.clone());
            Ok(match self.answers.get(req.method.as_str()) {
                Some(v) => RpcResponse::success(req.id, v.clone()),
                None => RpcResponse::failure(
                    req.id,
                    NodeError {
                        code: -32601,
                        message: "method not found".into(),
                        data: None,
                    },
                ),
            })
        }

        fn url(&self) -> &str {
            "mock://node"
        }
    }

    const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

    fn block() -> Value {
        json!({
            "number": "0x10",
            "hash": "0xb16",
            "parentHash": "0xb15",
            "timestamp": "0x65000000",
            "transactions": [
                {
                    "hash": "0xAA",
                    "from": "0xSender",
                    "to": "0xToken",
                    "value": "0x0",
                    "input": "0xa9059cbb",
                    "transactionIndex": "0x0"
                },
                {
                    "hash": "0xbb",
                    "from": "0xdeployer",
                    "to": null,
                    "value": "0x0",
                    "input": "0x6080",
                    "transactionIndex": "0x1"
                }
            ]
        })
    }

    fn receipts() -> Value {
        json!([
            {
                "transactionHash": "0xaa",
                "status": "0x1",
                "logs": [{
                    "address": "0xToken",
                    "topics": [TRANSFER_TOPIC, "0x01", "0x02"],
                    "data": "0x64",
                    "logIndex": "0x3"
                }]
            },
            { "transactionHash": "0xbb", "status": "0x0", "logs": [] }
        ])
    }

    #[tokio::test]
    async fn assembles_block_with_receipts() {
        let node = CannedNode::new(vec![
            ("eth_getBlockByNumber", block()),
            ("eth_getBlockReceipts", receipts()),
        ]);
        let fetcher = EvmBlockFetcher::new(node.clone());

        let block = fetcher.fetch_block(16).await.unwrap();

        assert_eq!(block.header.number, 16);
        assert_eq!(block.header.timestamp, 0x65000000);
        assert_eq!(block.transactions.len(), 2);
        let transfer = &block.transactions[0];
        assert!(transfer.success);
        assert_eq!(transfer.from, "0xsender");
        assert_eq!(transfer.logs[0].address, "0xtoken");
        assert_eq!(transfer.logs[0].log_index, 3);
        let deploy = &block.transactions[1];
        assert!(!deploy.success);
        assert_eq!(deploy.to, None);
    }

    #[tokio::test]
    async fn falls_back_to_per_transaction_receipts_once() {
        let node = CannedNode::new(vec![
            ("eth_getBlockByNumber", block()),
            (
                "eth_getTransactionReceipt",
                json!({ "transactionHash": "0xaa", "status": "0x1", "logs": [] }),
            ),
        ]);
        let fetcher = EvmBlockFetcher::new(node.clone());

        // Every receipt claims to be for 0xaa, so 0xbb is missing.
        let err = fetcher.fetch_block(16).await.unwrap_err();
        assert!(err.to_string().contains("no receipt for 0xbb"));
        assert_eq!(node.calls("eth_getBlockReceipts"), 1);
        assert_eq!(node.calls("eth_getTransactionReceipt"), 2);

        let _ = fetcher.fetch_block(16).await;
        assert_eq!(node.calls("eth_getBlockReceipts"), 1);
    }

    #[tokio::test]
    async fn unknown_block_is_a_fetch_error() {
        let node = CannedNode::new(vec![("eth_getBlockByNumber", Value::Null)]);
        let fetcher = EvmBlockFetcher::new(node);

        match fetcher.fetch_block(99).await {
            Err(SyncError::Fetch {
                block_number,
                reason,
            }) => {
                assert_eq!(block_number, 99);
                assert!(reason.contains("block not found"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mismatched_block_number_is_rejected() {
        let node = CannedNode::new(vec![("eth_getBlockByNumber", block())]);
        let fetcher = EvmBlockFetcher::new(node);
        assert!(fetcher.fetch_block(17).await.is_err());
    }

    #[test]
    fn header_requires_number() {
        let err = parse_header(&json!({ "hash": "0x1", "parentHash": "0x0", "timestamp": "0x1" }))
            .unwrap_err();
        assert!(err.to_string().contains("number"));
    }
}
