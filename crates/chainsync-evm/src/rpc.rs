//! JSON-RPC 2.0 envelopes and the transport seam.
//!
//! chainsync only ever sends numeric ids and positional params, so both are
//! typed that way. Replies with any other id shape fail to decode.

use async_trait::async_trait;
use serde::de::{self, Unexpected};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::error::TransportError;

/// The `"jsonrpc": "2.0"` member. Any other version is rejected on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version2;

impl Serialize for Version2 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for Version2 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = String::deserialize(deserializer)?;
        if version == "2.0" {
            Ok(Self)
        } else {
            Err(de::Error::invalid_value(Unexpected::Str(&version), &"\"2.0\""))
        }
    }
}

static REQUEST_IDS: AtomicU64 = AtomicU64::new(1);

/// Outbound call. Ids are unique per process so replies on a shared socket
/// can be matched to their request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: Version2,
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: Version2,
            id: REQUEST_IDS.fetch_add(1, Ordering::Relaxed),
            method: method.into(),
            params,
        }
    }
}

/// Error object a node puts in a failed reply.
#[derive(Debug, Clone, PartialEq, Deserialize, Error)]
#[error("node error {code}: {message}")]
pub struct NodeError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Inbound reply. `id` is `None` when the node could not read the request
/// at all, and on subscription notifications.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: Version2,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<NodeError>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: Version2,
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, error: NodeError) -> Self {
        Self {
            jsonrpc: Version2,
            id: Some(id),
            result: None,
            error: Some(error),
        }
    }

    pub fn node_error(&self) -> Option<&NodeError> {
        self.error.as_ref()
    }

    /// `result`, with an absent or `null` one (an unknown block, say) as
    /// `Value::Null`.
    pub fn into_result(self) -> Result<Value, TransportError> {
        match self.error {
            Some(err) => Err(TransportError::Rpc(err)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Anything that can carry a JSON-RPC request to a node.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send(&self, req: RpcRequest) -> Result<RpcResponse, TransportError>;

    /// Endpoint URL, for logs.
    fn url(&self) -> &str;

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        self.send(RpcRequest::new(method, params)).await?.into_result()
    }
}

/// `0x`-prefixed hex quantity, as JSON-RPC expects block numbers.
pub fn hex_quantity(n: u64) -> String {
    format!("{n:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_positional_params() {
        let req = RpcRequest::new(
            "eth_getBlockByNumber",
            vec![Value::from("0x10"), Value::Bool(true)],
        );
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], req.id);
        assert_eq!(json["params"], serde_json::json!(["0x10", true]));
    }

    #[test]
    fn request_ids_are_unique() {
        let a = RpcRequest::new("eth_chainId", vec![]);
        let b = RpcRequest::new("eth_chainId", vec![]);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn error_reply_becomes_rpc_error() {
        let resp: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"the method eth_getBlockReceipts does not exist"}}"#,
        )
        .unwrap();
        assert_eq!(resp.node_error().map(|e| e.code), Some(-32601));
        assert!(resp.into_result().unwrap_err().is_method_not_found());
    }

    #[test]
    fn unparseable_request_reply_has_no_id() {
        let resp: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"parse error"}}"#,
        )
        .unwrap();
        assert_eq!(resp.id, None);
    }

    #[test]
    fn null_result_is_null() {
        let resp: RpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":4,"result":null}"#).unwrap();
        assert_eq!(resp.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn other_versions_are_rejected() {
        assert!(serde_json::from_str::<RpcResponse>(r#"{"jsonrpc":"1.0","id":1,"result":1}"#).is_err());
        assert!(serde_json::from_str::<RpcResponse>(r#"{"id":1,"result":1}"#).is_err());
    }

    #[test]
    fn quantities_are_prefixed() {
        assert_eq!(hex_quantity(0), "0x0");
        assert_eq!(hex_quantity(255), "0xff");
    }
}
