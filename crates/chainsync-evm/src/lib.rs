//! chainsync-evm: EVM implementations of the chainsync collaborator traits.
//!
//! - [`HttpRpcClient`]: JSON-RPC 2.0 over HTTP (`reqwest`)
//! - [`EvmBlockFetcher`]: `eth_getBlockByNumber` + `eth_getBlockReceipts`
//! - [`WsHeaderSource`]: `eth_subscribe("newHeads")` over a websocket
//! - [`AddressFilter`], [`TransferFilter`]: filter chain stages
//! - [`LogSink`], [`ChannelSink`], [`MemorySink`]: event sinks

pub mod error;
pub mod fetcher;
pub mod filters;
pub mod http;
pub mod rpc;
pub mod sink;
pub mod ws;

pub use error::TransportError;
pub use fetcher::EvmBlockFetcher;
pub use filters::{AddressFilter, TransferFilter};
pub use http::{HttpClientConfig, HttpRpcClient};
pub use rpc::{NodeError, RpcRequest, RpcResponse, RpcTransport};
pub use sink::{ChainEvent, ChannelSink, EventSink, LogSink, MemorySink};
pub use ws::{WsConfig, WsHeaderSource};
