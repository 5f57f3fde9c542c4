//! `newHeads` header source over a websocket.
//!
//! Each [`subscribe`](HeaderSource::subscribe) opens a fresh connection and
//! issues `eth_subscribe("newHeads")`. A background task forwards parsed
//! headers into the returned stream, answers pings and pings the node in turn.
//! A connection that stays silent for `idle_timeout` ends the stream with an
//! error. Dropping the stream sends `eth_unsubscribe` and closes the socket.
//! Reconnecting is left to the head syncer.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::{CancellationToken, DropGuard};

use chainsync_core::{BlockHeader, HeaderSource, HeaderStream, SyncError};

use crate::error::TransportError;
use crate::fetcher::parse_header;
use crate::rpc::{RpcRequest, RpcResponse};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Bound on connecting plus the `eth_subscribe` round trip.
    pub connect_timeout: Duration,
    /// Headers buffered between the socket task and the consumer.
    pub buffer: usize,
    /// A subscription with no inbound frame for this long is treated as dead.
    pub idle_timeout: Duration,
    /// Keepalive ping period. Pongs count as inbound traffic.
    pub ping_interval: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            buffer: 64,
            idle_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsHeaderSource {
    url: String,
    config: WsConfig,
}

impl WsHeaderSource {
    pub fn new(url: impl Into<String>, config: WsConfig) -> Self {
        Self {
            url: url.into(),
            config,
        }
    }

    async fn open(&self) -> Result<HeaderStream, TransportError> {
        let timeout_ms = self.config.connect_timeout.as_millis() as u64;
        let (sink, stream, subscription_id) =
            tokio::time::timeout(self.config.connect_timeout, self.handshake())
                .await
                .map_err(|_| TransportError::Timeout { ms: timeout_ms })??;

        tracing::info!(url = %self.url, subscription = %subscription_id, "subscribed to newHeads");

        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        let cancel = CancellationToken::new();
        tokio::spawn(pump(
            sink,
            stream,
            subscription_id,
            tx,
            self.config.clone(),
            cancel.clone(),
        ));

        Ok(Box::pin(Subscription {
            rx,
            _guard: cancel.drop_guard(),
        }))
    }

    async fn handshake(
        &self,
    ) -> Result<(SplitSink<Socket, Message>, SplitStream<Socket>, String), TransportError> {
        let (socket, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let request = RpcRequest::new("eth_subscribe", vec![Value::from("newHeads")]);
        sink.send(Message::Text(serde_json::to_string(&request)?))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let Ok(resp) = serde_json::from_str::<RpcResponse>(&text) else {
                        continue;
                    };
                    if resp.id != Some(request.id) {
                        continue;
                    }
                    let result = resp.into_result()?;
                    let id = result.as_str().ok_or_else(|| {
                        TransportError::Decode(format!("subscription id is not a string: {result}"))
                    })?;
                    return Ok((sink, stream, id.to_string()));
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TransportError::WebSocket("closed during subscribe".into()))
                }
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
                Some(Ok(_)) => {}
            }
        }
    }
}

#[async_trait]
impl HeaderSource for WsHeaderSource {
    async fn subscribe(&self) -> Result<HeaderStream, SyncError> {
        self.open()
            .await
            .map_err(|e| SyncError::Subscription(format!("{}: {e}", self.url)))
    }
}

/// Consumer side of a live subscription; cancels the socket task on drop.
struct Subscription {
    rx: mpsc::Receiver<Result<BlockHeader, SyncError>>,
    _guard: DropGuard,
}

impl Stream for Subscription {
    type Item = Result<BlockHeader, SyncError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

async fn pump(
    mut sink: SplitSink<Socket, Message>,
    mut stream: SplitStream<Socket>,
    subscription_id: String,
    mut tx: mpsc::Sender<Result<BlockHeader, SyncError>>,
    config: WsConfig,
    cancel: CancellationToken,
) {
    let idle_timeout = config.idle_timeout.max(Duration::from_millis(1));
    let ping_every = config.ping_interval.max(Duration::from_millis(1));
    let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut idle => Err(SyncError::Subscription(format!(
                "no message for {}ms",
                idle_timeout.as_millis()
            ))),
            _ = ping.tick() => match sink.send(Message::Ping(Vec::new())).await {
                Ok(()) => continue,
                Err(e) => Err(SyncError::Subscription(format!("keepalive ping failed: {e}"))),
            },
            msg = stream.next() => {
                idle.as_mut().reset(Instant::now() + idle_timeout);
                match msg {
                    Some(Ok(Message::Text(text))) => match parse_notification(&text, &subscription_id) {
                        Some(Ok(header)) => Ok(header),
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "undecodable newHeads notification");
                            continue;
                        }
                        None => continue,
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(frame))) => Err(SyncError::Subscription(format!(
                        "websocket closed by peer: {frame:?}"
                    ))),
                    None => Err(SyncError::Subscription("websocket stream ended".into())),
                    Some(Err(e)) => Err(SyncError::Subscription(e.to_string())),
                    Some(Ok(_)) => continue,
                }
            }
        };

        let terminal = item.is_err();
        if tx.send(item).await.is_err() || terminal {
            break;
        }
    }

    // Best effort; the socket may already be gone or half-open.
    let request = RpcRequest::new("eth_unsubscribe", vec![Value::from(subscription_id.clone())]);
    let goodbye = async {
        if let Ok(body) = serde_json::to_string(&request) {
            let _ = sink.send(Message::Text(body)).await;
        }
        let _ = sink.close().await;
    };
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, goodbye).await;
    tracing::debug!(subscription = %subscription_id, "newHeads subscription closed");
}

/// Extract the header from an `eth_subscription` notification addressed to
/// `subscription_id`. Other messages yield `None`.
pub fn parse_notification(
    text: &str,
    subscription_id: &str,
) -> Option<Result<BlockHeader, TransportError>> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value["method"].as_str() != Some("eth_subscription") {
        return None;
    }
    let params = &value["params"];
    if params["subscription"].as_str() != Some(subscription_id) {
        return None;
    }
    Some(parse_header(&params["result"]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn notification(sub: &str, number: u64) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": sub,
                "result": {
                    "number": format!("{number:#x}"),
                    "hash": format!("0x{number:064x}"),
                    "parentHash": format!("0x{:064x}", number - 1),
                    "timestamp": "0x6500000c"
                }
            }
        })
        .to_string()
    }

    #[test]
    fn notification_for_other_subscription_is_ignored() {
        assert!(parse_notification(&notification("0xother", 5), "0xmine").is_none());
        assert!(parse_notification(r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#, "0xmine").is_none());
        assert!(parse_notification("not json", "0xmine").is_none());
    }

    #[test]
    fn notification_is_parsed() {
        let header = parse_notification(&notification("0xmine", 42), "0xmine")
            .unwrap()
            .unwrap();
        assert_eq!(header.number, 42);
        assert_eq!(header.timestamp, 0x6500000c);
    }

    /// A node that accepts one subscription, pushes `heads`, then records
    /// whether `eth_unsubscribe` arrives.
    async fn fake_node(heads: Vec<u64>) -> (String, Arc<AtomicBool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let unsubscribed = Arc::new(AtomicBool::new(false));
        let flag = unsubscribed.clone();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();

            let Some(Ok(Message::Text(req))) = ws.next().await else {
                return;
            };
            let req: Value = serde_json::from_str(&req).unwrap();
            assert_eq!(req["method"], "eth_subscribe");
            let reply = serde_json::json!({ "jsonrpc": "2.0", "id": req["id"], "result": "0xfeed" });
            ws.send(Message::Text(reply.to_string())).await.unwrap();

            ws.send(Message::Text(notification("0xdead", 1))).await.unwrap();
            for n in heads {
                ws.send(Message::Text(notification("0xfeed", n))).await.unwrap();
            }

            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let v: Value = serde_json::from_str(&text).unwrap();
                    if v["method"] == "eth_unsubscribe" && v["params"][0] == "0xfeed" {
                        flag.store(true, Ordering::SeqCst);
                    }
                }
            }
        });

        (url, unsubscribed)
    }

    #[tokio::test]
    async fn streams_headers_and_unsubscribes_on_drop() {
        let (url, unsubscribed) = fake_node(vec![100, 101]).await;
        let source = WsHeaderSource::new(url, WsConfig::default());

        let mut stream = source.subscribe().await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().number, 100);
        assert_eq!(stream.next().await.unwrap().unwrap().number, 101);
        drop(stream);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !unsubscribed.load(Ordering::SeqCst) {
            assert!(std::time::Instant::now() < deadline, "no eth_unsubscribe seen");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn silent_connection_ends_the_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let Some(Ok(Message::Text(req))) = ws.next().await else {
                return;
            };
            let req: Value = serde_json::from_str(&req).unwrap();
            let reply = serde_json::json!({ "jsonrpc": "2.0", "id": req["id"], "result": "0xfeed" });
            ws.send(Message::Text(reply.to_string())).await.unwrap();
            // Half-open: keep the socket but never write or read again.
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(ws);
        });

        let config = WsConfig {
            idle_timeout: Duration::from_millis(200),
            ping_interval: Duration::from_secs(10),
            ..WsConfig::default()
        };
        let mut stream = WsHeaderSource::new(url, config).subscribe().await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("idle connection was never detected");
        match next {
            Some(Err(SyncError::Subscription(reason))) => {
                assert!(reason.contains("no message"), "{reason}")
            }
            other => panic!("expected a subscription error, got {other:?}"),
        }
        let end = tokio::time::timeout(Duration::from_secs(5), stream.next()).await;
        assert!(matches!(end, Ok(None)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_subscription_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let source = WsHeaderSource::new(url, WsConfig::default());
        assert!(matches!(
            source.subscribe().await,
            Err(SyncError::Subscription(_))
        ));
    }
}
