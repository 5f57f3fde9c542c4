//! Event sinks: where filters publish decoded chain events.
//!
//! Delivery is at-least-once. A block can be processed more than once, so a
//! sink sees the same [`ChainEvent::id`] again and is expected to absorb it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use chainsync_core::SyncError;

/// A decoded event, ready for downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    /// Stable identity: `tx_hash:log_index`.
    pub id: String,
    pub kind: String,
    pub block_number: u64,
    pub block_hash: String,
    pub timestamp: u64,
    pub tx_hash: String,
    pub log_index: u32,
    /// Emitting contract, lowercase.
    pub contract: String,
    /// Decoded fields (e.g. `from`, `to`, `value`).
    pub fields: HashMap<String, String>,
}

impl ChainEvent {
    pub fn event_id(tx_hash: &str, log_index: u32) -> String {
        format!("{}:{log_index}", tx_hash.to_lowercase())
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &ChainEvent) -> Result<(), SyncError>;

    fn name(&self) -> &str;
}

// ─── LogSink ──────────────────────────────────────────────────────────────────

/// Writes each event as a structured `info` line.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, event: &ChainEvent) -> Result<(), SyncError> {
        let fields = serde_json::to_string(&event.fields).unwrap_or_default();
        tracing::info!(
            id = %event.id,
            kind = %event.kind,
            block = event.block_number,
            contract = %event.contract,
            fields = %fields,
            "chain event"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

// ─── ChannelSink ──────────────────────────────────────────────────────────────

/// Forwards events to an in-process consumer. Applies backpressure when the
/// channel is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ChainEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ChainEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn publish(&self, event: &ChainEvent) -> Result<(), SyncError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| SyncError::Other("event channel closed".into()))
    }

    fn name(&self) -> &str {
        "channel"
    }
}

// ─── MemorySink ───────────────────────────────────────────────────────────────

/// Keeps one copy of every event, keyed by id. Useful in tests and as the
/// reference for how a durable sink should deduplicate.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<HashMap<String, ChainEvent>>,
    duplicates: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events seen again after their first delivery.
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Stored events ordered by block, then log index.
    pub fn events(&self) -> Vec<ChainEvent> {
        let mut events: Vec<_> = self
            .events
            .lock()
            .map(|e| e.values().cloned().collect())
            .unwrap_or_default();
        events.sort_by_key(|e| (e.block_number, e.log_index));
        events
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, event: &ChainEvent) -> Result<(), SyncError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| SyncError::Other("memory sink lock poisoned".into()))?;
        if events.contains_key(&event.id) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
