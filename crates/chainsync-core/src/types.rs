//! Shared types for the sync pipeline.

use serde::{Deserialize, Serialize};

// ─── BlockHeader ──────────────────────────────────────────────────────────────

/// A minimal block header: what the live subscription delivers and what
/// filters receive as context for every transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: u64,
}

// ─── Transaction ──────────────────────────────────────────────────────────────

/// A log emitted by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    /// Emitting contract address.
    pub address: String,
    /// Indexed topics; `topics[0]` is the event signature hash.
    pub topics: Vec<String>,
    /// Non-indexed data (`0x…`).
    pub data: String,
    /// Position of the log within the block.
    pub log_index: u32,
}

/// A transaction together with its receipt data.
///
/// The engine never looks inside; interpretation belongs to the filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    /// `None` for contract creations.
    pub to: Option<String>,
    /// Wei value as a `0x` hex quantity.
    pub value: String,
    pub input: String,
    /// Position within the block.
    pub index: u32,
    /// Receipt status: `true` when the transaction succeeded.
    pub success: bool,
    pub logs: Vec<Log>,
}

// ─── FetchedBlock ─────────────────────────────────────────────────────────────

/// A block as returned by a [`BlockFetcher`](crate::fetcher::BlockFetcher).
/// Lives for exactly one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBlock {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl FetchedBlock {
    pub fn number(&self) -> u64 {
        self.header.number
    }
}

/// Parse a hex quantity (with or without `0x`) into a `u64`.
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}
