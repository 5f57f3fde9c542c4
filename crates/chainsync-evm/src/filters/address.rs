//! Stops the chain for transactions that touch none of the watched addresses.

use async_trait::async_trait;
use std::collections::HashSet;

use chainsync_core::{BlockHeader, Filter, SyncError, Transaction, Verdict};

#[derive(Debug, Clone)]
pub struct AddressFilter {
    watched: HashSet<String>,
}

impl AddressFilter {
    /// Addresses are compared case-insensitively.
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            watched: addresses
                .into_iter()
                .map(|a| a.as_ref().trim().to_lowercase())
                .filter(|a| !a.is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.watched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    /// True when the sender, the recipient or any log emitter is watched.
    pub fn matches(&self, tx: &Transaction) -> bool {
        let watched = |addr: &str| self.watched.contains(&addr.to_lowercase());
        watched(&tx.from)
            || tx.to.as_deref().is_some_and(watched)
            || tx.logs.iter().any(|log| watched(&log.address))
    }
}

#[async_trait]
impl Filter for AddressFilter {
    async fn execute(&self, _header: &BlockHeader, tx: &Transaction) -> Result<Verdict, SyncError> {
        if self.matches(tx) {
            Ok(Verdict::Continue)
        } else {
            Ok(Verdict::Stop)
        }
    }

    fn name(&self) -> &str {
        "address"
    }
}
