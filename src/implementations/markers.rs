//! Per-account UI hints ("request sent", approved senders).
//!
//! Optimistic markers only. Contract state is always re-fetched and these are
//! never consulted as ground truth.

use std::sync::Arc;

use ethers::types::Address;
use tracing::warn;

use crate::{error::AppResult, storage::ProfileStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerList {
    SentRequests,
    ApprovedSenders,
}

impl MarkerList {
    fn prefix(self) -> &'static str {
        match self {
            MarkerList::SentRequests => "sent_requests",
            MarkerList::ApprovedSenders => "approved_senders",
        }
    }

    pub fn key(self, account: Address) -> String {
        format!("{}.{account:#x}", self.prefix())
    }
}

#[derive(Clone)]
pub struct AccountMarkers {
    store: Arc<dyn ProfileStore>,
}

impl AccountMarkers {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }

    pub fn list(&self, list: MarkerList, account: Address) -> Vec<Address> {
        let key = list.key(account);
        match self.store.get(&key) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!("ignoring unreadable marker list {key}: {err}");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("failed to read marker list {key}: {err}");
                Vec::new()
            }
        }
    }

    /// Returns false when the entry was already present.
    pub fn add(&self, list: MarkerList, account: Address, entry: Address) -> AppResult<bool> {
        let mut entries = self.list(list, account);
        if entries.contains(&entry) {
            return Ok(false);
        }
        entries.push(entry);
        self.store
            .set(&list.key(account), &serde_json::to_string(&entries)?)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn markers_are_namespaced_per_account() {
        let markers = AccountMarkers::new(Arc::new(MemoryStore::new()));
        let alice = Address::from_low_u64_be(1);
        let bob = Address::from_low_u64_be(2);
        let carol = Address::from_low_u64_be(3);

        assert!(markers.add(MarkerList::SentRequests, alice, carol).unwrap());
        assert!(!markers.add(MarkerList::SentRequests, alice, carol).unwrap());

        assert_eq!(markers.list(MarkerList::SentRequests, alice), vec![carol]);
        assert!(markers.list(MarkerList::SentRequests, bob).is_empty());
        assert!(markers.list(MarkerList::ApprovedSenders, alice).is_empty());
    }

    #[test]
    fn unreadable_list_reads_as_empty() {
        let store = Arc::new(MemoryStore::new());
        let account = Address::from_low_u64_be(1);
        store
            .set(&MarkerList::ApprovedSenders.key(account), "garbage")
            .unwrap();

        let markers = AccountMarkers::new(store);
        assert!(markers.list(MarkerList::ApprovedSenders, account).is_empty());
    }
}
