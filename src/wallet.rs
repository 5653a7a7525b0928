use std::{str::FromStr, sync::Arc};

use ethers::{
    signers::{LocalWallet, Signer},
    types::Address,
};
use tracing::{debug, warn};

use crate::{error::AppResult, storage::ProfileStore};

const SESSION_KEY_SLOT: &str = "session_wallet.key";
const SESSION_VERIFIED_SLOT: &str = "session_wallet.verified";

/// Where the profile's session wallet is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uncreated,
    Created,
    Verified,
}

/// Persists the auto-signing session wallet for one profile.
///
/// Only the private key leaves memory, and only into the profile store. The
/// verified flag lives in its own slot and is never cleared by a balance drop.
#[derive(Clone)]
pub struct SessionWalletStore {
    store: Arc<dyn ProfileStore>,
}

impl SessionWalletStore {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }

    /// Fresh random keypair. Not persisted.
    pub fn generate() -> LocalWallet {
        LocalWallet::new(&mut rand::thread_rng())
    }

    /// Overwrites any previously stored key.
    pub fn save(&self, wallet: &LocalWallet) -> AppResult<()> {
        let key = format!("0x{}", hex::encode(wallet.signer().to_bytes()));
        self.store.set(SESSION_KEY_SLOT, &key)?;
        debug!(address = ?wallet.address(), "session wallet saved");
        Ok(())
    }

    /// Rebuilds the stored wallet. Missing or unreadable key material is `None`.
    pub fn load(&self) -> Option<LocalWallet> {
        let raw = match self.store.get(SESSION_KEY_SLOT) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!("failed to read session wallet slot: {err}");
                return None;
            }
        };

        let trimmed = raw.trim().trim_start_matches("0x");
        match LocalWallet::from_str(trimmed) {
            Ok(wallet) => Some(wallet),
            Err(err) => {
                warn!("stored session wallet key is unreadable: {err}");
                None
            }
        }
    }

    pub fn address(&self) -> Option<Address> {
        self.load().map(|wallet| wallet.address())
    }

    pub fn exists(&self) -> bool {
        self.store.contains(SESSION_KEY_SLOT).unwrap_or(false)
    }

    pub fn is_verified(&self) -> bool {
        matches!(self.store.get(SESSION_VERIFIED_SLOT), Ok(Some(v)) if v == "true")
    }

    /// Callers must only invoke this after observing a positive balance.
    pub fn mark_verified(&self) -> AppResult<()> {
        self.store.set(SESSION_VERIFIED_SLOT, "true")
    }

    pub fn clear(&self) -> AppResult<()> {
        self.store.remove(&[SESSION_KEY_SLOT, SESSION_VERIFIED_SLOT])
    }

    pub fn state(&self) -> SessionState {
        match (self.exists(), self.is_verified()) {
            (false, _) => SessionState::Uncreated,
            (true, false) => SessionState::Created,
            (true, true) => SessionState::Verified,
        }
    }

    #[cfg(test)]
    pub(crate) fn write_raw_key(&self, raw: &str) -> AppResult<()> {
        self.store.set(SESSION_KEY_SLOT, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn store() -> SessionWalletStore {
        SessionWalletStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn save_then_load_keeps_address() {
        let store = store();
        let wallet = SessionWalletStore::generate();
        store.save(&wallet).unwrap();

        let loaded = store.load().expect("stored wallet");
        assert_eq!(loaded.address(), wallet.address());
        assert_eq!(store.address(), Some(wallet.address()));
    }

    #[test]
    fn generate_does_not_persist() {
        let store = store();
        let _ = SessionWalletStore::generate();
        assert!(!store.exists());
        assert!(store.load().is_none());
    }

    #[test]
    fn save_overwrites_previous_key() {
        let store = store();
        let first = SessionWalletStore::generate();
        let second = SessionWalletStore::generate();
        store.save(&first).unwrap();
        store.save(&second).unwrap();
        assert_eq!(store.address(), Some(second.address()));
    }

    #[test]
    fn clear_resets_both_flags() {
        let store = store();
        store.save(&SessionWalletStore::generate()).unwrap();
        store.mark_verified().unwrap();
        assert_eq!(store.state(), SessionState::Verified);

        store.clear().unwrap();
        assert!(!store.exists());
        assert!(!store.is_verified());
        assert_eq!(store.state(), SessionState::Uncreated);
    }

    #[test]
    fn mark_verified_is_idempotent() {
        let store = store();
        store.mark_verified().unwrap();
        store.mark_verified().unwrap();
        assert!(store.is_verified());
    }

    #[test]
    fn corrupt_key_loads_as_absent() {
        let store = store();
        store.write_raw_key("0xnot-a-key").unwrap();
        assert!(store.exists());
        assert!(store.load().is_none());
    }

    #[test]
    fn known_key_round_trips() {
        let store = store();
        let wallet: LocalWallet =
            "0x59c6995e998f97a5a0044966f0945382d0b7adf99019cba46777e1fbbf3a1b02"
                .parse()
                .unwrap();
        store.save(&wallet).unwrap();
        assert_eq!(store.load().unwrap().address(), wallet.address());
    }
}
