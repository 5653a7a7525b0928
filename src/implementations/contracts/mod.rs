//! Contract ABIs and the chain → address directory.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use ethers::{providers::Middleware, types::Address};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::{
    chains::{self, ChainId},
    config::ContractEntry,
    error::{AppError, AppResult},
};

pub mod direct;
pub mod group;

pub use direct::DirectMessenger;
pub use group::GroupChat;

// First two deployments from the default Hardhat account.
pub static HARDHAT_DIRECT_MESSAGE: Lazy<Address> =
    Lazy::new(|| Address::from_str("0x5FbDB2315678afecb367f032d93F642f64180aa3").unwrap());
pub static HARDHAT_GROUP_CHAT: Lazy<Address> =
    Lazy::new(|| Address::from_str("0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractKind {
    DirectMessage,
    GroupChat,
}

impl fmt::Display for ContractKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractKind::DirectMessage => write!(f, "direct-message"),
            ContractKind::GroupChat => write!(f, "group-chat"),
        }
    }
}

/// Static table of deployments. Only allow-listed testnets can have entries.
#[derive(Debug, Clone, Default)]
pub struct ContractDirectory {
    entries: HashMap<(ChainId, ContractKind), Address>,
}

impl ContractDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut directory = Self::new();
        directory.entries.insert(
            (ChainId::HARDHAT, ContractKind::DirectMessage),
            *HARDHAT_DIRECT_MESSAGE,
        );
        directory
            .entries
            .insert((ChainId::HARDHAT, ContractKind::GroupChat), *HARDHAT_GROUP_CHAT);
        directory
    }

    /// Defaults plus configured deployments.
    pub fn from_entries(entries: &[ContractEntry]) -> AppResult<Self> {
        let mut directory = Self::with_defaults();
        for entry in entries {
            if let Some(raw) = &entry.direct_message {
                directory.insert(entry.chain_id, ContractKind::DirectMessage, parse_address(raw)?)?;
            }
            if let Some(raw) = &entry.group_chat {
                directory.insert(entry.chain_id, ContractKind::GroupChat, parse_address(raw)?)?;
            }
        }
        Ok(directory)
    }

    pub fn insert(&mut self, chain: ChainId, kind: ContractKind, address: Address) -> AppResult<()> {
        if !chains::is_testnet(chain) {
            return Err(AppError::Config(format!(
                "refusing {kind} deployment on {chain}: not an allow-listed testnet"
            )));
        }
        self.entries.insert((chain, kind), address);
        Ok(())
    }

    pub fn resolve(&self, chain: ChainId, kind: ContractKind) -> AppResult<Address> {
        if !chains::is_testnet(chain) {
            return Err(AppError::WrongNetwork(format!("{chain} is not a supported testnet")));
        }
        self.entries.get(&(chain, kind)).copied().ok_or_else(|| {
            AppError::WrongNetwork(format!("no {kind} contract deployed on {chain}"))
        })
    }
}

/// Which wallet signs calls made through a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerPath {
    Session,
    Browser,
}

/// A signer bound to one contract address on one chain. Built per call.
#[derive(Debug)]
pub struct Binding<M> {
    pub kind: ContractKind,
    pub signer: SignerPath,
    pub chain: ChainId,
    pub address: Address,
    pub account: Address,
    pub client: Arc<M>,
}

impl<M> Binding<M>
where
    M: Middleware + 'static,
{
    pub fn direct(&self) -> AppResult<DirectMessenger<M>> {
        self.expect_kind(ContractKind::DirectMessage)?;
        Ok(DirectMessenger::new(self.address, self.client.clone()))
    }

    pub fn group(&self) -> AppResult<GroupChat<M>> {
        self.expect_kind(ContractKind::GroupChat)?;
        Ok(GroupChat::new(self.address, self.client.clone()))
    }

    fn expect_kind(&self, kind: ContractKind) -> AppResult<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(AppError::Internal(format!(
                "binding is for the {} contract, not {kind}",
                self.kind
            )))
        }
    }
}

fn parse_address(raw: &str) -> AppResult<Address> {
    raw.parse::<Address>()
        .map_err(|_| AppError::Config(format!("invalid contract address: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_hardhat_defaults() {
        let directory = ContractDirectory::with_defaults();
        assert_eq!(
            directory
                .resolve(ChainId::HARDHAT, ContractKind::GroupChat)
                .unwrap(),
            *HARDHAT_GROUP_CHAT
        );
    }

    #[test]
    fn unresolved_address_is_hard_failure() {
        let directory = ContractDirectory::with_defaults();
        let err = directory
            .resolve(ChainId::SEPOLIA, ContractKind::DirectMessage)
            .unwrap_err();
        assert!(matches!(err, AppError::WrongNetwork(_)));
    }

    #[test]
    fn mainnet_entries_are_rejected() {
        let entries = vec![ContractEntry {
            chain_id: ChainId::ETHEREUM,
            direct_message: Some("0x5FbDB2315678afecb367f032d93F642f64180aa3".into()),
            group_chat: None,
        }];
        assert!(matches!(
            ContractDirectory::from_entries(&entries).unwrap_err(),
            AppError::Config(_)
        ));
    }

    #[test]
    fn configured_entries_extend_defaults() {
        let entries = vec![ContractEntry {
            chain_id: ChainId::SEPOLIA,
            direct_message: None,
            group_chat: Some("0x00000000000000000000000000000000000000aa".into()),
        }];
        let directory = ContractDirectory::from_entries(&entries).unwrap();
        assert_eq!(
            directory
                .resolve(ChainId::SEPOLIA, ContractKind::GroupChat)
                .unwrap(),
            Address::from_low_u64_be(0xaa)
        );
        assert!(directory
            .resolve(ChainId::SEPOLIA, ContractKind::DirectMessage)
            .is_err());
    }
}
