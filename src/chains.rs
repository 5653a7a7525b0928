//! Known networks and the testnet allow-list.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AppError, AppResult};

/// EVM chain id. Rendered as `0x`-prefixed hex, the way wallets report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(pub u64);

impl ChainId {
    pub const HARDHAT: ChainId = ChainId(0x7a69);
    pub const GOERLI: ChainId = ChainId(0x5);
    pub const MUMBAI: ChainId = ChainId(0x13881);
    pub const BSC_TESTNET: ChainId = ChainId(0x61);
    pub const SEPOLIA: ChainId = ChainId(0xaa36a7);

    pub const ETHEREUM: ChainId = ChainId(0x1);
    pub const BSC: ChainId = ChainId(0x38);
    pub const POLYGON: ChainId = ChainId(0x89);
    pub const FANTOM: ChainId = ChainId(0xfa);
    pub const AVALANCHE: ChainId = ChainId(0xa86a);

    pub fn to_hex(self) -> String {
        format!("{:#x}", self.0)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for ChainId {
    fn from(value: u64) -> Self {
        ChainId(value)
    }
}

impl FromStr for ChainId {
    type Err = AppError;

    /// Accepts `0x`-prefixed hex or plain decimal.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => trimmed.parse::<u64>(),
        };
        parsed
            .map(ChainId)
            .map_err(|_| AppError::InvalidInput(format!("invalid chain id: {raw}")))
    }
}

impl Serialize for ChainId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChainId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(ChainId(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Testnet,
    Mainnet,
}

#[derive(Debug, Clone, Copy)]
pub struct Network {
    pub chain_id: ChainId,
    pub name: &'static str,
    pub kind: NetworkKind,
}

const fn testnet(chain_id: ChainId, name: &'static str) -> Network {
    Network {
        chain_id,
        name,
        kind: NetworkKind::Testnet,
    }
}

const fn mainnet(chain_id: ChainId, name: &'static str) -> Network {
    Network {
        chain_id,
        name,
        kind: NetworkKind::Mainnet,
    }
}

pub const KNOWN_NETWORKS: &[Network] = &[
    testnet(ChainId::HARDHAT, "Hardhat"),
    testnet(ChainId::GOERLI, "Goerli"),
    testnet(ChainId::MUMBAI, "Mumbai"),
    testnet(ChainId::BSC_TESTNET, "BSC Testnet"),
    testnet(ChainId::SEPOLIA, "Sepolia"),
    mainnet(ChainId::ETHEREUM, "Ethereum Mainnet"),
    mainnet(ChainId::BSC, "BSC Mainnet"),
    mainnet(ChainId::POLYGON, "Polygon Mainnet"),
    mainnet(ChainId::FANTOM, "Fantom Mainnet"),
    mainnet(ChainId::AVALANCHE, "Avalanche Mainnet"),
];

pub fn lookup(chain_id: ChainId) -> Option<&'static Network> {
    KNOWN_NETWORKS.iter().find(|n| n.chain_id == chain_id)
}

/// Allow-list membership. Mainnets and unknown chains are never testnets.
pub fn is_testnet(chain_id: ChainId) -> bool {
    matches!(lookup(chain_id), Some(n) if n.kind == NetworkKind::Testnet)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Supported,
    UnsupportedMainnet,
    Unknown,
}

/// Human label for whatever chain the browser wallet is on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainLabel {
    pub chain_id: ChainId,
    pub name: String,
    pub status: ChainStatus,
}

impl ChainLabel {
    pub fn for_chain(chain_id: ChainId) -> Self {
        match lookup(chain_id) {
            Some(network) if network.kind == NetworkKind::Testnet => Self {
                chain_id,
                name: network.name.to_string(),
                status: ChainStatus::Supported,
            },
            Some(network) => Self {
                chain_id,
                name: format!("{} (Not Supported)", network.name),
                status: ChainStatus::UnsupportedMainnet,
            },
            None => Self {
                chain_id,
                name: "Unknown Network".to_string(),
                status: ChainStatus::Unknown,
            },
        }
    }

    pub fn is_usable(&self) -> bool {
        self.status == ChainStatus::Supported
    }
}

impl fmt::Display for ChainLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.chain_id)
    }
}

/// Parameters for `wallet_addEthereumChain` when the wallet does not know the default testnet.
pub struct ChainRegistration {
    pub chain_id: ChainId,
    pub chain_name: &'static str,
    pub currency_name: &'static str,
    pub currency_symbol: &'static str,
    pub decimals: u8,
    pub rpc_url: &'static str,
    pub explorer_url: &'static str,
}

pub const DEFAULT_TESTNET: ChainRegistration = ChainRegistration {
    chain_id: ChainId::SEPOLIA,
    chain_name: "Sepolia Test Network",
    currency_name: "Sepolia ETH",
    currency_symbol: "SEP",
    decimals: 18,
    rpc_url: "https://sepolia.infura.io/v3/",
    explorer_url: "https://sepolia.etherscan.io/",
};

impl ChainRegistration {
    pub fn to_params(&self) -> serde_json::Value {
        serde_json::json!({
            "chainId": self.chain_id.to_hex(),
            "chainName": self.chain_name,
            "nativeCurrency": {
                "name": self.currency_name,
                "symbol": self.currency_symbol,
                "decimals": self.decimals,
            },
            "rpcUrls": [self.rpc_url],
            "blockExplorerUrls": [self.explorer_url],
        })
    }
}

pub fn parse_chain_id(raw: &str) -> AppResult<ChainId> {
    raw.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_contains_only_testnets() {
        for id in [0x7a69, 0x5, 0x13881, 0x61, 0xaa36a7] {
            assert!(is_testnet(ChainId(id)), "{id:#x} should be allowed");
        }
        for id in [0x1, 0x38, 0x89, 0xfa, 0xa86a, 0x2105, 0] {
            assert!(!is_testnet(ChainId(id)), "{id:#x} should be rejected");
        }
    }

    #[test]
    fn mainnet_label_is_flagged_unsupported() {
        let label = ChainLabel::for_chain(ChainId::ETHEREUM);
        assert_eq!(label.name, "Ethereum Mainnet (Not Supported)");
        assert_eq!(label.status, ChainStatus::UnsupportedMainnet);
        assert!(!label.is_usable());
    }

    #[test]
    fn unknown_chain_label() {
        let label = ChainLabel::for_chain(ChainId(424242));
        assert_eq!(label.name, "Unknown Network");
        assert_eq!(label.status, ChainStatus::Unknown);
    }

    #[test]
    fn parses_hex_and_decimal() {
        assert_eq!(parse_chain_id("0xaa36a7").unwrap(), ChainId::SEPOLIA);
        assert_eq!(parse_chain_id("11155111").unwrap(), ChainId::SEPOLIA);
        assert!(parse_chain_id("sepolia").is_err());
        assert_eq!(ChainId::SEPOLIA.to_string(), "0xaa36a7");
    }

    #[test]
    fn chain_id_serde_accepts_both_forms() {
        let a: ChainId = serde_json::from_str("\"0x61\"").unwrap();
        let b: ChainId = serde_json::from_str("97").unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"0x61\"");
    }

    #[test]
    fn registration_params_shape() {
        let params = DEFAULT_TESTNET.to_params();
        assert_eq!(params["chainId"], "0xaa36a7");
        assert_eq!(params["nativeCurrency"]["symbol"], "SEP");
        assert_eq!(params["rpcUrls"][0], "https://sepolia.infura.io/v3/");
    }
}
