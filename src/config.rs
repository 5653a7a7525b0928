use crate::{
    chains::ChainId,
    error::{AppError, AppResult},
};
use dotenvy::dotenv;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::{env, fs, path::Path, path::PathBuf, str::FromStr};

const DEFAULT_CONFIG_PATH: &str = "Config.toml";
const DEFAULT_FUNDING_RPC_URL: &str = "https://ethereum-sepolia-rpc.publicnode.com";
const DEFAULT_FUNDING_CHAIN_ID: u64 = 11_155_111;
const DEFAULT_PROFILE_PATH: &str = "chatlink-profile.json";
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_RECHECK_DELAY_MS: u64 = 2_000;
const DEFAULT_MIN_SEND_BALANCE_ETH: &str = "0.0001";

/// Strongly-typed configuration derived from a `Config.toml` or environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Reliable endpoint used for balance reads and session-wallet sends.
    #[serde(default = "default_funding_rpc_url")]
    pub funding_rpc_url: String,
    #[serde(default = "default_funding_chain_id")]
    pub funding_chain_id: ChainId,
    /// JSON-RPC endpoint of the user's wallet (EIP-1193 methods over HTTP). None means no wallet.
    #[serde(default)]
    pub wallet_rpc_url: Option<String>,
    #[serde(default = "default_profile_path")]
    pub profile_path: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_recheck_delay_ms")]
    pub recheck_delay_ms: u64,
    #[serde(default = "default_min_send_balance")]
    pub min_send_balance_eth: Decimal,
    #[serde(default)]
    pub contracts: Vec<ContractEntry>,
}

/// Per-chain deployment addresses. Missing kinds stay unresolved for that chain.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractEntry {
    pub chain_id: ChainId,
    #[serde(default)]
    pub direct_message: Option<String>,
    #[serde(default)]
    pub group_chat: Option<String>,
}

fn default_funding_rpc_url() -> String {
    DEFAULT_FUNDING_RPC_URL.to_string()
}

fn default_funding_chain_id() -> ChainId {
    ChainId(DEFAULT_FUNDING_CHAIN_ID)
}

fn default_profile_path() -> PathBuf {
    PathBuf::from(DEFAULT_PROFILE_PATH)
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_recheck_delay_ms() -> u64 {
    DEFAULT_RECHECK_DELAY_MS
}

fn default_min_send_balance() -> Decimal {
    Decimal::from_str(DEFAULT_MIN_SEND_BALANCE_ETH).unwrap_or(Decimal::ZERO)
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            funding_rpc_url: default_funding_rpc_url(),
            funding_chain_id: default_funding_chain_id(),
            wallet_rpc_url: None,
            profile_path: default_profile_path(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            recheck_delay_ms: DEFAULT_RECHECK_DELAY_MS,
            min_send_balance_eth: default_min_send_balance(),
            contracts: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration, preferring a user-provided config file and falling back to env vars.
    pub fn load() -> AppResult<Self> {
        dotenv().ok();

        let configured_path =
            env::var("CHATLINK_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let config_path = Path::new(&configured_path);

        if config_path.exists() {
            let raw = fs::read_to_string(config_path)
                .map_err(|err| AppError::Config(format!("failed to read config file: {err}")))?;
            let cfg = Self::from_toml(&raw)?;
            return Ok(cfg);
        }

        Self::from_env()
    }

    pub fn from_toml(raw: &str) -> AppResult<Self> {
        let mut cfg: AppConfig = toml::from_str(raw)
            .map_err(|err| AppError::Config(format!("failed to parse config file: {err}")))?;
        cfg.apply_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Helper used when no config file is present.
    fn from_env() -> AppResult<Self> {
        let mut cfg = AppConfig::default();

        if let Ok(url) = env::var("FUNDING_RPC_URL") {
            cfg.funding_rpc_url = url;
        }
        if let Some(id) = env::var("FUNDING_CHAIN_ID")
            .ok()
            .and_then(|v| v.parse::<ChainId>().ok())
        {
            cfg.funding_chain_id = id;
        }
        cfg.wallet_rpc_url = env::var("WALLET_RPC_URL").ok().filter(|v| !v.is_empty());
        if let Ok(path) = env::var("PROFILE_PATH") {
            cfg.profile_path = PathBuf::from(path);
        }
        if let Some(ms) = env::var("POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            cfg.poll_interval_ms = ms;
        }
        if let Some(ms) = env::var("RECHECK_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            cfg.recheck_delay_ms = ms;
        }
        if let Ok(raw) = env::var("MIN_SEND_BALANCE_ETH") {
            cfg.min_send_balance_eth = Decimal::from_str(&raw).map_err(|err| {
                AppError::Config(format!("invalid MIN_SEND_BALANCE_ETH {raw}: {err}"))
            })?;
        }

        let direct_message = env::var("DIRECT_MESSAGE_CONTRACT").ok();
        let group_chat = env::var("GROUP_CHAT_CONTRACT").ok();
        if direct_message.is_some() || group_chat.is_some() {
            cfg.contracts.push(ContractEntry {
                chain_id: cfg.funding_chain_id,
                direct_message,
                group_chat,
            });
        }

        cfg.apply_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Zero intervals would spin the poller.
    fn apply_defaults(&mut self) {
        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = DEFAULT_POLL_INTERVAL_MS;
        }
        if self.funding_chain_id.0 == 0 {
            self.funding_chain_id = default_funding_chain_id();
        }
    }

    fn validate(&self) -> AppResult<()> {
        if self.funding_rpc_url.trim().is_empty() {
            return Err(AppError::Config("funding_rpc_url must not be empty".into()));
        }
        if self.min_send_balance_eth.is_sign_negative() {
            return Err(AppError::Config(
                "min_send_balance_eth must not be negative".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_defaults_fill_missing_fields() {
        let cfg = AppConfig::from_toml("wallet_rpc_url = \"http://127.0.0.1:1248\"").unwrap();
        assert_eq!(cfg.funding_rpc_url, DEFAULT_FUNDING_RPC_URL);
        assert_eq!(cfg.funding_chain_id, ChainId::SEPOLIA);
        assert_eq!(cfg.poll_interval_ms, 5_000);
        assert_eq!(cfg.min_send_balance_eth, Decimal::from_str("0.0001").unwrap());
        assert_eq!(cfg.wallet_rpc_url.as_deref(), Some("http://127.0.0.1:1248"));
    }

    #[test]
    fn toml_contract_entries() {
        let raw = r#"
            poll_interval_ms = 0

            [[contracts]]
            chain_id = "0xaa36a7"
            direct_message = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
        "#;
        let cfg = AppConfig::from_toml(raw).unwrap();
        assert_eq!(cfg.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(cfg.contracts.len(), 1);
        assert_eq!(cfg.contracts[0].chain_id, ChainId::SEPOLIA);
        assert!(cfg.contracts[0].group_chat.is_none());
    }

    #[test]
    fn rejects_negative_threshold() {
        let err = AppConfig::from_toml("min_send_balance_eth = \"-1\"").unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
