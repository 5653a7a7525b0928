//! Adapter over the user's wallet (EIP-1193 request semantics).
//!
//! The wallet is reached through an ethers `Provider`, so any transport works:
//! an HTTP endpoint exposed by a desktop wallet in production, `MockProvider`
//! in tests. Signing on this path is done by the wallet itself via
//! `eth_sendTransaction`.

use std::sync::Arc;

use ethers::{
    providers::{JsonRpcClient, Middleware, Provider, ProviderError, RpcError},
    types::Address,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    chains::{ChainId, ChainRegistration},
    error::{AppError, AppResult},
};

/// EIP-1193: user rejected the request.
pub const USER_REJECTED: i64 = 4001;
/// Wallet does not know the requested chain.
pub const UNRECOGNIZED_CHAIN: i64 = 4902;

const EVENT_BUFFER: usize = 16;

/// Mirrors the wallet's `accountsChanged` / `chainChanged` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "value", rename_all = "camelCase")]
pub enum WalletEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(ChainId),
}

#[derive(Debug, Default)]
struct Observed {
    chain: Option<ChainId>,
    accounts: Option<Vec<Address>>,
}

pub struct BrowserWallet<P> {
    provider: Arc<Provider<P>>,
    observed: Arc<Mutex<Observed>>,
    events: broadcast::Sender<WalletEvent>,
}

impl<P> Clone for BrowserWallet<P> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            observed: self.observed.clone(),
            events: self.events.clone(),
        }
    }
}

impl<P> BrowserWallet<P>
where
    P: JsonRpcClient + Clone + 'static,
{
    pub fn new(provider: Provider<P>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            provider: Arc::new(provider),
            observed: Arc::new(Mutex::new(Observed::default())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    /// `eth_chainId`
    pub async fn chain_id(&self) -> AppResult<ChainId> {
        let raw = self
            .provider
            .get_chainid()
            .await
            .map_err(|err| wallet_error("eth_chainId", err))?;
        let chain = ChainId(raw.low_u64());
        self.observe_chain(chain);
        Ok(chain)
    }

    /// `eth_accounts`: connected accounts without prompting.
    pub async fn accounts(&self) -> AppResult<Vec<Address>> {
        let accounts: Vec<Address> = self
            .provider
            .request("eth_accounts", ())
            .await
            .map_err(|err| wallet_error("eth_accounts", err))?;
        self.observe_accounts(&accounts);
        Ok(accounts)
    }

    /// `eth_requestAccounts`: may prompt the user. Returns the active account.
    pub async fn request_account(&self) -> AppResult<Address> {
        let accounts: Vec<Address> = self
            .provider
            .request("eth_requestAccounts", ())
            .await
            .map_err(|err| wallet_error("eth_requestAccounts", err))?;
        self.observe_accounts(&accounts);
        accounts
            .first()
            .copied()
            .ok_or_else(|| AppError::Wallet("wallet returned no accounts".into()))
    }

    /// `wallet_switchEthereumChain`
    pub async fn switch_chain(&self, chain: ChainId) -> AppResult<()> {
        let _: Value = self
            .provider
            .request(
                "wallet_switchEthereumChain",
                [json!({ "chainId": chain.to_hex() })],
            )
            .await
            .map_err(|err| wallet_error("wallet_switchEthereumChain", err))?;
        info!("wallet switched to {chain}");
        self.observe_chain(chain);
        Ok(())
    }

    /// `wallet_addEthereumChain`
    pub async fn add_chain(&self, registration: &ChainRegistration) -> AppResult<()> {
        let _: Value = self
            .provider
            .request("wallet_addEthereumChain", [registration.to_params()])
            .await
            .map_err(|err| wallet_error("wallet_addEthereumChain", err))?;
        info!("wallet registered {}", registration.chain_name);
        Ok(())
    }

    /// Client whose sends are signed by the wallet on behalf of `account`.
    pub fn signer_client(&self, account: Address) -> Provider<P> {
        self.provider.as_ref().clone().with_sender(account)
    }

    fn observe_chain(&self, chain: ChainId) {
        let mut observed = self.observed.lock();
        if observed.chain != Some(chain) {
            if observed.chain.is_some() {
                debug!("wallet chain changed to {chain}");
                let _ = self.events.send(WalletEvent::ChainChanged(chain));
            }
            observed.chain = Some(chain);
        }
    }

    fn observe_accounts(&self, accounts: &[Address]) {
        let mut observed = self.observed.lock();
        if observed.accounts.as_deref() != Some(accounts) {
            if observed.accounts.is_some() {
                debug!("wallet accounts changed");
                let _ = self.events.send(WalletEvent::AccountsChanged(accounts.to_vec()));
            }
            observed.accounts = Some(accounts.to_vec());
        }
    }
}

/// JSON-RPC error code carried by a provider error, if any.
pub fn rpc_error_code(err: &ProviderError) -> Option<i64> {
    err.as_error_response().map(|resp| resp.code)
}

fn wallet_error(method: &str, err: ProviderError) -> AppError {
    match rpc_error_code(&err) {
        Some(USER_REJECTED) => AppError::UserRejected(format!("{method}: {err}")),
        Some(UNRECOGNIZED_CHAIN) => AppError::WrongNetwork(format!("{method}: {err}")),
        _ => AppError::Rpc(format!("{method}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::{JsonRpcError, MockProvider, MockResponse};

    fn rejected() -> MockResponse {
        MockResponse::Error(JsonRpcError {
            code: USER_REJECTED,
            message: "User rejected the request.".into(),
            data: None,
        })
    }

    #[tokio::test]
    async fn chain_id_parses_hex_response() {
        let (provider, mock) = Provider::mocked();
        mock.push::<String, _>("0xaa36a7".to_string()).unwrap();

        let wallet = BrowserWallet::new(provider);
        assert_eq!(wallet.chain_id().await.unwrap(), ChainId::SEPOLIA);
    }

    #[tokio::test]
    async fn rejected_account_request_is_user_rejection() {
        let (provider, mock) = Provider::<MockProvider>::mocked();
        mock.push_response(rejected());

        let wallet = BrowserWallet::new(provider);
        let err = wallet.request_account().await.unwrap_err();
        assert!(matches!(err, AppError::UserRejected(_)));
    }

    #[tokio::test]
    async fn empty_account_list_is_wallet_error() {
        let (provider, mock) = Provider::mocked();
        mock.push::<Vec<Address>, _>(Vec::new()).unwrap();

        let wallet = BrowserWallet::new(provider);
        let err = wallet.request_account().await.unwrap_err();
        assert!(matches!(err, AppError::Wallet(_)));
    }

    #[tokio::test]
    async fn chain_change_is_broadcast_after_first_observation() {
        let (provider, mock) = Provider::mocked();
        // Responses are consumed in reverse order.
        mock.push::<String, _>("0xaa36a7".to_string()).unwrap();
        mock.push::<String, _>("0x1".to_string()).unwrap();

        let wallet = BrowserWallet::new(provider);
        let mut events = wallet.subscribe();

        wallet.chain_id().await.unwrap();
        assert!(events.try_recv().is_err(), "first observation is not a change");

        wallet.chain_id().await.unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            WalletEvent::ChainChanged(ChainId::SEPOLIA)
        );
    }
}
