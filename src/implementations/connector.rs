//! Chooses the signer for every contract call.
//!
//! A verified session wallet signs without prompting. Anything that keeps it
//! from being used is a `SessionUnavailable` reason, and the connector moves
//! on to the browser wallet. The browser path never binds on a chain outside
//! the testnet allow-list: it switches once or aborts.

use std::{fmt, sync::Arc};

use ethers::{
    middleware::SignerMiddleware,
    providers::{JsonRpcClient, Provider},
    signers::{LocalWallet, Signer},
    types::{Address, U256},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    chains::{ChainId, ChainLabel},
    error::{AppError, AppResult},
    implementations::{
        balance::{self, format_with_decimals},
        contracts::{Binding, ContractDirectory, ContractKind, SignerPath},
        network::NetworkGuard,
    },
    wallet::SessionWalletStore,
};

pub type SessionClient<F> = SignerMiddleware<Provider<F>, LocalWallet>;

/// A binding plus the path that produced it.
#[derive(Debug)]
pub enum Connection<P, F> {
    Session(Binding<SessionClient<F>>),
    Browser(Binding<Provider<P>>),
}

impl<P, F> Connection<P, F> {
    pub fn is_session(&self) -> bool {
        matches!(self, Connection::Session(_))
    }

    pub fn account(&self) -> Address {
        match self {
            Connection::Session(b) => b.account,
            Connection::Browser(b) => b.account,
        }
    }

    pub fn chain(&self) -> ChainId {
        match self {
            Connection::Session(b) => b.chain,
            Connection::Browser(b) => b.chain,
        }
    }

    pub fn address(&self) -> Address {
        match self {
            Connection::Session(b) => b.address,
            Connection::Browser(b) => b.address,
        }
    }

    pub fn signer_path(&self) -> SignerPath {
        match self {
            Connection::Session(b) => b.signer,
            Connection::Browser(b) => b.signer,
        }
    }
}

/// Why the session wallet was not used for a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUnavailable {
    NotCreated,
    NotVerified,
    KeyUnreadable,
    ChainRead(String),
    ChainUnsupported(ChainId),
    ChainMismatch { active: ChainId, funding: ChainId },
    NoAddress(ChainId),
    BalanceRead(String),
    Underfunded { balance: U256, required: U256 },
}

impl fmt::Display for SessionUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionUnavailable::NotCreated => write!(f, "no session wallet"),
            SessionUnavailable::NotVerified => write!(f, "session wallet not verified"),
            SessionUnavailable::KeyUnreadable => write!(f, "stored session key is unreadable"),
            SessionUnavailable::ChainRead(err) => write!(f, "could not read active chain: {err}"),
            SessionUnavailable::ChainUnsupported(chain) => {
                write!(f, "active chain {chain} is not a testnet")
            }
            SessionUnavailable::ChainMismatch { active, funding } => {
                write!(f, "active chain {active} differs from funding chain {funding}")
            }
            SessionUnavailable::NoAddress(chain) => write!(f, "no contract on {chain}"),
            SessionUnavailable::BalanceRead(err) => write!(f, "balance read failed: {err}"),
            SessionUnavailable::Underfunded { balance, required } => write!(
                f,
                "balance {} ETH below {} ETH",
                format_with_decimals(balance, 18),
                format_with_decimals(required, 18)
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectorSettings {
    pub funding_chain: ChainId,
    /// Minimum balance for the session wallet to be picked for a send.
    pub min_send_balance: U256,
}

enum BrowserStep<P> {
    Bound(Binding<Provider<P>>),
    WrongChain(ChainId),
}

pub struct Connector<P, F> {
    guard: NetworkGuard<P>,
    sessions: SessionWalletStore,
    funding: Arc<Provider<F>>,
    directory: Arc<ContractDirectory>,
    settings: ConnectorSettings,
}

impl<P, F> Connector<P, F>
where
    P: JsonRpcClient + Clone + 'static,
    F: JsonRpcClient + Clone + 'static,
{
    pub fn new(
        guard: NetworkGuard<P>,
        sessions: SessionWalletStore,
        funding: Arc<Provider<F>>,
        directory: Arc<ContractDirectory>,
        settings: ConnectorSettings,
    ) -> Self {
        Self {
            guard,
            sessions,
            funding,
            directory,
            settings,
        }
    }

    pub fn guard(&self) -> &NetworkGuard<P> {
        &self.guard
    }

    pub fn funding(&self) -> Arc<Provider<F>> {
        self.funding.clone()
    }

    pub fn settings(&self) -> ConnectorSettings {
        self.settings
    }

    /// Bind for a read.
    pub async fn connect(&self, kind: ContractKind) -> AppResult<Connection<P, F>> {
        self.connect_with(kind, false).await
    }

    /// Bind for a transaction. The session wallet is only chosen when it can pay for gas.
    pub async fn connect_for_send(&self, kind: ContractKind) -> AppResult<Connection<P, F>> {
        self.connect_with(kind, true).await
    }

    #[instrument(skip(self), fields(kind = %kind))]
    async fn connect_with(&self, kind: ContractKind, sending: bool) -> AppResult<Connection<P, F>> {
        let mut switched = false;

        loop {
            match self.session_binding(kind, sending).await {
                Ok(binding) => {
                    debug!(account = ?binding.account, chain = %binding.chain, "using session wallet");
                    return Ok(Connection::Session(binding));
                }
                Err(reason @ (SessionUnavailable::NotCreated | SessionUnavailable::NotVerified)) => {
                    debug!("session wallet skipped: {reason}");
                }
                Err(reason) => warn!("session wallet unavailable, using browser wallet: {reason}"),
            }

            match self.browser_step(kind).await? {
                BrowserStep::Bound(binding) => {
                    debug!(account = ?binding.account, chain = %binding.chain, "using browser wallet");
                    return Ok(Connection::Browser(binding));
                }
                BrowserStep::WrongChain(chain) if !switched => {
                    warn!(
                        "{} detected, switching to {}",
                        ChainLabel::for_chain(chain),
                        ChainLabel::for_chain(self.guard.default_testnet())
                    );
                    self.guard.switch_to_testnet().await?;
                    switched = true;
                }
                BrowserStep::WrongChain(chain) => {
                    return Err(AppError::WrongNetwork(format!(
                        "wallet is still on {} after switching; only testnets are supported",
                        ChainLabel::for_chain(chain)
                    )));
                }
            }
        }
    }

    /// Session-wallet path. Every failure is a reason to fall back, never an error.
    pub async fn session_binding(
        &self,
        kind: ContractKind,
        sending: bool,
    ) -> Result<Binding<SessionClient<F>>, SessionUnavailable> {
        if !self.sessions.exists() {
            return Err(SessionUnavailable::NotCreated);
        }
        if !self.sessions.is_verified() {
            return Err(SessionUnavailable::NotVerified);
        }
        let wallet = self
            .sessions
            .load()
            .ok_or(SessionUnavailable::KeyUnreadable)?;

        let funding = self.settings.funding_chain;
        let chain = match self.guard.wallet() {
            Some(browser) => browser
                .chain_id()
                .await
                .map_err(|err| SessionUnavailable::ChainRead(err.to_string()))?,
            None => funding,
        };
        if !NetworkGuard::<P>::is_testnet(chain) {
            return Err(SessionUnavailable::ChainUnsupported(chain));
        }
        if chain != funding {
            return Err(SessionUnavailable::ChainMismatch {
                active: chain,
                funding,
            });
        }
        let address = self
            .directory
            .resolve(chain, kind)
            .map_err(|_| SessionUnavailable::NoAddress(chain))?;

        let account = wallet.address();
        if sending {
            let balance = balance::check_balance(self.funding.clone(), account)
                .await
                .map_err(|err| SessionUnavailable::BalanceRead(err.to_string()))?;
            let required = self.settings.min_send_balance;
            if balance < required {
                return Err(SessionUnavailable::Underfunded { balance, required });
            }
        }

        let signer = wallet.with_chain_id(funding.0);
        let client = SignerMiddleware::new(self.funding.as_ref().clone(), signer);
        Ok(Binding {
            kind,
            signer: SignerPath::Session,
            chain,
            address,
            account,
            client: Arc::new(client),
        })
    }

    async fn browser_step(&self, kind: ContractKind) -> AppResult<BrowserStep<P>> {
        let wallet = self.guard.require_wallet()?;
        let account = wallet.request_account().await?;
        let chain = wallet.chain_id().await?;

        if !NetworkGuard::<P>::is_testnet(chain) {
            return Ok(BrowserStep::WrongChain(chain));
        }

        let address = self.directory.resolve(chain, kind)?;
        info!(chain = %chain, contract = ?address, "bound {kind} contract through browser wallet");
        Ok(BrowserStep::Bound(Binding {
            kind,
            signer: SignerPath::Browser,
            chain,
            address,
            account,
            client: Arc::new(wallet.signer_client(account)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        implementations::browser::BrowserWallet,
        storage::MemoryStore,
    };
    use ethers::providers::{JsonRpcError, MockProvider, MockResponse};
    use serde_json::{Value, json};

    const ACCOUNT: u64 = 0xa11ce;

    fn directory() -> Arc<ContractDirectory> {
        let mut directory = ContractDirectory::with_defaults();
        directory
            .insert(
                ChainId::SEPOLIA,
                ContractKind::DirectMessage,
                Address::from_low_u64_be(0xd1),
            )
            .unwrap();
        Arc::new(directory)
    }

    struct Fixture {
        connector: Connector<MockProvider, MockProvider>,
        sessions: SessionWalletStore,
        wallet_mock: Option<MockProvider>,
        funding_mock: MockProvider,
    }

    fn fixture(with_wallet: bool, funding_chain: ChainId) -> Fixture {
        let sessions = SessionWalletStore::new(Arc::new(MemoryStore::new()));
        let (funding, funding_mock) = Provider::mocked();
        let (browser, wallet_mock) = if with_wallet {
            let (provider, mock) = Provider::mocked();
            (Some(BrowserWallet::new(provider)), Some(mock))
        } else {
            (None, None)
        };
        let connector = Connector::new(
            NetworkGuard::new(browser),
            sessions.clone(),
            Arc::new(funding),
            directory(),
            ConnectorSettings {
                funding_chain,
                min_send_balance: U256::from(100_000_000_000_000u64),
            },
        );
        Fixture {
            connector,
            sessions,
            wallet_mock,
            funding_mock,
        }
    }

    fn verified_session(sessions: &SessionWalletStore) -> Address {
        let wallet = SessionWalletStore::generate();
        sessions.save(&wallet).unwrap();
        sessions.mark_verified().unwrap();
        wallet.address()
    }

    fn push_browser_connect(mock: &MockProvider, chain: &str) {
        // Responses are consumed in reverse order: accounts, then chain.
        mock.push::<String, _>(chain.to_string()).unwrap();
        mock.push::<Vec<Address>, _>(vec![Address::from_low_u64_be(ACCOUNT)])
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_profile_goes_straight_to_browser_wallet() {
        let fx = fixture(true, ChainId::SEPOLIA);
        let mock = fx.wallet_mock.as_ref().unwrap();
        push_browser_connect(mock, "0xaa36a7");

        let conn = fx.connector.connect(ContractKind::DirectMessage).await.unwrap();
        assert!(!conn.is_session());
        assert_eq!(conn.account(), Address::from_low_u64_be(ACCOUNT));
        assert_eq!(conn.address(), Address::from_low_u64_be(0xd1));

        mock.assert_request("eth_requestAccounts", ()).unwrap();
        mock.assert_request("eth_chainId", ()).unwrap();
    }

    #[tokio::test]
    async fn verified_session_wallet_is_preferred() {
        let fx = fixture(false, ChainId::SEPOLIA);
        let session = verified_session(&fx.sessions);

        let conn = fx.connector.connect(ContractKind::DirectMessage).await.unwrap();
        assert!(conn.is_session());
        assert_eq!(conn.account(), session);
        assert_eq!(conn.chain(), ChainId::SEPOLIA);
    }

    #[tokio::test]
    async fn unverified_session_wallet_is_skipped() {
        let fx = fixture(true, ChainId::SEPOLIA);
        fx.sessions.save(&SessionWalletStore::generate()).unwrap();
        push_browser_connect(fx.wallet_mock.as_ref().unwrap(), "0xaa36a7");

        let conn = fx.connector.connect(ContractKind::DirectMessage).await.unwrap();
        assert!(!conn.is_session());
    }

    #[tokio::test]
    async fn unreadable_key_falls_back_to_browser_wallet() {
        let fx = fixture(true, ChainId::SEPOLIA);
        fx.sessions.write_raw_key("0xdeadbeef").unwrap();
        fx.sessions.mark_verified().unwrap();
        push_browser_connect(fx.wallet_mock.as_ref().unwrap(), "0xaa36a7");

        let reason = fx
            .connector
            .session_binding(ContractKind::DirectMessage, false)
            .await
            .unwrap_err();
        assert_eq!(reason, SessionUnavailable::KeyUnreadable);

        let conn = fx.connector.connect(ContractKind::DirectMessage).await.unwrap();
        assert!(!conn.is_session());
    }

    #[tokio::test]
    async fn underfunded_session_wallet_is_not_used_for_sends() {
        let fx = fixture(false, ChainId::SEPOLIA);
        verified_session(&fx.sessions);
        fx.funding_mock.push::<String, _>("0x1".to_string()).unwrap();

        let err = fx
            .connector
            .connect_for_send(ContractKind::DirectMessage)
            .await
            .unwrap_err();
        // No browser wallet to fall back to.
        assert!(matches!(err, AppError::ProviderAbsent(_)));
    }

    #[tokio::test]
    async fn funded_session_wallet_is_used_for_sends() {
        let fx = fixture(false, ChainId::SEPOLIA);
        verified_session(&fx.sessions);
        fx.funding_mock
            .push::<String, _>("0xde0b6b3a7640000".to_string())
            .unwrap();

        let conn = fx
            .connector
            .connect_for_send(ContractKind::DirectMessage)
            .await
            .unwrap();
        assert!(conn.is_session());
    }

    #[tokio::test]
    async fn session_skipped_when_no_contract_on_chain() {
        let fx = fixture(false, ChainId::SEPOLIA);
        verified_session(&fx.sessions);

        let reason = fx
            .connector
            .session_binding(ContractKind::GroupChat, false)
            .await
            .unwrap_err();
        assert_eq!(reason, SessionUnavailable::NoAddress(ChainId::SEPOLIA));
    }

    #[tokio::test]
    async fn mainnet_triggers_switch_before_binding() {
        let fx = fixture(true, ChainId::SEPOLIA);
        let mock = fx.wallet_mock.as_ref().unwrap();
        // Second attempt, after the switch: accounts + Sepolia.
        push_browser_connect(mock, "0xaa36a7");
        // Switch succeeds.
        mock.push::<Value, _>(Value::Null).unwrap();
        // First attempt: accounts + mainnet.
        push_browser_connect(mock, "0x1");

        let conn = fx.connector.connect(ContractKind::DirectMessage).await.unwrap();
        assert_eq!(conn.chain(), ChainId::SEPOLIA);

        mock.assert_request("eth_requestAccounts", ()).unwrap();
        mock.assert_request("eth_chainId", ()).unwrap();
        mock.assert_request(
            "wallet_switchEthereumChain",
            [json!({ "chainId": "0xaa36a7" })],
        )
        .unwrap();
        mock.assert_request("eth_requestAccounts", ()).unwrap();
    }

    #[tokio::test]
    async fn failed_switch_aborts_without_binding() {
        let fx = fixture(true, ChainId::SEPOLIA);
        let mock = fx.wallet_mock.as_ref().unwrap();
        mock.push_response(MockResponse::Error(JsonRpcError {
            code: 4001,
            message: "User rejected the request.".into(),
            data: None,
        }));
        push_browser_connect(mock, "0x1");

        let err = fx
            .connector
            .connect(ContractKind::DirectMessage)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UserRejected(_)));
    }

    #[tokio::test]
    async fn still_on_mainnet_after_switch_is_wrong_network() {
        let fx = fixture(true, ChainId::SEPOLIA);
        let mock = fx.wallet_mock.as_ref().unwrap();
        push_browser_connect(mock, "0x1");
        mock.push::<Value, _>(Value::Null).unwrap();
        push_browser_connect(mock, "0x1");

        let err = fx
            .connector
            .connect(ContractKind::DirectMessage)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::WrongNetwork(_)));
    }

    #[tokio::test]
    async fn session_wallet_ignored_while_wallet_is_on_mainnet() {
        let fx = fixture(true, ChainId::SEPOLIA);
        verified_session(&fx.sessions);
        let mock = fx.wallet_mock.as_ref().unwrap();
        mock.push::<String, _>("0x1".to_string()).unwrap();

        let reason = fx
            .connector
            .session_binding(ContractKind::DirectMessage, false)
            .await
            .unwrap_err();
        assert_eq!(reason, SessionUnavailable::ChainUnsupported(ChainId::ETHEREUM));
    }
}
