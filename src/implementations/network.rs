use ethers::providers::JsonRpcClient;
use tracing::{info, instrument, warn};

use crate::{
    chains::{self, ChainId, ChainLabel, ChainRegistration, DEFAULT_TESTNET},
    error::{AppError, AppResult},
    implementations::browser::BrowserWallet,
};

/// Reads the wallet's active chain and moves it onto the testnet allow-list.
pub struct NetworkGuard<P> {
    wallet: Option<BrowserWallet<P>>,
    target: &'static ChainRegistration,
}

impl<P> Clone for NetworkGuard<P> {
    fn clone(&self) -> Self {
        Self {
            wallet: self.wallet.clone(),
            target: self.target,
        }
    }
}

impl<P> NetworkGuard<P>
where
    P: JsonRpcClient + Clone + 'static,
{
    pub fn new(wallet: Option<BrowserWallet<P>>) -> Self {
        Self {
            wallet,
            target: &DEFAULT_TESTNET,
        }
    }

    pub fn wallet(&self) -> Option<&BrowserWallet<P>> {
        self.wallet.as_ref()
    }

    pub fn default_testnet(&self) -> ChainId {
        self.target.chain_id
    }

    pub fn require_wallet(&self) -> AppResult<&BrowserWallet<P>> {
        self.wallet.as_ref().ok_or_else(|| {
            AppError::ProviderAbsent("please install or connect a browser wallet".into())
        })
    }

    pub fn is_testnet(chain_id: ChainId) -> bool {
        chains::is_testnet(chain_id)
    }

    pub async fn current_chain(&self) -> AppResult<ChainLabel> {
        let chain = self.require_wallet()?.chain_id().await?;
        Ok(ChainLabel::for_chain(chain))
    }

    /// Switch to the default testnet, registering it first if the wallet does not know it.
    /// A single register-then-switch attempt; no other retries.
    #[instrument(skip(self), fields(target = %self.target.chain_id))]
    pub async fn switch_to_testnet(&self) -> AppResult<()> {
        let wallet = self.require_wallet()?;
        let target = self.target.chain_id;

        match wallet.switch_chain(target).await {
            Ok(()) => Ok(()),
            Err(AppError::WrongNetwork(reason)) => {
                info!("wallet does not know {target}, registering it: {reason}");
                wallet.add_chain(self.target).await.map_err(|err| match err {
                    AppError::UserRejected(msg) => AppError::UserRejected(msg),
                    other => AppError::WrongNetwork(format!(
                        "failed to add {}: {other}",
                        self.target.chain_name
                    )),
                })?;
                wallet.switch_chain(target).await
            }
            Err(AppError::UserRejected(msg)) => {
                warn!("network switch rejected");
                Err(AppError::UserRejected(msg))
            }
            Err(err) => Err(AppError::WrongNetwork(format!(
                "failed to switch network: {err}"
            ))),
        }
    }
}
