use std::{sync::Arc, time::Duration};

use chatlink::{
    config::AppConfig,
    error::{AppError, AppResult},
    implementations::{
        balance::{PollSettings, ether_to_wei},
        browser::BrowserWallet,
        connector::{Connector, ConnectorSettings},
        contracts::ContractDirectory,
        markers::AccountMarkers,
        network::NetworkGuard,
    },
    layers::{
        mcp::McpServer,
        service::{ServiceContext, ServiceLayer},
    },
    storage::{FileStore, ProfileStore},
    wallet::SessionWalletStore,
};
use ethers::providers::{Http, Provider};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!("fatal error: {err}");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> AppResult<()> {
    init_tracing();

    info!("loading configuration");
    let config = AppConfig::load()?;

    info!(url = %config.funding_rpc_url, chain = %config.funding_chain_id, "connecting to funding provider");
    let funding = Arc::new(build_provider(&config.funding_rpc_url)?);

    let wallet = match &config.wallet_rpc_url {
        Some(url) => {
            info!(%url, "using browser wallet endpoint");
            Some(BrowserWallet::new(build_provider(url)?))
        }
        None => {
            warn!("no wallet endpoint configured; only the session wallet can sign");
            None
        }
    };

    info!(path = %config.profile_path.display(), "opening profile store");
    let store: Arc<dyn ProfileStore> = Arc::new(FileStore::open(&config.profile_path)?);
    let sessions = SessionWalletStore::new(store.clone());
    let markers = AccountMarkers::new(store);

    let directory = Arc::new(ContractDirectory::from_entries(&config.contracts)?);
    let settings = ConnectorSettings {
        funding_chain: config.funding_chain_id,
        min_send_balance: ether_to_wei(config.min_send_balance_eth)?,
    };
    let connector = Connector::new(
        NetworkGuard::new(wallet),
        sessions.clone(),
        funding,
        directory,
        settings,
    );

    let poll = PollSettings {
        interval: Duration::from_millis(config.poll_interval_ms),
        recheck_delay: Duration::from_millis(config.recheck_delay_ms),
    };
    let service_ctx = Arc::new(ServiceContext::new(connector, sessions, markers, poll));
    let service: ServiceLayer<Http, Http> = ServiceLayer::new(service_ctx);

    // Resume watching a wallet that was created but never funded.
    let status = service.session_wallet_status();
    if status.exists && !status.verified {
        if let Err(err) = service.start_funding_watch().await {
            warn!("could not resume funding watch: {err}");
        }
    }

    info!("starting MCP stdio server");
    let server = McpServer::new(service.clone());
    tokio::select! {
        result = server.run_stdio() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            service.shutdown();
            Ok(())
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_line_number(true)
        .init();
}

fn build_provider(url: &str) -> AppResult<Provider<Http>> {
    Provider::<Http>::try_from(url)
        .map_err(|err| AppError::Config(format!("failed to create provider: {err}")))
}
