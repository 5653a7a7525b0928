//! Funding checks for the session wallet.
//!
//! Balances are always read through the reliable funding endpoint, never
//! through the browser wallet. `poll_until_funded` is the only open-ended
//! background activity in the crate.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use ethers::{
    providers::Middleware,
    types::{Address, H256, U256},
};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::Serialize;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval, sleep_until},
};
use tracing::{debug, info, warn};

use crate::{
    error::{AppError, AppResult},
    types::BalanceOut,
    wallet::SessionWalletStore,
};

const ETHER_DECIMALS: u32 = 18;
const SIGNAL_BUFFER: usize = 16;

/// Native balance of `address` as seen by the funding endpoint.
pub async fn check_balance<M>(provider: Arc<M>, address: Address) -> AppResult<U256>
where
    M: Middleware + 'static,
{
    provider
        .get_balance(address, None)
        .await
        .map_err(|err| AppError::Rpc(err.to_string()))
}

pub async fn resolve_native_balance<M>(provider: Arc<M>, address: Address) -> AppResult<BalanceOut>
where
    M: Middleware + 'static,
{
    let raw_balance = check_balance(provider, address).await?;

    Ok(BalanceOut {
        address: format!("{address:#x}"),
        symbol: "ETH".to_string(),
        raw: raw_balance.to_string(),
        decimals: ETHER_DECIMALS,
        formatted: format_with_decimals(&raw_balance, ETHER_DECIMALS),
    })
}

/// Format a `U256` amount into a decimal string using the provided number of decimals.
pub fn format_with_decimals(raw: &U256, decimals: u32) -> String {
    if decimals == 0 {
        return raw.to_string();
    }

    let ten = U256::from(10u64);
    let power = ten.pow(U256::from(decimals));
    if power.is_zero() {
        return raw.to_string();
    }

    let integer = raw / power;
    let fraction = raw % power;

    if fraction.is_zero() {
        return integer.to_string();
    }

    let mut fraction_str = fraction.to_string();
    if fraction_str.len() < decimals as usize {
        let padding = decimals as usize - fraction_str.len();
        let prefix = "0".repeat(padding);
        fraction_str = format!("{prefix}{fraction_str}");
    }

    let trimmed_fraction = fraction_str.trim_end_matches('0').to_string();
    if trimmed_fraction.is_empty() {
        integer.to_string()
    } else {
        format!("{}.{}", integer, trimmed_fraction)
    }
}

/// Convert an ether amount into wei, truncating anything below one wei.
pub fn ether_to_wei(amount: Decimal) -> AppResult<U256> {
    if amount.is_sign_negative() {
        return Err(AppError::InvalidInput(format!("negative amount: {amount}")));
    }
    let wei = amount
        .checked_mul(Decimal::from(10u64.pow(ETHER_DECIMALS)))
        .and_then(|scaled| scaled.trunc().to_u128())
        .ok_or_else(|| AppError::InvalidInput(format!("amount out of range: {amount}")))?;
    Ok(U256::from(wei))
}

/// Published after a session-wallet transaction confirms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxComplete {
    pub tx_hash: H256,
    pub at: u64,
}

impl TxComplete {
    pub fn now(tx_hash: H256) -> Self {
        let at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self { tx_hash, at }
    }
}

/// Broadcast of confirmed sends. Pollers use it to re-check early; missing a
/// signal only delays verification until the next regular tick.
#[derive(Debug, Clone)]
pub struct TxSignal {
    tx: broadcast::Sender<TxComplete>,
}

impl Default for TxSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl TxSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_BUFFER);
        Self { tx }
    }

    pub fn publish(&self, event: TxComplete) {
        debug!(tx = ?event.tx_hash, "transaction complete signal");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TxComplete> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub recheck_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// `ticks` counts balance reads, including the one that saw funds.
    Funded { ticks: u32, balance: U256 },
    /// Cancelled, or the stored wallet no longer matches the polled address.
    Cancelled,
}

/// Handle to a running poll. The owner must `cancel()` it on teardown.
pub struct PollHandle {
    address: Address,
    cancel: watch::Sender<bool>,
    task: JoinHandle<PollOutcome>,
}

impl PollHandle {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> PollOutcome {
        self.task.await.unwrap_or(PollOutcome::Cancelled)
    }
}

/// Read the balance every `interval` until it is positive, then mark the
/// session wallet verified and stop. Runs until funded or cancelled.
pub fn poll_until_funded<M>(
    provider: Arc<M>,
    address: Address,
    store: SessionWalletStore,
    settings: PollSettings,
    signal: Option<broadcast::Receiver<TxComplete>>,
) -> PollHandle
where
    M: Middleware + 'static,
{
    let (cancel, mut cancelled) = watch::channel(false);
    let mut signal = signal;

    let task = tokio::spawn(async move {
        let mut ticker = interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut recheck_at: Option<Instant> = None;
        let mut ticks = 0u32;

        info!(address = ?address, "polling session wallet balance");

        loop {
            tokio::select! {
                biased;
                changed = cancelled.changed() => {
                    if changed.is_err() || *cancelled.borrow() {
                        debug!(address = ?address, "balance poll cancelled");
                        return PollOutcome::Cancelled;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
                _ = sleep_until(recheck_at.unwrap_or_else(Instant::now)), if recheck_at.is_some() => {
                    recheck_at = None;
                }
                received = next_signal(&mut signal), if signal.is_some() => {
                    match received {
                        Ok(event) => {
                            debug!(tx = ?event.tx_hash, "re-checking balance after transaction");
                            recheck_at = Some(Instant::now() + settings.recheck_delay);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            recheck_at = Some(Instant::now() + settings.recheck_delay);
                        }
                        Err(broadcast::error::RecvError::Closed) => signal = None,
                    }
                    continue;
                }
            }

            ticks += 1;
            let read = check_balance(provider.clone(), address).await;
            // A read that was in flight when the poll was cancelled must not verify anything.
            if *cancelled.borrow() {
                debug!(address = ?address, "balance poll cancelled during read");
                return PollOutcome::Cancelled;
            }
            match read {
                Ok(balance) if !balance.is_zero() => {
                    if store.address() != Some(address) {
                        warn!(address = ?address, "session wallet replaced, dropping stale balance");
                        return PollOutcome::Cancelled;
                    }
                    match store.mark_verified() {
                        Ok(()) => {
                            info!(
                                address = ?address,
                                balance = %format_with_decimals(&balance, ETHER_DECIMALS),
                                "session wallet funded"
                            );
                            return PollOutcome::Funded { ticks, balance };
                        }
                        Err(err) => warn!("failed to record verification: {err}"),
                    }
                }
                Ok(_) => debug!(tick = ticks, "session wallet not funded yet"),
                Err(err) => warn!("balance read failed: {err}"),
            }
        }
    });

    PollHandle {
        address,
        cancel,
        task,
    }
}

async fn next_signal(
    signal: &mut Option<broadcast::Receiver<TxComplete>>,
) -> Result<TxComplete, broadcast::error::RecvError> {
    match signal {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use ethers::{
        providers::{JsonRpcClient, MockError, MockProvider, Provider},
        signers::Signer,
    };
    use std::str::FromStr;

    fn settings(interval_ms: u64) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(interval_ms),
            recheck_delay: Duration::from_millis(1),
        }
    }

    /// Store holding a freshly saved session wallet, plus its address.
    fn stored_wallet() -> (SessionWalletStore, Address) {
        let store = SessionWalletStore::new(Arc::new(MemoryStore::new()));
        let wallet = SessionWalletStore::generate();
        store.save(&wallet).unwrap();
        (store, wallet.address())
    }

    /// Delays every request so a read can still be in flight when the caller acts.
    #[derive(Debug, Clone)]
    struct SlowClient {
        inner: MockProvider,
        delay: Duration,
    }

    #[async_trait]
    impl JsonRpcClient for SlowClient {
        type Error = MockError;

        async fn request<T, R>(&self, method: &str, params: T) -> Result<R, Self::Error>
        where
            T: std::fmt::Debug + serde::Serialize + Send + Sync,
            R: serde::de::DeserializeOwned + Send,
        {
            tokio::time::sleep(self.delay).await;
            self.inner.request(method, params).await
        }
    }

    fn slow_provider(delay_ms: u64) -> (Provider<SlowClient>, MockProvider) {
        let mock = MockProvider::new();
        let client = SlowClient {
            inner: mock.clone(),
            delay: Duration::from_millis(delay_ms),
        };
        (Provider::new(client), mock)
    }

    #[test]
    fn formats_without_decimals() {
        let value = U256::from(123u64);
        assert_eq!(format_with_decimals(&value, 0), "123");
    }

    #[test]
    fn formats_with_decimals() {
        let value = U256::from_dec_str("123456000000000000000").unwrap();
        assert_eq!(format_with_decimals(&value, 18), "123.456");
    }

    #[test]
    fn trims_trailing_zeroes() {
        let value = U256::from_dec_str("1000000000000000000").unwrap();
        assert_eq!(format_with_decimals(&value, 18), "1");
    }

    #[test]
    fn converts_minimum_send_balance() {
        let wei = ether_to_wei(Decimal::from_str("0.0001").unwrap()).unwrap();
        assert_eq!(wei, U256::from(100_000_000_000_000u64));
        assert!(ether_to_wei(Decimal::from_str("-1").unwrap()).is_err());
    }

    #[tokio::test]
    async fn resolve_native_balance_formats_expected_output() {
        let (provider, mock) = Provider::mocked();
        mock.push::<String, _>("0xde0b6b3a7640000".to_string()).unwrap(); // 1 ETH in wei

        let address = Address::from_low_u64_be(1);
        let balance = resolve_native_balance(Arc::new(provider), address)
            .await
            .unwrap();

        assert_eq!(balance.symbol, "ETH");
        assert_eq!(balance.raw, "1000000000000000000");
        assert_eq!(balance.formatted, "1");
    }

    #[tokio::test]
    async fn poll_marks_verified_on_first_funded_tick() {
        let (provider, mock) = Provider::mocked();
        // Responses are consumed in reverse order: 0, 0, then funded.
        mock.push::<String, _>("0x2386f26fc10000".to_string()).unwrap();
        mock.push::<String, _>("0x0".to_string()).unwrap();
        mock.push::<String, _>("0x0".to_string()).unwrap();

        let (store, address) = stored_wallet();
        let handle = poll_until_funded(
            Arc::new(provider),
            address,
            store.clone(),
            settings(5),
            None,
        );

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("poll should finish on its own");

        assert_eq!(
            outcome,
            PollOutcome::Funded {
                ticks: 3,
                balance: U256::from(10_000_000_000_000_000u64)
            }
        );
        assert!(store.is_verified());
    }

    #[tokio::test]
    async fn read_errors_do_not_stop_polling() {
        let (provider, mock) = Provider::mocked();
        mock.push::<String, _>("0x1".to_string()).unwrap();
        mock.push::<String, _>("not-a-number".to_string()).unwrap();

        let (store, address) = stored_wallet();
        let handle = poll_until_funded(
            Arc::new(provider),
            address,
            store.clone(),
            settings(5),
            None,
        );

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(matches!(outcome, PollOutcome::Funded { ticks: 2, .. }));
    }

    #[tokio::test]
    async fn cancel_stops_an_unfunded_poll() {
        let (provider, mock) = Provider::mocked();
        mock.push::<String, _>("0x0".to_string()).unwrap();

        let (store, address) = stored_wallet();
        let handle = poll_until_funded(
            Arc::new(provider),
            address,
            store.clone(),
            settings(60_000),
            None,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::Cancelled);
        assert!(!store.is_verified());
    }

    #[tokio::test]
    async fn tx_signal_triggers_early_recheck() {
        let (provider, mock) = Provider::mocked();
        mock.push::<String, _>("0x5".to_string()).unwrap();
        mock.push::<String, _>("0x0".to_string()).unwrap();

        let (store, address) = stored_wallet();
        let signal = TxSignal::new();
        let handle = poll_until_funded(
            Arc::new(provider),
            address,
            store.clone(),
            settings(60_000),
            Some(signal.subscribe()),
        );

        // First tick fires immediately and reads zero; the next regular tick is a minute away.
        tokio::time::sleep(Duration::from_millis(50)).await;
        signal.publish(TxComplete::now(H256::zero()));

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("signal should trigger a re-check");
        assert_eq!(
            outcome,
            PollOutcome::Funded {
                ticks: 2,
                balance: U256::from(5u64)
            }
        );
        assert!(store.is_verified());
    }

    #[tokio::test]
    async fn read_in_flight_during_cancel_does_not_verify_replacement() {
        let (provider, mock) = slow_provider(200);
        mock.push::<String, _>("0x1".to_string()).unwrap();

        let (store, first) = stored_wallet();
        let handle = poll_until_funded(Arc::new(provider), first, store.clone(), settings(60_000), None);

        // The first read is now waiting on the slow endpoint.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        store.clear().unwrap();
        store.save(&SessionWalletStore::generate()).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled);
        assert!(!store.is_verified());
    }

    #[tokio::test]
    async fn funds_for_a_replaced_wallet_are_ignored() {
        let (provider, mock) = Provider::mocked();
        mock.push::<String, _>("0x1".to_string()).unwrap();

        let (store, _) = stored_wallet();
        let stale = SessionWalletStore::generate().address();
        let handle = poll_until_funded(Arc::new(provider), stale, store.clone(), settings(5), None);

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled);
        assert!(!store.is_verified());
    }
}
