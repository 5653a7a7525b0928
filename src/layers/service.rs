use std::sync::Arc;

use crate::{
    chains::ChainLabel,
    error::{AppError, AppResult},
    implementations::{
        balance::{self, PollHandle, PollSettings, TxComplete, TxSignal},
        browser::WalletEvent,
        connector::{Connection, Connector},
        contracts::ContractKind,
        markers::{AccountMarkers, MarkerList},
        messaging,
    },
    notice::{Notice, Notifier},
    types::{
        AccountParams, AddFriendParams, AddressParams, ApproveSenderParams, BalanceOut,
        CreateGroupParams, CreateUserParams, CreatedGroupOut, FriendOut, GroupIdParams,
        GroupMessageParams, GroupOut, JoinRequestParams, MemberParams, MemberRoleOut, MessageOut,
        SendMessageParams, SessionWalletOut, SetRoleParams, SwitchOut, TxOut, UserOut,
    },
    wallet::SessionWalletStore,
};
use ethers::{
    providers::JsonRpcClient,
    signers::Signer,
    types::{Address, H256},
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

/// Run `$body` against whichever binding the connection holds.
macro_rules! with_binding {
    ($conn:expr, |$b:ident| $body:expr) => {
        match $conn {
            Connection::Session($b) => $body,
            Connection::Browser($b) => $body,
        }
    };
}

/// Explicit session object: built once at startup, shared by reference, torn down with `shutdown`.
pub struct ServiceContext<P, F> {
    pub connector: Connector<P, F>,
    pub sessions: SessionWalletStore,
    pub markers: AccountMarkers,
    pub notifier: Notifier,
    pub tx_signal: TxSignal,
    pub poll: PollSettings,
    watcher: Mutex<Option<PollHandle>>,
}

impl<P, F> ServiceContext<P, F> {
    pub fn new(
        connector: Connector<P, F>,
        sessions: SessionWalletStore,
        markers: AccountMarkers,
        poll: PollSettings,
    ) -> Self {
        Self {
            connector,
            sessions,
            markers,
            notifier: Notifier::new(),
            tx_signal: TxSignal::new(),
            poll,
            watcher: Mutex::new(None),
        }
    }
}

/// Middle layer that exposes business-level operations while delegating heavy work to implementation modules.
///
/// Every public method is an operation boundary: a failure is published as a
/// single notice and returned, never left half-applied.
pub struct ServiceLayer<P, F> {
    ctx: Arc<ServiceContext<P, F>>,
}

impl<P, F> Clone for ServiceLayer<P, F> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<P, F> ServiceLayer<P, F>
where
    P: JsonRpcClient + Clone + 'static,
    F: JsonRpcClient + Clone + 'static,
{
    pub fn new(ctx: Arc<ServiceContext<P, F>>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ServiceContext<P, F> {
        &self.ctx
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.ctx.notifier.subscribe()
    }

    pub fn subscribe_wallet_events(&self) -> Option<broadcast::Receiver<WalletEvent>> {
        self.ctx.connector.guard().wallet().map(|w| w.subscribe())
    }

    /// Teardown: cancels the funding watch. Stored wallet state is left alone.
    pub fn shutdown(&self) {
        if let Some(handle) = self.ctx.watcher.lock().take() {
            handle.cancel();
        }
        info!("service shut down");
    }

    fn surface<T>(&self, result: AppResult<T>) -> AppResult<T> {
        if let Err(err) = &result {
            self.ctx.notifier.error(err);
        }
        result
    }

    async fn boundary<T>(&self, op: impl Future<Output = AppResult<T>>) -> AppResult<T> {
        let result = op.await;
        self.surface(result)
    }

    // -- network -----------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn current_chain(&self) -> AppResult<ChainLabel> {
        self.boundary(self.ctx.connector.guard().current_chain())
            .await
    }

    /// Never errors: failure is reported as `switched: false` plus a notice.
    #[instrument(skip(self))]
    pub async fn switch_to_testnet(&self) -> AppResult<SwitchOut> {
        match self.ctx.connector.guard().switch_to_testnet().await {
            Ok(()) => {
                self.ctx.notifier.publish(Notice::success(
                    "Network Switched",
                    "Connected to the Sepolia testnet",
                ));
                Ok(SwitchOut { switched: true })
            }
            Err(err) => {
                self.ctx.notifier.error(&err);
                Ok(SwitchOut { switched: false })
            }
        }
    }

    // -- session wallet ----------------------------------------------------

    pub fn session_wallet_status(&self) -> SessionWalletOut {
        let sessions = &self.ctx.sessions;
        let watching = self
            .ctx
            .watcher
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        SessionWalletOut {
            address: sessions.address().map(|a| format!("{a:#x}")),
            state: sessions.state(),
            exists: sessions.exists(),
            verified: sessions.is_verified(),
            watching,
        }
    }

    /// Replace any existing session wallet with a fresh, unverified one and start watching for funds.
    #[instrument(skip(self))]
    pub async fn create_session_wallet(&self) -> AppResult<SessionWalletOut> {
        self.boundary(self.create_session_wallet_inner()).await
    }

    async fn create_session_wallet_inner(&self) -> AppResult<SessionWalletOut> {
        self.stop_watch().await;
        self.ctx.sessions.clear()?;
        let wallet = SessionWalletStore::generate();
        self.ctx.sessions.save(&wallet)?;
        info!(address = ?wallet.address(), "session wallet created");
        self.ctx.notifier.publish(Notice::success(
            "Wallet Created",
            format!("Session wallet {:#x} created; fund it to enable auto-signing", wallet.address()),
        ));
        self.start_watch(wallet.address());
        Ok(self.session_wallet_status())
    }

    /// One balance read; a positive balance verifies the wallet.
    #[instrument(skip(self))]
    pub async fn check_session_balance(&self) -> AppResult<BalanceOut> {
        self.boundary(self.check_session_balance_inner()).await
    }

    async fn check_session_balance_inner(&self) -> AppResult<BalanceOut> {
        let address = self.require_session_address()?;
        let out = balance::resolve_native_balance(self.ctx.connector.funding(), address).await?;
        if out.raw != "0" && !self.ctx.sessions.is_verified() {
            self.ctx.sessions.mark_verified()?;
            self.stop_watch().await;
            self.ctx.notifier.publish(Notice::success(
                "Session Wallet Ready",
                "Messages will now be signed automatically",
            ));
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    pub async fn start_funding_watch(&self) -> AppResult<SessionWalletOut> {
        let result = self.require_session_address().map(|address| {
            if !self.ctx.sessions.is_verified() {
                self.start_watch(address);
            }
            self.session_wallet_status()
        });
        self.surface(result)
    }

    pub async fn stop_funding_watch(&self) -> AppResult<SessionWalletOut> {
        self.stop_watch().await;
        Ok(self.session_wallet_status())
    }

    #[instrument(skip(self))]
    pub async fn clear_session_wallet(&self) -> AppResult<SessionWalletOut> {
        self.stop_watch().await;
        let result = self.ctx.sessions.clear().map(|()| {
            self.ctx
                .notifier
                .publish(Notice::info("Session Wallet Removed", "Auto-signing is off"));
            self.session_wallet_status()
        });
        self.surface(result)
    }

    /// At most one poll at a time; a new one replaces the old.
    fn start_watch(&self, address: Address) {
        let handle = balance::poll_until_funded(
            self.ctx.connector.funding(),
            address,
            self.ctx.sessions.clone(),
            self.ctx.poll,
            Some(self.ctx.tx_signal.subscribe()),
        );
        if let Some(previous) = self.ctx.watcher.lock().replace(handle) {
            previous.cancel();
        }
    }

    /// Local hints trail a mined transaction, so a failed write is only logged.
    fn record_hint(&self, list: MarkerList, account: Address, entry: Address) {
        if let Err(err) = self.ctx.markers.add(list, account, entry) {
            warn!("failed to record {list:?} hint for {account:#x}: {err}");
        }
    }

    /// Cancels the running poll and waits for it, so no read still in flight can land afterwards.
    async fn stop_watch(&self) {
        let handle = self.ctx.watcher.lock().take();
        if let Some(handle) = handle {
            handle.cancel();
            handle.wait().await;
        }
    }

    fn require_session_address(&self) -> AppResult<Address> {
        if !self.ctx.sessions.exists() {
            return Err(AppError::Wallet("no session wallet has been created".into()));
        }
        self.ctx
            .sessions
            .address()
            .ok_or_else(|| AppError::Wallet("stored session wallet key is unreadable".into()))
    }

    fn after_send(&self, conn: &Connection<P, F>, out: &TxOut) {
        if !conn.is_session() {
            return;
        }
        match out.tx_hash.parse::<H256>() {
            Ok(hash) => self.ctx.tx_signal.publish(TxComplete::now(hash)),
            Err(_) => debug!("unparseable tx hash {}", out.tx_hash),
        }
    }

    // -- direct messages ---------------------------------------------------

    #[instrument(skip(self), fields(name = %params.name))]
    pub async fn create_user(&self, params: CreateUserParams) -> AppResult<TxOut> {
        self.boundary(async {
            if params.name.trim().is_empty() {
                return Err(AppError::InvalidInput("name must not be empty".into()));
            }
            let conn = self.ctx.connector.connect_for_send(ContractKind::DirectMessage).await?;
            let out = with_binding!(&conn, |b| messaging::create_user(b, &params.name).await)?;
            self.after_send(&conn, &out);
            self.ctx
                .notifier
                .publish(Notice::success("Account Created", format!("Welcome, {}", params.name)));
            Ok(out)
        })
        .await
    }

    #[instrument(skip(self), fields(address = %params.address))]
    pub async fn get_username(&self, params: AddressParams) -> AppResult<String> {
        self.boundary(async {
            let address = parse_address(&params.address)?;
            let conn = self.ctx.connector.connect(ContractKind::DirectMessage).await?;
            with_binding!(&conn, |b| messaging::username(b, address).await)
        })
        .await
    }

    #[instrument(skip(self, params), fields(to = %params.to))]
    pub async fn send_message(&self, params: SendMessageParams) -> AppResult<TxOut> {
        self.boundary(async {
            let to = parse_address(&params.to)?;
            if params.content.is_empty() {
                return Err(AppError::InvalidInput("message must not be empty".into()));
            }
            let conn = self.ctx.connector.connect_for_send(ContractKind::DirectMessage).await?;
            let out =
                with_binding!(&conn, |b| messaging::send_message(b, to, &params.content).await)?;
            self.after_send(&conn, &out);
            Ok(out)
        })
        .await
    }

    #[instrument(skip(self), fields(peer = %params.address))]
    pub async fn read_messages(&self, params: AddressParams) -> AppResult<Vec<MessageOut>> {
        self.boundary(async {
            let peer = parse_address(&params.address)?;
            let conn = self.ctx.connector.connect(ContractKind::DirectMessage).await?;
            with_binding!(&conn, |b| messaging::read_messages(b, peer).await)
        })
        .await
    }

    /// Sends the friend request and records a local "request sent" marker.
    #[instrument(skip(self), fields(address = %params.address))]
    pub async fn add_friend(&self, params: AddFriendParams) -> AppResult<TxOut> {
        self.boundary(async {
            let friend = parse_address(&params.address)?;
            let conn = self.ctx.connector.connect_for_send(ContractKind::DirectMessage).await?;
            let out =
                with_binding!(&conn, |b| messaging::add_friend(b, friend, &params.name).await)?;
            self.after_send(&conn, &out);
            self.record_hint(MarkerList::SentRequests, conn.account(), friend);
            self.ctx.notifier.publish(Notice::success(
                "Friend Request Sent",
                format!("Request sent to {}", params.name),
            ));
            Ok(out)
        })
        .await
    }

    #[instrument(skip(self), fields(address = %params.address))]
    pub async fn block_user(&self, params: AddressParams) -> AppResult<TxOut> {
        self.boundary(async {
            let account = parse_address(&params.address)?;
            let conn = self.ctx.connector.connect_for_send(ContractKind::DirectMessage).await?;
            let out = with_binding!(&conn, |b| messaging::block_user(b, account).await)?;
            self.after_send(&conn, &out);
            Ok(out)
        })
        .await
    }

    #[instrument(skip(self), fields(address = %params.address))]
    pub async fn unblock_user(&self, params: AddressParams) -> AppResult<TxOut> {
        self.boundary(async {
            let account = parse_address(&params.address)?;
            let conn = self.ctx.connector.connect_for_send(ContractKind::DirectMessage).await?;
            let out = with_binding!(&conn, |b| messaging::unblock_user(b, account).await)?;
            self.after_send(&conn, &out);
            Ok(out)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn list_friends(&self) -> AppResult<Vec<FriendOut>> {
        self.boundary(async {
            let conn = self.ctx.connector.connect(ContractKind::DirectMessage).await?;
            with_binding!(&conn, |b| messaging::friends(b).await)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn list_users(&self) -> AppResult<Vec<UserOut>> {
        self.boundary(async {
            let conn = self.ctx.connector.connect(ContractKind::DirectMessage).await?;
            with_binding!(&conn, |b| messaging::users(b).await)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn list_blocked(&self) -> AppResult<Vec<String>> {
        self.boundary(async {
            let conn = self.ctx.connector.connect(ContractKind::DirectMessage).await?;
            with_binding!(&conn, |b| messaging::blocked(b).await)
        })
        .await
    }

    // -- groups ------------------------------------------------------------

    #[instrument(skip(self), fields(name = %params.name, private = params.is_private))]
    pub async fn create_group(&self, params: CreateGroupParams) -> AppResult<CreatedGroupOut> {
        self.boundary(async {
            if params.name.trim().is_empty() {
                return Err(AppError::InvalidInput("group name must not be empty".into()));
            }
            let conn = self.ctx.connector.connect_for_send(ContractKind::GroupChat).await?;
            let out = with_binding!(&conn, |b| {
                messaging::create_group(b, &params.name, &params.description, params.is_private)
                    .await
            })?;
            self.after_send(&conn, &out.tx);
            self.ctx.notifier.publish(Notice::success(
                "Group Created",
                format!("Successfully created group \"{}\"", params.name),
            ));
            Ok(out)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn user_groups(&self, params: AccountParams) -> AppResult<Vec<GroupOut>> {
        self.boundary(async {
            let conn = self.ctx.connector.connect(ContractKind::GroupChat).await?;
            let account = match params.account.as_deref() {
                Some(raw) => parse_address(raw)?,
                None => conn.account(),
            };
            with_binding!(&conn, |b| messaging::user_groups(b, account).await)
        })
        .await
    }

    #[instrument(skip(self), fields(group = params.group_id))]
    pub async fn group_info(&self, params: GroupIdParams) -> AppResult<GroupOut> {
        self.boundary(async {
            let conn = self.ctx.connector.connect(ContractKind::GroupChat).await?;
            with_binding!(&conn, |b| messaging::group_info(b, params.group_id).await)
        })
        .await
    }

    #[instrument(skip(self), fields(group = params.group_id))]
    pub async fn join_group(&self, params: GroupIdParams) -> AppResult<TxOut> {
        self.boundary(async {
            let conn = self.ctx.connector.connect_for_send(ContractKind::GroupChat).await?;
            let out = with_binding!(&conn, |b| messaging::join_group(b, params.group_id).await)?;
            self.after_send(&conn, &out);
            Ok(out)
        })
        .await
    }

    #[instrument(skip(self, params), fields(group = params.group_id))]
    pub async fn send_group_message(&self, params: GroupMessageParams) -> AppResult<TxOut> {
        self.boundary(async {
            if params.content.is_empty() {
                return Err(AppError::InvalidInput("message must not be empty".into()));
            }
            let conn = self.ctx.connector.connect_for_send(ContractKind::GroupChat).await?;
            let out = with_binding!(&conn, |b| {
                messaging::send_group_message(b, params.group_id, &params.content).await
            })?;
            self.after_send(&conn, &out);
            Ok(out)
        })
        .await
    }

    #[instrument(skip(self), fields(group = params.group_id))]
    pub async fn group_messages(&self, params: GroupIdParams) -> AppResult<Vec<MessageOut>> {
        self.boundary(async {
            let conn = self.ctx.connector.connect(ContractKind::GroupChat).await?;
            with_binding!(&conn, |b| messaging::group_messages(b, params.group_id).await)
        })
        .await
    }

    #[instrument(skip(self), fields(group = params.group_id, address = %params.address))]
    pub async fn member_role(&self, params: MemberParams) -> AppResult<MemberRoleOut> {
        self.boundary(async {
            let account = parse_address(&params.address)?;
            let conn = self.ctx.connector.connect(ContractKind::GroupChat).await?;
            with_binding!(&conn, |b| {
                messaging::member_role(b, params.group_id, account).await
            })
        })
        .await
    }

    #[instrument(skip(self), fields(group = params.group_id, role = %params.role))]
    pub async fn set_member_role(&self, params: SetRoleParams) -> AppResult<TxOut> {
        self.boundary(async {
            let account = parse_address(&params.address)?;
            let conn = self.ctx.connector.connect_for_send(ContractKind::GroupChat).await?;
            let out = with_binding!(&conn, |b| {
                messaging::set_member_role(b, params.group_id, account, params.role).await
            })?;
            self.after_send(&conn, &out);
            Ok(out)
        })
        .await
    }

    #[instrument(skip(self), fields(group = params.group_id, accept = params.accept))]
    pub async fn respond_join_request(&self, params: JoinRequestParams) -> AppResult<TxOut> {
        self.boundary(async {
            let requester = parse_address(&params.requester)?;
            let conn = self.ctx.connector.connect_for_send(ContractKind::GroupChat).await?;
            let out = with_binding!(&conn, |b| {
                messaging::respond_join_request(b, params.group_id, requester, params.accept).await
            })?;
            self.after_send(&conn, &out);
            let verdict = if params.accept { "approved" } else { "rejected" };
            self.ctx.notifier.publish(Notice::success(
                "Join Request Handled",
                format!("Request from {requester:#x} {verdict}"),
            ));
            Ok(out)
        })
        .await
    }

    #[instrument(skip(self), fields(group = params.group_id))]
    pub async fn pending_join_requests(&self, params: GroupIdParams) -> AppResult<Vec<String>> {
        self.boundary(async {
            let conn = self.ctx.connector.connect(ContractKind::GroupChat).await?;
            with_binding!(&conn, |b| {
                messaging::pending_join_requests(b, params.group_id).await
            })
        })
        .await
    }

    // -- local hints -------------------------------------------------------

    pub async fn sent_requests(&self, params: AccountParams) -> AppResult<Vec<String>> {
        self.boundary(async {
            let account = self.resolve_account(params.account.as_deref()).await?;
            Ok(format_addresses(
                self.ctx.markers.list(MarkerList::SentRequests, account),
            ))
        })
        .await
    }

    pub async fn approved_senders(&self, params: AccountParams) -> AppResult<Vec<String>> {
        self.boundary(async {
            let account = self.resolve_account(params.account.as_deref()).await?;
            Ok(format_addresses(
                self.ctx.markers.list(MarkerList::ApprovedSenders, account),
            ))
        })
        .await
    }

    pub async fn approve_sender(&self, params: ApproveSenderParams) -> AppResult<Vec<String>> {
        self.boundary(async {
            let sender = parse_address(&params.sender)?;
            let account = self.resolve_account(params.account.as_deref()).await?;
            self.ctx
                .markers
                .add(MarkerList::ApprovedSenders, account, sender)?;
            Ok(format_addresses(
                self.ctx.markers.list(MarkerList::ApprovedSenders, account),
            ))
        })
        .await
    }

    /// Explicit account, else the wallet's connected account, else the session wallet.
    async fn resolve_account(&self, explicit: Option<&str>) -> AppResult<Address> {
        if let Some(raw) = explicit {
            return parse_address(raw);
        }
        if let Some(wallet) = self.ctx.connector.guard().wallet() {
            if let Some(first) = wallet.accounts().await?.first() {
                return Ok(*first);
            }
        }
        self.ctx
            .sessions
            .address()
            .ok_or_else(|| AppError::InvalidInput("no account connected".into()))
    }
}

fn parse_address(input: &str) -> AppResult<Address> {
    input
        .trim()
        .parse::<Address>()
        .map_err(|_| AppError::InvalidInput(format!("invalid address: {input}")))
}

fn format_addresses(addresses: Vec<Address>) -> Vec<String> {
    addresses.into_iter().map(|a| format!("{a:#x}")).collect()
}
