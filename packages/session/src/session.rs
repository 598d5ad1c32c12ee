//! The session synchronizer.
//!
//! `SessionSync` owns the three pieces of shared state (connection state,
//! contract binding, read cache). Each transition takes the locks it needs in
//! that order, applies the change, and releases them before the next await, so
//! no observer ever sees a state paired with the wrong binding.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::{stream, StreamExt, TryStreamExt};
use primitive_types::U256;
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    abi::AbiSet,
    cache::{Balances, CacheGroup, ReadCache, SaleParams, StakePosition, Timestamped},
    config::SessionConfig,
    contracts::{Backend, ContractBinding, PendingTx},
    error::{Result, SessionError, UNRECOGNIZED_CHAIN_CODE},
    lock,
    pending::{PendingTransaction, PendingTransactions, TxKind, TxTicket},
    rpc::{HttpRpc, ReadProvider},
    state::{ConnectionMode, ConnectionState, SessionEvent},
    types::Address,
    units::{format_units, DECIMALS},
    wallet::{TxReceipt, WalletEvent, WalletProvider},
};

const EVENT_CAPACITY: usize = 64;
/// Stake entries read concurrently while loading the stake list.
const STAKE_READ_CONCURRENCY: usize = 8;

/// Outcome of one cache group in a refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum GroupOutcome {
    Updated,
    Failed { reason: String },
    /// Not applicable in the current mode (user data while not connected).
    Skipped,
    /// The binding was rebuilt while the read was in flight; result dropped.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub sale: GroupOutcome,
    pub balances: GroupOutcome,
    pub stakes: GroupOutcome,
}

impl RefreshReport {
    fn outcomes(&self) -> [&GroupOutcome; 3] {
        [&self.sale, &self.balances, &self.stakes]
    }

    pub fn any_failed(&self) -> bool {
        self.outcomes()
            .iter()
            .any(|o| matches!(o, GroupOutcome::Failed { .. }))
    }

    pub fn any_updated(&self) -> bool {
        self.outcomes().contains(&&GroupOutcome::Updated)
    }

    pub fn outcome(&self, group: CacheGroup) -> &GroupOutcome {
        match group {
            CacheGroup::Sale => &self.sale,
            CacheGroup::Balances => &self.balances,
            CacheGroup::Stakes => &self.stakes,
        }
    }
}

/// Everything a UI needs to render, taken at one instant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub cache: ReadCache,
    pub pending: Vec<PendingTransaction>,
}

#[derive(Debug, Clone, Copy)]
enum ClearScope {
    UserScoped,
    All,
}

pub struct SessionSync {
    config: SessionConfig,
    abis: Arc<AbiSet>,
    rpc: Arc<dyn ReadProvider>,
    wallet: Option<Arc<dyn WalletProvider>>,
    state: Mutex<ConnectionState>,
    binding: Mutex<ContractBinding>,
    cache: Mutex<ReadCache>,
    pending: Arc<PendingTransactions>,
    events: broadcast::Sender<SessionEvent>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionSync {
    /// Load ABIs from `config.abi_dir` and bind read-only to `config.rpc_endpoint`.
    ///
    /// `wallet` is `None` when no wallet was detected; the session then starts
    /// in `ReadOnly`. With a wallet it starts `Disconnected` until `connect()`.
    pub fn initialize(
        config: SessionConfig,
        wallet: Option<Arc<dyn WalletProvider>>,
    ) -> Result<Arc<Self>> {
        let abis = AbiSet::load(&config.abi_dir)?;
        let rpc: Arc<dyn ReadProvider> = Arc::new(HttpRpc::new(config.rpc_endpoint.clone()));
        Ok(Self::with_providers(config, abis, rpc, wallet))
    }

    /// Build a session from already constructed capabilities.
    pub fn with_providers(
        config: SessionConfig,
        abis: AbiSet,
        rpc: Arc<dyn ReadProvider>,
        wallet: Option<Arc<dyn WalletProvider>>,
    ) -> Arc<Self> {
        let abis = Arc::new(abis);
        let mode = if wallet.is_some() {
            ConnectionMode::Disconnected
        } else {
            ConnectionMode::ReadOnly
        };
        let binding = ContractBinding::new(
            &abis,
            &config.contracts,
            Backend::ReadOnly(Arc::clone(&rpc)),
            0,
            0,
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            mode = ?mode,
            chain_id = config.chain_id,
            rpc = %config.rpc_endpoint,
            "session initialized"
        );

        Arc::new(Self {
            state: Mutex::new(ConnectionState {
                mode,
                address: None,
                chain_id: config.chain_id,
            }),
            binding: Mutex::new(binding),
            cache: Mutex::new(ReadCache::default()),
            pending: PendingTransactions::new(),
            events,
            refresh_task: Mutex::new(None),
            config,
            abis,
            rpc,
            wallet,
        })
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn has_wallet(&self) -> bool {
        self.wallet.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.state).clone()
    }

    pub fn cache(&self) -> ReadCache {
        lock(&self.cache).clone()
    }

    pub fn binding(&self) -> ContractBinding {
        lock(&self.binding).clone()
    }

    pub fn pending(&self) -> Vec<PendingTransaction> {
        self.pending.snapshot()
    }

    pub fn is_pending(&self, kind: TxKind) -> bool {
        self.pending.is_pending(kind)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (state, cache) = {
            let state = lock(&self.state);
            let cache = lock(&self.cache);
            (state.clone(), cache.clone())
        };
        SessionSnapshot {
            state,
            cache,
            pending: self.pending.snapshot(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn epoch(&self) -> u64 {
        lock(&self.binding).epoch
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Ask the wallet for authorization and bind to its signer.
    pub async fn connect(&self) -> Result<ConnectionState> {
        let wallet = self.wallet.clone().ok_or(SessionError::NoWallet)?;

        let accounts = wallet.request_accounts().await.inspect_err(|e| {
            warn!(error = %e, "wallet authorization failed");
        })?;
        let address = accounts
            .first()
            .copied()
            .ok_or(SessionError::UserRejected)?;

        self.ensure_chain(wallet.as_ref()).await?;

        let state = self.rebind(
            ConnectionMode::Connected,
            Some(address),
            self.config.chain_id,
            ClearScope::UserScoped,
        );
        self.refresh().await;
        Ok(state)
    }

    /// Make sure the wallet is on the configured chain, switching at most once.
    async fn ensure_chain(&self, wallet: &dyn WalletProvider) -> Result<()> {
        let expected = self.config.chain_id;
        let actual = wallet.chain_id().await?;
        if actual == expected {
            return Ok(());
        }

        warn!(expected, actual, "wallet on wrong network, requesting switch");
        if let Err(e) = self.switch_chain(wallet, expected).await {
            warn!(error = %e, "network switch failed");
            return Err(SessionError::WrongNetwork { expected, actual });
        }

        let actual = wallet.chain_id().await?;
        if actual != expected {
            return Err(SessionError::WrongNetwork { expected, actual });
        }
        Ok(())
    }

    async fn switch_chain(&self, wallet: &dyn WalletProvider, chain_id: u64) -> Result<()> {
        match wallet.switch_chain(chain_id).await {
            Err(SessionError::Rpc { code, .. }) if code == UNRECOGNIZED_CHAIN_CODE => {
                info!(chain_id, "wallet does not know the chain, adding it");
                wallet.add_chain(chain_id, &self.config.chain).await
            }
            other => other,
        }
    }

    /// Drop the signer and fall back to the read-only endpoint.
    ///
    /// Wallets cannot be revoked programmatically; this only forgets the account.
    pub fn disconnect(&self) -> ConnectionState {
        self.rebind(
            ConnectionMode::ReadOnly,
            None,
            self.config.chain_id,
            ClearScope::UserScoped,
        )
    }

    pub async fn on_accounts_changed(&self, accounts: &[Address]) -> ConnectionState {
        let current = self.state();
        if current.mode != ConnectionMode::Connected {
            debug!("ignoring account change while not connected");
            return current;
        }

        let Some(&next) = accounts.first() else {
            info!("wallet removed all accounts");
            return self.disconnect();
        };
        if current.address == Some(next) {
            return current;
        }

        let state = self.rebind(
            ConnectionMode::Connected,
            Some(next),
            current.chain_id,
            ClearScope::UserScoped,
        );
        self.refresh().await;
        state
    }

    /// A chain switch invalidates every binding and every cached read.
    pub async fn on_chain_changed(&self, chain_id: u64) -> ConnectionState {
        let current = self.state();
        let expected = self.config.chain_id;

        let state = match current.mode {
            ConnectionMode::Connected if chain_id == expected => self.rebind(
                ConnectionMode::Connected,
                current.address,
                chain_id,
                ClearScope::All,
            ),
            ConnectionMode::Connected => {
                warn!(
                    expected,
                    actual = chain_id,
                    "wallet left the configured network, falling back to read-only"
                );
                self.rebind(ConnectionMode::ReadOnly, None, expected, ClearScope::All)
            }
            mode => self.rebind(mode, None, expected, ClearScope::All),
        };
        self.refresh().await;
        state
    }

    pub async fn handle_wallet_event(&self, event: WalletEvent) -> ConnectionState {
        match event {
            WalletEvent::AccountsChanged(accounts) => self.on_accounts_changed(&accounts).await,
            WalletEvent::ChainChanged(chain_id) => self.on_chain_changed(chain_id).await,
        }
    }

    /// Apply wallet events one at a time, in arrival order.
    pub fn spawn_event_pump(self: &Arc<Self>, mut rx: mpsc::Receiver<WalletEvent>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                debug!(event = ?event, "wallet event");
                session.handle_wallet_event(event).await;
            }
        })
    }

    /// Install a new state and a freshly built binding in one step.
    fn rebind(
        &self,
        mode: ConnectionMode,
        address: Option<Address>,
        chain_id: u64,
        clear: ClearScope,
    ) -> ConnectionState {
        let new_state = {
            let mut state = lock(&self.state);
            let mut binding = lock(&self.binding);
            let mut cache = lock(&self.cache);

            let backend = match (mode, address, &self.wallet) {
                (ConnectionMode::Connected, Some(from), Some(wallet)) => Backend::Signer {
                    wallet: Arc::clone(wallet),
                    from,
                },
                _ => Backend::ReadOnly(Arc::clone(&self.rpc)),
            };
            let mode = if backend.signer().is_none() && mode == ConnectionMode::Connected {
                ConnectionMode::ReadOnly
            } else {
                mode
            };

            let chain_epoch = match clear {
                ClearScope::UserScoped => binding.chain_epoch,
                ClearScope::All => binding.chain_epoch + 1,
            };
            *binding = ContractBinding::new(
                &self.abis,
                &self.config.contracts,
                backend,
                binding.epoch + 1,
                chain_epoch,
            );
            match clear {
                ClearScope::UserScoped => cache.clear_user_scoped(),
                ClearScope::All => cache.clear(),
            }
            *state = ConnectionState {
                mode,
                address: address.filter(|_| mode == ConnectionMode::Connected),
                chain_id,
            };
            state.clone()
        };

        info!(
            mode = ?new_state.mode,
            address = ?new_state.address,
            chain_id = new_state.chain_id,
            "session state changed"
        );
        self.emit(SessionEvent::StateChanged {
            state: new_state.clone(),
        });
        new_state
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Refresh every cache group that applies to the current mode.
    ///
    /// Groups are fetched concurrently and each is committed as soon as its
    /// own reads finish, so a slow group never holds back the others. A failed
    /// or timed out group keeps its previous snapshot.
    pub async fn refresh(&self) -> RefreshReport {
        let (state, binding) = {
            let state = lock(&self.state);
            let binding = lock(&self.binding);
            (state.clone(), binding.clone())
        };
        let user = match state.mode {
            ConnectionMode::Connected => state.address,
            _ => None,
        };
        let limit = self.config.read_timeout();

        let (sale, balances, stakes) = tokio::join!(
            async {
                let result = within(limit, CacheGroup::Sale, fetch_sale(&binding)).await;
                self.commit(&binding, CacheGroup::Sale, result, |cache| &mut cache.sale)
            },
            async {
                let Some(owner) = user else {
                    return GroupOutcome::Skipped;
                };
                let result =
                    within(limit, CacheGroup::Balances, fetch_balances(&binding, owner)).await;
                self.commit(&binding, CacheGroup::Balances, result, |cache| {
                    &mut cache.balances
                })
            },
            async {
                let Some(owner) = user else {
                    return GroupOutcome::Skipped;
                };
                let result = within(limit, CacheGroup::Stakes, fetch_stakes(&binding, owner)).await;
                self.commit(&binding, CacheGroup::Stakes, result, |cache| &mut cache.stakes)
            },
        );

        let report = RefreshReport {
            sale,
            balances,
            stakes,
        };
        debug!(report = ?report, "refresh complete");
        report
    }

    /// Install one group's result, unless the binding it was read through has
    /// since been replaced in a way that invalidates that group.
    fn commit<T>(
        &self,
        started: &ContractBinding,
        group: CacheGroup,
        result: Result<Timestamped<T>>,
        slot: impl FnOnce(&mut ReadCache) -> &mut Option<Timestamped<T>>,
    ) -> GroupOutcome {
        let (outcome, stale) = {
            let binding = lock(&self.binding);
            let superseded = match group {
                CacheGroup::Sale => binding.chain_epoch != started.chain_epoch,
                CacheGroup::Balances | CacheGroup::Stakes => binding.epoch != started.epoch,
            };
            if superseded {
                debug!(
                    group = ?group,
                    epoch = started.epoch,
                    current = binding.epoch,
                    "refresh result superseded by rebind"
                );
                return GroupOutcome::Superseded;
            }

            let mut cache = lock(&self.cache);
            let outcome = merge(slot(&mut *cache), group, result);
            cache.record(group, !matches!(outcome, GroupOutcome::Failed { .. }));
            (outcome, cache.stale)
        };

        self.emit(SessionEvent::CacheUpdated { group, stale });
        outcome
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Run `action` as the single in-flight transaction of `kind`.
    ///
    /// Fails with `AlreadyPending` without running `action` if one is already
    /// in flight. `TxSubmitted` goes out when the action records the wallet's
    /// hash on its ticket. On success the cache is refreshed, unless the
    /// binding was rebuilt meanwhile: the result is then returned and reported
    /// as `TxSuperseded` but not acted on.
    pub async fn submit<T, F, Fut>(&self, kind: TxKind, action: F) -> Result<T>
    where
        F: FnOnce(ContractBinding, TxTicket) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.pending.try_begin(kind).inspect_err(|_| {
            debug!(kind = %kind, "submission blocked, already pending");
        })?;
        let binding = self.binding();
        let epoch = binding.epoch;
        let ticket = TxTicket::new(&guard, self.events.clone());

        debug!(kind = %kind, epoch, "transaction started");

        let outcome = action(binding, ticket).await;
        drop(guard);

        match outcome {
            Ok(value) => {
                if self.epoch() != epoch {
                    info!(kind = %kind, "session rebound during transaction, result superseded");
                    self.emit(SessionEvent::TxSuperseded { kind });
                    return Ok(value);
                }
                info!(kind = %kind, "transaction confirmed");
                self.emit(SessionEvent::TxConfirmed { kind });
                self.refresh().await;
                Ok(value)
            }
            Err(e) => {
                let e = match e {
                    e @ (SessionError::UserRejected
                    | SessionError::TransactionFailed(_)
                    | SessionError::InvalidAmount(_)
                    | SessionError::NotConnected) => e,
                    other => SessionError::TransactionFailed(other.reason()),
                };
                warn!(kind = %kind, error = %e, "transaction failed");
                self.emit(SessionEvent::TxFailed {
                    kind,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn require_connected(&self) -> Result<()> {
        if self.state().is_connected() {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    fn tx_timing(&self) -> (Duration, Duration) {
        (self.config.tx_timeout(), self.config.receipt_poll())
    }

    /// Buy tokens with `value_wei` of the native coin.
    pub async fn buy(&self, value_wei: U256) -> Result<TxReceipt> {
        self.require_connected()?;
        if value_wei.is_zero() {
            return Err(SessionError::InvalidAmount("enter a BNB amount".into()));
        }
        let timing = self.tx_timing();
        self.submit(TxKind::Buy, move |binding, ticket| async move {
            let min = binding.sale.min_buy_wei().await?;
            if value_wei < min {
                return Err(SessionError::InvalidAmount(format!(
                    "minimum buy is {} BNB",
                    format_units(min, DECIMALS)
                )));
            }
            confirm(binding.sale.buy(value_wei).await?, &ticket, timing).await
        })
        .await
    }

    /// Allow the staking contract to pull `amount` tokens.
    pub async fn approve(&self, amount: U256) -> Result<TxReceipt> {
        self.require_connected()?;
        if amount.is_zero() {
            return Err(SessionError::InvalidAmount("enter a stake amount".into()));
        }
        let spender = self.config.contracts.staking;
        let timing = self.tx_timing();
        self.submit(TxKind::Approve, move |binding, ticket| async move {
            confirm(binding.token.approve(spender, amount).await?, &ticket, timing).await
        })
        .await
    }

    /// Lock `amount` tokens for `months`.
    pub async fn stake(&self, amount: U256, months: u32) -> Result<TxReceipt> {
        self.require_connected()?;
        if amount.is_zero() {
            return Err(SessionError::InvalidAmount("enter a stake amount".into()));
        }
        if months == 0 {
            return Err(SessionError::InvalidAmount("choose a lock period".into()));
        }
        let timing = self.tx_timing();
        self.submit(TxKind::Stake, move |binding, ticket| async move {
            confirm(binding.staking.stake(amount, months).await?, &ticket, timing).await
        })
        .await
    }

    /// Withdraw the stake at `index` once its lock has expired.
    pub async fn withdraw(&self, index: u64) -> Result<TxReceipt> {
        self.require_connected()?;
        let timing = self.tx_timing();
        self.submit(TxKind::Withdraw, move |binding, ticket| async move {
            confirm(binding.staking.withdraw(index).await?, &ticket, timing).await
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Background refresh
    // -----------------------------------------------------------------------

    /// Start (or restart) the periodic refresh task.
    pub fn start_refresh_loop(self: &Arc<Self>) {
        let period = self.config.refresh_interval();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else {
                    break;
                };
                let report = session.refresh().await;
                if report.any_failed() {
                    debug!("periodic refresh left stale data");
                }
            }
        });

        if let Some(previous) = lock(&self.refresh_task).replace(handle) {
            previous.abort();
        }
        info!(interval_ms = period.as_millis() as u64, "refresh loop started");
    }

    pub fn is_refreshing(&self) -> bool {
        lock(&self.refresh_task)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Cancel the periodic refresh task.
    pub fn shutdown(&self) {
        if let Some(handle) = lock(&self.refresh_task).take() {
            handle.abort();
            info!("refresh loop stopped");
        }
    }
}

impl Drop for SessionSync {
    fn drop(&mut self) {
        let task = self
            .refresh_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }
}

fn merge<T>(
    slot: &mut Option<Timestamped<T>>,
    group: CacheGroup,
    result: Result<Timestamped<T>>,
) -> GroupOutcome {
    match result {
        Ok(fresh) => {
            *slot = Some(fresh);
            GroupOutcome::Updated
        }
        Err(e) => {
            warn!(group = ?group, error = %e, "refresh read failed, keeping previous snapshot");
            GroupOutcome::Failed {
                reason: e.to_string(),
            }
        }
    }
}

/// Bound one group's reads so a hung endpoint cannot stall the refresh.
async fn within<T>(
    limit: Duration,
    group: CacheGroup,
    read: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, read).await.unwrap_or_else(|_| {
        Err(SessionError::ReadFailure(format!(
            "{:?} reads timed out after {}ms",
            group,
            limit.as_millis()
        )))
    })
}

async fn confirm(
    tx: PendingTx,
    ticket: &TxTicket,
    (timeout, poll): (Duration, Duration),
) -> Result<TxReceipt> {
    ticket.record_hash(tx.hash());
    tx.wait(timeout, poll).await
}

async fn fetch_sale(binding: &ContractBinding) -> Result<Timestamped<SaleParams>> {
    let sale = &binding.sale;
    let (sale_active, min_buy_wei, tokens_per_bnb, available_tokens) = tokio::try_join!(
        sale.sale_active(),
        sale.min_buy_wei(),
        sale.tokens_per_bnb(),
        sale.available_tokens(),
    )?;
    Ok(Timestamped::now(SaleParams {
        sale_active,
        min_buy_wei,
        tokens_per_bnb,
        available_tokens,
    }))
}

async fn fetch_balances(binding: &ContractBinding, owner: Address) -> Result<Timestamped<Balances>> {
    let (native_wei, token_wei) = tokio::try_join!(
        binding.native_balance(owner),
        binding.token.balance_of(owner),
    )?;
    Ok(Timestamped::now(Balances {
        native_wei,
        token_wei,
    }))
}

/// Load every stake of `owner`, a bounded number of entries at a time.
async fn fetch_stakes(
    binding: &ContractBinding,
    owner: Address,
) -> Result<Timestamped<Vec<StakePosition>>> {
    let staking = &binding.staking;
    let count = staking.stake_count(owner).await?;

    let stakes = stream::iter(0..count)
        .map(move |index| async move {
            let (mut stake, can_withdraw) = tokio::try_join!(
                staking.stake_at(owner, index),
                staking.can_withdraw(owner, index),
            )?;
            stake.can_withdraw = can_withdraw;
            Ok::<_, SessionError>(stake)
        })
        .buffered(STAKE_READ_CONCURRENCY)
        .try_collect::<Vec<_>>()
        .await?;
    Ok(Timestamped::now(stakes))
}
