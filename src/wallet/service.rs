//! WalletService - lifecycle, queries and forwarding for one wallet.
//!
//! Two locks:
//!
//! - `ledger` (`tokio::sync::Mutex`) serializes UTXO refresh, reservations,
//!   the pending-forward queue and wallet persistence. Held across
//!   build, sign, broadcast and persist.
//! - `state` (`std::sync::RwLock`) is the read snapshot behind `balance()`,
//!   `short_info()` and `status()`. Balance and address updates are written
//!   while the ledger is held; never held across an await.

use super::builder::{check_amount, TransactionBuilder};
use super::pending::{PendingForward, PendingQueue};
use super::tracker::{Activity, ConfirmationTracker, ForwardAction, TrackerState};
use crate::chain::{ChainClient, Direction, KeyStore, UnspentOutput, WalletBalance};
use crate::config::ServiceConfig;
use crate::error::{ChainError, ServiceError, ServiceResult};
use crate::keys::{self, LoadedWallet, PersistedState, WalletSeed};
use crate::runtime::Shutdown;
use async_trait::async_trait;
use bitcoin::{Address, OutPoint, Txid};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::{broadcast, Notify, OnceCell};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ServiceStatus {
    /// Queries and forwards are served only while starting or running.
    pub fn is_ready(&self) -> bool {
        matches!(self, ServiceStatus::Starting | ServiceStatus::Running)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Uninitialized => "uninitialized",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ForwardReceipt {
    pub txid: Txid,
    pub destination: String,
    pub amount_sat: u64,
    pub fee_sat: u64,
    pub change_sat: u64,
    pub inputs: usize,
    pub peers: usize,
    /// False when the broadcast went out but the wallet file could not be written.
    pub persisted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceReport {
    pub confirmed: u64,
    pub pending: u64,
    pub immature: u64,
    pub available: u64,
    pub estimated: u64,
}

impl From<WalletBalance> for BalanceReport {
    fn from(b: WalletBalance) -> Self {
        Self {
            confirmed: b.confirmed,
            pending: b.trusted_pending + b.untrusted_pending,
            immature: b.immature,
            available: b.available(),
            estimated: b.estimated(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShortInfo {
    pub network: String,
    pub mnemonic: String,
    pub creation_time: String,
    pub receive_address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TxInfo {
    pub txid: Txid,
    pub direction: Direction,
    pub time: Option<String>,
    pub received: u64,
    pub sent: u64,
    /// received - sent, as seen by this wallet.
    pub value: i64,
    pub fee: Option<u64>,
    pub confirmations: u32,
    pub confirmed: bool,
}

struct WalletState {
    status: ServiceStatus,
    seed: Option<WalletSeed>,
    balance: WalletBalance,
    address_book: Vec<String>,
    receive_address: Option<Address>,
}

#[derive(Default)]
struct Ledger {
    /// Outpoint -> spending txid, for spends not yet reflected by the chain.
    reserved: HashMap<OutPoint, Txid>,
    pending: PendingQueue,
}

impl Ledger {
    /// Drop reservations the chain no longer reports and return what is
    /// still free to spend.
    fn spendable(&mut self, utxos: Vec<UnspentOutput>) -> Vec<UnspentOutput> {
        self.reserved.retain(|outpoint, _| utxos.iter().any(|u| u.outpoint == *outpoint));
        utxos.into_iter().filter(|u| !self.reserved.contains_key(&u.outpoint)).collect()
    }

    fn reserve(&mut self, outpoints: Vec<OutPoint>, txid: Txid) {
        for outpoint in outpoints {
            self.reserved.insert(outpoint, txid);
        }
    }

    fn release(&mut self, txid: Txid) {
        self.reserved.retain(|_, spender| *spender != txid);
    }
}

struct Inner<C: ChainClient + KeyStore> {
    config: ServiceConfig,
    destination: Address,
    chain: Arc<C>,
    builder: TransactionBuilder,
    ledger: tokio::sync::Mutex<Ledger>,
    state: RwLock<WalletState>,
    tracker: Arc<Mutex<TrackerState>>,
    activity: broadcast::Sender<Activity>,
    tasks: Shutdown,
    retry: Notify,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stopped: OnceCell<Result<(), ChainError>>,
}

/// Cheap to clone; all clones share one service.
pub struct WalletService<C: ChainClient + KeyStore> {
    inner: Arc<Inner<C>>,
}

impl<C: ChainClient + KeyStore> Clone for WalletService<C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<C: ChainClient + KeyStore> WalletService<C> {
    /// Validates the destination and amount; nothing is loaded until `start`.
    pub fn new(config: ServiceConfig, chain: Arc<C>) -> ServiceResult<Self> {
        let destination = config.destination_address()?;
        check_amount(config.amount_sat)?;
        let (activity, _) = broadcast::channel(256);
        let builder = TransactionBuilder::new(config.fee_multiplier);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                destination,
                chain,
                builder,
                ledger: tokio::sync::Mutex::new(Ledger::default()),
                state: RwLock::new(WalletState {
                    status: ServiceStatus::Uninitialized,
                    seed: None,
                    balance: WalletBalance::default(),
                    address_book: Vec::new(),
                    receive_address: None,
                }),
                tracker: Arc::new(Mutex::new(TrackerState::default())),
                activity,
                tasks: Shutdown::new(),
                retry: Notify::new(),
                handles: Mutex::new(Vec::new()),
                stopped: OnceCell::new(),
            }),
        })
    }

    pub fn config(&self) -> &ServiceConfig { &self.inner.config }

    pub fn chain(&self) -> &Arc<C> { &self.inner.chain }

    pub fn status(&self) -> ServiceStatus { self.inner.read_state().status }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<Activity> {
        self.inner.activity.subscribe()
    }

    /// Load the configured wallet file, or create one (see [`keys::create_or_load`]).
    pub fn create_or_load_wallet(&self) -> ServiceResult<LoadedWallet> {
        let config = &self.inner.config;
        keys::create_or_load(&config.wallet_path, config.network, config.new_wallet)
    }

    /// Load keys, bind and sync the chain client, spawn the tracker and the
    /// pending-forward worker, and hook `stop()` onto `exit`.
    ///
    /// Valid once, from `Uninitialized`. On any failure everything acquired
    /// so far is released and the service ends `Stopped`.
    pub async fn start(&self, exit: &Shutdown) -> ServiceResult<()> {
        {
            let mut state = self.inner.write_state();
            if state.status != ServiceStatus::Uninitialized {
                return Err(ServiceError::InvalidTransition { from: state.status });
            }
            state.status = ServiceStatus::Starting;
        }
        tracing::info!(network = self.inner.config.network.as_str(), wallet = %self.inner.config.wallet_path.display(), "Starting wallet service");

        if let Err(e) = self.start_inner(exit).await {
            tracing::error!("Startup failed: {}", e);
            if let Err(stop_err) = self.stop().await {
                tracing::warn!("Cleanup after failed startup: {}", stop_err);
            }
            return Err(e);
        }

        let mut state = self.inner.write_state();
        if state.status != ServiceStatus::Starting {
            return Err(ServiceError::NotReady { status: state.status });
        }
        state.status = ServiceStatus::Running;
        tracing::info!("Wallet service running");
        Ok(())
    }

    async fn start_inner(&self, exit: &Shutdown) -> ServiceResult<()> {
        let inner = &self.inner;
        let loaded = self.create_or_load_wallet()?;
        inner.chain.load_or_create_wallet(&loaded.seed).await?;

        *inner.lock_tracker() = loaded.state.tracker.clone();
        {
            let mut state = inner.write_state();
            state.balance = loaded.state.balance;
            state.address_book = loaded.state.address_book.clone();
            state.seed = Some(loaded.seed);
        }

        // Subscribe before syncing so no event from the initial sync is missed.
        let forwarder: Arc<dyn ForwardAction> = Arc::new(Forwarder { inner: Arc::downgrade(inner) });
        let tracker = ConfirmationTracker::new(
            inner.chain.clone(),
            forwarder,
            inner.config.forward_policy,
            inner.config.confirmation_depth,
            inner.tracker.clone(),
            inner.activity.clone(),
            inner.tasks.clone(),
        );
        inner.push_handle(tracker.spawn());

        let report = tokio::time::timeout(inner.config.sync_timeout, inner.chain.start_sync())
            .await
            .map_err(|_| ServiceError::SyncTimeout(inner.config.sync_timeout))??;
        if report.peers == 0 {
            return Err(ChainError::Sync("sync finished without a connected peer".into()).into());
        }
        tracing::info!(peers = report.peers, tip = report.tip_height, "Chain synced");

        {
            let ledger = inner.ledger.lock().await;
            let address = inner.chain.receive_address()?;
            let balance = inner.chain.balance()?;
            {
                let mut state = inner.write_state();
                let shown = address.to_string();
                if !state.address_book.contains(&shown) {
                    state.address_book.push(shown);
                }
                state.receive_address = Some(address);
                state.balance = balance;
            }
            inner.persist(&ledger)?;
        }

        inner.push_handle(tokio::spawn(pending_worker(Arc::downgrade(inner), inner.tasks.clone(), inner.chain.watch_balance())));
        inner.push_handle(tokio::spawn(exit_hook(Arc::downgrade(inner), exit.clone(), inner.tasks.clone())));
        Ok(())
    }

    /// Shut down exactly once. Concurrent and later callers wait for, and
    /// get, the result of the first run.
    pub async fn stop(&self) -> ServiceResult<()> {
        let inner = &self.inner;
        inner.stopped.get_or_init(|| inner.shutdown_sequence()).await.clone().map_err(ServiceError::from)
    }

    /// Forward `amount_sat` to `destination`. Resolves on relay acceptance.
    ///
    /// On `InsufficientFunds` the forward is also queued and retried once
    /// the available balance reaches the required amount.
    pub async fn forward(&self, destination: &Address, amount_sat: u64) -> ServiceResult<ForwardReceipt> {
        self.inner.forward_or_queue(destination, amount_sat).await
    }

    /// Forward the configured amount to the configured destination.
    pub async fn forward_configured(&self) -> ServiceResult<ForwardReceipt> {
        let destination = self.inner.destination.clone();
        self.forward(&destination, self.inner.config.amount_sat).await
    }

    pub fn balance(&self) -> ServiceResult<BalanceReport> {
        let state = self.inner.ready_state()?;
        Ok(state.balance.into())
    }

    pub fn short_info(&self) -> ServiceResult<ShortInfo> {
        let state = self.inner.ready_state()?;
        let seed = state.seed.as_ref().ok_or(ServiceError::Chain(ChainError::NotLoaded))?;
        let created = chrono::DateTime::from_timestamp(seed.creation_time(), 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| seed.creation_time().to_string());
        Ok(ShortInfo {
            network: self.inner.config.network.as_str().to_string(),
            mnemonic: seed.mnemonic().to_string(),
            creation_time: created,
            receive_address: state.receive_address.as_ref().map(|a| a.to_string()).unwrap_or_default(),
        })
    }

    pub fn tx_info(&self, txid: Txid) -> ServiceResult<Option<TxInfo>> {
        drop(self.inner.ready_state()?);
        let Some(details) = self.inner.chain.transaction(txid)? else {
            return Ok(None);
        };
        let direction = if details.received > details.sent { Direction::Incoming } else { Direction::Outgoing };
        Ok(Some(TxInfo {
            txid,
            direction,
            time: details
                .timestamp
                .and_then(|t| chrono::DateTime::from_timestamp(t as i64, 0))
                .map(|t| t.to_rfc3339()),
            received: details.received,
            sent: details.sent,
            value: details.received as i64 - details.sent as i64,
            fee: details.fee,
            confirmations: details.confirmations,
            confirmed: details.confirmations > 0,
        }))
    }

    /// Handed-out receive addresses, oldest first.
    pub fn address_book(&self) -> ServiceResult<Vec<String>> {
        Ok(self.inner.ready_state()?.address_book.clone())
    }

    /// Forwards waiting for funds.
    pub async fn pending_forwards(&self) -> Vec<PendingForward> {
        self.inner.ledger.lock().await.pending.iter().cloned().collect()
    }

    pub fn tracker_state(&self) -> TrackerState {
        self.inner.lock_tracker().clone()
    }
}

impl<C: ChainClient + KeyStore> Inner<C> {
    fn read_state(&self) -> RwLockReadGuard<'_, WalletState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, WalletState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_tracker(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.tracker.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ready_state(&self) -> ServiceResult<RwLockReadGuard<'_, WalletState>> {
        let state = self.read_state();
        if !state.status.is_ready() {
            return Err(ServiceError::NotReady { status: state.status });
        }
        Ok(state)
    }

    fn push_handle(&self, handle: JoinHandle<()>) {
        self.handles.lock().unwrap_or_else(|p| p.into_inner()).push(handle);
    }

    /// Write the wallet file and flush the chain store. Takes the ledger
    /// guard so it can only run inside the serialization domain.
    fn persist(&self, _ledger: &Ledger) -> ServiceResult<()> {
        let tracker = self.lock_tracker().clone();
        {
            let state = self.read_state();
            let Some(seed) = state.seed.as_ref() else {
                return Ok(());
            };
            let persisted = PersistedState { address_book: state.address_book.clone(), balance: state.balance, tracker };
            keys::save(&self.config.wallet_path, self.config.network, seed, &persisted)?;
        }
        self.chain.save_wallet().map_err(|e| ServiceError::Persistence(e.to_string()))
    }

    fn refresh_balance(&self, _ledger: &Ledger) {
        match self.chain.balance() {
            Ok(balance) => self.write_state().balance = balance,
            Err(e) => tracing::debug!("Balance refresh skipped: {}", e),
        }
    }

    async fn forward_or_queue(&self, destination: &Address, amount_sat: u64) -> ServiceResult<ForwardReceipt> {
        let mut ledger = self.ledger.lock().await;
        let result = self.forward_locked(&mut ledger, destination, amount_sat).await;
        if let Err(ServiceError::InsufficientFunds { required, available }) = &result {
            self.queue_pending(&mut ledger, PendingForward::new(destination.clone(), amount_sat, *required, insufficient(*required, *available)), *available);
        }
        result
    }

    fn queue_pending(&self, ledger: &mut Ledger, pending: PendingForward, available: u64) {
        tracing::info!(
            destination = %pending.destination,
            amount = pending.amount_sat,
            required = pending.threshold,
            available,
            attempts = pending.attempts,
            "Waiting for funds"
        );
        let _ = self.activity.send(Activity::WaitingForFunds {
            destination: pending.destination.to_string(),
            amount_sat: pending.amount_sat,
            required: pending.threshold,
            available,
        });
        ledger.pending.push(pending);
        self.retry.notify_one();
    }

    /// Refresh, build, sign, reserve, broadcast, persist. The caller holds
    /// the ledger for the whole sequence.
    async fn forward_locked(&self, ledger: &mut Ledger, destination: &Address, amount_sat: u64) -> ServiceResult<ForwardReceipt> {
        {
            let state = self.read_state();
            if !state.status.is_ready() {
                return Err(ServiceError::NotReady { status: state.status });
            }
        }

        let spendable = ledger.spendable(self.chain.current_utxos()?);
        let change_script = self.chain.change_script()?;
        let candidate = self.builder.build(&destination.script_pubkey(), amount_sat, &spendable, change_script)?;
        let signed = self.chain.sign(&candidate)?;
        let txid = signed.txid();

        ledger.reserve(candidate.outpoints(), txid);
        let ack = match self.chain.broadcast(&signed).await {
            Ok(ack) => ack,
            Err(e) => {
                ledger.release(txid);
                tracing::warn!(%txid, "Broadcast failed: {}", e);
                return Err(ServiceError::Broadcast(e.to_string()));
            }
        };
        tracing::info!(
            %txid,
            destination = %destination,
            amount = amount_sat,
            fee = candidate.fee,
            peers = ack.peers,
            "Forwarded coins"
        );

        self.refresh_balance(ledger);
        let persisted = match self.persist(ledger) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%txid, "Broadcast succeeded but wallet was not saved: {}", e);
                false
            }
        };

        let _ = self.activity.send(Activity::Forwarded {
            txid,
            destination: destination.to_string(),
            amount_sat,
            fee_sat: candidate.fee,
            persisted,
        });
        Ok(ForwardReceipt {
            txid,
            destination: destination.to_string(),
            amount_sat,
            fee_sat: candidate.fee,
            change_sat: candidate.change_amount(),
            inputs: candidate.inputs.len(),
            peers: ack.peers,
            persisted,
        })
    }

    /// Record the new balance and retry every pending forward it now covers.
    async fn on_balance(&self, balance: WalletBalance) {
        let mut ledger = self.ledger.lock().await;
        self.write_state().balance = balance;

        for pending in ledger.pending.take_ready(balance.available()) {
            let destination = pending.destination.clone();
            match self.forward_locked(&mut ledger, &destination, pending.amount_sat).await {
                Ok(receipt) => {
                    tracing::info!(txid = %receipt.txid, attempts = pending.attempts + 1, "Pending forward completed");
                }
                Err(ServiceError::InsufficientFunds { required, available }) => {
                    let reason = insufficient(required, available);
                    self.queue_pending(&mut ledger, pending.retried(required, reason), available);
                }
                Err(e) => {
                    tracing::warn!(destination = %destination, "Pending forward dropped: {}", e);
                    let _ = self.activity.send(Activity::ForwardFailed { reason: e.to_string() });
                }
            }
        }
    }

    async fn shutdown_sequence(&self) -> Result<(), ChainError> {
        let previous = {
            let mut state = self.write_state();
            let previous = state.status;
            state.status = ServiceStatus::Stopping;
            previous
        };
        tracing::info!(from = %previous, "Stopping wallet service");
        self.tasks.trigger().await;

        let result = if previous == ServiceStatus::Uninitialized {
            Ok(())
        } else {
            // Waits for an in-flight forward.
            let ledger = self.ledger.lock().await;
            let saved = self.persist(&ledger).map_err(|e| ChainError::Store(e.to_string()));
            let stopped = self.chain.stop().await;
            saved.and(stopped)
        };

        self.handles.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.write_state().status = ServiceStatus::Stopped;
        match &result {
            Ok(()) => tracing::info!("Wallet service stopped"),
            Err(e) => tracing::warn!("Wallet service stopped with error: {}", e),
        }
        result
    }
}

fn insufficient(required: u64, available: u64) -> String {
    format!("insufficient funds: required {} sat, available {} sat", required, available)
}

/// Tracker callback. Holds a weak reference so the spawned tracker does not
/// keep a stopped service alive.
struct Forwarder<C: ChainClient + KeyStore> {
    inner: Weak<Inner<C>>,
}

#[async_trait]
impl<C: ChainClient + KeyStore> ForwardAction for Forwarder<C> {
    async fn forward_on_confirmation(&self, trigger: Txid) -> ServiceResult<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        let destination = inner.destination.clone();
        tracing::debug!(%trigger, "Forwarding after confirmation");
        match inner.forward_or_queue(&destination, inner.config.amount_sat).await {
            Ok(_) | Err(ServiceError::InsufficientFunds { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Single consumer of the pending queue: wakes on balance changes and on
/// newly queued forwards.
async fn pending_worker<C: ChainClient + KeyStore>(
    inner: Weak<Inner<C>>,
    shutdown: Shutdown,
    mut balance: tokio::sync::watch::Receiver<WalletBalance>,
) {
    loop {
        let Some(service) = inner.upgrade() else { break };
        let woke = tokio::select! {
            _ = shutdown.wait() => false,
            changed = balance.changed() => changed.is_ok(),
            _ = service.retry.notified() => true,
        };
        if !woke {
            break;
        }
        let current = *balance.borrow_and_update();
        service.on_balance(current).await;
    }
    tracing::debug!("Pending-forward worker stopped");
}

async fn exit_hook<C: ChainClient + KeyStore>(inner: Weak<Inner<C>>, exit: Shutdown, tasks: Shutdown) {
    tokio::select! {
        _ = tasks.wait() => {}
        _ = exit.wait() => {
            if let Some(inner) = inner.upgrade() {
                let service = WalletService { inner };
                if let Err(e) = service.stop().await {
                    tracing::warn!("Shutdown on exit: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::config::Network;
    use std::time::Duration;
    use tempfile::TempDir;

    const SINK_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn sink() -> String {
        let seed = WalletSeed::from_mnemonic(SINK_MNEMONIC, 0).unwrap();
        keys::SeedKeys::derive(&seed, Network::Regtest).unwrap().first_receive_address().unwrap().to_string()
    }

    fn config(dir: &TempDir) -> ServiceConfig {
        ServiceConfig::new(dir.path().join("svc.wallet"))
            .with_network(Network::Regtest)
            .with_destination(sink())
            .with_sync_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn queries_before_start_are_not_ready() {
        let dir = TempDir::new().unwrap();
        let service = WalletService::new(config(&dir), Arc::new(MemoryChain::new(Network::Regtest))).unwrap();
        assert!(matches!(service.balance(), Err(ServiceError::NotReady { status: ServiceStatus::Uninitialized })));
        assert!(matches!(service.short_info(), Err(ServiceError::NotReady { .. })));
    }

    #[tokio::test]
    async fn start_twice_is_invalid() {
        let dir = TempDir::new().unwrap();
        let service = WalletService::new(config(&dir), Arc::new(MemoryChain::new(Network::Regtest))).unwrap();
        let exit = Shutdown::new();
        service.start(&exit).await.unwrap();
        assert_eq!(service.status(), ServiceStatus::Running);
        assert!(matches!(service.start(&exit).await, Err(ServiceError::InvalidTransition { from: ServiceStatus::Running })));
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_destination_rejected_at_construction() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir).with_destination("not-an-address");
        let result = WalletService::new(cfg, Arc::new(MemoryChain::new(Network::Regtest)));
        assert!(matches!(result, Err(ServiceError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn dust_amount_rejected_at_construction() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir).with_amount(100);
        let result = WalletService::new(cfg, Arc::new(MemoryChain::new(Network::Regtest)));
        assert!(matches!(result, Err(ServiceError::InvalidAmount { amount: 100, .. })));
    }

    #[tokio::test]
    async fn amount_above_max_money_rejected_at_construction() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir).with_amount(u64::MAX - 100);
        let result = WalletService::new(cfg, Arc::new(MemoryChain::new(Network::Regtest)));
        assert!(matches!(result, Err(ServiceError::InvalidAmount { .. })));
    }

    #[tokio::test]
    async fn sync_without_peers_fails_startup() {
        let dir = TempDir::new().unwrap();
        let chain = Arc::new(MemoryChain::new(Network::Regtest));
        chain.set_no_peers(true);
        let service = WalletService::new(config(&dir), chain.clone()).unwrap();

        let err = service.start(&Shutdown::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Chain(ChainError::Sync(_))));
        assert_eq!(service.status(), ServiceStatus::Stopped);
        assert!(chain.is_stopped());
    }

    #[tokio::test]
    async fn sync_timeout_leaves_service_stopped() {
        let dir = TempDir::new().unwrap();
        let chain = Arc::new(MemoryChain::new(Network::Regtest));
        chain.set_sync_stalled(true);
        let cfg = config(&dir).with_sync_timeout(Duration::from_millis(50));
        let service = WalletService::new(cfg, chain.clone()).unwrap();

        let err = service.start(&Shutdown::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::SyncTimeout(_)));
        assert_eq!(service.status(), ServiceStatus::Stopped);
        assert!(chain.is_stopped());
    }

    #[tokio::test]
    async fn stop_runs_once() {
        let dir = TempDir::new().unwrap();
        let chain = Arc::new(MemoryChain::new(Network::Regtest));
        let service = WalletService::new(config(&dir), chain.clone()).unwrap();
        let exit = Shutdown::new();
        service.start(&exit).await.unwrap();
        let saves_before = chain.save_count();

        let (a, b) = tokio::join!(service.stop(), service.stop());
        a.unwrap();
        b.unwrap();
        exit.trigger().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        service.stop().await.unwrap();

        assert_eq!(chain.save_count(), saves_before + 1);
        assert_eq!(service.status(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn exit_signal_stops_service() {
        let dir = TempDir::new().unwrap();
        let service = WalletService::new(config(&dir), Arc::new(MemoryChain::new(Network::Regtest))).unwrap();
        let exit = Shutdown::new();
        service.start(&exit).await.unwrap();

        exit.trigger().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.status(), ServiceStatus::Stopped);
        assert!(matches!(service.balance(), Err(ServiceError::NotReady { status: ServiceStatus::Stopped })));
    }

    #[tokio::test]
    async fn broadcast_failure_releases_reservation() {
        let dir = TempDir::new().unwrap();
        let chain = Arc::new(MemoryChain::new(Network::Regtest));
        // Depth out of reach: only the explicit forwards below broadcast.
        let service = WalletService::new(config(&dir).with_confirmation_depth(100), chain.clone()).unwrap();
        service.start(&Shutdown::new()).await.unwrap();
        let destination = service.config().destination_address().unwrap();

        chain.receive(10_000);
        chain.mine(1);

        let before = chain.broadcasts().len();
        chain.fail_next_broadcast("relay rejected");
        let err = service.forward(&destination, 600).await.unwrap_err();
        assert!(matches!(err, ServiceError::Broadcast(_)));

        // The same output is selectable again.
        let receipt = service.forward(&destination, 600).await.unwrap();
        assert_eq!(receipt.inputs, 1);
        assert_eq!(chain.broadcasts().len(), before + 1);
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn tx_info_reports_direction_and_depth() {
        let dir = TempDir::new().unwrap();
        let chain = Arc::new(MemoryChain::new(Network::Regtest));
        let service = WalletService::new(config(&dir), chain.clone()).unwrap();
        service.start(&Shutdown::new()).await.unwrap();

        let txid = chain.receive(2_000);
        let info = service.tx_info(txid).unwrap().unwrap();
        assert_eq!(info.direction, Direction::Incoming);
        assert_eq!(info.value, 2_000);
        assert!(!info.confirmed);

        chain.mine(2);
        let info = service.tx_info(txid).unwrap().unwrap();
        assert_eq!(info.confirmations, 2);
        assert!(info.confirmed);
        service.stop().await.unwrap();
    }
}
