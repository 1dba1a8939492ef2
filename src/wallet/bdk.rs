//! BdkChain - chain client over bdk_wallet 2.x + Electrum
//!
//! The wallet (descriptors, tx graph, checkpoints) lives in a
//! `bdk_wallet::file_store` file next to the wallet file. Electrum calls are
//! blocking and run on the blocking pool. A poller re-syncs revealed scripts
//! every `poll_interval` and turns new transactions, depth changes and
//! balance changes into the `ChainClient` channels.

use crate::chain::{
    BroadcastAck, ChainClient, Direction, KeyStore, SignedTransaction, SyncReport, TransactionDetails,
    UnspentOutput, WalletBalance, WalletEvent,
};
use crate::config::Network;
use crate::error::ChainError;
use crate::keys::WalletSeed;
use crate::runtime::Shutdown;
use crate::wallet::CandidateTransaction;
use async_trait::async_trait;
use bdk_electrum::{electrum_client::Client, BdkElectrumClient};
use bdk_wallet::{
    bitcoin::{bip32::Xpriv, Address, Amount, ScriptBuf, Transaction, Txid},
    chain::ChainPosition,
    file_store::Store as FileStore,
    template::Bip84,
    ChangeSet, KeychainKind, PersistedWallet, SignOptions, Wallet,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const MAGIC: &[u8] = b"beeforward0";
const STOP_GAP: usize = 10;
const BATCH_SIZE: usize = 10;

type Persisted = PersistedWallet<FileStore<ChangeSet>>;

struct Bound {
    wallet: Persisted,
    db: FileStore<ChangeSet>,
}

impl Bound {
    fn persist(&mut self) -> Result<(), ChainError> {
        self.wallet.persist(&mut self.db).map_err(|e| ChainError::Store(format!("Persist: {}", e)))?;
        Ok(())
    }

    fn confirmations(&self, txid: Txid) -> u32 {
        let tip = self.wallet.latest_checkpoint().height();
        match self.wallet.get_tx(txid).map(|tx| tx.chain_position) {
            Some(ChainPosition::Confirmed { anchor, .. }) => tip.saturating_sub(anchor.block_id.height) + 1,
            _ => 0,
        }
    }

    fn balance(&self) -> WalletBalance {
        let b = self.wallet.balance();
        WalletBalance {
            confirmed: b.confirmed.to_sat(),
            trusted_pending: b.trusted_pending.to_sat(),
            untrusted_pending: b.untrusted_pending.to_sat(),
            immature: b.immature.to_sat(),
        }
    }
}

struct Shared {
    network: Network,
    store_path: PathBuf,
    electrum_url: String,
    bound: Mutex<Option<Bound>>,
    client: Mutex<Option<Arc<BdkElectrumClient<Client>>>>,
    seen: Mutex<HashSet<Txid>>,
    watchers: Mutex<HashMap<Txid, watch::Sender<u32>>>,
    events: broadcast::Sender<WalletEvent>,
    balance: watch::Sender<WalletBalance>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Shared {
    fn with_wallet<T>(&self, f: impl FnOnce(&mut Bound) -> Result<T, ChainError>) -> Result<T, ChainError> {
        let mut guard = lock(&self.bound);
        let bound = guard.as_mut().ok_or(ChainError::NotLoaded)?;
        f(bound)
    }

    /// Connected Electrum client, connecting on first use.
    fn client(&self) -> Result<Arc<BdkElectrumClient<Client>>, ChainError> {
        if lock(&self.bound).is_none() {
            return Err(ChainError::NotLoaded);
        }
        let mut client = lock(&self.client);
        if let Some(existing) = client.as_ref() {
            return Ok(existing.clone());
        }
        let connected = Client::new(&self.electrum_url).map_err(|e| ChainError::Sync(format!("Electrum: {}", e)))?;
        tracing::info!(url = %self.electrum_url, "Connected to Electrum");
        let connected = Arc::new(BdkElectrumClient::new(connected));
        *client = Some(connected.clone());
        Ok(connected)
    }

    /// Open the chain store for `seed`, creating it when missing or when it
    /// belongs to other descriptors.
    fn bind(&self, seed: &[u8]) -> Result<(), ChainError> {
        let network = self.network.to_bitcoin();
        let xprv = Xpriv::new_master(network, seed).map_err(|e| ChainError::Other(format!("Key derivation: {}", e)))?;
        let (wallet, db) = open_store(xprv, network, &self.store_path)?;
        tracing::info!(store = %self.store_path.display(), "Chain store opened");

        *lock(&self.bound) = Some(Bound { wallet, db });
        Ok(())
    }

    /// Blocking scan + apply + persist, then publish what changed. `full`
    /// walks the keychains up to the stop gap; otherwise only revealed
    /// scripts are re-checked.
    fn scan(&self, full: bool) -> Result<u32, ChainError> {
        let client = self.client()?;
        if full {
            let request = self.with_wallet(|b| Ok(b.wallet.start_full_scan()))?;
            let update = client
                .full_scan(request, STOP_GAP, BATCH_SIZE, false)
                .map_err(|e| ChainError::Sync(e.to_string()))?;
            self.with_wallet(|b| {
                b.wallet.apply_update(update).map_err(|e| ChainError::Sync(format!("Apply: {}", e)))?;
                b.persist()
            })?;
        } else {
            let request = self.with_wallet(|b| Ok(b.wallet.start_sync_with_revealed_spks()))?;
            let update = client.sync(request, BATCH_SIZE, false).map_err(|e| ChainError::Sync(e.to_string()))?;
            self.with_wallet(|b| {
                b.wallet.apply_update(update).map_err(|e| ChainError::Sync(format!("Apply: {}", e)))?;
                b.persist()
            })?;
        }
        self.publish()
    }

    /// Emit events for transactions not seen before, push depth and
    /// balance updates. Returns the tip height.
    fn publish(&self) -> Result<u32, ChainError> {
        let (tip, events, balance) = self.with_wallet(|b| {
            let tip = b.wallet.latest_checkpoint().height();
            let mut seen = lock(&self.seen);
            let mut events = Vec::new();
            for tx in b.wallet.transactions() {
                let txid = tx.tx_node.txid;
                if !seen.insert(txid) {
                    continue;
                }
                let (sent, received) = b.wallet.sent_and_received(&tx.tx_node.tx);
                let (sent, received) = (sent.to_sat(), received.to_sat());
                let direction = if received > sent { Direction::Incoming } else { Direction::Outgoing };
                events.push(WalletEvent { txid, direction, received, sent });
            }
            drop(seen);

            for (txid, sender) in lock(&self.watchers).iter() {
                let confirmations = b.confirmations(*txid);
                sender.send_if_modified(|current| {
                    let changed = *current != confirmations;
                    *current = confirmations;
                    changed
                });
            }
            Ok((tip, events, b.balance()))
        })?;

        self.balance.send_if_modified(|current| {
            let changed = *current != balance;
            *current = balance;
            changed
        });
        for event in events {
            tracing::debug!(txid = %event.txid, direction = %event.direction, "Wallet transaction");
            let _ = self.events.send(event);
        }
        Ok(tip)
    }

    fn broadcast(&self, tx: Transaction) -> Result<Txid, ChainError> {
        use bdk_electrum::electrum_client::ElectrumApi;

        let client = self.client()?;
        let txid = client.inner.transaction_broadcast(&tx).map_err(|e| ChainError::Broadcast(e.to_string()))?;
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.with_wallet(|b| {
            b.wallet.apply_unconfirmed_txs([(tx, now)]);
            b.persist()
        })?;
        self.publish()?;
        Ok(txid)
    }
}

fn open_store(xprv: Xpriv, network: bdk_wallet::bitcoin::Network, path: &Path) -> Result<(Persisted, FileStore<ChangeSet>), ChainError> {
    let ext = Bip84(xprv, KeychainKind::External);
    let int = Bip84(xprv, KeychainKind::Internal);

    let mut db: FileStore<ChangeSet> = FileStore::load_or_create(MAGIC, path)
        .map_err(|e| ChainError::Store(format!("FileStore: {}", e)))?
        .0;

    let loaded = Wallet::load()
        .descriptor(KeychainKind::External, Some(ext.clone()))
        .descriptor(KeychainKind::Internal, Some(int.clone()))
        .extract_keys()
        .check_network(network)
        .load_wallet(&mut db);

    match loaded {
        Ok(Some(wallet)) => return Ok((wallet, db)),
        Ok(None) => {}
        Err(e) => {
            // Chain store belongs to another seed or network; it is only a
            // cache, so start it over.
            tracing::warn!(store = %path.display(), "Discarding chain store: {}", e);
            drop(db);
            std::fs::remove_file(path).map_err(|e| ChainError::Store(format!("{}: {}", path.display(), e)))?;
            db = FileStore::load_or_create(MAGIC, path)
                .map_err(|e| ChainError::Store(format!("FileStore: {}", e)))?
                .0;
        }
    }

    let wallet = Wallet::create(ext, int)
        .network(network)
        .create_wallet(&mut db)
        .map_err(|e| ChainError::Store(format!("Create wallet: {}", e)))?;
    Ok((wallet, db))
}

pub fn default_electrum_url(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "ssl://electrum.blockstream.info:50002",
        Network::Testnet => "ssl://electrum.blockstream.info:60002",
        Network::Signet => "ssl://mempool.space:60602",
        Network::Regtest => "tcp://127.0.0.1:60401",
    }
}

fn join_error(e: tokio::task::JoinError) -> ChainError {
    ChainError::Other(format!("blocking task: {}", e))
}

pub struct BdkChain {
    shared: Arc<Shared>,
    poll_interval: Duration,
    poller: Mutex<Option<JoinHandle<()>>>,
    shutdown: Shutdown,
}

impl BdkChain {
    /// `store_path` is the chain store (`*.chain`); `electrum_url` falls back
    /// to a public server for the network.
    pub fn new(network: Network, store_path: impl Into<PathBuf>, electrum_url: Option<&str>, poll_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        let (balance, _) = watch::channel(WalletBalance::default());
        Self {
            shared: Arc::new(Shared {
                network,
                store_path: store_path.into(),
                electrum_url: electrum_url.unwrap_or(default_electrum_url(network)).to_string(),
                bound: Mutex::new(None),
                client: Mutex::new(None),
                seen: Mutex::new(HashSet::new()),
                watchers: Mutex::new(HashMap::new()),
                events,
                balance,
            }),
            poll_interval,
            poller: Mutex::new(None),
            shutdown: Shutdown::new(),
        }
    }

    fn start_poller(&self) {
        let mut poller = lock(&self.poller);
        if poller.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.poll_interval;
        *poller = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let shared = shared.clone();
                match tokio::task::spawn_blocking(move || shared.scan(false)).await {
                    Ok(Ok(tip)) => tracing::trace!(tip, "Electrum poll"),
                    Ok(Err(e)) => tracing::warn!("Electrum poll failed: {}", e),
                    Err(e) => tracing::warn!("Electrum poll task: {}", e),
                }
            }
            tracing::debug!("Electrum poller stopped");
        }));
    }
}

#[async_trait]
impl ChainClient for BdkChain {
    async fn load_or_create_wallet(&self, seed: &WalletSeed) -> Result<(), ChainError> {
        let bytes = seed.to_seed().map_err(|e| ChainError::Other(e.to_string()))?;
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || shared.bind(&bytes[..])).await.map_err(join_error)?
    }

    async fn start_sync(&self) -> Result<SyncReport, ChainError> {
        let shared = self.shared.clone();
        let tip = tokio::task::spawn_blocking(move || shared.scan(true)).await.map_err(join_error)??;
        self.start_poller();
        Ok(SyncReport { peers: 1, tip_height: tip })
    }

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.shared.events.subscribe()
    }

    fn watch_confirmations(&self, txid: Txid) -> watch::Receiver<u32> {
        let current = self.shared.with_wallet(|b| Ok(b.confirmations(txid))).unwrap_or(0);
        lock(&self.shared.watchers).entry(txid).or_insert_with(|| watch::channel(current).0).subscribe()
    }

    fn watch_balance(&self) -> watch::Receiver<WalletBalance> {
        self.shared.balance.subscribe()
    }

    async fn broadcast(&self, tx: &SignedTransaction) -> Result<BroadcastAck, ChainError> {
        let shared = self.shared.clone();
        let raw = tx.tx.clone();
        let txid = tokio::task::spawn_blocking(move || shared.broadcast(raw)).await.map_err(join_error)??;
        Ok(BroadcastAck { txid, peers: 1 })
    }

    fn current_utxos(&self) -> Result<Vec<UnspentOutput>, ChainError> {
        self.shared.with_wallet(|b| {
            let tip = b.wallet.latest_checkpoint().height();
            Ok(b.wallet
                .list_unspent()
                .filter_map(|utxo| {
                    let confirmations = match utxo.chain_position {
                        ChainPosition::Confirmed { anchor, .. } => tip.saturating_sub(anchor.block_id.height) + 1,
                        ChainPosition::Unconfirmed { .. } => 0,
                    };
                    // Unconfirmed outputs are spendable only when they are our own change.
                    if confirmations == 0 && utxo.keychain != KeychainKind::Internal {
                        return None;
                    }
                    Some(UnspentOutput {
                        outpoint: utxo.outpoint,
                        amount_sat: utxo.txout.value.to_sat(),
                        script_pubkey: utxo.txout.script_pubkey,
                        confirmations,
                    })
                })
                .collect())
        })
    }

    fn balance(&self) -> Result<WalletBalance, ChainError> {
        self.shared.with_wallet(|b| Ok(b.balance()))
    }

    fn transaction(&self, txid: Txid) -> Result<Option<TransactionDetails>, ChainError> {
        self.shared.with_wallet(|b| {
            let confirmations = b.confirmations(txid);
            Ok(b.wallet.get_tx(txid).map(|tx| {
                let (timestamp, block_height) = match tx.chain_position {
                    ChainPosition::Confirmed { anchor, .. } => (Some(anchor.confirmation_time), Some(anchor.block_id.height)),
                    ChainPosition::Unconfirmed { last_seen, .. } => (last_seen, None),
                };
                let (sent, received) = b.wallet.sent_and_received(&tx.tx_node.tx);
                TransactionDetails {
                    txid,
                    received: received.to_sat(),
                    sent: sent.to_sat(),
                    fee: b.wallet.calculate_fee(&tx.tx_node.tx).ok().map(|f| f.to_sat()),
                    confirmations,
                    timestamp,
                    block_height,
                }
            }))
        })
    }

    fn save_wallet(&self) -> Result<(), ChainError> {
        self.shared.with_wallet(|b| b.persist())
    }

    async fn stop(&self) -> Result<(), ChainError> {
        self.shutdown.trigger().await;
        let poller = lock(&self.poller).take();
        if let Some(handle) = poller {
            if let Err(e) = handle.await {
                tracing::debug!("Electrum poller join: {}", e);
            }
        }
        lock(&self.shared.watchers).clear();
        *lock(&self.shared.client) = None;
        match self.shared.with_wallet(|b| b.persist()) {
            Err(ChainError::NotLoaded) => Ok(()),
            other => other,
        }
    }
}

impl KeyStore for BdkChain {
    fn receive_address(&self) -> Result<Address, ChainError> {
        self.shared.with_wallet(|b| {
            let address = b.wallet.next_unused_address(KeychainKind::External).address;
            b.persist()?;
            Ok(address)
        })
    }

    fn change_script(&self) -> Result<ScriptBuf, ChainError> {
        self.shared.with_wallet(|b| {
            let script = b.wallet.next_unused_address(KeychainKind::Internal).address.script_pubkey();
            b.persist()?;
            Ok(script)
        })
    }

    /// Re-creates the candidate with BDK's builder (same inputs, same
    /// recipient, same absolute fee) so BDK can produce the PSBT and sign it.
    /// BDK places any change on the next internal address.
    fn sign(&self, candidate: &CandidateTransaction) -> Result<SignedTransaction, ChainError> {
        self.shared.with_wallet(|b| {
            let mut builder = b.wallet.build_tx();
            builder
                .add_utxos(&candidate.outpoints())
                .map_err(|e| ChainError::Signing(format!("Inputs: {}", e)))?;
            builder.manually_selected_only();
            builder.add_recipient(candidate.recipient.script_pubkey.clone(), candidate.recipient.value);
            builder.fee_absolute(Amount::from_sat(candidate.fee));

            let mut psbt = builder.finish().map_err(|e| ChainError::Signing(format!("Build: {}", e)))?;
            #[allow(deprecated)]
            let finalized = b
                .wallet
                .sign(&mut psbt, SignOptions::default())
                .map_err(|e| ChainError::Signing(format!("Sign: {}", e)))?;
            if !finalized {
                return Err(ChainError::Signing("transaction not fully signed".into()));
            }
            let fee = psbt.fee().map_err(|e| ChainError::Signing(format!("Fee: {}", e)))?.to_sat();
            let tx = psbt.extract_tx().map_err(|e| ChainError::Signing(format!("Extract: {}", e)))?;
            Ok(SignedTransaction { tx, fee })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_urls_per_network() {
        assert!(default_electrum_url(Network::Testnet).ends_with(":60002"));
        assert!(default_electrum_url(Network::Regtest).starts_with("tcp://"));
    }

    #[tokio::test]
    async fn unbound_client_reports_not_loaded() {
        let dir = TempDir::new().unwrap();
        let chain = BdkChain::new(Network::Regtest, dir.path().join("x.chain"), None, Duration::from_secs(1));
        assert!(matches!(chain.balance(), Err(ChainError::NotLoaded)));
        assert!(matches!(chain.current_utxos(), Err(ChainError::NotLoaded)));
        assert!(matches!(chain.receive_address(), Err(ChainError::NotLoaded)));
        chain.stop().await.unwrap();
    }

    #[test]
    fn store_reopens_with_same_descriptors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w.chain");
        let seed = WalletSeed::from_mnemonic(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
            0,
        )
        .unwrap();
        let bytes = seed.to_seed().unwrap();
        let xprv = Xpriv::new_master(bdk_wallet::bitcoin::Network::Regtest, &bytes[..]).unwrap();

        let first = {
            let (mut wallet, mut db) = open_store(xprv, bdk_wallet::bitcoin::Network::Regtest, &path).unwrap();
            let address = wallet.reveal_next_address(KeychainKind::External).address;
            wallet.persist(&mut db).unwrap();
            address
        };
        let (wallet, _db) = open_store(xprv, bdk_wallet::bitcoin::Network::Regtest, &path).unwrap();
        assert_eq!(wallet.peek_address(KeychainKind::External, 0).address, first);
        assert_eq!(wallet.derivation_index(KeychainKind::External), Some(0));
    }
}
