//! MemoryChain - an in-process chain client.
//!
//! Keeps a UTXO set, a block counter and per-transaction confirmation
//! channels in memory. Addresses are real BIP84 derivations of the bound
//! seed; "signing" returns the unsigned transaction, since nothing here
//! validates scripts. Test hooks (`receive`, `mine`, `fail_next_broadcast`,
//! ...) drive the chain from the outside.

use super::{
    BroadcastAck, ChainClient, Direction, KeyStore, SignedTransaction, SyncReport, TransactionDetails,
    UnspentOutput, WalletBalance, WalletEvent,
};
use crate::config::Network;
use crate::error::ChainError;
use crate::keys::{Keychain, SeedKeys, WalletSeed};
use crate::wallet::CandidateTransaction;
use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{
    absolute, transaction, Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone)]
struct OwnedOutput {
    amount_sat: u64,
    script_pubkey: ScriptBuf,
}

#[derive(Debug, Clone)]
struct MemoryTx {
    direction: Direction,
    received: u64,
    sent: u64,
    fee: Option<u64>,
    height: Option<u32>,
    seen_at: u64,
}

#[derive(Default)]
struct MemoryState {
    keys: Option<SeedKeys>,
    receive_index: u32,
    own_scripts: HashSet<ScriptBuf>,
    tip: u32,
    utxos: BTreeMap<OutPoint, OwnedOutput>,
    txs: HashMap<Txid, MemoryTx>,
    watchers: HashMap<Txid, watch::Sender<u32>>,
    broadcasts: Vec<SignedTransaction>,
    broadcast_failures: VecDeque<String>,
    broadcast_delay: Option<Duration>,
    sync_stalled: bool,
    no_peers: bool,
    nonce: u64,
    saves: usize,
    stopped: bool,
}

impl MemoryState {
    fn confirmations(&self, txid: &Txid) -> u32 {
        match self.txs.get(txid).and_then(|t| t.height) {
            Some(height) => self.tip.saturating_sub(height) + 1,
            None => 0,
        }
    }

    fn is_spendable(&self, outpoint: &OutPoint) -> bool {
        self.txs
            .get(&outpoint.txid)
            .map(|t| t.height.is_some() || t.direction == Direction::Outgoing)
            .unwrap_or(false)
    }

    fn balance(&self) -> WalletBalance {
        let mut balance = WalletBalance::default();
        for (outpoint, output) in &self.utxos {
            match self.txs.get(&outpoint.txid) {
                Some(tx) if tx.height.is_some() => balance.confirmed += output.amount_sat,
                Some(tx) if tx.direction == Direction::Outgoing => balance.trusted_pending += output.amount_sat,
                _ => balance.untrusted_pending += output.amount_sat,
            }
        }
        balance
    }

    fn details(&self, txid: Txid) -> Option<TransactionDetails> {
        let tx = self.txs.get(&txid)?;
        Some(TransactionDetails {
            txid,
            received: tx.received,
            sent: tx.sent,
            fee: tx.fee,
            confirmations: self.confirmations(&txid),
            timestamp: Some(tx.seen_at),
            block_height: tx.height,
        })
    }

    fn keys(&self) -> Result<&SeedKeys, ChainError> {
        self.keys.as_ref().ok_or(ChainError::NotLoaded)
    }
}

pub struct MemoryChain {
    network: Network,
    state: Mutex<MemoryState>,
    events: broadcast::Sender<WalletEvent>,
    balance: watch::Sender<WalletBalance>,
}

impl MemoryChain {
    pub fn new(network: Network) -> Self {
        let (events, _) = broadcast::channel(256);
        let (balance, _) = watch::channel(WalletBalance::default());
        Self { network, state: Mutex::new(MemoryState::default()), events, balance }
    }

    pub fn network(&self) -> Network { self.network }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, state: &MemoryState) {
        self.balance.send_replace(state.balance());
        for (txid, sender) in &state.watchers {
            let confirmations = state.confirmations(txid);
            sender.send_if_modified(|current| {
                if *current != confirmations {
                    *current = confirmations;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Pay `amount_sat` to the current receive address in a new mempool
    /// transaction. Emits an incoming event.
    pub fn receive(&self, amount_sat: u64) -> Txid {
        let mut state = self.lock();
        let script = match state.keys() {
            Ok(keys) => keys
                .address(Keychain::External, state.receive_index)
                .map(|a| a.script_pubkey())
                .unwrap_or_default(),
            Err(_) => ScriptBuf::new(),
        };
        state.own_scripts.insert(script.clone());
        state.receive_index += 1;
        state.nonce += 1;

        let funding = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid: Txid::from_byte_array(nonce_bytes(state.nonce)), vout: 0 },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: Amount::from_sat(amount_sat), script_pubkey: script.clone() }],
        };
        let txid = funding.compute_txid();
        state.utxos.insert(OutPoint { txid, vout: 0 }, OwnedOutput { amount_sat, script_pubkey: script });
        state.txs.insert(txid, MemoryTx {
            direction: Direction::Incoming,
            received: amount_sat,
            sent: 0,
            fee: None,
            height: None,
            seen_at: now(),
        });
        self.publish(&state);
        drop(state);

        let _ = self.events.send(WalletEvent { txid, direction: Direction::Incoming, received: amount_sat, sent: 0 });
        txid
    }

    /// Record a spend that did not go through `broadcast` (e.g. made by
    /// another instance of the same seed).
    pub fn inject_outgoing(&self, sent: u64) -> Txid {
        let mut state = self.lock();
        state.nonce += 1;
        let txid = Txid::from_byte_array(nonce_bytes(u64::MAX - state.nonce));
        state.txs.insert(txid, MemoryTx {
            direction: Direction::Outgoing,
            received: 0,
            sent,
            fee: None,
            height: None,
            seen_at: now(),
        });
        drop(state);
        let _ = self.events.send(WalletEvent { txid, direction: Direction::Outgoing, received: 0, sent });
        txid
    }

    /// Re-deliver the event for a known transaction.
    pub fn replay_event(&self, txid: Txid) {
        let event = {
            let state = self.lock();
            state.txs.get(&txid).map(|tx| WalletEvent { txid, direction: tx.direction, received: tx.received, sent: tx.sent })
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    /// Drop an unconfirmed transaction from the mempool, as after a
    /// replacement. Its confirmation watchers are closed. Returns false for
    /// unknown or mined transactions.
    pub fn evict(&self, txid: Txid) -> bool {
        let mut state = self.lock();
        if !matches!(state.txs.get(&txid), Some(tx) if tx.height.is_none()) {
            return false;
        }
        state.txs.remove(&txid);
        state.utxos.retain(|outpoint, _| outpoint.txid != txid);
        state.watchers.remove(&txid);
        self.publish(&state);
        true
    }

    /// Mine `blocks` blocks; the first one includes every mempool transaction.
    pub fn mine(&self, blocks: u32) {
        let mut state = self.lock();
        for i in 0..blocks {
            state.tip += 1;
            if i == 0 {
                let tip = state.tip;
                for tx in state.txs.values_mut().filter(|t| t.height.is_none()) {
                    tx.height = Some(tip);
                }
            }
        }
        self.publish(&state);
    }

    pub fn fail_next_broadcast(&self, reason: impl Into<String>) {
        self.lock().broadcast_failures.push_back(reason.into());
    }

    /// Make every broadcast take `delay` before it is acknowledged.
    pub fn set_broadcast_delay(&self, delay: Option<Duration>) {
        self.lock().broadcast_delay = delay;
    }

    /// While stalled, `start_sync` never completes.
    pub fn set_sync_stalled(&self, stalled: bool) {
        self.lock().sync_stalled = stalled;
    }

    /// Sync completes but reports no connected peer.
    pub fn set_no_peers(&self, no_peers: bool) {
        self.lock().no_peers = no_peers;
    }

    pub fn broadcasts(&self) -> Vec<SignedTransaction> {
        self.lock().broadcasts.clone()
    }

    pub fn tip(&self) -> u32 { self.lock().tip }

    pub fn save_count(&self) -> usize { self.lock().saves }

    pub fn is_stopped(&self) -> bool { self.lock().stopped }
}

fn nonce_bytes(nonce: u64) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&nonce.to_le_bytes());
    bytes
}

fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[async_trait]
impl ChainClient for MemoryChain {
    async fn load_or_create_wallet(&self, seed: &WalletSeed) -> Result<(), ChainError> {
        let keys = SeedKeys::derive(seed, self.network).map_err(|e| ChainError::Other(e.to_string()))?;
        let mut state = self.lock();
        state.keys = Some(keys);
        state.stopped = false;
        Ok(())
    }

    async fn start_sync(&self) -> Result<SyncReport, ChainError> {
        let stalled = {
            let state = self.lock();
            state.keys()?;
            state.sync_stalled
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        let state = self.lock();
        self.publish(&state);
        let peers = if state.no_peers { 0 } else { 1 };
        Ok(SyncReport { peers, tip_height: state.tip })
    }

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    fn watch_confirmations(&self, txid: Txid) -> watch::Receiver<u32> {
        let mut state = self.lock();
        let confirmations = state.confirmations(&txid);
        state.watchers.entry(txid).or_insert_with(|| watch::channel(confirmations).0).subscribe()
    }

    fn watch_balance(&self) -> watch::Receiver<WalletBalance> {
        self.balance.subscribe()
    }

    async fn broadcast(&self, tx: &SignedTransaction) -> Result<BroadcastAck, ChainError> {
        let delay = self.lock().broadcast_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let txid = tx.txid();
        let sent;
        let received;
        {
            let mut state = self.lock();
            if state.stopped {
                return Err(ChainError::Broadcast("chain client stopped".into()));
            }
            if let Some(reason) = state.broadcast_failures.pop_front() {
                return Err(ChainError::Broadcast(reason));
            }
            for input in &tx.tx.input {
                if !state.utxos.contains_key(&input.previous_output) {
                    return Err(ChainError::Broadcast(format!("input {} missing or already spent", input.previous_output)));
                }
            }

            sent = tx
                .tx
                .input
                .iter()
                .filter_map(|i| state.utxos.remove(&i.previous_output))
                .map(|o| o.amount_sat)
                .sum::<u64>();
            let mut change = 0;
            for (vout, output) in tx.tx.output.iter().enumerate() {
                if state.own_scripts.contains(&output.script_pubkey) {
                    change += output.value.to_sat();
                    state.utxos.insert(
                        OutPoint { txid, vout: vout as u32 },
                        OwnedOutput { amount_sat: output.value.to_sat(), script_pubkey: output.script_pubkey.clone() },
                    );
                }
            }
            received = change;
            state.txs.insert(txid, MemoryTx {
                direction: Direction::Outgoing,
                received,
                sent,
                fee: Some(tx.fee),
                height: None,
                seen_at: now(),
            });
            state.broadcasts.push(tx.clone());
            self.publish(&state);
        }

        let _ = self.events.send(WalletEvent { txid, direction: Direction::Outgoing, received, sent });
        Ok(BroadcastAck { txid, peers: 1 })
    }

    fn current_utxos(&self) -> Result<Vec<UnspentOutput>, ChainError> {
        let state = self.lock();
        state.keys()?;
        Ok(state
            .utxos
            .iter()
            .filter(|(outpoint, _)| state.is_spendable(outpoint))
            .map(|(outpoint, output)| UnspentOutput {
                outpoint: *outpoint,
                amount_sat: output.amount_sat,
                script_pubkey: output.script_pubkey.clone(),
                confirmations: state.confirmations(&outpoint.txid),
            })
            .collect())
    }

    fn balance(&self) -> Result<WalletBalance, ChainError> {
        Ok(self.lock().balance())
    }

    fn transaction(&self, txid: Txid) -> Result<Option<TransactionDetails>, ChainError> {
        Ok(self.lock().details(txid))
    }

    fn save_wallet(&self) -> Result<(), ChainError> {
        self.lock().saves += 1;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChainError> {
        let mut state = self.lock();
        state.stopped = true;
        state.watchers.clear();
        Ok(())
    }
}

impl KeyStore for MemoryChain {
    fn receive_address(&self) -> Result<Address, ChainError> {
        let mut state = self.lock();
        let index = state.receive_index;
        let address = state.keys()?.address(Keychain::External, index).map_err(|e| ChainError::Other(e.to_string()))?;
        state.own_scripts.insert(address.script_pubkey());
        Ok(address)
    }

    fn change_script(&self) -> Result<ScriptBuf, ChainError> {
        let mut state = self.lock();
        let script = state
            .keys()?
            .address(Keychain::Internal, 0)
            .map_err(|e| ChainError::Other(e.to_string()))?
            .script_pubkey();
        state.own_scripts.insert(script.clone());
        Ok(script)
    }

    fn sign(&self, candidate: &CandidateTransaction) -> Result<SignedTransaction, ChainError> {
        self.lock().keys()?;
        Ok(SignedTransaction { tx: candidate.to_unsigned_tx(), fee: candidate.fee })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loaded() -> MemoryChain {
        let chain = MemoryChain::new(Network::Regtest);
        chain.load_or_create_wallet(&WalletSeed::generate().unwrap()).await.unwrap();
        chain
    }

    #[tokio::test]
    async fn unloaded_chain_refuses_queries() {
        let chain = MemoryChain::new(Network::Regtest);
        assert!(matches!(chain.current_utxos(), Err(ChainError::NotLoaded)));
        assert!(matches!(chain.start_sync().await, Err(ChainError::NotLoaded)));
    }

    #[tokio::test]
    async fn incoming_is_untrusted_until_mined() {
        let chain = loaded().await;
        chain.receive(10_000);
        assert_eq!(chain.balance().unwrap().untrusted_pending, 10_000);
        assert!(chain.current_utxos().unwrap().is_empty());

        chain.mine(1);
        assert_eq!(chain.balance().unwrap().confirmed, 10_000);
        assert_eq!(chain.current_utxos().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn confirmations_follow_tip() {
        let chain = loaded().await;
        let txid = chain.receive(1_000);
        let rx = chain.watch_confirmations(txid);
        assert_eq!(*rx.borrow(), 0);
        chain.mine(3);
        assert_eq!(*rx.borrow(), 3);
        assert_eq!(chain.transaction(txid).unwrap().unwrap().confirmations, 3);
    }

    #[tokio::test]
    async fn double_spend_rejected() {
        let chain = loaded().await;
        let txid = chain.receive(5_000);
        chain.mine(1);
        let utxo = chain.current_utxos().unwrap().remove(0);
        let spend = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn { previous_output: OutPoint { txid, vout: 0 }, ..Default::default() }],
            output: vec![TxOut { value: Amount::from_sat(4_000), script_pubkey: ScriptBuf::new() }],
        };
        let signed = SignedTransaction { tx: spend, fee: 1_000 };
        assert_eq!(utxo.amount_sat, 5_000);
        chain.broadcast(&signed).await.unwrap();
        assert!(matches!(chain.broadcast(&signed).await, Err(ChainError::Broadcast(_))));
    }
}
