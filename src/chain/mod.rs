//! Chain - the collaborator contracts the wallet service is written against
//!
//! The service never talks to peers, validates headers or signs by itself.
//! Those jobs belong to a chain client (`ChainClient`) and a key store
//! (`KeyStore`). Two implementations ship with the crate:
//!
//! | Client | Backend | Use |
//! |--------|---------|-----|
//! | [`MemoryChain`] | in-process UTXO set and block counter | tests, `--offline` |
//! | `BdkChain` | BDK 2.x wallet + Electrum, `file_store` chain store | production (`electrum` feature) |
//!
//! # Event flow
//!
//! ```text
//! ChainClient ──subscribe()──────────► WalletEvent {txid, direction}
//!             ──watch_confirmations()► watch::Receiver<u32> (per txid)
//!             ──watch_balance()──────► watch::Receiver<WalletBalance>
//! ```

mod memory;

pub use memory::MemoryChain;

use crate::error::ChainError;
use crate::keys::WalletSeed;
use crate::wallet::CandidateTransaction;
use async_trait::async_trait;
use bitcoin::{Address, OutPoint, ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{broadcast, watch};

/// A spendable output owned by the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub outpoint: OutPoint,
    pub amount_sat: u64,
    pub script_pubkey: ScriptBuf,
    pub confirmations: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub confirmed: u64,
    pub trusted_pending: u64,
    pub untrusted_pending: u64,
    pub immature: u64,
}

impl WalletBalance {
    /// Spendable now: confirmed plus our own unconfirmed change.
    pub fn available(&self) -> u64 {
        self.confirmed + self.trusted_pending
    }

    /// Everything we expect to own once pending transactions settle.
    pub fn estimated(&self) -> u64 {
        self.confirmed + self.trusted_pending + self.untrusted_pending + self.immature
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Coins received by the wallet.
    Incoming,
    /// A spend made by this wallet.
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Incoming => write!(f, "incoming"),
            Direction::Outgoing => write!(f, "outgoing"),
        }
    }
}

/// A wallet-relevant transaction appeared (mempool or block).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletEvent {
    pub txid: Txid,
    pub direction: Direction,
    pub received: u64,
    pub sent: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionDetails {
    pub txid: Txid,
    pub received: u64,
    pub sent: u64,
    pub fee: Option<u64>,
    pub confirmations: u32,
    pub timestamp: Option<u64>,
    pub block_height: Option<u32>,
}

/// Signed, network-ready transaction.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub tx: Transaction,
    pub fee: u64,
}

impl SignedTransaction {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastAck {
    pub txid: Txid,
    pub peers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub peers: usize,
    pub tip_height: u32,
}

/// Header sync, peers, relay and confirmation notifications.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// Bind the client to the wallet derived from `seed`, loading its chain
    /// store when one exists.
    async fn load_or_create_wallet(&self, seed: &WalletSeed) -> Result<(), ChainError>;

    /// Resolves once at least one peer is connected and the chain is caught up.
    async fn start_sync(&self) -> Result<SyncReport, ChainError>;

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent>;

    /// Confirmation count of `txid`, updated as blocks arrive (0 = unconfirmed).
    fn watch_confirmations(&self, txid: Txid) -> watch::Receiver<u32>;

    fn watch_balance(&self) -> watch::Receiver<WalletBalance>;

    /// Hand the transaction to the network. Resolves on relay acceptance,
    /// not on confirmation.
    async fn broadcast(&self, tx: &SignedTransaction) -> Result<BroadcastAck, ChainError>;

    /// Spendable outputs in the client's order.
    fn current_utxos(&self) -> Result<Vec<UnspentOutput>, ChainError>;

    fn balance(&self) -> Result<WalletBalance, ChainError>;

    fn transaction(&self, txid: Txid) -> Result<Option<TransactionDetails>, ChainError>;

    /// Flush the chain store.
    fn save_wallet(&self) -> Result<(), ChainError>;

    async fn stop(&self) -> Result<(), ChainError>;
}

/// Address derivation and signing for the bound wallet.
pub trait KeyStore: Send + Sync {
    fn receive_address(&self) -> Result<Address, ChainError>;
    fn change_script(&self) -> Result<ScriptBuf, ChainError>;
    fn sign(&self, candidate: &CandidateTransaction) -> Result<SignedTransaction, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_excludes_untrusted() {
        let b = WalletBalance { confirmed: 1_000, trusted_pending: 200, untrusted_pending: 50, immature: 0 };
        assert_eq!(b.available(), 1_200);
        assert_eq!(b.estimated(), 1_250);
    }
}
