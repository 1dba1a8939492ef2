//! Beeforward: a single-wallet payment service that forwards received coins.
//!
//! # Architecture
//!
//! ```text
//! WalletService (lifecycle, ledger, persistence)
//!   │
//!   ├── keys        (BIP39 seed, BIP84 derivation, wallet file)
//!   │
//!   ├── ChainClient + KeyStore
//!   │     ├── MemoryChain (in-process, tests / --offline)
//!   │     └── BdkChain    (BDK 2.x + Electrum, `electrum` feature)
//!   │
//!   ├── ConfirmationTracker (wallet events → depth reached → forward)
//!   │
//!   └── PendingQueue worker (balance changes → retry forwards)
//! ```
//!
//! # Features
//!
//! - `electrum` (default) - `BdkChain`, backed by `bdk_wallet` + `bdk_electrum`
//!
//! # Usage
//!
//! ```ignore
//! use beeforward::{MemoryChain, Network, ServiceConfig, Shutdown, WalletService};
//! use std::sync::Arc;
//!
//! let chain = Arc::new(MemoryChain::new(Network::Regtest));
//! let config = ServiceConfig::new("regtest.wallet").with_network(Network::Regtest);
//! let service = WalletService::new(config, chain)?;
//! service.start(&Shutdown::new()).await?;
//! println!("{:?}", service.balance()?);
//! ```

pub mod chain;
pub mod config;
pub mod error;
pub mod keys;
pub mod logging;
pub mod runtime;
pub mod wallet;

pub use chain::{ChainClient, Direction, KeyStore, MemoryChain, UnspentOutput, WalletBalance, WalletEvent};
pub use config::{ForwardPolicy, Network, ServiceConfig};
pub use error::{ChainError, ServiceError, ServiceResult};
pub use keys::{SeedKeys, WalletSeed};
pub use runtime::{install_signal_handlers, Shutdown};
pub use wallet::{
    Activity, BalanceReport, CandidateTransaction, ForwardReceipt, ServiceStatus, ShortInfo, TransactionBuilder, TxInfo,
    WalletService,
};

#[cfg(feature = "electrum")]
pub use wallet::BdkChain;
