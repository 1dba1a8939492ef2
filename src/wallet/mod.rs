//! Wallet module - the forwarding engine on top of a chain client
//!
//! # Architecture
//!
//! ```text
//! ChainClient ── WalletEvent ──► ConfirmationTracker
//!     ▲                               │ depth reached (incoming, policy allows)
//!     │                               ▼
//!     │                         WalletService::forward ◄── PendingQueue worker
//!     │                               │                      (balance changes)
//!     │                               ▼
//!     │                         TransactionBuilder ── CandidateTransaction
//!     │                               │
//!     │                               ▼
//!     └──── broadcast ◄──────── KeyStore::sign
//! ```
//!
//! | Module | Role |
//! |--------|------|
//! | `service` | lifecycle state machine, queries, ledger lock, persistence |
//! | `builder` | largest-first selection, fee estimate, change/dust |
//! | `tracker` | one watch task per (txid, direction), forward policy |
//! | `pending` | forwards waiting for funds |
//! | `bdk` | `BdkChain`: BDK 2.x + Electrum chain client (`electrum` feature) |

#[cfg(feature = "electrum")]
mod bdk;
mod builder;
mod pending;
mod service;
mod tracker;

#[cfg(feature = "electrum")]
pub use bdk::BdkChain;
pub use builder::{
    check_amount, estimate_vsize, CandidateTransaction, TransactionBuilder, DUST_LIMIT, MAX_FEE_MULTIPLIER, REFERENCE_MIN_FEE_RATE,
};
pub use pending::{PendingForward, PendingQueue};
pub use service::{BalanceReport, ForwardReceipt, ServiceStatus, ShortInfo, TxInfo, WalletService};
pub use tracker::{Activity, ConfirmationTracker, ForwardAction, TrackKey, TrackedTransaction, TrackerState};
