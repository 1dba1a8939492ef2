//! Error taxonomy for the wallet service and its collaborators.

use crate::wallet::ServiceStatus;
use std::time::Duration;

/// Errors reported by a chain client or key store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    #[error("wallet not loaded")]
    NotLoaded,
    #[error("Sync: {0}")]
    Sync(String),
    #[error("Broadcast: {0}")]
    Broadcast(String),
    #[error("Store: {0}")]
    Store(String),
    #[error("Sign: {0}")]
    Signing(String),
    #[error("{0}")]
    Other(String),
}

/// Errors surfaced by [`crate::wallet::WalletService`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("wallet service not ready (status: {status})")]
    NotReady { status: ServiceStatus },

    #[error("cannot start from status {from}")]
    InvalidTransition { from: ServiceStatus },

    #[error("insufficient funds: required {required} sat, available {available} sat")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("amount {amount} sat must be at least the dust limit of {dust_limit} sat and at most 21,000,000 BTC")]
    InvalidAmount { amount: u64, dust_limit: u64 },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("corrupt wallet: {0}")]
    CorruptWallet(String),

    #[error("chain sync did not complete within {0:?}")]
    SyncTimeout(Duration),

    #[error("broadcast failed: {0}")]
    Broadcast(String),

    #[error("wallet persistence failed: {0}")]
    Persistence(String),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl ServiceError {
    /// Errors a caller can recover from by waiting or retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::NotReady { .. }
                | ServiceError::InsufficientFunds { .. }
                | ServiceError::SyncTimeout(_)
                | ServiceError::Broadcast(_)
        )
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
