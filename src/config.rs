//! Service configuration - built by the CLI, immutable once the service exists

use crate::error::ServiceError;
use bitcoin::Address;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Testnet address the original deployment forwarded to.
pub const DEFAULT_DESTINATION: &str = "tb1qerzrlxcfu24davlur5sqmgzzgsal6wusda40er";
/// Smallest non-dust output (sat).
pub const DEFAULT_FORWARD_AMOUNT: u64 = 546;
pub const DEFAULT_FEE_MULTIPLIER: u64 = 3;
pub const DEFAULT_CONFIRMATION_DEPTH: u32 = 1;
pub const DEFAULT_WALLET_FILE: &str = "testnet.wallet";

pub const WALLET_EXTENSION: &str = "wallet";
pub const CHAIN_EXTENSION: &str = "chain";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network { Bitcoin, #[default] Testnet, Signet, Regtest }

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self { Network::Bitcoin => "bitcoin", Network::Testnet => "testnet", Network::Signet => "signet", Network::Regtest => "regtest" }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bitcoin" | "mainnet" => Some(Network::Bitcoin),
            "testnet" | "testnet3" => Some(Network::Testnet),
            "signet" => Some(Network::Signet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }

    pub fn to_bitcoin(&self) -> bitcoin::Network {
        match self { Network::Bitcoin => bitcoin::Network::Bitcoin, Network::Testnet => bitcoin::Network::Testnet, Network::Signet => bitcoin::Network::Signet, Network::Regtest => bitcoin::Network::Regtest }
    }

    /// BIP44 coin type used in derivation paths.
    pub fn coin_type(&self) -> u32 {
        match self { Network::Bitcoin => 0, _ => 1 }
    }
}

/// What happens when an incoming transaction reaches the confirmation depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardPolicy {
    /// Forward once, on the first qualifying incoming transaction.
    #[default]
    OnceOnFirstConfirmation,
    /// Forward on every qualifying incoming transaction (`-loop`).
    EveryConfirmation,
}

impl ForwardPolicy {
    pub fn from_loop_flag(looping: bool) -> Self {
        if looping { ForwardPolicy::EveryConfirmation } else { ForwardPolicy::OnceOnFirstConfirmation }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub network: Network,
    pub wallet_path: PathBuf,
    /// Create fresh key material even if `wallet_path` exists.
    pub new_wallet: bool,
    pub destination: String,
    pub amount_sat: u64,
    pub fee_multiplier: u64,
    pub confirmation_depth: u32,
    pub forward_policy: ForwardPolicy,
    pub sync_timeout: Duration,
    pub balance_interval: Duration,
    pub electrum_url: Option<String>,
    /// How often the electrum client re-syncs after startup.
    pub poll_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            wallet_path: PathBuf::from(DEFAULT_WALLET_FILE),
            new_wallet: false,
            destination: DEFAULT_DESTINATION.into(),
            amount_sat: DEFAULT_FORWARD_AMOUNT,
            fee_multiplier: DEFAULT_FEE_MULTIPLIER,
            confirmation_depth: DEFAULT_CONFIRMATION_DEPTH,
            forward_policy: ForwardPolicy::default(),
            sync_timeout: Duration::from_secs(300),
            balance_interval: Duration::from_secs(30),
            electrum_url: None,
            poll_interval: Duration::from_secs(15),
        }
    }
}

impl ServiceConfig {
    pub fn new(wallet_path: impl Into<PathBuf>) -> Self {
        Self { wallet_path: wallet_path.into(), ..Default::default() }
    }

    /// Config for a brand-new wallet named after its creation time.
    pub fn fresh(dir: impl AsRef<Path>) -> Self {
        let name = format!("{}.{}", chrono::Utc::now().timestamp_millis(), WALLET_EXTENSION);
        Self { wallet_path: dir.as_ref().join(name), new_wallet: true, ..Default::default() }
    }

    pub fn with_network(mut self, network: Network) -> Self { self.network = network; self }
    pub fn with_new_wallet(mut self, new_wallet: bool) -> Self { self.new_wallet = new_wallet; self }
    pub fn with_destination(mut self, to: impl Into<String>) -> Self { self.destination = to.into(); self }
    pub fn with_amount(mut self, amount_sat: u64) -> Self { self.amount_sat = amount_sat; self }
    pub fn with_fee_multiplier(mut self, multiplier: u64) -> Self { self.fee_multiplier = multiplier; self }
    pub fn with_confirmation_depth(mut self, depth: u32) -> Self { self.confirmation_depth = depth.max(1); self }
    pub fn with_policy(mut self, policy: ForwardPolicy) -> Self { self.forward_policy = policy; self }
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self { self.sync_timeout = timeout; self }
    pub fn with_balance_interval(mut self, interval: Duration) -> Self { self.balance_interval = interval; self }
    pub fn with_electrum(mut self, url: impl Into<String>) -> Self { self.electrum_url = Some(url.into()); self }
    pub fn with_poll_interval(mut self, interval: Duration) -> Self { self.poll_interval = interval; self }

    /// Chain store sits next to the wallet file: `foo.wallet` -> `foo.chain`.
    pub fn chain_path(&self) -> PathBuf {
        self.wallet_path.with_extension(CHAIN_EXTENSION)
    }

    /// Destination parsed and checked against the configured network.
    pub fn destination_address(&self) -> Result<Address, ServiceError> {
        parse_address(&self.destination, self.network)
    }
}

pub fn parse_address(value: &str, network: Network) -> Result<Address, ServiceError> {
    Address::from_str(value.trim())
        .map_err(|e| ServiceError::InvalidAddress(format!("{}: {}", value, e)))?
        .require_network(network.to_bitcoin())
        .map_err(|e| ServiceError::InvalidAddress(format!("{}: {}", value, e)))
}
