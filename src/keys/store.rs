//! Wallet file - key material plus the service's own state, as JSON.
//!
//! The chain store (headers, tx graph) is the chain client's business and
//! lives in a sibling file; this file only holds what the service needs to
//! resume: seed, handed-out addresses, last balance, fired confirmations.

use super::WalletSeed;
use crate::chain::WalletBalance;
use crate::config::Network;
use crate::error::ServiceError;
use crate::wallet::TrackerState;
use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const WALLET_FILE_VERSION: u32 = 1;

/// Non-secret state persisted alongside the seed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub address_book: Vec<String>,
    #[serde(default)]
    pub balance: WalletBalance,
    #[serde(default)]
    pub tracker: TrackerState,
}

#[derive(Debug)]
pub struct LoadedWallet {
    pub seed: WalletSeed,
    pub state: PersistedState,
    /// True when the key material was generated by this call.
    pub created: bool,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct WalletFile {
    #[zeroize(skip)]
    version: u32,
    #[zeroize(skip)]
    network: Network,
    mnemonic: String,
    #[zeroize(skip)]
    creation_time: i64,
    #[zeroize(skip)]
    #[serde(flatten)]
    state: PersistedState,
}

/// Load `path`, or generate a new seed when the file is missing or
/// `force_new` is set. New wallets are written out immediately.
pub fn create_or_load(path: &Path, network: Network, force_new: bool) -> Result<LoadedWallet, ServiceError> {
    if force_new || !path.exists() {
        if path.exists() {
            return Err(ServiceError::Persistence(format!(
                "refusing to overwrite existing wallet {}",
                path.display()
            )));
        }
        let seed = WalletSeed::generate().map_err(|e| ServiceError::CorruptWallet(e.to_string()))?;
        let state = PersistedState::default();
        save(path, network, &seed, &state)?;
        tracing::info!(path = %path.display(), "Created new wallet");
        return Ok(LoadedWallet { seed, state, created: true });
    }

    let (seed, state) = load(path, network)?;
    tracing::info!(path = %path.display(), "Loaded wallet");
    Ok(LoadedWallet { seed, state, created: false })
}

pub fn load(path: &Path, network: Network) -> Result<(WalletSeed, PersistedState), ServiceError> {
    let bytes = std::fs::read(path)
        .map_err(|e| ServiceError::CorruptWallet(format!("{}: {}", path.display(), e)))?;
    let file: WalletFile = serde_json::from_slice(&bytes)
        .map_err(|e| ServiceError::CorruptWallet(format!("{}: {}", path.display(), e)))?;

    if file.version != WALLET_FILE_VERSION {
        return Err(ServiceError::CorruptWallet(format!("unsupported wallet version {}", file.version)));
    }
    if file.network != network {
        return Err(ServiceError::CorruptWallet(format!(
            "wallet is for {}, service runs on {}",
            file.network.as_str(),
            network.as_str()
        )));
    }
    let seed = WalletSeed::from_mnemonic(&file.mnemonic, file.creation_time)
        .map_err(|e| ServiceError::CorruptWallet(e.to_string()))?;
    Ok((seed, file.state.clone()))
}

/// Written via a temp file + rename.
pub fn save(path: &Path, network: Network, seed: &WalletSeed, state: &PersistedState) -> Result<(), ServiceError> {
    let file = WalletFile {
        version: WALLET_FILE_VERSION,
        network,
        mnemonic: seed.mnemonic().to_string(),
        creation_time: seed.creation_time(),
        state: state.clone(),
    };
    let json = serde_json::to_vec_pretty(&file).map_err(|e| ServiceError::Persistence(e.to_string()))?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| ServiceError::Persistence(e.to_string()))?;
    }
    let tmp = path.with_extension("wallet.tmp");
    std::fs::write(&tmp, &json).map_err(|e| ServiceError::Persistence(format!("{}: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, path).map_err(|e| ServiceError::Persistence(format!("{}: {}", path.display(), e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Direction;
    use crate::wallet::TrackKey;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;
    use tempfile::TempDir;

    #[test]
    fn missing_file_creates_wallet() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fresh.wallet");
        let loaded = create_or_load(&path, Network::Testnet, false).unwrap();
        assert!(loaded.created);
        assert!(path.exists());
        assert_eq!(loaded.seed.word_count(), 12);
    }

    #[test]
    fn round_trip_preserves_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rt.wallet");
        let created = create_or_load(&path, Network::Testnet, false).unwrap();

        let mut state = PersistedState::default();
        state.address_book.push("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx".into());
        state.balance = WalletBalance { confirmed: 10_000, trusted_pending: 9_031, untrusted_pending: 0, immature: 0 };
        state.tracker.forwards_triggered = 1;
        state.tracker.fired.insert(TrackKey { txid: Txid::from_byte_array([7; 32]), direction: Direction::Incoming });
        save(&path, Network::Testnet, &created.seed, &state).unwrap();

        let reloaded = create_or_load(&path, Network::Testnet, false).unwrap();
        assert!(!reloaded.created);
        assert_eq!(reloaded.seed.mnemonic(), created.seed.mnemonic());
        assert_eq!(reloaded.seed.creation_time(), created.seed.creation_time());
        assert_eq!(reloaded.state, state);
    }

    #[test]
    fn garbage_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.wallet");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(create_or_load(&path, Network::Testnet, false), Err(ServiceError::CorruptWallet(_))));
    }

    #[test]
    fn network_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("net.wallet");
        create_or_load(&path, Network::Testnet, false).unwrap();
        assert!(matches!(load(&path, Network::Bitcoin), Err(ServiceError::CorruptWallet(_))));
    }

    #[test]
    fn invalid_mnemonic_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("words.wallet");
        let json = serde_json::json!({
            "version": WALLET_FILE_VERSION,
            "network": "testnet",
            "mnemonic": "not a real mnemonic",
            "creation_time": 0
        });
        std::fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();
        assert!(matches!(load(&path, Network::Testnet), Err(ServiceError::CorruptWallet(_))));
    }

    #[test]
    fn force_new_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keep.wallet");
        create_or_load(&path, Network::Testnet, false).unwrap();
        assert!(matches!(create_or_load(&path, Network::Testnet, true), Err(ServiceError::Persistence(_))));
    }
}
