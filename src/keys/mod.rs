//! Keys - BIP39 seed material and BIP84 address derivation.
//!
//! Key material is owned by exactly one `WalletSeed` and wiped on drop.
//! Chain clients receive a borrow and derive what they need.

mod store;

pub use store::{create_or_load, load, save, LoadedWallet, PersistedState, WALLET_FILE_VERSION};

use crate::config::Network;
use bip39::Mnemonic;
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, CompressedPublicKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// 128 bits -> 12 words.
pub const ENTROPY_BYTES: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("Derivation failed: {0}")]
    Derivation(String),
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct WalletSeed {
    mnemonic: String,
    #[zeroize(skip)]
    creation_time: i64,
}

impl fmt::Debug for WalletSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletSeed")
            .field("words", &self.word_count())
            .field("creation_time", &self.creation_time)
            .finish()
    }
}

impl WalletSeed {
    /// Fresh seed from the OS RNG, stamped with the current time.
    pub fn generate() -> Result<Self, KeyError> {
        let mut entropy = Zeroizing::new([0u8; ENTROPY_BYTES]);
        OsRng.fill_bytes(&mut entropy[..]);
        let mnemonic = Mnemonic::from_entropy(&entropy[..])
            .map_err(|e| KeyError::InvalidMnemonic(e.to_string()))?;
        Ok(Self { mnemonic: mnemonic.to_string(), creation_time: chrono::Utc::now().timestamp() })
    }

    pub fn from_mnemonic(words: &str, creation_time: i64) -> Result<Self, KeyError> {
        let mnemonic = Mnemonic::parse_normalized(words)
            .map_err(|e| KeyError::InvalidMnemonic(e.to_string()))?;
        Ok(Self { mnemonic: mnemonic.to_string(), creation_time })
    }

    pub fn mnemonic(&self) -> &str { &self.mnemonic }

    pub fn word_count(&self) -> usize { self.mnemonic.split_whitespace().count() }

    /// Unix seconds. Chain clients may skip history before this.
    pub fn creation_time(&self) -> i64 { self.creation_time }

    /// 64-byte BIP39 seed (empty passphrase).
    pub fn to_seed(&self) -> Result<Zeroizing<[u8; 64]>, KeyError> {
        let mnemonic = Mnemonic::parse_normalized(&self.mnemonic)
            .map_err(|e| KeyError::InvalidMnemonic(e.to_string()))?;
        Ok(Zeroizing::new(mnemonic.to_seed("")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keychain {
    External = 0,
    Internal = 1,
}

/// BIP84 (native segwit) account keys: `m/84'/coin'/0'`.
pub struct SeedKeys {
    network: Network,
    account: Xpriv,
    secp: Secp256k1<All>,
}

impl SeedKeys {
    pub fn derive(seed: &WalletSeed, network: Network) -> Result<Self, KeyError> {
        let secp = Secp256k1::new();
        let bytes = seed.to_seed()?;
        let master = Xpriv::new_master(network.to_bitcoin(), &bytes[..])
            .map_err(|e| KeyError::Derivation(e.to_string()))?;
        let path = DerivationPath::from_str(&format!("m/84'/{}'/0'", network.coin_type()))
            .map_err(|e| KeyError::Derivation(e.to_string()))?;
        let account = master
            .derive_priv(&secp, &path)
            .map_err(|e| KeyError::Derivation(e.to_string()))?;
        Ok(Self { network, account, secp })
    }

    pub fn address(&self, keychain: Keychain, index: u32) -> Result<Address, KeyError> {
        let path = [
            ChildNumber::from_normal_idx(keychain as u32).map_err(|e| KeyError::Derivation(e.to_string()))?,
            ChildNumber::from_normal_idx(index).map_err(|e| KeyError::Derivation(e.to_string()))?,
        ];
        let child = self
            .account
            .derive_priv(&self.secp, &path)
            .map_err(|e| KeyError::Derivation(e.to_string()))?;
        let pubkey = CompressedPublicKey::from_private_key(&self.secp, &child.to_priv())
            .map_err(|e| KeyError::Derivation(e.to_string()))?;
        Ok(Address::p2wpkh(&pubkey, self.network.to_bitcoin()))
    }

    /// First receive address, `m/84'/coin'/0'/0/0`.
    pub fn first_receive_address(&self) -> Result<Address, KeyError> {
        self.address(Keychain::External, 0)
    }

    pub fn network(&self) -> Network { self.network }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn generated_seed_has_twelve_words() {
        let seed = WalletSeed::generate().expect("generate");
        assert_eq!(seed.word_count(), 12);
        assert!(Mnemonic::parse_normalized(seed.mnemonic()).is_ok());
        assert!(seed.creation_time() > 0);
    }

    #[test]
    fn generated_seeds_differ() {
        let a = WalletSeed::generate().unwrap();
        let b = WalletSeed::generate().unwrap();
        assert_ne!(a.mnemonic(), b.mnemonic());
    }

    #[test]
    fn rejects_bad_checksum() {
        let bad = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon";
        assert!(matches!(WalletSeed::from_mnemonic(bad, 0), Err(KeyError::InvalidMnemonic(_))));
    }

    #[test]
    fn bip84_mainnet_vector() {
        // BIP84 test vector: first receive address of the all-abandon mnemonic.
        let seed = WalletSeed::from_mnemonic(TEST_MNEMONIC, 0).unwrap();
        let keys = SeedKeys::derive(&seed, Network::Bitcoin).unwrap();
        assert_eq!(
            keys.first_receive_address().unwrap().to_string(),
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
        );
        assert_eq!(
            keys.address(Keychain::Internal, 0).unwrap().to_string(),
            "bc1q8c6fshw2dlwun7ekn9qwf37cu2rn755upcp6el"
        );
    }

    #[test]
    fn testnet_addresses_use_tb_prefix() {
        let seed = WalletSeed::from_mnemonic(TEST_MNEMONIC, 0).unwrap();
        let keys = SeedKeys::derive(&seed, Network::Testnet).unwrap();
        assert!(keys.first_receive_address().unwrap().to_string().starts_with("tb1q"));
    }

    #[test]
    fn debug_hides_words() {
        let seed = WalletSeed::from_mnemonic(TEST_MNEMONIC, 7).unwrap();
        let shown = format!("{:?}", seed);
        assert!(!shown.contains("abandon"));
        assert!(shown.contains("creation_time: 7"));
    }
}
