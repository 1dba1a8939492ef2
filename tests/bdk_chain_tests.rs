//! BdkChain without a server - verify the BDK side agrees with our own key
//! derivation and that the chain store survives a restart.
//!
//! Nothing here connects to Electrum; the client connects lazily on sync.

#![cfg(feature = "electrum")]

use beeforward::keys::{Keychain, SeedKeys};
use beeforward::{BdkChain, ChainClient, ChainError, KeyStore, Network, WalletSeed};
use std::time::Duration;
use tempfile::TempDir;

// "abandon" x11 + "about" - BIP84 test vector
const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

// m/84'/1'/0'/0/0 of the test mnemonic
const EXPECTED_SIGNET_ADDR_0: &str = "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pqcpvkl";

fn seed() -> WalletSeed {
    WalletSeed::from_mnemonic(TEST_MNEMONIC, 0).unwrap()
}

fn chain(dir: &TempDir, network: Network) -> BdkChain {
    BdkChain::new(network, dir.path().join("test.chain"), Some("tcp://127.0.0.1:1"), Duration::from_secs(60))
}

#[tokio::test]
async fn receive_address_matches_seed_keys() {
    let dir = TempDir::new().unwrap();
    let chain = chain(&dir, Network::Signet);
    chain.load_or_create_wallet(&seed()).await.unwrap();

    let bdk = chain.receive_address().unwrap();
    let ours = SeedKeys::derive(&seed(), Network::Signet).unwrap().first_receive_address().unwrap();
    assert_eq!(bdk.to_string(), EXPECTED_SIGNET_ADDR_0);
    assert_eq!(bdk, ours);
    chain.stop().await.unwrap();
}

#[tokio::test]
async fn change_script_is_internal_keychain() {
    let dir = TempDir::new().unwrap();
    let chain = chain(&dir, Network::Signet);
    chain.load_or_create_wallet(&seed()).await.unwrap();

    let keys = SeedKeys::derive(&seed(), Network::Signet).unwrap();
    let expected = keys.address(Keychain::Internal, 0).unwrap().script_pubkey();
    assert_eq!(chain.change_script().unwrap(), expected);
    chain.stop().await.unwrap();
}

#[tokio::test]
async fn fresh_store_is_empty() {
    let dir = TempDir::new().unwrap();
    let chain = chain(&dir, Network::Regtest);
    chain.load_or_create_wallet(&seed()).await.unwrap();

    assert_eq!(chain.balance().unwrap().estimated(), 0);
    assert!(chain.current_utxos().unwrap().is_empty());
    assert!(dir.path().join("test.chain").exists());
    chain.stop().await.unwrap();
}

#[tokio::test]
async fn store_reopens_after_stop() {
    let dir = TempDir::new().unwrap();
    let first = chain(&dir, Network::Signet);
    first.load_or_create_wallet(&seed()).await.unwrap();
    let address = first.receive_address().unwrap();
    first.save_wallet().unwrap();
    first.stop().await.unwrap();

    let second = chain(&dir, Network::Signet);
    second.load_or_create_wallet(&seed()).await.unwrap();
    assert_eq!(second.receive_address().unwrap(), address);
    second.stop().await.unwrap();
}

#[tokio::test]
async fn store_for_another_seed_is_replaced() {
    let dir = TempDir::new().unwrap();
    let first = chain(&dir, Network::Signet);
    first.load_or_create_wallet(&seed()).await.unwrap();
    first.stop().await.unwrap();

    let other = WalletSeed::generate().unwrap();
    let expected = SeedKeys::derive(&other, Network::Signet).unwrap().first_receive_address().unwrap();
    let second = chain(&dir, Network::Signet);
    second.load_or_create_wallet(&other).await.unwrap();
    assert_eq!(second.receive_address().unwrap(), expected);
    second.stop().await.unwrap();
}

#[tokio::test]
async fn sync_without_server_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    let chain = chain(&dir, Network::Regtest);
    assert!(matches!(chain.start_sync().await, Err(ChainError::NotLoaded)));

    chain.load_or_create_wallet(&seed()).await.unwrap();
    assert!(matches!(chain.start_sync().await, Err(ChainError::Sync(_))));
    chain.stop().await.unwrap();
}
