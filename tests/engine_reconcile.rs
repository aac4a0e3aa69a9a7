//! Exercises `SwapEngine`'s reconciliation loop (`handle_event`) and the
//! server-side bookkeeping path (`create_server_swap`) against fake
//! collaborators, the way `ln_liquid_swap_e2e.rs` drives the service layer
//! against a regtest node — here the chain/lightning/wallet/watcher/fee
//! collaborators are in-memory fakes instead, since the engine's contract
//! with them is exactly the five traits in `collaborators.rs`.

use std::collections::HashMap;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use bitcoin::hashes::{Hash, sha256};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Network, OutPoint, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use ln_swap_core::api::ApiClient;
use ln_swap_core::collaborators::{AddressWatcher, Chain, CollabFuture, FeeEstimator, LightningLayer, SpentStatus, Wallet, WatcherEvent};
use ln_swap_core::engine::SwapEngine;
use ln_swap_core::error::Error;
use ln_swap_core::fees::FeeCalculator;

struct FakeChain {
    height: Mutex<u32>,
    broadcasts: Mutex<Vec<Transaction>>,
}

impl FakeChain {
    fn new(height: u32) -> Self {
        Self { height: Mutex::new(height), broadcasts: Mutex::new(Vec::new()) }
    }
}

impl Chain for FakeChain {
    fn local_height(&self) -> CollabFuture<'_, u32> {
        Box::pin(async move { Ok(*self.height.lock().unwrap()) })
    }

    fn broadcast<'a>(&'a self, tx: &'a Transaction) -> CollabFuture<'a, Txid> {
        Box::pin(async move {
            let txid = tx.compute_txid();
            self.broadcasts.lock().unwrap().push(tx.clone());
            Ok(txid)
        })
    }
}

struct FakeWallet {
    address: bitcoin::Address<bitcoin::address::NetworkUnchecked>,
}

impl Wallet for FakeWallet {
    fn get_receiving_address(&self) -> CollabFuture<'_, bitcoin::Address<bitcoin::address::NetworkUnchecked>> {
        Box::pin(async move { Ok(self.address.clone()) })
    }

    fn create_transaction<'a>(&'a self, outputs: &'a [TxOut], _rbf: bool, _password: Option<&'a str>) -> CollabFuture<'a, Transaction> {
        Box::pin(async move {
            Ok(Transaction {
                version: Version::TWO,
                lock_time: bitcoin::absolute::LockTime::ZERO,
                input: vec![TxIn {
                    previous_output: OutPoint::null(),
                    script_sig: bitcoin::ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                }],
                output: outputs.to_vec(),
            })
        })
    }
}

struct FakeFees {
    sat_per_vbyte: u64,
}

impl FeeEstimator for FakeFees {
    fn claim_fee_rate(&self) -> CollabFuture<'_, u64> {
        Box::pin(async move { Ok(self.sat_per_vbyte) })
    }
}

#[derive(Default)]
struct FakeWatcher {
    registered: Mutex<Vec<String>>,
}

impl AddressWatcher for FakeWatcher {
    fn register<'a>(&'a self, address: &'a str, _sender: tokio::sync::mpsc::Sender<WatcherEvent>) -> CollabFuture<'a, ()> {
        Box::pin(async move {
            self.registered.lock().unwrap().push(address.to_string());
            Ok(())
        })
    }

    fn unregister<'a>(&'a self, address: &'a str) -> CollabFuture<'a, ()> {
        Box::pin(async move {
            self.registered.lock().unwrap().retain(|a| a != address);
            Ok(())
        })
    }
}

#[derive(Default)]
struct FakeLightning {
    preimages: Mutex<HashMap<[u8; 32], [u8; 32]>>,
    failed_forwards: Mutex<Vec<Vec<u8>>>,
    published: Mutex<Vec<[u8; 32]>>,
}

impl LightningLayer for FakeLightning {
    fn create_invoice<'a>(&'a self, _amount_msat: u64, _description: &'a str, _expiry_secs: u32) -> CollabFuture<'a, String> {
        Box::pin(async move { Err(Error::Api("create_invoice not used in this test".into())) })
    }

    fn get_preimage<'a>(&'a self, payment_hash: &'a [u8; 32]) -> CollabFuture<'a, Option<[u8; 32]>> {
        Box::pin(async move { Ok(self.preimages.lock().unwrap().get(payment_hash).copied()) })
    }

    fn publish_preimage<'a>(&'a self, payment_hash: &'a [u8; 32], _preimage: &'a [u8; 32]) -> CollabFuture<'a, ()> {
        Box::pin(async move {
            self.published.lock().unwrap().push(*payment_hash);
            Ok(())
        })
    }

    fn pay_invoice<'a>(&'a self, _bolt11: &'a str, _attempts: u32) -> CollabFuture<'a, bool> {
        Box::pin(async move { Ok(true) })
    }

    fn fail_trampoline_forwarding<'a>(&'a self, key: &'a [u8]) -> CollabFuture<'a, ()> {
        Box::pin(async move {
            self.failed_forwards.lock().unwrap().push(key.to_vec());
            Ok(())
        })
    }
}

fn keypair(byte: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
    let pk = PublicKey::from_secret_key(&secp, &sk);
    (sk, pk)
}

fn calculator() -> FeeCalculator {
    FeeCalculator {
        percentage_bps: 50,
        normal_fee: 500,
        lockup_fee: 1_000,
        claim_fee: 136,
        min_amount: 1_000,
        max_amount: 10_000_000,
    }
}

struct Harness {
    engine: Arc<SwapEngine>,
    chain: Arc<FakeChain>,
    lightning: Arc<FakeLightning>,
    event_tx: tokio::sync::mpsc::Sender<WatcherEvent>,
}

fn build_harness(height: u32) -> Harness {
    let receive_address: bitcoin::Address<bitcoin::address::NetworkUnchecked> =
        bitcoin::Address::from_str("bcrt1qe5gn5w47hxw4tps5zrgqj0dhl9yfcqdfqdzgah").unwrap();
    let chain = Arc::new(FakeChain::new(height));
    let lightning = Arc::new(FakeLightning::default());
    let (event_tx, _event_rx) = tokio::sync::mpsc::channel(16);
    let engine = Arc::new(SwapEngine::new(
        Network::Regtest,
        ApiClient::new("http://unused.invalid"),
        lightning.clone(),
        chain.clone(),
        Arc::new(FakeWallet { address: receive_address }),
        Arc::new(FakeFees { sat_per_vbyte: 2 }),
        Arc::new(FakeWatcher::default()),
        calculator(),
        event_tx.clone(),
    ));
    Harness { engine, chain, lightning, event_tx }
}

fn funding_event(lockup_address: String, value_sat: u64, spent_height: SpentStatus) -> WatcherEvent {
    WatcherEvent {
        lockup_address,
        funding_txid: Txid::from_str("04a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33").unwrap(),
        vout: 0,
        value_sat,
        spent_height,
    }
}

// `create_server_swap`'s `invoice` argument determines our own role exactly
// as `add_server_swap`'s `is_reverse_for_server = (invoice is not None)`
// does: `Some(_)` means the peer is doing a forward swap and we end up
// claiming it (our `SwapData.is_reverse` is `true`); `None` means the peer
// is doing a reverse swap and we may have to refund it (`is_reverse` is
// `false`). This is the opposite sense from the client-facing
// `create_forward_swap`/`create_reverse_swap`, which store the protocol
// direction directly.

#[tokio::test]
async fn server_refund_role_waits_for_locktime() -> Result<()> {
    let harness = build_harness(100);
    let (_claim_sk, claim_pk) = keypair(1);
    let payment_hash = sha256::Hash::hash(&[7u8; 32]).to_byte_array();

    let (swap, key) = harness.engine.create_server_swap(
        100_000, 99_000, 200, claim_pk, payment_hash,
        bitcoin::Address::from_str("bcrt1qe5gn5w47hxw4tps5zrgqj0dhl9yfcqdfqdzgah").unwrap(),
        None,
    );
    assert!(!swap.is_reverse);
    let lockup_address = swap.lockup_address.clone().assume_checked().to_string();
    harness.engine.store.lock().await.upsert(key, swap);
    harness.engine.watcher.register(&lockup_address, harness.event_tx.clone()).await?;

    let event = funding_event(lockup_address, 100_000, SpentStatus::Unspent);
    let err = harness.engine.handle_event(event).await.unwrap_err();
    assert!(matches!(err, Error::TooEarlyToRefund));
    assert!(harness.chain.broadcasts.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn server_refund_role_broadcasts_after_locktime() -> Result<()> {
    let harness = build_harness(300);
    let (_claim_sk, claim_pk) = keypair(3);
    let payment_hash = sha256::Hash::hash(&[8u8; 32]).to_byte_array();

    let (swap, key) = harness.engine.create_server_swap(
        100_000, 99_000, 200, claim_pk, payment_hash,
        bitcoin::Address::from_str("bcrt1qe5gn5w47hxw4tps5zrgqj0dhl9yfcqdfqdzgah").unwrap(),
        None,
    );
    let lockup_address = swap.lockup_address.clone().assume_checked().to_string();
    harness.engine.store.lock().await.upsert(key, swap);

    let event = funding_event(lockup_address, 100_000, SpentStatus::Unspent);
    harness.engine.handle_event(event).await.context("handle_event")?;

    let broadcasts = harness.chain.broadcasts.lock().unwrap();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].lock_time, bitcoin::absolute::LockTime::from_height(200).unwrap());
    Ok(())
}

#[tokio::test]
async fn client_reverse_swap_waits_for_preimage_before_claiming() -> Result<()> {
    let harness = build_harness(100);
    let (_claim_sk, claim_pk) = keypair(4);
    let preimage = [6u8; 32];
    let payment_hash = sha256::Hash::hash(&preimage).to_byte_array();

    // `Some(invoice)` gives us the server's own claiming role; a real
    // client-initiated reverse swap instead goes through
    // `create_reverse_swap`, which sets `preimage` up front. Here we start
    // with it unknown to exercise the get_preimage fetch path.
    let (swap, key) = harness.engine.create_server_swap(
        100_000, 99_000, 500, claim_pk, payment_hash,
        bitcoin::Address::from_str("bcrt1qe5gn5w47hxw4tps5zrgqj0dhl9yfcqdfqdzgah").unwrap(),
        Some("lnbcrt1...".to_string()),
    );
    assert!(swap.is_reverse);
    let lockup_address = swap.lockup_address.clone().assume_checked().to_string();
    harness.engine.store.lock().await.upsert(key, swap);

    let event = funding_event(lockup_address.clone(), 100_000, SpentStatus::Unspent);
    harness.engine.handle_event(event).await.context("handle_event before preimage known")?;
    assert!(harness.chain.broadcasts.lock().unwrap().is_empty());
    assert!(harness.engine.store.lock().await.get_by_payment_hash(&key).unwrap().preimage.is_none());

    harness.lightning.preimages.lock().unwrap().insert(payment_hash, preimage);
    let event = funding_event(lockup_address, 100_000, SpentStatus::Unspent);
    harness.engine.handle_event(event).await.context("handle_event after preimage known")?;
    assert_eq!(harness.chain.broadcasts.lock().unwrap().len(), 1);
    assert_eq!(harness.engine.store.lock().await.get_by_payment_hash(&key).unwrap().preimage, Some(preimage));
    Ok(())
}

#[tokio::test]
async fn reverse_swap_underpayment_is_ignored() -> Result<()> {
    let harness = build_harness(100);
    let (_claim_sk, claim_pk) = keypair(5);
    let preimage = [2u8; 32];
    let payment_hash = sha256::Hash::hash(&preimage).to_byte_array();

    let (mut swap, key) = harness.engine.create_server_swap(
        100_000, 99_000, 500, claim_pk, payment_hash,
        bitcoin::Address::from_str("bcrt1qe5gn5w47hxw4tps5zrgqj0dhl9yfcqdfqdzgah").unwrap(),
        Some("lnbcrt1...".to_string()),
    );
    swap.preimage = Some(preimage);
    let lockup_address = swap.lockup_address.clone().assume_checked().to_string();
    harness.engine.store.lock().await.upsert(key, swap);

    let event = funding_event(lockup_address, 50_000, SpentStatus::Unspent);
    harness.engine.handle_event(event).await.context("handle_event underpaid")?;
    assert!(harness.chain.broadcasts.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn confirmed_refund_without_preimage_fails_forwarding_and_unregisters() -> Result<()> {
    let harness = build_harness(300);
    let (_claim_sk, claim_pk) = keypair(6);
    let payment_hash = sha256::Hash::hash(&[3u8; 32]).to_byte_array();

    let (swap, key) = harness.engine.create_server_swap(
        100_000, 99_000, 200, claim_pk, payment_hash,
        bitcoin::Address::from_str("bcrt1qe5gn5w47hxw4tps5zrgqj0dhl9yfcqdfqdzgah").unwrap(),
        None,
    );
    assert!(!swap.is_reverse);
    let lockup_address = swap.lockup_address.clone().assume_checked().to_string();
    harness.engine.store.lock().await.upsert(key, swap);
    harness.engine.watcher.register(&lockup_address, harness.event_tx.clone()).await?;

    let event = funding_event(lockup_address.clone(), 100_000, SpentStatus::Confirmed(250));
    harness.engine.handle_event(event).await.context("handle_event confirmed spend")?;

    assert_eq!(harness.lightning.failed_forwards.lock().unwrap().len(), 1);
    let store = harness.engine.store.lock().await;
    assert!(store.get_by_payment_hash(&key).unwrap().is_redeemed);
    Ok(())
}

#[tokio::test]
async fn observe_spend_extracts_and_publishes_matching_preimage() -> Result<()> {
    let harness = build_harness(100);
    let (_claim_sk, claim_pk) = keypair(7);
    let preimage = [4u8; 32];
    let payment_hash = sha256::Hash::hash(&preimage).to_byte_array();

    let (swap, key) = harness.engine.create_server_swap(
        100_000, 99_000, 200, claim_pk, payment_hash,
        bitcoin::Address::from_str("bcrt1qe5gn5w47hxw4tps5zrgqj0dhl9yfcqdfqdzgah").unwrap(),
        None,
    );
    assert!(!swap.is_reverse);
    harness.engine.store.lock().await.upsert(key, swap);

    harness.engine.observe_spend(&key, &preimage).await?;
    assert_eq!(harness.lightning.published.lock().unwrap(), vec![payment_hash]);
    Ok(())
}
