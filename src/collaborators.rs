//! External interfaces the engine calls out to but does not own: the
//! Lightning payment engine, the on-chain address watcher, chain queries,
//! wallet transaction construction and fee estimation. Concrete adapters
//! live in `lightning::ldk` (for `LightningLayer`); the rest are contracts
//! a host wallet implements, the way `lendasat-lendaswap-sdk` leaves
//! `WalletStorage`/`SwapStorage` as traits for its embedding app.

use std::future::Future;
use std::pin::Pin;

use bitcoin::{Transaction, TxOut, Txid};

use crate::error::Result;

pub type CollabFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

pub trait LightningLayer: Send + Sync {
    fn create_invoice<'a>(&'a self, amount_msat: u64, description: &'a str, expiry_secs: u32) -> CollabFuture<'a, String>;
    fn get_preimage<'a>(&'a self, payment_hash: &'a [u8; 32]) -> CollabFuture<'a, Option<[u8; 32]>>;
    fn publish_preimage<'a>(&'a self, payment_hash: &'a [u8; 32], preimage: &'a [u8; 32]) -> CollabFuture<'a, ()>;
    fn pay_invoice<'a>(&'a self, bolt11: &'a str, attempts: u32) -> CollabFuture<'a, bool>;
    fn fail_trampoline_forwarding<'a>(&'a self, key: &'a [u8]) -> CollabFuture<'a, ()>;
}

/// A single observation delivered by the watcher, replacing the source's
/// cyclic per-swap closure with a plain message, per the Design Notes'
/// "Cyclic watcher callbacks -> message passing" guidance.
#[derive(Debug, Clone)]
pub struct WatcherEvent {
    pub lockup_address: String,
    pub funding_txid: Txid,
    pub vout: u32,
    pub value_sat: u64,
    pub spent_height: SpentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpentStatus {
    Unspent,
    Confirmed(u32),
    Local,
    InMempool,
}

pub trait AddressWatcher: Send + Sync {
    fn register<'a>(&'a self, address: &'a str, sender: tokio::sync::mpsc::Sender<WatcherEvent>) -> CollabFuture<'a, ()>;
    fn unregister<'a>(&'a self, address: &'a str) -> CollabFuture<'a, ()>;
}

pub trait Chain: Send + Sync {
    fn local_height(&self) -> CollabFuture<'_, u32>;
    fn broadcast<'a>(&'a self, tx: &'a Transaction) -> CollabFuture<'a, Txid>;
}

pub trait Wallet: Send + Sync {
    fn get_receiving_address(&self) -> CollabFuture<'_, bitcoin::Address<bitcoin::address::NetworkUnchecked>>;

    /// Builds and signs a transaction paying `outputs`, funded and
    /// change-returned by the wallet's own UTXO selection (`create_transaction`
    /// in the source). `password` unlocks an encrypted keystore, when the
    /// embedding wallet has one.
    fn create_transaction<'a>(&'a self, outputs: &'a [TxOut], rbf: bool, password: Option<&'a str>) -> CollabFuture<'a, Transaction>;
}

pub trait FeeEstimator: Send + Sync {
    /// Current feerate, in sat/vbyte, to use for a claim/refund transaction.
    fn claim_fee_rate(&self) -> CollabFuture<'_, u64>;
}
