//! Concrete `Chain`/`FeeEstimator`/`AddressWatcher`/`Wallet` collaborators
//! backed by an Esplora REST endpoint, the way `ark-client-sample`'s
//! `EsploraClient` backs the `Blockchain` trait there. Esplora has no
//! subscription API, so `AddressWatcher` is a per-address polling task
//! rather than a push subscription.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Address, Transaction, TxOut, Txid};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::collaborators::{AddressWatcher, Chain, FeeEstimator, SpentStatus, Wallet, WatcherEvent};
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Esplora's standard "confirmation target" fee estimate buckets; 2 blocks
/// is a reasonable default for a time-sensitive claim transaction.
const CLAIM_FEE_CONF_TARGET: u16 = 2;

pub struct EsploraChain {
    client: esplora_client::AsyncClient,
}

impl EsploraChain {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = esplora_client::Builder::new(base_url)
            .build_async()
            .map_err(|e| Error::SwapServerUnreachable(format!("esplora client: {e}")))?;
        Ok(Self { client })
    }
}

impl Chain for EsploraChain {
    fn local_height(&self) -> crate::collaborators::CollabFuture<'_, u32> {
        Box::pin(async move {
            self.client
                .get_height()
                .await
                .map_err(|e| Error::SwapServerUnreachable(format!("get_height: {e}")))
        })
    }

    fn broadcast<'a>(&'a self, tx: &'a Transaction) -> crate::collaborators::CollabFuture<'a, Txid> {
        Box::pin(async move {
            self.client
                .broadcast(tx)
                .await
                .map_err(|e| Error::SwapServerUnreachable(format!("broadcast: {e}")))?;
            Ok(tx.compute_txid())
        })
    }
}

pub struct EsploraFeeEstimator {
    client: esplora_client::AsyncClient,
}

impl EsploraFeeEstimator {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = esplora_client::Builder::new(base_url)
            .build_async()
            .map_err(|e| Error::SwapServerUnreachable(format!("esplora client: {e}")))?;
        Ok(Self { client })
    }
}

impl FeeEstimator for EsploraFeeEstimator {
    fn claim_fee_rate(&self) -> crate::collaborators::CollabFuture<'_, u64> {
        Box::pin(async move {
            let estimates = self
                .client
                .get_fee_estimates()
                .await
                .map_err(|e| Error::SwapServerUnreachable(format!("get_fee_estimates: {e}")))?;
            let rate = estimates
                .get(&CLAIM_FEE_CONF_TARGET)
                .copied()
                .unwrap_or(1.0);
            Ok(rate.ceil().max(1.0) as u64)
        })
    }
}

/// A single pre-derived receiving address, standing in for a full wallet
/// (address management is out of scope; see DESIGN.md).
pub struct StaticWallet {
    address: Address,
}

impl StaticWallet {
    pub fn new(address: Address) -> Self {
        Self { address }
    }
}

impl Wallet for StaticWallet {
    fn get_receiving_address(&self) -> crate::collaborators::CollabFuture<'_, bitcoin::Address<bitcoin::address::NetworkUnchecked>> {
        let address = self.address.as_unchecked().clone();
        Box::pin(async move { Ok(address) })
    }

    /// `StaticWallet` owns no UTXO set, so it cannot fund `outputs` itself;
    /// a real deployment swaps this adapter for one backed by an actual
    /// wallet (BDK, LWK, Electrum's own), which this crate does not own
    /// (see DESIGN.md).
    fn create_transaction<'a>(&'a self, _outputs: &'a [TxOut], _rbf: bool, _password: Option<&'a str>) -> crate::collaborators::CollabFuture<'a, Transaction> {
        Box::pin(async move { Err(Error::InvariantViolation("StaticWallet cannot fund a transaction; supply a real Wallet".into())) })
    }
}

pub struct EsploraWatcher {
    client: esplora_client::AsyncClient,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl EsploraWatcher {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = esplora_client::Builder::new(base_url)
            .build_async()
            .map_err(|e| Error::SwapServerUnreachable(format!("esplora client: {e}")))?;
        Ok(Self {
            client,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    async fn poll_once(client: &esplora_client::AsyncClient, address: &Address, sender: &mpsc::Sender<WatcherEvent>) {
        let script_pubkey = address.script_pubkey();
        let txs = match client.scripthash_txs(&script_pubkey, None).await {
            Ok(txs) => txs,
            Err(e) => {
                tracing::debug!(error = %e, %address, "scripthash_txs poll failed");
                return;
            }
        };

        for tx in txs {
            let Some((vout, output)) = tx
                .vout
                .iter()
                .enumerate()
                .find(|(_, o)| o.scriptpubkey == script_pubkey)
            else {
                continue;
            };
            let vout = vout as u32;

            let spent_height = match client.get_output_status(&tx.txid, vout as u64).await {
                Ok(Some(status)) if status.spent => match status.status.and_then(|s| s.block_height) {
                    Some(height) => SpentStatus::Confirmed(height),
                    None => SpentStatus::InMempool,
                },
                Ok(_) => SpentStatus::Unspent,
                Err(e) => {
                    tracing::debug!(error = %e, "get_output_status poll failed");
                    SpentStatus::Unspent
                }
            };

            let event = WatcherEvent {
                lockup_address: address.to_string(),
                funding_txid: tx.txid,
                vout,
                value_sat: output.value,
                spent_height,
            };
            if sender.send(event).await.is_err() {
                return;
            }
        }
    }
}

impl AddressWatcher for EsploraWatcher {
    fn register<'a>(&'a self, address: &'a str, sender: mpsc::Sender<WatcherEvent>) -> crate::collaborators::CollabFuture<'a, ()> {
        Box::pin(async move {
            let parsed = Address::from_str(address)
                .map_err(|e| Error::ProtocolMismatch(format!("bad address to watch: {e}")))?
                .assume_checked();
            let client = self.client.clone();

            let handle = tokio::spawn(async move {
                loop {
                    Self::poll_once(&client, &parsed, &sender).await;
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            });

            self.tasks.lock().await.insert(address.to_string(), handle);
            Ok(())
        })
    }

    fn unregister<'a>(&'a self, address: &'a str) -> crate::collaborators::CollabFuture<'a, ()> {
        Box::pin(async move {
            if let Some(handle) = self.tasks.lock().await.remove(address) {
                handle.abort();
            }
            Ok(())
        })
    }
}

pub fn wrap_chain(base_url: &str) -> Result<Arc<dyn Chain>> {
    Ok(Arc::new(EsploraChain::new(base_url)?))
}

pub fn wrap_fees(base_url: &str) -> Result<Arc<dyn FeeEstimator>> {
    Ok(Arc::new(EsploraFeeEstimator::new(base_url)?))
}

pub fn wrap_watcher(base_url: &str) -> Result<Arc<dyn AddressWatcher>> {
    Ok(Arc::new(EsploraWatcher::new(base_url)?))
}
