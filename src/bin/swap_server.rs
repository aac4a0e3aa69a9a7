//! Server-role binary: operates the counterparty side of swaps recorded in
//! the local store (via `SwapEngine::create_server_swap`), driving the same
//! watcher-reconciliation loop as the client plus the periodic
//! pending-invoice-payment worker.

use std::path::PathBuf;
use std::str::FromStr as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser as _;
use ln_swap_core::api::ApiClient;
use ln_swap_core::engine::SwapEngine;
use ln_swap_core::esplora;
use ln_swap_core::fees::FeeCalculator;
use ln_swap_core::lightning::LdkLightningClient;
use ln_swap_core::store::SwapStore;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:9001")]
    swap_server_url: String,

    #[arg(long)]
    esplora_url: String,

    #[arg(long)]
    ldk_rest_addr: String,

    #[arg(long)]
    receive_address: String,

    #[arg(long, default_value = "bitcoin")]
    network: String,

    #[arg(long, default_value = "./swap-server-data/submarine_swaps.json")]
    store_path: PathBuf,

    #[arg(long, default_value = "./swap-server-data/pairs_cache.json")]
    pairs_cache_path: PathBuf,

    #[arg(long, default_value_t = 30)]
    pending_invoice_poll_interval_secs: u64,

    #[arg(long, default_value_t = 60)]
    persist_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    ln_swap_core::logging::init().ok();
    let args = Args::parse();

    let network = bitcoin::Network::from_str(&args.network).context("parse --network")?;
    let receive_address = bitcoin::Address::from_str(&args.receive_address)
        .context("parse --receive-address")?
        .require_network(network)
        .context("receive address on wrong network")?;

    let api = ApiClient::new(args.swap_server_url);
    let pairs = api
        .get_pairs_cached(&args.pairs_cache_path)
        .await
        .context("GET /getpairs")?;
    let fee_calculator = FeeCalculator::from_pairs_response(&pairs).context("build fee calculator")?;

    let lightning = Arc::new(LdkLightningClient::new(args.ldk_rest_addr));
    let chain = esplora::wrap_chain(&args.esplora_url)?;
    let fees = esplora::wrap_fees(&args.esplora_url)?;
    let watcher = esplora::wrap_watcher(&args.esplora_url)?;
    let wallet = Arc::new(esplora::StaticWallet::new(receive_address));

    if let Some(parent) = args.store_path.parent() {
        std::fs::create_dir_all(parent).context("create store dir")?;
    }
    let loaded_store = SwapStore::load_from_json(&args.store_path).context("load store")?;

    let (event_tx, event_rx) = tokio::sync::mpsc::channel(256);
    let engine = Arc::new(SwapEngine::new(
        network, api, lightning, chain, wallet, fees, watcher, fee_calculator, event_tx.clone(),
    ));
    *engine.store.lock().await = loaded_store;

    let lockup_addresses: Vec<String> = {
        let store = engine.store.lock().await;
        store
            .iter()
            .map(|(_, swap)| swap.lockup_address.clone().assume_checked().to_string())
            .collect()
    };
    for lockup_address in lockup_addresses {
        engine
            .watcher
            .register(&lockup_address, event_tx.clone())
            .await
            .context("re-register lockup address on startup")?;
    }

    let reconcile_task = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(event_rx).await })
    };

    let pending_invoice_task = {
        let engine = engine.clone();
        let interval = Duration::from_secs(args.pending_invoice_poll_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = engine.pay_pending_invoices_once().await {
                    tracing::warn!(error = %e, "pay_pending_invoices_once failed");
                }
            }
        })
    };

    let persist_task = {
        let engine = engine.clone();
        let store_path = args.store_path.clone();
        let interval = Duration::from_secs(args.persist_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let store = engine.store.lock().await;
                if let Err(e) = store.save_to_json(&store_path) {
                    tracing::warn!(error = %e, "periodic store persist failed");
                }
            }
        })
    };

    tracing::info!("swap server worker running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
        result = reconcile_task => {
            result.context("reconcile task panicked")?;
        }
    }

    pending_invoice_task.abort();
    persist_task.abort();
    engine.store.lock().await.save_to_json(&args.store_path)?;
    Ok(())
}
