//! Client-role binary: create a forward or reverse swap against an external
//! swap server, persisting state to a local JSON store and driving the
//! watcher-reconciliation loop until the process is interrupted.

use std::path::PathBuf;
use std::str::FromStr as _;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser as _, Subcommand};
use ln_swap_core::api::ApiClient;
use ln_swap_core::engine::SwapEngine;
use ln_swap_core::esplora;
use ln_swap_core::fees::FeeCalculator;
use ln_swap_core::lightning::LdkLightningClient;

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

    #[arg(long, default_value = "./swap-client-data/submarine_swaps.json")]
    store_path: PathBuf,

    #[arg(long, default_value = "./swap-client-data/pairs_cache.json")]
    pairs_cache_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pay on-chain, receive on Lightning.
    Forward {
        #[arg(long)]
        amount_msat: u64,
        #[arg(long, default_value = "swap")]
        description: String,
    },
    /// Pay on Lightning, receive on-chain.
    Reverse {
        #[arg(long)]
        amount_sat: u64,
    },
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

    let (event_tx, event_rx) = tokio::sync::mpsc::channel(64);
    let engine = Arc::new(SwapEngine::new(
        network, api, lightning, chain, wallet, fees, watcher, fee_calculator, event_tx,
    ));

    if let Some(parent) = args.store_path.parent() {
        std::fs::create_dir_all(parent).context("create store dir")?;
    }

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(event_rx).await })
    };

    let payment_hash = match args.command {
        Command::Forward { amount_msat, description } => engine
            .create_forward_swap(amount_msat, &description)
            .await
            .context("create_forward_swap")?,
        Command::Reverse { amount_sat } => engine
            .create_reverse_swap(amount_sat)
            .await
            .context("create_reverse_swap")?,
    };
    tracing::info!(payment_hash = %hex::encode(payment_hash), "swap created");

    engine.store.lock().await.save_to_json(&args.store_path)?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
        result = runner => {
            result.context("watcher loop task panicked")?;
        }
    }

    engine.store.lock().await.save_to_json(&args.store_path)?;
    Ok(())
}
