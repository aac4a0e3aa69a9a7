//! Introspection CLI: inspect the local swap store and query the swap
//! server's fee/limit schedule without touching Lightning or chain state.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser as _, Subcommand};
use ln_swap_core::api::ApiClient;
use ln_swap_core::data::derive_state;
use ln_swap_core::fees::FeeCalculator;
use ln_swap_core::store::SwapStore;
use serde_json::json;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:9001")]
    swap_server_url: String,

    #[arg(long, default_value = "./swap-client-data/submarine_swaps.json")]
    store_path: PathBuf,

    #[arg(long, default_value = "./swap-client-data/pairs_cache.json")]
    pairs_cache_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List every swap in the local store with its derived lifecycle state.
    List {
        #[arg(long)]
        current_height: u32,
    },
    /// Show one swap by payment hash (hex).
    Show {
        #[arg(long)]
        payment_hash: String,
        #[arg(long)]
        current_height: u32,
    },
    /// Fetch and print the swap server's current fee/limit schedule.
    Pairs,
    /// Compute a send/recv quote from the cached fee schedule.
    Quote {
        #[arg(long)]
        recv_amount: u64,
        #[arg(long)]
        reverse: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    ln_swap_core::logging::init().ok();
    let args = Args::parse();

    match args.command {
        Command::List { current_height } => {
            let store = SwapStore::load_from_json(&args.store_path).context("load store")?;
            let rows: Vec<_> = store
                .iter()
                .map(|(payment_hash, swap)| {
                    json!({
                        "payment_hash": hex::encode(payment_hash),
                        "is_reverse": swap.is_reverse,
                        "onchain_amount": swap.onchain_amount,
                        "lightning_amount": swap.lightning_amount,
                        "state": format!("{:?}", derive_state(swap, current_height)),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Show { payment_hash, current_height } => {
            let store = SwapStore::load_from_json(&args.store_path).context("load store")?;
            let bytes = hex::decode(&payment_hash).context("decode --payment-hash")?;
            let key: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("--payment-hash must be 32 bytes"))?;
            let swap = store
                .get_by_payment_hash(&key)
                .ok_or_else(|| anyhow::anyhow!("no such swap"))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "is_reverse": swap.is_reverse,
                    "locktime": swap.locktime,
                    "onchain_amount": swap.onchain_amount,
                    "lightning_amount": swap.lightning_amount,
                    "lockup_address": swap.lockup_address.clone().assume_checked().to_string(),
                    "receive_address": swap.receive_address.clone().assume_checked().to_string(),
                    "funding_txid": swap.funding_txid.map(|t| t.to_string()),
                    "spending_txid": swap.spending_txid.map(|t| t.to_string()),
                    "is_redeemed": swap.is_redeemed,
                    "state": format!("{:?}", derive_state(swap, current_height)),
                }))?
            );
        }
        Command::Pairs => {
            let api = ApiClient::new(args.swap_server_url);
            let pairs = api.get_pairs_cached(&args.pairs_cache_path).await.context("GET /getpairs")?;
            println!("{}", serde_json::to_string_pretty(&pairs)?);
        }
        Command::Quote { recv_amount, reverse } => {
            let api = ApiClient::new(args.swap_server_url);
            let pairs = api.get_pairs_cached(&args.pairs_cache_path).await.context("GET /getpairs")?;
            let calculator = FeeCalculator::from_pairs_response(&pairs).context("build fee calculator")?;
            let send_amount = calculator
                .send_from_recv(recv_amount, reverse)
                .context("send_from_recv")?
                .ok_or_else(|| anyhow::anyhow!("recv_amount out of range"))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "recv_amount": recv_amount, "send_amount": send_amount }))?
            );
        }
    }

    Ok(())
}
