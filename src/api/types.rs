//! Wire types for the swap server's JSON HTTP API, field-mapped to its
//! camelCase schema the way `ark-lightning/src/boltz.rs` maps the Boltz API.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapType {
    #[serde(rename = "submarine")]
    Submarine,
    #[serde(rename = "reversesubmarine")]
    ReverseSubmarine,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSwapRequest {
    #[serde(rename = "type")]
    pub kind: SwapType,
    #[serde(rename = "pairId")]
    pub pair_id: String,
    #[serde(rename = "orderSide")]
    pub order_side: OrderSide,
    pub invoice: Option<String>,
    #[serde(rename = "refundPublicKey", skip_serializing_if = "Option::is_none")]
    pub refund_public_key: Option<String>,
    #[serde(rename = "preimageHash", skip_serializing_if = "Option::is_none")]
    pub preimage_hash: Option<String>,
    #[serde(rename = "claimPublicKey", skip_serializing_if = "Option::is_none")]
    pub claim_public_key: Option<String>,
    #[serde(rename = "invoiceAmount", skip_serializing_if = "Option::is_none")]
    pub invoice_amount: Option<u64>,
}

/// `POST /createswap` response for a forward (`submarine`) swap.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubmarineSwapResponse {
    pub id: String,
    #[serde(rename = "acceptZeroConf", default)]
    pub accept_zero_conf: bool,
    #[serde(rename = "expectedAmount")]
    pub expected_amount: u64,
    #[serde(rename = "timeoutBlockHeight")]
    pub timeout_block_height: u32,
    pub address: String,
    #[serde(rename = "redeemScript")]
    pub redeem_script: String,
}

/// `POST /createswap` response for a reverse (`reversesubmarine`) swap.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateReverseSwapResponse {
    pub id: String,
    pub invoice: String,
    #[serde(rename = "minerFeeInvoice")]
    pub miner_fee_invoice: Option<String>,
    #[serde(rename = "lockupAddress")]
    pub lockup_address: String,
    #[serde(rename = "redeemScript")]
    pub redeem_script: String,
    #[serde(rename = "timeoutBlockHeight")]
    pub timeout_block_height: u32,
    #[serde(rename = "onchainAmount")]
    pub onchain_amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerFeesLeg {
    pub lockup: u64,
    pub claim: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerFees {
    pub normal: u64,
    pub reverse: MinerFeesLeg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerFeesByAsset {
    #[serde(rename = "baseAsset")]
    pub base_asset: MinerFees,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairFees {
    pub percentage: f64,
    #[serde(rename = "minerFees")]
    pub miner_fees: MinerFeesByAsset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairLimits {
    pub minimal: u64,
    pub maximal: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pair {
    pub fees: PairFees,
    pub limits: PairLimits,
}

/// `GET /getpairs` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairsResponse {
    pub pairs: HashMap<String, Pair>,
}
