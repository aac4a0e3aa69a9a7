//! The canonical persisted swap entity and its on-disk serialization.

use bitcoin::hashes::{Hash, sha256};
use bitcoin::{OutPoint, ScriptBuf};
use serde::{Deserialize, Serialize};

/// Serde helper for `[u8; 32]` fields, hex-encoded on the wire.
mod hex_bytes32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        hex::encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

mod hex_bytes32_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        bytes.map(hex::encode).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            None => Ok(None),
            Some(s) => {
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
                Ok(Some(arr))
            }
        }
    }
}

/// In-memory representation of one swap, forward or reverse.
#[derive(Debug, Clone)]
pub struct SwapData {
    pub is_reverse: bool,
    pub locktime: u32,
    pub onchain_amount: u64,
    pub lightning_amount: u64,
    pub redeem_script: ScriptBuf,
    pub preimage: Option<[u8; 32]>,
    pub prepay_hash: Option<[u8; 32]>,
    pub privkey: [u8; 32],
    pub lockup_address: bitcoin::Address<bitcoin::address::NetworkUnchecked>,
    pub receive_address: bitcoin::Address<bitcoin::address::NetworkUnchecked>,
    pub funding_txid: Option<bitcoin::Txid>,
    pub spending_txid: Option<bitcoin::Txid>,
    pub is_redeemed: bool,
    /// Forward swaps only: the counterparty's BOLT11, needed by the server
    /// role to pay it once the on-chain lockup is claimed.
    pub invoice: Option<String>,
    /// Volatile: recomputed from chain observations, never persisted.
    pub funding_prevout: Option<OutPoint>,
}

impl SwapData {
    /// `payment_hash` is logically derived as `SHA256(preimage)`, but since
    /// the preimage is unknown until claim time for reverse swaps it is
    /// also carried explicitly as the store's primary key.
    pub fn payment_hash(&self, fallback: [u8; 32]) -> [u8; 32] {
        match self.preimage {
            Some(preimage) => sha256::Hash::hash(&preimage).to_byte_array(),
            None => fallback,
        }
    }
}

/// High-level lifecycle state, derived from `SwapData` plus current height;
/// never stored directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    Created,
    FundingObserved,
    ClaimPending,
    ClaimBroadcast,
    Redeemed,
    RefundBroadcast,
    Abandoned,
}

pub fn derive_state(swap: &SwapData, current_height: u32) -> SwapState {
    if swap.is_redeemed {
        return SwapState::Redeemed;
    }
    if swap.spending_txid.is_some() {
        return SwapState::ClaimBroadcast;
    }
    if swap.funding_txid.is_some() {
        return SwapState::FundingObserved;
    }
    if !swap.is_reverse && current_height >= swap.locktime {
        return SwapState::Abandoned;
    }
    SwapState::Created
}

/// On-disk form of `SwapData`: explicit schema, hex-encoded byte fields,
/// one JSON document keyed by `payment_hash` hex. `funding_prevout` is
/// volatile and is not persisted; it is re-populated on the next watcher
/// callback after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSwap {
    pub is_reverse: bool,
    pub locktime: u32,
    pub onchain_amount: u64,
    pub lightning_amount: u64,
    pub redeem_script_hex: String,
    #[serde(with = "hex_bytes32_opt")]
    pub preimage: Option<[u8; 32]>,
    #[serde(with = "hex_bytes32_opt")]
    pub prepay_hash: Option<[u8; 32]>,
    #[serde(with = "hex_bytes32")]
    pub privkey: [u8; 32],
    pub lockup_address: String,
    pub receive_address: String,
    pub funding_txid: Option<String>,
    pub spending_txid: Option<String>,
    pub is_redeemed: bool,
    pub invoice: Option<String>,
}

impl PersistedSwap {
    pub fn from_swap(swap: &SwapData) -> Self {
        PersistedSwap {
            is_reverse: swap.is_reverse,
            locktime: swap.locktime,
            onchain_amount: swap.onchain_amount,
            lightning_amount: swap.lightning_amount,
            redeem_script_hex: hex::encode(swap.redeem_script.as_bytes()),
            preimage: swap.preimage,
            prepay_hash: swap.prepay_hash,
            privkey: swap.privkey,
            lockup_address: swap.lockup_address.clone().assume_checked().to_string(),
            receive_address: swap.receive_address.clone().assume_checked().to_string(),
            funding_txid: swap.funding_txid.map(|t| t.to_string()),
            spending_txid: swap.spending_txid.map(|t| t.to_string()),
            is_redeemed: swap.is_redeemed,
            invoice: swap.invoice.clone(),
        }
    }

    pub fn into_swap(self) -> anyhow::Result<SwapData> {
        use std::str::FromStr;

        let redeem_script_bytes = hex::decode(&self.redeem_script_hex)
            .map_err(|e| anyhow::anyhow!("bad redeem_script hex: {e}"))?;
        let redeem_script = ScriptBuf::from(redeem_script_bytes);
        let lockup_address = bitcoin::Address::from_str(&self.lockup_address)
            .map_err(|e| anyhow::anyhow!("bad lockup_address: {e}"))?;
        let receive_address = bitcoin::Address::from_str(&self.receive_address)
            .map_err(|e| anyhow::anyhow!("bad receive_address: {e}"))?;

        Ok(SwapData {
            is_reverse: self.is_reverse,
            locktime: self.locktime,
            onchain_amount: self.onchain_amount,
            lightning_amount: self.lightning_amount,
            redeem_script,
            preimage: self.preimage,
            prepay_hash: self.prepay_hash,
            privkey: self.privkey,
            lockup_address,
            receive_address,
            funding_txid: self
                .funding_txid
                .map(|t| bitcoin::Txid::from_str(&t))
                .transpose()
                .map_err(|e| anyhow::anyhow!("bad funding_txid: {e}"))?,
            spending_txid: self
                .spending_txid
                .map(|t| bitcoin::Txid::from_str(&t))
                .transpose()
                .map_err(|e| anyhow::anyhow!("bad spending_txid: {e}"))?,
            is_redeemed: self.is_redeemed,
            invoice: self.invoice,
            funding_prevout: None,
        })
    }
}
