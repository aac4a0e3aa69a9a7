//! In-memory multi-index store over `SwapData`, keyed by payment hash,
//! lockup address and (once observed) funding outpoint, plus a secondary
//! prepay-hash map. Replaces the teacher's SQLite-backed store: the source
//! this crate implements keeps these as plain dicts (`self.swaps`,
//! `_swaps_by_funding_outpoint`, `_swaps_by_lockup_address`) with no query
//! planner round-trip, so an in-memory index is the faithful port.

use std::collections::HashMap;
use std::path::Path;

use bitcoin::OutPoint;

use crate::data::{PersistedSwap, SwapData};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct SwapStore {
    by_payment_hash: HashMap<[u8; 32], SwapData>,
    lockup_address_index: HashMap<String, [u8; 32]>,
    funding_outpoint_index: HashMap<OutPoint, [u8; 32]>,
    prepay_to_payment_hash: HashMap<[u8; 32], [u8; 32]>,
}

impl SwapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a swap, re-indexing every applicable lookup.
    /// Idempotent: re-running with the same `SwapData` is a no-op on the
    /// indices besides overwriting the stored value.
    pub fn upsert(&mut self, payment_hash: [u8; 32], swap: SwapData) {
        let lockup_key = swap.lockup_address.clone().assume_checked().to_string();
        self.lockup_address_index.insert(lockup_key, payment_hash);

        if let Some(prevout) = swap.funding_prevout {
            self.funding_outpoint_index.insert(prevout, payment_hash);
        }
        if let Some(prepay_hash) = swap.prepay_hash {
            self.prepay_to_payment_hash.insert(prepay_hash, payment_hash);
        }

        self.by_payment_hash.insert(payment_hash, swap);
    }

    pub fn get_by_payment_hash(&self, payment_hash: &[u8; 32]) -> Option<&SwapData> {
        if let Some(swap) = self.by_payment_hash.get(payment_hash) {
            return Some(swap);
        }
        let primary = self.prepay_to_payment_hash.get(payment_hash)?;
        self.by_payment_hash.get(primary)
    }

    pub fn get_mut_by_payment_hash(&mut self, payment_hash: &[u8; 32]) -> Option<&mut SwapData> {
        if self.by_payment_hash.contains_key(payment_hash) {
            return self.by_payment_hash.get_mut(payment_hash);
        }
        let primary = *self.prepay_to_payment_hash.get(payment_hash)?;
        self.by_payment_hash.get_mut(&primary)
    }

    pub fn get_by_lockup_address(&self, address: &str) -> Option<&SwapData> {
        let payment_hash = self.lockup_address_index.get(address)?;
        self.by_payment_hash.get(payment_hash)
    }

    pub fn payment_hash_for_lockup_address(&self, address: &str) -> Option<[u8; 32]> {
        self.lockup_address_index.get(address).copied()
    }

    /// O(1) membership check used to decide whether an address-watcher
    /// event is even relevant to a swap, before invoking the full callback
    /// path (`is_lockup_address_for_a_swap` in the source).
    pub fn is_swap_lockup_address(&self, address: &str) -> bool {
        self.lockup_address_index.contains_key(address)
    }

    /// Returns `None` both when there is no matching funding outpoint and
    /// when `tx` has more than one output — the source returns `False` in
    /// the latter case, which is almost certainly a bug; this does not
    /// replicate it.
    pub fn get_by_funding_tx(&self, tx: &bitcoin::Transaction) -> Option<&SwapData> {
        if tx.output.len() != 1 {
            return None;
        }
        let prevout = OutPoint {
            txid: tx.compute_txid(),
            vout: 0,
        };
        let payment_hash = self.funding_outpoint_index.get(&prevout)?;
        self.by_payment_hash.get(payment_hash)
    }

    pub fn get_by_claim_txin_prevout(&self, prevout: &OutPoint) -> Option<&SwapData> {
        let payment_hash = self.funding_outpoint_index.get(prevout)?;
        self.by_payment_hash.get(payment_hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8; 32], &SwapData)> {
        self.by_payment_hash.iter()
    }

    pub fn load_from_json(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let contents = std::fs::read_to_string(path)?;
        let persisted: HashMap<String, PersistedSwap> = serde_json::from_str(&contents)?;

        let mut store = Self::new();
        for (payment_hash_hex, persisted_swap) in persisted {
            let payment_hash_bytes = hex::decode(&payment_hash_hex)
                .map_err(|e| Error::Parse(format!("bad payment_hash key: {e}")))?;
            let payment_hash: [u8; 32] = payment_hash_bytes
                .try_into()
                .map_err(|_| Error::Parse("payment_hash key must be 32 bytes".into()))?;
            let swap = persisted_swap.into_swap()?;
            store.upsert(payment_hash, swap);
        }
        Ok(store)
    }

    pub fn save_to_json(&self, path: &Path) -> Result<()> {
        let mut out: HashMap<String, PersistedSwap> = HashMap::with_capacity(self.by_payment_hash.len());
        for (payment_hash, swap) in &self.by_payment_hash {
            out.insert(hex::encode(payment_hash), PersistedSwap::from_swap(swap));
        }
        let contents = serde_json::to_string_pretty(&out)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::address::NetworkUnchecked;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use std::str::FromStr;

    fn sample_swap(privkey_byte: u8) -> ([u8; 32], SwapData) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[privkey_byte; 32]).unwrap();
        let claim_pk = bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk);
        let hash160 = [0u8; 20];
        let script = crate::script::build_forward_script(&hash160, &claim_pk, 800_000, &claim_pk);
        let lockup_address: bitcoin::Address<NetworkUnchecked> =
            crate::script::p2wsh_address(&script, bitcoin::Network::Regtest)
                .as_unchecked()
                .clone();
        let receive_address: bitcoin::Address<NetworkUnchecked> =
            bitcoin::Address::from_str("bcrt1qe5gn5w47hxw4tps5zrgqj0dhl9yfcqdfqdzgah")
                .unwrap();

        let payment_hash = [privkey_byte; 32];
        let swap = SwapData {
            is_reverse: false,
            locktime: 800_000,
            onchain_amount: 100_000,
            lightning_amount: 99_000,
            redeem_script: script,
            preimage: Some([privkey_byte; 32]),
            prepay_hash: None,
            privkey: sk.secret_bytes(),
            lockup_address,
            receive_address,
            funding_txid: None,
            spending_txid: None,
            is_redeemed: false,
            invoice: None,
            funding_prevout: None,
        };
        (payment_hash, swap)
    }

    #[test]
    fn upsert_then_lookup_by_all_keys() {
        let mut store = SwapStore::new();
        let (payment_hash, swap) = sample_swap(1);
        let lockup = swap.lockup_address.clone().assume_checked().to_string();
        store.upsert(payment_hash, swap);

        assert!(store.get_by_payment_hash(&payment_hash).is_some());
        assert!(store.get_by_lockup_address(&lockup).is_some());
        assert!(store.is_swap_lockup_address(&lockup));
        assert!(!store.is_swap_lockup_address("not-an-address"));
    }

    #[test]
    fn reindex_on_funding_observed() {
        let mut store = SwapStore::new();
        let (payment_hash, mut swap) = sample_swap(2);
        let prevout = OutPoint {
            txid: bitcoin::Txid::from_str(
                "04a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33",
            )
            .expect("valid txid hex"),
            vout: 0,
        };
        swap.funding_prevout = Some(prevout);
        store.upsert(payment_hash, swap);

        assert!(store.get_by_claim_txin_prevout(&prevout).is_some());
    }

    #[test]
    fn json_round_trip() {
        let mut store = SwapStore::new();
        let (payment_hash, swap) = sample_swap(3);
        store.upsert(payment_hash, swap);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("submarine_swaps.json");
        store.save_to_json(&path).unwrap();

        let loaded = SwapStore::load_from_json(&path).unwrap();
        assert!(loaded.get_by_payment_hash(&payment_hash).is_some());
    }
}
