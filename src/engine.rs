//! The protocol state machine: create forward/reverse swaps, verify the
//! server's response against the agreed template, and reconcile chain
//! observations against protocol expectations (`_claim_swap` / `normal_swap`
//! / `reverse_swap` / `add_server_swap` / `pay_pending_invoices` in the
//! source).

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bitcoin::hashes::{Hash, ripemd160, sha256};
use bitcoin::secp256k1::rand::rngs::OsRng;
use bitcoin::secp256k1::rand::RngCore;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::Network;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::api::types::{CreateSwapRequest, OrderSide, SwapType};
use crate::api::ApiClient;
use crate::claim::{self, LockupUtxo};
use crate::collaborators::{AddressWatcher, Chain, FeeEstimator, LightningLayer, SpentStatus, Wallet, WatcherEvent};
use crate::data::SwapData;
use crate::error::{Error, Result};
use crate::fees::FeeCalculator;
use crate::script;
use crate::store::SwapStore;

/// Blocks of reorg-safety delay required before a confirmed spend is
/// considered final (`REDEEM_AFTER_DOUBLE_SPENT_DELAY` in the source).
pub const REDEEM_AFTER_DOUBLE_SPENT_DELAY: u32 = 3;
/// Server must not lock funds for more than this many blocks ahead.
pub const MAX_SERVER_LOCKTIME_WINDOW: u32 = 144;
pub const MIN_LOCKTIME_DELTA: u32 = 60;

fn random_privkey() -> ([u8; 32], SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let sk = SecretKey::from_slice(&bytes).expect("32 random bytes is a valid secret key");
    let pk = PublicKey::from_secret_key(&secp, &sk);
    (bytes, sk, pk)
}

pub struct SwapEngine {
    pub network: Network,
    pub api: ApiClient,
    pub lightning: Arc<dyn LightningLayer>,
    pub chain: Arc<dyn Chain>,
    pub wallet: Arc<dyn Wallet>,
    pub fees: Arc<dyn FeeEstimator>,
    pub watcher: Arc<dyn AddressWatcher>,
    pub store: AsyncMutex<SwapStore>,
    pub fee_calculator: StdMutex<FeeCalculator>,
    /// Clone of this goes to `AddressWatcher::register` for every swap, so a
    /// single `run` loop sees every observation in delivery order.
    event_tx: mpsc::Sender<WatcherEvent>,
    pending_payments: StdMutex<HashSet<[u8; 32]>>,
}

impl SwapEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network: Network,
        api: ApiClient,
        lightning: Arc<dyn LightningLayer>,
        chain: Arc<dyn Chain>,
        wallet: Arc<dyn Wallet>,
        fees: Arc<dyn FeeEstimator>,
        watcher: Arc<dyn AddressWatcher>,
        fee_calculator: FeeCalculator,
        event_tx: mpsc::Sender<WatcherEvent>,
    ) -> Self {
        Self {
            network,
            api,
            lightning,
            chain,
            wallet,
            fees,
            watcher,
            store: AsyncMutex::new(SwapStore::new()),
            fee_calculator: StdMutex::new(fee_calculator),
            event_tx,
            pending_payments: StdMutex::new(HashSet::new()),
        }
    }

    /// §4.5.1 Create forward swap (client side): client funds on-chain,
    /// receives on Lightning.
    pub async fn create_forward_swap(&self, lightning_amount_msat: u64, description: &str) -> Result<[u8; 32]> {
        let (privkey_bytes, _sk, refund_pubkey) = random_privkey();

        let bolt11 = self
            .lightning
            .create_invoice(lightning_amount_msat, description, 3600)
            .await?;
        let payment_hash = crate::lightning::invoice::payment_hash_from_bolt11(&bolt11)?;
        let lightning_amount = lightning_amount_msat / 1000;

        let req = CreateSwapRequest {
            kind: SwapType::Submarine,
            pair_id: "BTC/BTC".to_string(),
            order_side: OrderSide::Sell,
            invoice: Some(bolt11.clone()),
            refund_public_key: Some(hex::encode(refund_pubkey.serialize())),
            preimage_hash: None,
            claim_public_key: None,
            invoice_amount: None,
        };
        let resp = self.api.create_submarine_swap(&req).await?;

        let redeem_script_bytes = hex::decode(&resp.redeem_script)
            .map_err(|e| Error::ProtocolMismatch(format!("bad redeemScript hex: {e}")))?;
        let redeem_script = bitcoin::ScriptBuf::from(redeem_script_bytes);

        script::verify_response(&redeem_script, &payment_hash, &refund_pubkey, resp.timeout_block_height, false)?;

        let lockup_address = bitcoin::Address::from_str(&resp.address)
            .map_err(|e| Error::ProtocolMismatch(format!("bad lockup address: {e}")))?
            .require_network(self.network)
            .map_err(|e| Error::ProtocolMismatch(format!("lockup address wrong network: {e}")))?;
        if script::p2wsh_address(&redeem_script, self.network) != lockup_address {
            return Err(Error::ProtocolMismatch("lockup address does not match redeem script".into()));
        }

        let expected_max = self
            .fee_calculator
            .lock()
            .expect("fee_calculator mutex poisoned")
            .send_from_recv(lightning_amount, false)?
            .ok_or_else(|| Error::ProtocolMismatch("lightning amount out of range".into()))?;
        if resp.expected_amount > expected_max {
            return Err(Error::ProtocolMismatch("expectedAmount exceeds our calculation".into()));
        }

        let current_height = self.chain.local_height().await?;
        if resp.timeout_block_height.saturating_sub(current_height) >= MAX_SERVER_LOCKTIME_WINDOW {
            return Err(Error::ProtocolMismatch("server locktime window too large".into()));
        }

        let receive_address = self.wallet.get_receiving_address().await?;

        let swap = SwapData {
            is_reverse: false,
            locktime: resp.timeout_block_height,
            onchain_amount: resp.expected_amount,
            lightning_amount,
            redeem_script,
            preimage: None,
            prepay_hash: None,
            privkey: privkey_bytes,
            lockup_address: lockup_address.as_unchecked().clone(),
            receive_address,
            funding_txid: None,
            spending_txid: None,
            is_redeemed: false,
            invoice: Some(bolt11),
            funding_prevout: None,
        };

        self.watcher.register(&resp.address, self.event_tx.clone()).await?;
        self.store.lock().await.upsert(payment_hash, swap);

        // Fund the lockup: build and broadcast the on-chain output the
        // server's claim/refund script spends (`start_normal_swap` in the
        // source). Any verification above must have succeeded first, since
        // once broadcast the funds are locked to the agreed script.
        let funding_output = bitcoin::TxOut {
            value: bitcoin::Amount::from_sat(resp.expected_amount),
            script_pubkey: lockup_address.script_pubkey(),
        };
        let funding_tx = self.wallet.create_transaction(&[funding_output], true, None).await?;
        let funding_txid = self.chain.broadcast(&funding_tx).await?;
        if let Some(swap) = self.store.lock().await.get_mut_by_payment_hash(&payment_hash) {
            swap.funding_txid = Some(funding_txid);
        }

        Ok(payment_hash)
    }

    /// §4.5.2 Create reverse swap (client side): client pays Lightning,
    /// receives on-chain. Registers the lockup address before paying the
    /// invoice so the watcher can never miss the funding transaction, then
    /// pays; the claim itself happens later, reconciled by `handle_event`
    /// once the lockup is confirmed.
    pub async fn create_reverse_swap(&self, onchain_amount_recv: u64) -> Result<[u8; 32]> {
        let (privkey_bytes, _sk, claim_pubkey) = random_privkey();
        let mut preimage = [0u8; 32];
        OsRng.fill_bytes(&mut preimage);
        let preimage_hash = sha256::Hash::hash(&preimage).to_byte_array();

        let send_amount = self
            .fee_calculator
            .lock()
            .expect("fee_calculator mutex poisoned")
            .send_from_recv(onchain_amount_recv, true)?
            .ok_or_else(|| Error::ProtocolMismatch("amount out of range".into()))?;

        let req = CreateSwapRequest {
            kind: SwapType::ReverseSubmarine,
            pair_id: "BTC/BTC".to_string(),
            order_side: OrderSide::Buy,
            invoice: None,
            refund_public_key: None,
            preimage_hash: Some(hex::encode(preimage_hash)),
            claim_public_key: Some(hex::encode(claim_pubkey.serialize())),
            invoice_amount: Some(send_amount),
        };
        let resp = self.api.create_reverse_swap(&req).await?;

        let invoice_payment_hash = crate::lightning::invoice::payment_hash_from_bolt11(&resp.invoice)?;
        if invoice_payment_hash != preimage_hash {
            return Err(Error::ProtocolMismatch("invoice payment_hash does not match preimage_hash".into()));
        }

        // The server may split the payment into the swap invoice plus a
        // separate on-chain-miner-fee invoice (`minerFeeInvoice`); the two
        // together must add up to exactly what we requested.
        let mut invoice_amount_sat = crate::lightning::invoice::amount_msat_from_bolt11(&resp.invoice)?
            .ok_or_else(|| Error::ProtocolMismatch("invoice missing amount".into()))?
            / 1000;
        let prepay_hash = match &resp.miner_fee_invoice {
            Some(fee_invoice) => {
                let fee_amount_msat = crate::lightning::invoice::amount_msat_from_bolt11(fee_invoice)?
                    .ok_or_else(|| Error::ProtocolMismatch("fee invoice missing amount".into()))?;
                invoice_amount_sat += fee_amount_msat / 1000;
                Some(crate::lightning::invoice::payment_hash_from_bolt11(fee_invoice)?)
            }
            None => None,
        };
        if invoice_amount_sat != send_amount {
            return Err(Error::ProtocolMismatch(
                "invoice amount plus fee invoice amount does not match the requested lightning amount".into(),
            ));
        }

        let redeem_script_bytes = hex::decode(&resp.redeem_script)
            .map_err(|e| Error::ProtocolMismatch(format!("bad redeemScript hex: {e}")))?;
        let redeem_script = bitcoin::ScriptBuf::from(redeem_script_bytes);
        script::verify_response(&redeem_script, &preimage_hash, &claim_pubkey, resp.timeout_block_height, true)?;

        let lockup_address = bitcoin::Address::from_str(&resp.lockup_address)
            .map_err(|e| Error::ProtocolMismatch(format!("bad lockup address: {e}")))?
            .require_network(self.network)
            .map_err(|e| Error::ProtocolMismatch(format!("lockup address wrong network: {e}")))?;
        if resp.onchain_amount < onchain_amount_recv {
            return Err(Error::ProtocolMismatch("onchainAmount below what we expect to receive".into()));
        }

        let current_height = self.chain.local_height().await?;
        let delta = resp.timeout_block_height.saturating_sub(current_height);
        if delta <= MIN_LOCKTIME_DELTA {
            return Err(Error::ProtocolMismatch("locktime window too small".into()));
        }

        let receive_address = self.wallet.get_receiving_address().await?;

        let swap = SwapData {
            is_reverse: true,
            locktime: resp.timeout_block_height,
            onchain_amount: resp.onchain_amount,
            lightning_amount: send_amount,
            redeem_script,
            preimage: Some(preimage),
            prepay_hash,
            privkey: privkey_bytes,
            lockup_address: lockup_address.as_unchecked().clone(),
            receive_address,
            funding_txid: None,
            spending_txid: None,
            is_redeemed: false,
            invoice: None,
            funding_prevout: None,
        };

        self.watcher.register(&resp.lockup_address, self.event_tx.clone()).await?;
        self.store.lock().await.upsert(preimage_hash, swap);

        // The fee invoice, if any, is paid fire-and-forget: its own
        // payment_hash never gates anything the caller waits on.
        if let Some(fee_invoice) = resp.miner_fee_invoice.clone() {
            let lightning = self.lightning.clone();
            tokio::spawn(async move {
                if let Err(e) = lightning.pay_invoice(&fee_invoice, 10).await {
                    tracing::warn!(error = %e, "fee invoice payment failed");
                }
            });
        }

        // First-completed join: return as soon as either the swap invoice
        // is paid or the funding output is observed, cancelling the loser
        // (§4.5.2 step 6, §5). Any partial payment side effect left behind
        // by a cancelled `pay_invoice` is reconciled from persisted
        // `SwapData` on restart, same as the source's own documented
        // caveat for this race.
        tokio::select! {
            result = self.lightning.pay_invoice(&resp.invoice, 10) => {
                result?;
            }
            _ = self.wait_for_funding(preimage_hash) => {}
        }

        Ok(preimage_hash)
    }

    /// Polls the store until `payment_hash`'s swap has observed a funding
    /// transaction, for the first-completed race in `create_reverse_swap`.
    async fn wait_for_funding(&self, payment_hash: [u8; 32]) {
        loop {
            let funded = self
                .store
                .lock()
                .await
                .get_by_payment_hash(&payment_hash)
                .is_some_and(|swap| swap.funding_txid.is_some());
            if funded {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// §SUPPLEMENT `add_server_swap`: server-side counterparty bookkeeping
    /// for a swap the peer initiated.
    ///
    /// `is_reverse_for_server = invoice.is_some()`, exactly as in the
    /// source: a non-`None` `invoice` means the *peer* is doing a forward
    /// swap (client locks on-chain, we pay `invoice`), so from our own
    /// engine's perspective we are the one who ends up claiming that
    /// lockup with a preimage once we've paid it — the success-path branch
    /// `handle_event` drives for `is_reverse == true`. A `None` invoice
    /// means the peer is doing a reverse swap (we lock on-chain ourselves
    /// and issue our own hold invoice elsewhere); we are the one who may
    /// have to refund that lockup after timeout — the timeout-path branch
    /// for `is_reverse == false`. Note this is the *opposite* sense from
    /// `create_forward_swap`/`create_reverse_swap`, where `is_reverse`
    /// equals the peer-facing protocol direction directly, because there
    /// the caller plays the role the protocol direction implies (client
    /// refunds a forward swap, client claims a reverse swap) while here the
    /// server plays the complementary role.
    ///
    /// Because the role is inverted, so is the script template: the
    /// redeem script built here uses the *protocol*-direction template
    /// (`invoice.is_some()` ⇒ forward template even though our own
    /// `is_reverse` flag is `true`), matching `add_server_swap`'s own
    /// `WITNESS_TEMPLATE_SWAP`/`WITNESS_TEMPLATE_REVERSE_SWAP` choice.
    #[allow(clippy::too_many_arguments)]
    pub fn create_server_swap(
        &self,
        onchain_amount: u64,
        lightning_amount: u64,
        locktime: u32,
        peer_pubkey: PublicKey,
        payment_hash: [u8; 32],
        receive_address: bitcoin::Address<bitcoin::address::NetworkUnchecked>,
        invoice: Option<String>,
    ) -> (SwapData, [u8; 32]) {
        let (privkey_bytes, _sk, our_pubkey) = random_privkey();
        let hash160 = ripemd160::Hash::hash(&payment_hash).to_byte_array();

        let is_reverse = invoice.is_some();
        let protocol_is_reverse = !is_reverse;
        let (claim_pubkey, refund_pubkey) = if is_reverse {
            (our_pubkey, peer_pubkey)
        } else {
            (peer_pubkey, our_pubkey)
        };
        let redeem_script = script::build(protocol_is_reverse, &hash160, &claim_pubkey, locktime, &refund_pubkey);
        let lockup_address = script::p2wsh_address(&redeem_script, self.network);

        let swap = SwapData {
            is_reverse,
            locktime,
            onchain_amount,
            lightning_amount,
            redeem_script,
            preimage: None,
            prepay_hash: None,
            privkey: privkey_bytes,
            lockup_address: lockup_address.as_unchecked().clone(),
            receive_address,
            funding_txid: None,
            spending_txid: None,
            is_redeemed: false,
            invoice,
            funding_prevout: None,
        };
        (swap, payment_hash)
    }

    /// §4.5.3 Watcher callback (`claim_swap`): reconcile one observation
    /// against the swap it concerns.
    pub async fn handle_event(&self, event: WatcherEvent) -> Result<()> {
        let current_height = self.chain.local_height().await?;
        let mut store = self.store.lock().await;
        let Some(payment_hash) = store.payment_hash_for_lockup_address(&event.lockup_address) else {
            return Ok(());
        };
        let Some(swap) = store.get_mut_by_payment_hash(&payment_hash) else {
            return Ok(());
        };

        if swap.is_reverse && event.value_sat < swap.onchain_amount {
            tracing::warn!(lockup_address = %event.lockup_address, "reverse swap underpaid, ignoring");
            return Ok(());
        }

        swap.funding_txid = Some(event.funding_txid);
        swap.funding_prevout = Some(bitcoin::OutPoint {
            txid: event.funding_txid,
            vout: event.vout,
        });

        match event.spent_height {
            SpentStatus::Confirmed(height) => {
                if current_height.saturating_sub(height) < REDEEM_AFTER_DOUBLE_SPENT_DELAY {
                    return Ok(());
                }
                if swap.preimage.is_none() && !swap.is_reverse {
                    tracing::info!("confirmed refund by counterparty, failing forwarded htlc");
                    let key: Vec<u8> = payment_hash.to_vec();
                    self.lightning.fail_trampoline_forwarding(&key).await?;
                }
                swap.is_redeemed = true;
                self.watcher.unregister(&event.lockup_address).await?;
                return Ok(());
            }
            SpentStatus::InMempool | SpentStatus::Local => return Ok(()),
            SpentStatus::Unspent => {}
        }

        if !swap.is_reverse {
            if current_height < swap.locktime {
                // The counterparty can still claim with the preimage;
                // refund only becomes valid at `locktime`.
                return Err(Error::TooEarlyToRefund);
            }
        } else if swap.preimage.is_none() {
            // A reverse-role claim whose preimage isn't already known to us
            // (the server bookkeeping a client's forward swap, rather than
            // our own create_reverse_swap where the preimage is generated
            // up front): pull it from the Lightning layer now that funds
            // are visible, or park the payment_hash for the periodic
            // pay_pending_invoices_once worker to retry.
            match self.lightning.get_preimage(&payment_hash).await? {
                Some(preimage) => swap.preimage = Some(preimage),
                None => {
                    self.pending_payments.lock().expect("pending_payments mutex poisoned").insert(payment_hash);
                    return Ok(());
                }
            }
        }

        let utxo = LockupUtxo {
            outpoint: swap.funding_prevout.expect("funding_prevout just set"),
            value: bitcoin::Amount::from_sat(event.value_sat),
            script_pubkey: swap.redeem_script.to_p2wsh(),
        };
        let fee_rate = self.fees.claim_fee_rate().await?;
        let fee = claim::claim_fee(fee_rate.max(1));

        match claim::build_and_sign(swap, &utxo, fee) {
            Ok(tx) => {
                let txid = self.chain.broadcast(&tx).await?;
                swap.spending_txid = Some(txid);
            }
            Err(Error::BelowDust) => {
                tracing::info!("claim output below dust, will retry with updated fee estimate");
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }

    /// Extract and verify the preimage from a counterparty's spending
    /// witness on a forward swap's lockup, settling the inbound Lightning
    /// HTLC on success.
    pub async fn observe_spend(&self, payment_hash: &[u8; 32], witness_second_element: &[u8]) -> Result<()> {
        let mut store = self.store.lock().await;
        let Some(swap) = store.get_mut_by_payment_hash(payment_hash) else {
            return Ok(());
        };
        if swap.is_reverse || swap.preimage.is_some() {
            return Ok(());
        }
        if witness_second_element.len() != 32 {
            return Ok(());
        }
        let mut preimage = [0u8; 32];
        preimage.copy_from_slice(witness_second_element);
        if sha256::Hash::hash(&preimage).to_byte_array() == *payment_hash {
            swap.preimage = Some(preimage);
            self.lightning.publish_preimage(payment_hash, &preimage).await?;
        }
        Ok(())
    }

    /// Consume watcher events until the channel closes, driving
    /// `handle_event` sequentially so observations for a given swap are
    /// processed in delivery order.
    pub async fn run(&self, mut events: mpsc::Receiver<WatcherEvent>) {
        while let Some(event) = events.recv().await {
            match self.handle_event(event).await {
                Ok(()) => {}
                Err(Error::TooEarlyToRefund) => tracing::debug!("too early to refund, skipping"),
                Err(e) => tracing::warn!(error = %e, "claim_swap failed"),
            }
        }
    }

    /// §4.5.4 Periodic invoice-payment worker (server role): every tick,
    /// retry any pending (server-side, forward-swap) invoice payment whose
    /// locktime has not expired.
    pub async fn pay_pending_invoices_once(&self) -> Result<()> {
        let current_height = self.chain.local_height().await?;
        let pending: Vec<[u8; 32]> = self
            .pending_payments
            .lock()
            .expect("pending_payments mutex poisoned")
            .iter()
            .copied()
            .collect();

        for payment_hash in pending {
            let (locktime, invoice) = {
                let store = self.store.lock().await;
                let Some(swap) = store.get_by_payment_hash(&payment_hash) else {
                    continue;
                };
                (swap.locktime, swap.invoice.clone())
            };
            if locktime.saturating_sub(current_height) <= MIN_LOCKTIME_DELTA {
                continue;
            }
            let Some(bolt11) = invoice else { continue };
            if self.lightning.pay_invoice(&bolt11, 1).await.unwrap_or(false) {
                self.pending_payments.lock().expect("pending_payments mutex poisoned").remove(&payment_hash);
            }
        }
        Ok(())
    }
}
