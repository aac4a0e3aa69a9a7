//! Construction and signing of the single-input claim/refund transaction
//! spending a P2WSH swap lockup, for both the success path (reverse swap,
//! preimage known) and the timeout path (forward swap, refund).

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::data::SwapData;
use crate::error::{Error, Result};
use crate::fees::{CLAIM_FEE_SIZE, DUST_THRESHOLD};

/// Everything about the lockup UTXO the builder needs besides `SwapData`.
#[derive(Debug, Clone)]
pub struct LockupUtxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
}

/// A 71-byte placeholder: max-length low-S/low-R DER-encoded ECDSA
/// signature, used only to size the witness before a real signature
/// exists (`add_txin_info` in the source).
const SIG_DUMMY: [u8; 71] = [0u8; 71];

/// Single empty-byte push at the preimage slot for the refund path, per
/// the resolved Open Question: this must not be confused with pushing the
/// empty string as a zero-length element.
const REFUND_PREIMAGE_PLACEHOLDER: [u8; 1] = [0u8];

fn witness_stack(signature_der: &[u8], preimage_or_placeholder: &[u8], redeem_script: &ScriptBuf) -> Witness {
    let mut witness = Witness::new();
    witness.push(signature_der);
    witness.push(preimage_or_placeholder);
    witness.push(redeem_script.as_bytes());
    witness
}

/// Pre-signing witness-size hint for wallet coin selection, before a
/// signature exists.
pub fn witness_size_hint(swap: &SwapData) -> usize {
    let placeholder: &[u8] = if swap.is_reverse {
        swap.preimage.as_ref().map(|p| p.as_slice()).unwrap_or(&REFUND_PREIMAGE_PLACEHOLDER)
    } else {
        &REFUND_PREIMAGE_PLACEHOLDER
    };
    let witness = witness_stack(&SIG_DUMMY, placeholder, &swap.redeem_script);
    witness.size()
}

fn locktime_for(swap: &SwapData) -> u32 {
    if swap.is_reverse { 0 } else { swap.locktime }
}

/// Builds and signs the claim (reverse-success) or refund (forward-timeout)
/// transaction spending `utxo`, paying the full value minus `fee_sat` to
/// `swap.receive_address`.
pub fn build_and_sign(swap: &SwapData, utxo: &LockupUtxo, fee_sat: u64) -> Result<Transaction> {
    let claim_value = utxo
        .value
        .to_sat()
        .checked_sub(fee_sat)
        .ok_or(Error::BelowDust)?;
    if claim_value < DUST_THRESHOLD {
        return Err(Error::BelowDust);
    }

    let locktime = locktime_for(swap);
    let receive_address = swap.receive_address.clone().assume_checked();

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_height(locktime)
            .map_err(|e| Error::InvariantViolation(format!("bad locktime {locktime}: {e}")))?,
        input: vec![TxIn {
            previous_output: utxo.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(claim_value),
            script_pubkey: receive_address.script_pubkey(),
        }],
    };

    let secp = Secp256k1::new();
    let secret_key = SecretKey::from_slice(&swap.privkey)
        .map_err(|e| Error::InvariantViolation(format!("bad privkey: {e}")))?;

    let sighash = {
        let mut cache = SighashCache::new(&tx);
        cache
            .p2wsh_signature_hash(0, &swap.redeem_script, utxo.value, EcdsaSighashType::All)
            .map_err(|e| Error::InvariantViolation(format!("sighash: {e}")))?
    };

    let message = Message::from_digest(sighash.to_byte_array());
    let signature = secp.sign_ecdsa_low_r(&message, &secret_key);
    let mut signature_der = signature.serialize_der().to_vec();
    signature_der.push(EcdsaSighashType::All as u8);

    let preimage_push: Vec<u8> = if swap.is_reverse {
        swap.preimage
            .ok_or_else(|| Error::InvariantViolation("reverse claim requires known preimage".into()))?
            .to_vec()
    } else {
        REFUND_PREIMAGE_PLACEHOLDER.to_vec()
    };

    tx.input[0].witness = witness_stack(&signature_der, &preimage_push, &swap.redeem_script);

    Ok(tx)
}

/// Fee, in satoshis, for the fixed-size claim transaction at `fee_rate`
/// sat/vbyte.
pub fn claim_fee(fee_rate_sat_per_vbyte: u64) -> u64 {
    CLAIM_FEE_SIZE * fee_rate_sat_per_vbyte
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script;
    use bitcoin::secp256k1::PublicKey;
    use bitcoin::Txid;
    use std::str::FromStr;

    fn keypair(byte: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        (sk, pk)
    }

    fn sample_utxo(script: &ScriptBuf) -> LockupUtxo {
        LockupUtxo {
            outpoint: OutPoint {
                txid: Txid::from_str(
                    "04a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33",
                )
                .unwrap(),
                vout: 0,
            },
            value: Amount::from_sat(100_000),
            script_pubkey: script.clone(),
        }
    }

    fn sample_swap(is_reverse: bool, refund_sk: SecretKey, redeem_script: ScriptBuf, preimage: Option<[u8; 32]>) -> SwapData {
        let receive_address: bitcoin::Address<bitcoin::address::NetworkUnchecked> =
            bitcoin::Address::from_str("bcrt1qe5gn5w47hxw4tps5zrgqj0dhl9yfcqdfqdzgah").unwrap();
        SwapData {
            is_reverse,
            locktime: 700_000,
            onchain_amount: 100_000,
            lightning_amount: 99_000,
            redeem_script,
            preimage,
            prepay_hash: None,
            privkey: refund_sk.secret_bytes(),
            lockup_address: receive_address.clone(),
            receive_address,
            funding_txid: None,
            spending_txid: None,
            is_redeemed: false,
            invoice: None,
            funding_prevout: None,
        }
    }

    #[test]
    fn refund_tx_uses_swap_locktime_and_empty_preimage_push() {
        let (claim_sk, claim_pk) = keypair(1);
        let (refund_sk, refund_pk) = keypair(2);
        let hash160 = [0u8; 20];
        let redeem_script = script::build_forward_script(&hash160, &claim_pk, 700_000, &refund_pk);
        let _ = claim_sk;

        let swap = sample_swap(false, refund_sk, redeem_script.clone(), None);
        let utxo = sample_utxo(&redeem_script.to_p2wsh());

        let tx = build_and_sign(&swap, &utxo, claim_fee(2)).expect("builds");
        assert_eq!(tx.lock_time, LockTime::from_height(700_000).unwrap());
        assert_eq!(tx.input[0].witness.iter().nth(1).unwrap(), &[0u8]);
        assert_eq!(tx.output[0].script_pubkey, swap.receive_address.clone().assume_checked().script_pubkey());
    }

    #[test]
    fn claim_tx_uses_zero_locktime_and_real_preimage() {
        let (claim_sk, claim_pk) = keypair(3);
        let (_refund_sk, refund_pk) = keypair(4);
        let hash160 = [0u8; 20];
        let redeem_script = script::build_reverse_script(&hash160, &claim_pk, 700_000, &refund_pk);
        let preimage = [5u8; 32];

        let swap = sample_swap(true, claim_sk, redeem_script.clone(), Some(preimage));
        let utxo = sample_utxo(&redeem_script.to_p2wsh());

        let tx = build_and_sign(&swap, &utxo, claim_fee(2)).expect("builds");
        assert_eq!(tx.lock_time, LockTime::from_height(0).unwrap());
        assert_eq!(tx.input[0].witness.iter().nth(1).unwrap(), &preimage);
    }

    #[test]
    fn below_dust_is_rejected() {
        let (claim_sk, claim_pk) = keypair(6);
        let (refund_sk, refund_pk) = keypair(7);
        let hash160 = [0u8; 20];
        let redeem_script = script::build_forward_script(&hash160, &claim_pk, 700_000, &refund_pk);
        let _ = claim_sk;

        let mut swap = sample_swap(false, refund_sk, redeem_script.clone(), None);
        swap.onchain_amount = 400;
        let mut utxo = sample_utxo(&redeem_script.to_p2wsh());
        utxo.value = Amount::from_sat(400);

        let err = build_and_sign(&swap, &utxo, claim_fee(2)).unwrap_err();
        assert!(matches!(err, Error::BelowDust));
    }
}
