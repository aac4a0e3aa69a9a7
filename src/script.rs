//! Construction, matching and parsing of the two submarine-swap witness
//! script templates, and P2WSH address derivation.

use bitcoin::hashes::{Hash, ripemd160};
use bitcoin::opcodes::all::{
    OP_CHECKLOCKTIMEVERIFY, OP_CHECKSIG, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUAL, OP_EQUALVERIFY,
    OP_HASH160, OP_IF, OP_SIZE,
};
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Address, Network, ScriptBuf, WScriptHash};

use crate::error::{Error, Result};

/// Length of the RIPEMD160 digest embedded in both templates.
pub const HASH_LEN: usize = 20;
/// Preimage length enforced by the reverse-swap template's `OP_SIZE` check.
pub const PREIMAGE_LEN: i64 = 32;

fn push_pubkey(builder: Builder, pubkey: &PublicKey) -> Builder {
    let bytes = pubkey.serialize();
    let push = PushBytesBuf::try_from(bytes.to_vec()).expect("33 bytes fits a push");
    builder.push_slice(push)
}

fn push_hash160(builder: Builder, hash: &[u8; HASH_LEN]) -> Builder {
    let push = PushBytesBuf::try_from(hash.to_vec()).expect("20 bytes fits a push");
    builder.push_slice(push)
}

/// `HASH160 <hash> EQUAL IF <claim_pubkey> ELSE <locktime> CHECKLOCKTIMEVERIFY
/// DROP <refund_pubkey> ENDIF CHECKSIG`
pub fn build_forward_script(
    hash160: &[u8; HASH_LEN],
    claim_pubkey: &PublicKey,
    locktime: u32,
    refund_pubkey: &PublicKey,
) -> ScriptBuf {
    let mut builder = Builder::new().push_opcode(OP_HASH160);
    builder = push_hash160(builder, hash160);
    builder = builder
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF);
    builder = push_pubkey(builder, claim_pubkey);
    builder = builder
        .push_opcode(OP_ELSE)
        .push_int(locktime as i64)
        .push_opcode(OP_CHECKLOCKTIMEVERIFY)
        .push_opcode(OP_DROP);
    builder = push_pubkey(builder, refund_pubkey);
    builder
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// `SIZE <32> EQUAL IF HASH160 <hash> EQUALVERIFY <claim_pubkey> ELSE DROP
/// <locktime> CHECKLOCKTIMEVERIFY DROP <refund_pubkey> ENDIF CHECKSIG`
pub fn build_reverse_script(
    hash160: &[u8; HASH_LEN],
    claim_pubkey: &PublicKey,
    locktime: u32,
    refund_pubkey: &PublicKey,
) -> ScriptBuf {
    let mut builder = Builder::new()
        .push_opcode(OP_SIZE)
        .push_int(PREIMAGE_LEN)
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_opcode(OP_HASH160);
    builder = push_hash160(builder, hash160);
    builder = builder.push_opcode(OP_EQUALVERIFY);
    builder = push_pubkey(builder, claim_pubkey);
    builder = builder
        .push_opcode(OP_ELSE)
        .push_opcode(OP_DROP)
        .push_int(locktime as i64)
        .push_opcode(OP_CHECKLOCKTIMEVERIFY)
        .push_opcode(OP_DROP);
    builder = push_pubkey(builder, refund_pubkey);
    builder
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

pub fn build(is_reverse: bool, hash160: &[u8; HASH_LEN], claim_pubkey: &PublicKey, locktime: u32, refund_pubkey: &PublicKey) -> ScriptBuf {
    if is_reverse {
        build_reverse_script(hash160, claim_pubkey, locktime, refund_pubkey)
    } else {
        build_forward_script(hash160, claim_pubkey, locktime, refund_pubkey)
    }
}

/// The four values embedded in a matched witness script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSwapScript {
    pub is_reverse: bool,
    pub hash160: [u8; HASH_LEN],
    pub claim_pubkey: PublicKey,
    pub locktime: u32,
    pub refund_pubkey: PublicKey,
}

fn collect_instructions(script: &bitcoin::Script) -> Result<Vec<Instruction<'_>>> {
    script
        .instructions()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::ProtocolMismatch(format!("malformed script: {e}")))
}

fn expect_op(instr: Option<&Instruction>, op: bitcoin::opcodes::Opcode, what: &str) -> Result<()> {
    match instr {
        Some(Instruction::Op(o)) if *o == op => Ok(()),
        other => Err(Error::ProtocolMismatch(format!(
            "expected {what}, got {other:?}"
        ))),
    }
}

fn expect_push_len(instr: Option<&Instruction>, len: usize, what: &str) -> Result<Vec<u8>> {
    match instr {
        Some(Instruction::PushBytes(p)) if p.as_bytes().len() == len => Ok(p.as_bytes().to_vec()),
        other => Err(Error::ProtocolMismatch(format!(
            "expected {what} ({len} bytes), got {other:?}"
        ))),
    }
}

fn expect_pubkey(instr: Option<&Instruction>, what: &str) -> Result<PublicKey> {
    let bytes = expect_push_len(instr, 33, what)?;
    PublicKey::from_slice(&bytes)
        .map_err(|e| Error::ProtocolMismatch(format!("{what}: invalid pubkey: {e}")))
}

fn expect_scriptnum(instr: Option<&Instruction>, what: &str) -> Result<i64> {
    match instr {
        Some(Instruction::Op(op)) => {
            // OP_0..OP_16 encode small locktimes as opcodes rather than pushes.
            let v = op.to_u8();
            if v == 0x00 {
                Ok(0)
            } else if (0x51..=0x60).contains(&v) {
                Ok((v - 0x50) as i64)
            } else {
                Err(Error::ProtocolMismatch(format!("expected {what}, got opcode {op:?}")))
            }
        }
        Some(Instruction::PushBytes(p)) => {
            bitcoin::script::read_scriptint(p.as_bytes())
                .map_err(|e| Error::ProtocolMismatch(format!("{what}: bad scriptnum: {e}")))
        }
        None => Err(Error::ProtocolMismatch(format!("expected {what}, got end of script"))),
    }
}

/// Attempt to match `script` against the forward-swap template and, failing
/// that, the reverse-swap template. Returns the embedded values on success.
pub fn parse(script: &bitcoin::Script) -> Result<ParsedSwapScript> {
    if let Ok(parsed) = parse_forward(script) {
        return Ok(parsed);
    }
    parse_reverse(script)
}

fn parse_forward(script: &bitcoin::Script) -> Result<ParsedSwapScript> {
    let ins = collect_instructions(script)?;
    if ins.len() != 12 {
        return Err(Error::ProtocolMismatch(format!(
            "forward template: expected 12 instructions, got {}",
            ins.len()
        )));
    }
    expect_op(ins.first(), OP_HASH160, "OP_HASH160")?;
    let hash_bytes = expect_push_len(ins.get(1), HASH_LEN, "payment hash160")?;
    expect_op(ins.get(2), OP_EQUAL, "OP_EQUAL")?;
    expect_op(ins.get(3), OP_IF, "OP_IF")?;
    let claim_pubkey = expect_pubkey(ins.get(4), "claim pubkey")?;
    expect_op(ins.get(5), OP_ELSE, "OP_ELSE")?;
    let locktime = expect_scriptnum(ins.get(6), "locktime")?;
    expect_op(ins.get(7), OP_CHECKLOCKTIMEVERIFY, "OP_CHECKLOCKTIMEVERIFY")?;
    expect_op(ins.get(8), OP_DROP, "OP_DROP")?;
    let refund_pubkey = expect_pubkey(ins.get(9), "refund pubkey")?;
    expect_op(ins.get(10), OP_ENDIF, "OP_ENDIF")?;
    expect_op(ins.get(11), OP_CHECKSIG, "OP_CHECKSIG")?;

    let mut hash160 = [0u8; HASH_LEN];
    hash160.copy_from_slice(&hash_bytes);

    Ok(ParsedSwapScript {
        is_reverse: false,
        hash160,
        claim_pubkey,
        locktime: locktime as u32,
        refund_pubkey,
    })
}

fn parse_reverse(script: &bitcoin::Script) -> Result<ParsedSwapScript> {
    let ins = collect_instructions(script)?;
    if ins.len() != 16 {
        return Err(Error::ProtocolMismatch(format!(
            "reverse template: expected 16 instructions, got {}",
            ins.len()
        )));
    }
    expect_op(ins.first(), OP_SIZE, "OP_SIZE")?;
    let size = expect_scriptnum(ins.get(1), "preimage size")?;
    if size != PREIMAGE_LEN {
        return Err(Error::ProtocolMismatch(format!(
            "expected preimage size {PREIMAGE_LEN}, got {size}"
        )));
    }
    expect_op(ins.get(2), OP_EQUAL, "OP_EQUAL")?;
    expect_op(ins.get(3), OP_IF, "OP_IF")?;
    expect_op(ins.get(4), OP_HASH160, "OP_HASH160")?;
    let hash_bytes = expect_push_len(ins.get(5), HASH_LEN, "payment hash160")?;
    expect_op(ins.get(6), OP_EQUALVERIFY, "OP_EQUALVERIFY")?;
    let claim_pubkey = expect_pubkey(ins.get(7), "claim pubkey")?;
    expect_op(ins.get(8), OP_ELSE, "OP_ELSE")?;
    expect_op(ins.get(9), OP_DROP, "OP_DROP")?;
    let locktime = expect_scriptnum(ins.get(10), "locktime")?;
    expect_op(ins.get(11), OP_CHECKLOCKTIMEVERIFY, "OP_CHECKLOCKTIMEVERIFY")?;
    expect_op(ins.get(12), OP_DROP, "OP_DROP")?;
    let refund_pubkey = expect_pubkey(ins.get(13), "refund pubkey")?;
    expect_op(ins.get(14), OP_ENDIF, "OP_ENDIF")?;
    expect_op(ins.get(15), OP_CHECKSIG, "OP_CHECKSIG")?;
    Ok(ParsedSwapScript {
        is_reverse: true,
        hash160: {
            let mut h = [0u8; HASH_LEN];
            h.copy_from_slice(&hash_bytes);
            h
        },
        claim_pubkey,
        locktime: locktime as u32,
        refund_pubkey,
    })
}

/// Validate a server-supplied script against the values this side expects.
#[allow(clippy::too_many_arguments)]
pub fn verify_response(
    script: &bitcoin::Script,
    payment_hash: &[u8; 32],
    expected_pubkey: &PublicKey,
    expected_locktime: u32,
    is_reverse: bool,
) -> Result<()> {
    let parsed = parse(script)?;
    if parsed.is_reverse != is_reverse {
        return Err(Error::ProtocolMismatch(
            "script template does not match swap direction".into(),
        ));
    }
    let expected_hash160 = ripemd160::Hash::hash(payment_hash);
    if parsed.hash160 != expected_hash160.to_byte_array() {
        return Err(Error::ProtocolMismatch("embedded hash mismatch".into()));
    }
    let our_pubkey = if is_reverse {
        parsed.claim_pubkey
    } else {
        parsed.refund_pubkey
    };
    if &our_pubkey != expected_pubkey {
        return Err(Error::ProtocolMismatch("our pubkey not embedded in script".into()));
    }
    if parsed.locktime != expected_locktime {
        return Err(Error::ProtocolMismatch(format!(
            "locktime mismatch: expected {}, got {}",
            expected_locktime, parsed.locktime
        )));
    }
    Ok(())
}

/// Derive the P2WSH lockup address for a witness script.
pub fn p2wsh_address(script: &bitcoin::Script, network: Network) -> Address {
    let hash: WScriptHash = script.wscript_hash();
    Address::p2wsh_from_hash(hash, network)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::sha256;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn keypair(byte: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        (sk, pk)
    }

    #[test]
    fn forward_round_trip() {
        let (_sk1, claim_pk) = keypair(1);
        let (_sk2, refund_pk) = keypair(2);
        let preimage = [7u8; 32];
        let payment_hash = sha256::Hash::hash(&preimage).to_byte_array();
        let hash160 = ripemd160::Hash::hash(&payment_hash).to_byte_array();

        let script = build_forward_script(&hash160, &claim_pk, 800_000, &refund_pk);
        let parsed = parse(&script).expect("parses");
        assert!(!parsed.is_reverse);
        assert_eq!(parsed.hash160, hash160);
        assert_eq!(parsed.claim_pubkey, claim_pk);
        assert_eq!(parsed.refund_pubkey, refund_pk);
        assert_eq!(parsed.locktime, 800_000);

        verify_response(&script, &payment_hash, &refund_pk, 800_000, false).unwrap();
    }

    #[test]
    fn reverse_round_trip() {
        let (_sk1, claim_pk) = keypair(3);
        let (_sk2, refund_pk) = keypair(4);
        let preimage = [9u8; 32];
        let payment_hash = sha256::Hash::hash(&preimage).to_byte_array();
        let hash160 = ripemd160::Hash::hash(&payment_hash).to_byte_array();

        let script = build_reverse_script(&hash160, &claim_pk, 500, &refund_pk);
        let parsed = parse(&script).expect("parses");
        assert!(parsed.is_reverse);
        assert_eq!(parsed.hash160, hash160);

        verify_response(&script, &payment_hash, &claim_pk, 500, true).unwrap();
    }

    #[test]
    fn verify_response_rejects_wrong_pubkey() {
        let (_sk1, claim_pk) = keypair(5);
        let (_sk2, refund_pk) = keypair(6);
        let (_sk3, wrong_pk) = keypair(7);
        let preimage = [1u8; 32];
        let payment_hash = sha256::Hash::hash(&preimage).to_byte_array();
        let hash160 = ripemd160::Hash::hash(&payment_hash).to_byte_array();

        let script = build_forward_script(&hash160, &claim_pk, 100, &refund_pk);
        let err = verify_response(&script, &payment_hash, &wrong_pk, 100, false).unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch(_)));
    }

    #[test]
    fn p2wsh_address_matches_script_hash() {
        let (_sk1, claim_pk) = keypair(8);
        let (_sk2, refund_pk) = keypair(9);
        let hash160 = [0u8; HASH_LEN];
        let script = build_forward_script(&hash160, &claim_pk, 10, &refund_pk);
        let addr = p2wsh_address(&script, Network::Regtest);
        assert!(addr.script_pubkey().is_p2wsh());
    }
}
