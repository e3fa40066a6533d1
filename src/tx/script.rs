use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::Builder;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Script, ScriptBuf, TxOut, Witness};

use crate::util::crypto_utils::hash160;
use crate::util::status::{invalid_argument, Status};

/// The 2-of-2 funding redeemscript, keys sorted ascending by serialized
/// bytes.
///
/// Returns the script and whether sorting reversed the argument order; the
/// caller needs the flag to put witness signatures in key order.
pub fn funding_redeemscript(a_pub: &PublicKey, b_pub: &PublicKey) -> (ScriptBuf, bool) {
    let a_ser = a_pub.serialize();
    let b_ser = b_pub.serialize();
    let swapped = a_ser[..] > b_ser[..];
    let (first, second) = if swapped { (b_ser, a_ser) } else { (a_ser, b_ser) };
    let script = Builder::new()
        .push_opcode(opcodes::all::OP_PUSHNUM_2)
        .push_slice(&first)
        .push_slice(&second)
        .push_opcode(opcodes::all::OP_PUSHNUM_2)
        .push_opcode(opcodes::all::OP_CHECKMULTISIG)
        .into_script();
    (script, swapped)
}

/// The funding output: P2WSH of the 2-of-2 over both channel pubkeys
pub fn funding_tx_out(a_pub: &PublicKey, b_pub: &PublicKey, value: i64) -> Result<TxOut, Status> {
    if value < 0 {
        return Err(invalid_argument("negative funding value"));
    }
    let (redeem, _) = funding_redeemscript(a_pub, b_pub);
    Ok(TxOut { value: value as u64, script_pubkey: redeem.to_v0_p2wsh() })
}

/// The commitment output redeemscript.
///
/// Spendable immediately with a signature for `rev_pub`, or after `delay`
/// blocks with a signature for `timeout_pub`.
pub fn commitment_redeemscript(rev_pub: &PublicKey, timeout_pub: &PublicKey, delay: u16) -> ScriptBuf {
    Builder::new()
        .push_opcode(opcodes::all::OP_DUP)
        .push_slice(&rev_pub.serialize())
        .push_opcode(opcodes::all::OP_CHECKSIG)
        .push_opcode(opcodes::all::OP_NOTIF)
        .push_slice(&timeout_pub.serialize())
        .push_opcode(opcodes::all::OP_CHECKSIGVERIFY)
        .push_int(delay as i64)
        .push_opcode(opcodes::all::OP_CSV)
        .push_opcode(opcodes::all::OP_ENDIF)
        .into_script()
}

/// The P2WPKH output script for a key
pub fn p2wpkh_script(key: &PublicKey) -> ScriptBuf {
    Builder::new()
        .push_opcode(opcodes::all::OP_PUSHBYTES_0)
        .push_slice(&hash160(&key.serialize()))
        .into_script()
}

/// Whether a script is the 22-byte P2WPKH of the key
pub fn is_p2wpkh_for(script: &Script, key: &PublicKey) -> bool {
    let bytes = script.as_bytes();
    bytes.len() == 22 && bytes[2..22] == hash160(&key.serialize())
}

/// Build the witness stack spending a 2-of-2 funding output.
///
/// Signatures must already be in key order and carry their sighash byte.
/// The leading empty element soaks up the extra pop of OP_CHECKMULTISIG.
pub fn funding_spend_witness(redeem: &Script, sig_first: &[u8], sig_second: &[u8]) -> Witness {
    Witness::from_slice(&[&[][..], sig_first, sig_second, redeem.as_bytes()])
}
