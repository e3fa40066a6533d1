use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::tx::script::{commitment_redeemscript, p2wpkh_script};
use crate::util::status::{internal_invariant, invalid_argument, Status};
use crate::util::MAX_STATE_INDEX;

/// Required high byte of a commitment input sequence
pub const SEQUENCE_HIGH: u32 = 0xff00_0000;
/// Required high byte of a commitment locktime (years 1987-1988)
pub const LOCKTIME_HIGH: u32 = 0x2100_0000;

/// Flat commitment / close fee, deducted from each output leg.
///
/// Fixed for now; needs to become a negotiated per-channel parameter.
pub const COMMIT_FEE_SAT: i64 = 5_000;

/// Default CSV delay on the encumbered commitment output.
///
/// Short, for testing.
pub const DEFAULT_TIMEOUT_BLOCKS: u16 = 5;

/// Encode a state index into the sequence and locktime of a single-input
/// transaction, masked with the 48-bit offset `x`.
///
/// The high 24 bits of `idx ^ x` land in the sequence, the low 24 bits in
/// the locktime, under the fixed high bytes.
pub fn set_state_idx_bits(tx: &mut Transaction, idx: u64, x: u64) -> Result<(), Status> {
    if tx.input.len() != 1 {
        return Err(invalid_argument(format!("tx has {} inputs", tx.input.len())));
    }
    if idx >= MAX_STATE_INDEX {
        return Err(internal_invariant(format!("state index {} out of range", idx)));
    }
    if x >= MAX_STATE_INDEX {
        return Err(invalid_argument(format!("state index mask {:x} out of range", x)));
    }
    let masked = idx ^ x;
    let seq_bits = (masked >> 24) as u32;
    let time_bits = (masked & 0x00ff_ffff) as u32;

    tx.input[0].sequence = Sequence(seq_bits | SEQUENCE_HIGH);
    tx.lock_time = LockTime::from_consensus(time_bits | LOCKTIME_HIGH);
    Ok(())
}

/// Recover the state index hidden in a commitment transaction.
///
/// Total: returns 0 whenever there is no retrievable index - not exactly
/// one input, wrong high bytes, or an out-of-range mask - which callers
/// read as "unrecognised or cooperative".
pub fn get_state_idx_from_tx(tx: &Transaction, x: u64) -> u64 {
    if tx.input.len() != 1 {
        return 0;
    }
    if x >= MAX_STATE_INDEX {
        return 0;
    }
    let sequence = tx.input[0].sequence.0;
    let locktime = tx.lock_time.to_consensus_u32();
    if sequence >> 24 != 0xff || locktime >> 24 != 0x21 {
        return 0;
    }
    let seq_bits = (sequence & 0x00ff_ffff) as u64;
    let time_bits = (locktime & 0x00ff_ffff) as u64;

    (seq_bits << 24 | time_bits) ^ x
}

/// Sort outputs into canonical order: ascending by value, then by script
/// bytes.
pub fn sort_outputs(outputs: &mut Vec<TxOut>) {
    outputs.sort_unstable_by(|a, b| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
    });
}

fn unsigned_funding_input(funding_outpoint: OutPoint) -> TxIn {
    TxIn {
        previous_output: funding_outpoint,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::default(),
    }
}

fn leg_value(amount: i64, what: &str) -> Result<u64, Status> {
    let value = amount - COMMIT_FEE_SAT;
    if value < 0 {
        return Err(invalid_argument(format!("{} {} does not cover the fee", what, amount)));
    }
    Ok(value as u64)
}

/// Assemble a commitment transaction for one side of the channel.
///
/// The encumbered leg pays `encumbered_amt - fee` into the revocable,
/// delayed script; the plain leg pays `refund_amt - fee` to the refund key.
/// The state index is encoded masked into the sequence/locktime fields and
/// the outputs are then canonically sorted.
pub fn build_commitment_tx(
    funding_outpoint: OutPoint,
    rev_pub: &PublicKey,
    timeout_pub: &PublicKey,
    delay: u16,
    encumbered_amt: i64,
    refund_pub: &PublicKey,
    refund_amt: i64,
    state_idx: u64,
    x: u64,
) -> Result<Transaction, Status> {
    let redeem = commitment_redeemscript(rev_pub, timeout_pub, delay);
    let encumbered_out = TxOut {
        value: leg_value(encumbered_amt, "encumbered amount")?,
        script_pubkey: redeem.to_v0_p2wsh(),
    };
    let refund_out = TxOut {
        value: leg_value(refund_amt, "refund amount")?,
        script_pubkey: p2wpkh_script(refund_pub),
    };

    let mut tx = Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![unsigned_funding_input(funding_outpoint)],
        output: vec![encumbered_out, refund_out],
    };
    set_state_idx_bits(&mut tx, state_idx, x)?;
    sort_outputs(&mut tx.output);
    Ok(tx)
}

/// Assemble a cooperative close transaction: both refund keys paid directly,
/// a flat fee off each side, outputs canonically sorted.
///
/// Symmetric, so both parties assemble identical bytes.
pub fn build_close_tx(
    funding_outpoint: OutPoint,
    my_refund_pub: &PublicKey,
    my_amt: i64,
    their_refund_pub: &PublicKey,
    their_amt: i64,
) -> Result<Transaction, Status> {
    let my_out =
        TxOut { value: leg_value(my_amt, "close amount")?, script_pubkey: p2wpkh_script(my_refund_pub) };
    let their_out = TxOut {
        value: leg_value(their_amt, "close amount")?,
        script_pubkey: p2wpkh_script(their_refund_pub),
    };
    let mut tx = Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![unsigned_funding_input(funding_outpoint)],
        output: vec![my_out, their_out],
    };
    sort_outputs(&mut tx.output);
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::{make_test_outpoint, make_test_pubkey};

    fn make_idx_tx() -> Transaction {
        Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: vec![unsigned_funding_input(make_test_outpoint(1))],
            output: vec![],
        }
    }

    #[test]
    fn state_idx_roundtrip_test() {
        let mut tx = make_idx_tx();
        for &(idx, x) in &[
            (0u64, 0u64),
            (1, 0),
            (1, 0xbeef_dead_beefu64 & ((1 << 48) - 1)),
            (12345, 98765),
            ((1 << 48) - 1, (1 << 48) - 1),
        ] {
            set_state_idx_bits(&mut tx, idx, x).unwrap();
            assert_eq!(tx.input[0].sequence.0 >> 24, 0xff);
            assert_eq!(tx.lock_time.to_consensus_u32() >> 24, 0x21);
            assert_eq!(get_state_idx_from_tx(&tx, x), idx);
        }
    }

    #[test]
    fn state_idx_rejects_test() {
        let mut tx = make_idx_tx();
        assert!(set_state_idx_bits(&mut tx, 1 << 48, 0).is_err());

        set_state_idx_bits(&mut tx, 77, 0).unwrap();
        // out-of-range mask reads as no index
        assert_eq!(get_state_idx_from_tx(&tx, 1 << 48), 0);

        // a second input disqualifies the tx
        tx.input.push(unsigned_funding_input(make_test_outpoint(2)));
        assert_eq!(get_state_idx_from_tx(&tx, 0), 0);
        assert!(set_state_idx_bits(&mut tx, 1, 0).is_err());
        tx.input.truncate(1);

        // wrong high bytes read as no index
        tx.input[0].sequence = Sequence(0xfe00_0000 | 77);
        assert_eq!(get_state_idx_from_tx(&tx, 0), 0);
        tx.input[0].sequence = Sequence(SEQUENCE_HIGH | 77);
        tx.lock_time = LockTime::from_consensus(0x2000_0000);
        assert_eq!(get_state_idx_from_tx(&tx, 0), 0);
    }

    #[test]
    fn sort_outputs_test() {
        let out1 = TxOut { value: 100, script_pubkey: p2wpkh_script(&make_test_pubkey(9)) };
        let out2 = TxOut { value: 50, script_pubkey: p2wpkh_script(&make_test_pubkey(8)) };
        let mut outputs = vec![out1.clone(), out2.clone()];
        sort_outputs(&mut outputs);
        assert_eq!(outputs[0], out2);
        assert_eq!(outputs[1], out1);

        // equal values fall back to script order
        let mut outputs = vec![
            TxOut { value: 50, script_pubkey: ScriptBuf::from(vec![0x00, 0x02]) },
            TxOut { value: 50, script_pubkey: ScriptBuf::from(vec![0x00, 0x01]) },
        ];
        sort_outputs(&mut outputs);
        assert!(outputs[0].script_pubkey.as_bytes() < outputs[1].script_pubkey.as_bytes());
    }

    #[test]
    fn build_commitment_tx_test() {
        let tx = build_commitment_tx(
            make_test_outpoint(3),
            &make_test_pubkey(1),
            &make_test_pubkey(2),
            DEFAULT_TIMEOUT_BLOCKS,
            750_000,
            &make_test_pubkey(3),
            1_250_000,
            7,
            0x1234,
        )
        .unwrap();
        assert_eq!(tx.version, 2);
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[0].value + tx.output[1].value, 2_000_000 - 2 * COMMIT_FEE_SAT as u64);
        assert_eq!(get_state_idx_from_tx(&tx, 0x1234), 7);
        // sub-fee legs are refused
        assert!(build_commitment_tx(
            make_test_outpoint(3),
            &make_test_pubkey(1),
            &make_test_pubkey(2),
            DEFAULT_TIMEOUT_BLOCKS,
            COMMIT_FEE_SAT - 1,
            &make_test_pubkey(3),
            1_250_000,
            7,
            0,
        )
        .is_err());
    }

    #[test]
    fn build_close_tx_symmetry_test() {
        let alice_refund = make_test_pubkey(21);
        let bob_refund = make_test_pubkey(22);
        let mine = build_close_tx(make_test_outpoint(4), &alice_refund, 600_000, &bob_refund, 400_000)
            .unwrap();
        let theirs = build_close_tx(make_test_outpoint(4), &bob_refund, 400_000, &alice_refund, 600_000)
            .unwrap();
        assert_eq!(mine, theirs);
        assert_eq!(mine.output.len(), 2);
    }
}
