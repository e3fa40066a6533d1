use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{OutPoint, ScriptBuf, Sequence, Transaction, TxIn, Witness};
use log::{debug, info};

use crate::chain::ChainClient;
use crate::channel::{no_such_channel, CloseData, Qchan, RoundStage};
use crate::elkrem::ElkremSender;
use crate::persist::model::ChannelEntry;
use crate::persist::Persist;
use crate::prelude::*;
use crate::tx::script::{commitment_redeemscript, funding_redeemscript, funding_spend_witness};
use crate::tx::tx::{get_state_idx_from_tx, COMMIT_FEE_SAT};
use crate::util::crypto_utils::{
    add_privkey_tweak, hkdf_sha256, signature_to_bitcoin_vec,
};
use crate::util::status::{
    elk_unknown, internal_invariant, invalid_argument, malformed_close, not_my_channel,
    script_mismatch, state_order_violation, Status,
};
use crate::wallet::{Utxo, Wallet};

/// A channel host: one wallet's collection of bilateral channels.
///
/// Holds the external collaborators - wallet keys, chain access,
/// persistence - and serializes all operations on a channel behind its
/// per-channel lock.  Different channels are independent.
pub struct Node {
    pub(crate) secp_ctx: Secp256k1<All>,
    wallet: Arc<dyn Wallet>,
    chain: Arc<dyn ChainClient>,
    persister: Arc<dyn Persist>,
    channels: Mutex<Map<(u32, u32), Arc<Mutex<Qchan>>>>,
}

impl Node {
    /// Create a node around its external collaborators
    pub fn new(wallet: Arc<dyn Wallet>, chain: Arc<dyn ChainClient>, persister: Arc<dyn Persist>) -> Node {
        Node {
            secp_ctx: Secp256k1::new(),
            wallet,
            chain,
            persister,
            channels: Mutex::new(Map::new()),
        }
    }

    /// The chain client
    pub fn chain(&self) -> Arc<dyn ChainClient> {
        Arc::clone(&self.chain)
    }

    /// The elkrem root for a channel, derived from its channel secret.
    ///
    /// Deterministic, so a restored channel regenerates the same reveal
    /// sequence.
    pub fn derive_elkrem_root(&self, peer_idx: u32, key_idx: u32) -> [u8; 32] {
        let secret = self.wallet.get_chan_privkey(peer_idx, key_idx);
        hkdf_sha256(&secret.secret_bytes(), "elkrem root".as_bytes(), &[])
    }

    /// Track a newly funded channel
    pub fn add_channel(&self, chan: Qchan) -> Result<(), Status> {
        let key = (chan.setup.peer_idx, chan.setup.key_idx);
        self.persister
            .new_channel(&chan)
            .map_err(|()| invalid_argument(format!("channel {:?} already persisted", key)))?;
        let mut channels = self.channels.lock().unwrap();
        if channels.contains_key(&key) {
            return Err(invalid_argument(format!("channel {:?} already tracked", key)));
        }
        info!("tracking channel ({},{})", key.0, key.1);
        channels.insert(key, Arc::new(Mutex::new(chan)));
        Ok(())
    }

    /// Reconstitute a persisted channel, re-deriving its elkrem sender
    pub fn restore_channel(&self, entry: ChannelEntry) -> Result<(), Status> {
        let root = self.derive_elkrem_root(entry.setup.peer_idx, entry.setup.key_idx);
        let chan = Qchan::restore(entry, ElkremSender::new(root));
        let key = (chan.setup.peer_idx, chan.setup.key_idx);
        info!("restored channel ({},{}) at state {}", key.0, key.1, chan.state.state_idx);
        self.channels.lock().unwrap().insert(key, Arc::new(Mutex::new(chan)));
        Ok(())
    }

    /// Get the slot for a channel
    pub fn get_channel(&self, peer_idx: u32, key_idx: u32) -> Result<Arc<Mutex<Qchan>>, Status> {
        let channels = self.channels.lock().unwrap();
        channels
            .get(&(peer_idx, key_idx))
            .map(Arc::clone)
            .ok_or_else(|| no_such_channel(peer_idx, key_idx))
    }

    /// Run a closure against a channel under its lock
    pub fn with_channel<T, F: FnOnce(&mut Qchan) -> Result<T, Status>>(
        &self,
        peer_idx: u32,
        key_idx: u32,
        f: F,
    ) -> Result<T, Status> {
        let slot = self.get_channel(peer_idx, key_idx)?;
        let mut chan = slot.lock().unwrap();
        f(&mut chan)
    }

    fn persist(&self, chan: &Qchan) -> Result<(), Status> {
        self.persister.update_channel(chan).map_err(|()| internal_invariant("persist failed"))
    }

    fn funding_sighash(&self, chan: &Qchan, tx: &Transaction) -> Result<Message, Status> {
        let (redeem, _) = funding_redeemscript(&chan.setup.my_chan_pub, &chan.setup.their_chan_pub);
        let sighash = SighashCache::new(tx)
            .segwit_signature_hash(0, &redeem, chan.setup.funding_value as u64, EcdsaSighashType::All)
            .map_err(|err| internal_invariant(format!("sighash failed: {}", err)))?;
        Message::from_slice(&sighash[..])
            .map_err(|err| internal_invariant(format!("sighash message failed: {}", err)))
    }

    /// Sign the counterparty's commitment for the current state.
    ///
    /// Returns the DER signature with the trailing sighash byte stripped,
    /// ready for the wire.
    pub fn sign_state(&self, peer_idx: u32, key_idx: u32) -> Result<Vec<u8>, Status> {
        self.with_channel(peer_idx, key_idx, |chan| {
            if chan.close_data.is_some() {
                return Err(state_order_violation("channel is closed"));
            }
            if chan.state.stage != RoundStage::Fresh {
                return Err(state_order_violation("this round was already signed"));
            }
            let tx = chan.build_state_tx(None)?;
            let msg = self.funding_sighash(chan, &tx)?;
            let privkey = self.wallet.get_chan_privkey(peer_idx, key_idx);
            let sig = self.secp_ctx.sign_ecdsa(&msg, &privkey);
            debug!(
                "sign_state: channel ({},{}) state {} myamt {} theiramt {}",
                peer_idx,
                key_idx,
                chan.state.state_idx,
                chan.state.my_amt,
                chan.their_amt()
            );
            chan.state.stage = RoundStage::AwaitingAck;
            self.persist(chan)?;
            Ok(sig.serialize_der().to_vec())
        })
    }

    /// Verify and store the counterparty's signature on my commitment
    pub fn verify_sig(&self, peer_idx: u32, key_idx: u32, sig_wire: &[u8]) -> Result<(), Status> {
        self.with_channel(peer_idx, key_idx, |chan| {
            chan.verify_sig(sig_wire)?;
            self.persist(chan)
        })
    }

    /// Ingest the counterparty's revocation of the previous state
    pub fn ingest_elkrem(&self, peer_idx: u32, key_idx: u32, elk: [u8; 32]) -> Result<(), Status> {
        self.with_channel(peer_idx, key_idx, |chan| {
            chan.ingest_elkrem(elk)?;
            self.persist(chan)
        })
    }

    /// Fold the in-flight delta and advance to the next state
    pub fn advance_state(
        &self,
        peer_idx: u32,
        key_idx: u32,
        next_my_hakd_pub: PublicKey,
    ) -> Result<(), Status> {
        self.with_channel(peer_idx, key_idx, |chan| {
            chan.advance_state(next_my_hakd_pub)?;
            self.persist(chan)
        })
    }

    /// Sign the cooperative close for the current state.
    ///
    /// Returns the DER signature, sighash byte stripped.
    pub fn sign_simple_close(&self, peer_idx: u32, key_idx: u32) -> Result<Vec<u8>, Status> {
        self.with_channel(peer_idx, key_idx, |chan| {
            if chan.close_data.is_some() {
                return Err(state_order_violation("channel is closed"));
            }
            let tx = chan.simple_close_tx()?;
            let msg = self.funding_sighash(chan, &tx)?;
            let privkey = self.wallet.get_chan_privkey(peer_idx, key_idx);
            let sig = self.secp_ctx.sign_ecdsa(&msg, &privkey);
            Ok(sig.serialize_der().to_vec())
        })
    }

    /// Assemble and sign my commitment for a unilateral close.
    ///
    /// Usable whenever a countersignature is stored; the counterparty does
    /// not cooperate.  The stored signature is combined with a fresh local
    /// one in funding-key order.
    pub fn sign_break_tx(&self, peer_idx: u32, key_idx: u32) -> Result<Transaction, Status> {
        self.with_channel(peer_idx, key_idx, |chan| {
            // current revocation pubkey; be sure it is not yet revoked
            let their_hakd_pub = chan.their_hakd_pubkey()?;
            let mut tx = chan.build_state_tx(Some(&their_hakd_pub))?;

            let stored_sig = chan
                .state
                .sig
                .ok_or_else(|| state_order_violation("no counterparty signature stored"))?;

            let msg = self.funding_sighash(chan, &tx)?;
            let privkey = self.wallet.get_chan_privkey(peer_idx, key_idx);
            let my_sig = self.secp_ctx.sign_ecdsa(&msg, &privkey);

            let (redeem, swapped) =
                funding_redeemscript(&chan.setup.my_chan_pub, &chan.setup.their_chan_pub);
            let my_sig_vec = signature_to_bitcoin_vec(my_sig);
            let their_sig_vec = signature_to_bitcoin_vec(stored_sig);
            tx.input[0].witness = if swapped {
                funding_spend_witness(&redeem, &their_sig_vec, &my_sig_vec)
            } else {
                funding_spend_witness(&redeem, &my_sig_vec, &their_sig_vec)
            };
            info!(
                "break tx for channel ({},{}) at state {}: {}",
                peer_idx,
                key_idx,
                chan.state.state_idx,
                tx.txid()
            );
            Ok(tx)
        })
    }

    /// Record a confirmed spend of the funding outpoint and classify it.
    ///
    /// The channel becomes read-only; the returned outputs feed the
    /// wallet's UTxO tracking.
    pub fn handle_close_tx(
        &self,
        peer_idx: u32,
        key_idx: u32,
        tx: &Transaction,
        height: i32,
    ) -> Result<Vec<Utxo>, Status> {
        self.with_channel(peer_idx, key_idx, |chan| {
            if tx.input.len() != 1 || tx.input[0].previous_output != chan.setup.funding_outpoint {
                return Err(not_my_channel(format!(
                    "tx {} does not spend channel outpoint {}",
                    tx.txid(),
                    chan.setup.funding_outpoint
                )));
            }
            let txid = tx.txid();
            if let Some(close) = &chan.close_data {
                if close.close_txid != txid {
                    return Err(invalid_argument(format!(
                        "channel already closed by {}",
                        close.close_txid
                    )));
                }
            }
            chan.close_data = Some(CloseData { close_txid: txid, close_height: height });
            self.persist(chan)?;
            let txos = chan.get_close_txos(tx)?;
            info!(
                "channel ({},{}) closed by {} at height {}: {} spendable outputs",
                peer_idx,
                key_idx,
                txid,
                height,
                txos.len()
            );
            Ok(txos)
        })
    }

    /// Produce the remedy transaction sweeping a revoked counterparty
    /// output.
    ///
    /// Only works on outputs the classifier marked grabbable; the
    /// revocation private key is reassembled from the refund key and the
    /// stored elkrem, and must reproduce the on-chain script exactly.
    pub fn grab_utxo(&self, utxo: &Utxo) -> Result<Transaction, Status> {
        let slot = self.get_channel(utxo.peer_idx, utxo.key_idx)?;
        let chan = slot.lock().unwrap();

        let close = chan
            .close_data
            .as_ref()
            .ok_or_else(|| invalid_argument("channel is not closed"))?;
        let close_tx = self.chain.get_tx(&close.close_txid)?;
        if close_tx.output.len() != 2 {
            return Err(malformed_close(format!(
                "close tx has {} outputs, can't grab",
                close_tx.output.len()
            )));
        }
        let target = close_tx
            .output
            .get(utxo.op.vout as usize)
            .ok_or_else(|| invalid_argument(format!("no output {} in close tx", utxo.op.vout)))?;
        if target.script_pubkey.len() != 34 {
            return Err(malformed_close(format!(
                "grab target script is {} bytes, expect 34",
                target.script_pubkey.len()
            )));
        }

        let x = chan.elk_zero_offset()?;
        let hinted_idx = get_state_idx_from_tx(&close_tx, x);
        if hinted_idx == 0 {
            return Err(malformed_close("close tx carries no index hint, can't recover"));
        }
        match chan.elk_recv.upto() {
            Some(upto) if hinted_idx <= upto => {}
            other => {
                return Err(elk_unknown(format!(
                    "close at state {} but elkrem only goes to {:?}",
                    hinted_idx, other
                )))
            }
        }
        let elk = chan.elk_recv.at_index(hinted_idx)?;

        // reassemble the revocation keypair they forfeited
        let refund_privkey = self.wallet.get_refund_privkey(utxo.peer_idx, utxo.key_idx);
        let grab_privkey = add_privkey_tweak(refund_privkey, &elk)?;
        let grab_pubkey = PublicKey::from_secret_key(&self.secp_ctx, &grab_privkey);

        let timeout_pub = chan.their_timeout_pubkey(hinted_idx)?;
        let redeem = commitment_redeemscript(&grab_pubkey, &timeout_pub, chan.setup.timeout_blocks);
        if redeem.to_v0_p2wsh() != target.script_pubkey {
            return Err(script_mismatch(format!(
                "reconstructed script hashes to {}, chain has {}",
                redeem.to_v0_p2wsh(),
                target.script_pubkey
            )));
        }

        let dest = self.wallet.new_change_out(target.value as i64 - COMMIT_FEE_SAT)?;
        let mut sweep = Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid: close.close_txid, vout: utxo.op.vout },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![dest],
        };

        let sighash = SighashCache::new(&sweep)
            .segwit_signature_hash(0, &redeem, target.value, EcdsaSighashType::All)
            .map_err(|err| internal_invariant(format!("sighash failed: {}", err)))?;
        let msg = Message::from_slice(&sighash[..])
            .map_err(|err| internal_invariant(format!("sighash message failed: {}", err)))?;
        let sig = self.secp_ctx.sign_ecdsa(&msg, &grab_privkey);

        sweep.input[0].witness =
            Witness::from_slice(&[&signature_to_bitcoin_vec(sig)[..], redeem.as_bytes()]);
        info!(
            "remedy sweep of {} for channel ({},{}) from revoked state {}",
            utxo.op, utxo.peer_idx, utxo.key_idx, hinted_idx
        );
        Ok(sweep)
    }
}
