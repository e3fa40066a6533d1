use bitcoin::secp256k1::SecretKey;
use bitcoin::{OutPoint, TxOut};

use crate::util::status::Status;

/// A layer-1 wallet, the source of per-channel private keys and change
/// outputs.
///
/// Keys are located by `(peer_idx, key_idx)`, the same pair that locates
/// the channel record itself.
pub trait Wallet: Send + Sync {
    /// The channel-specific funding key
    fn get_chan_privkey(&self, peer_idx: u32, key_idx: u32) -> SecretKey;

    /// The channel-specific refund key.
    ///
    /// Also the base key for revocation derivation, so a revealed elkrem
    /// scalar added to it yields the revocation private key.
    fn get_refund_privkey(&self, peer_idx: u32, key_idx: u32) -> SecretKey;

    /// Allocate a fresh change output for the given value
    fn new_change_out(&self, value: i64) -> Result<TxOut, Status>;
}

/// A spendable output resulting from a channel close.
///
/// `spend_lag` encodes how the output may be spent: 1 for immediately
/// spendable, a positive count for CSV-delayed by that many blocks, and -1
/// for a revoked counterparty output that can be grabbed with the
/// reconstructed revocation key.  The shape is shared with the rest of the
/// wallet's UTxO tracking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    /// The outpoint
    pub op: OutPoint,
    /// Value in satoshi
    pub value: i64,
    /// Height of the creating transaction, if confirmed
    pub at_height: i32,
    /// Peer locator of the originating channel
    pub peer_idx: u32,
    /// Key locator of the originating channel
    pub key_idx: u32,
    /// Spendability class, see type docs
    pub spend_lag: i32,
}
