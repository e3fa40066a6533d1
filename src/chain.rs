use bitcoin::{Transaction, Txid};

use crate::util::status::Status;

/// On-chain node access.
///
/// The core fetches previously confirmed transactions (for close
/// classification and remedy construction) and submits newly signed ones;
/// mempool policy, fee estimation and confirmation tracking are the host's
/// business.
pub trait ChainClient: Send + Sync {
    /// Fetch a previously seen transaction by id
    fn get_tx(&self, txid: &Txid) -> Result<Transaction, Status>;

    /// Submit a newly signed transaction
    fn broadcast(&self, tx: &Transaction) -> Result<(), Status>;
}
