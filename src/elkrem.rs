//! A forward-revealable hash tree.
//!
//! The sender can produce up to 2^48 - 1 hashes in reveal order from a
//! single root; the receiver ingests them one at a time, keeping at most 48
//! nodes, and can re-derive any previously revealed hash on demand.
//!
//! Nodes are numbered in reveal order: the left child of node `(i, h)` is
//! `i - 2^h` and the right child is `i - 1`, so every interior node is
//! revealed immediately after its subtree.  Children are derived by
//! `left = sha256d(parent)` and `right = sha256d(parent || 0x01)`.

use serde_derive::{Deserialize, Serialize};

use crate::util::crypto_utils::double_sha256;
use crate::util::status::{elk_inconsistent, elk_unknown, Status};

/// Height of the tree (the root sits at this height)
const MAX_HEIGHT: u8 = 47;

/// Index of the root node, the last hash that would ever be revealed
const MAX_INDEX: u64 = (1 << 48) - 2;

fn left_sha(sha: &[u8; 32]) -> [u8; 32] {
    double_sha256(sha)
}

fn right_sha(sha: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 33];
    buf[0..32].copy_from_slice(sha);
    buf[32] = 0x01;
    double_sha256(&buf)
}

// Walk down from node (i, h) to the node at index w.
fn descend(w: u64, mut i: u64, mut h: u8, mut sha: [u8; 32]) -> Result<[u8; 32], Status> {
    while w < i {
        if w <= i - (1 << h) {
            sha = left_sha(&sha);
            i -= 1 << h;
        } else {
            sha = right_sha(&sha);
            i -= 1;
        }
        if h == 0 {
            break;
        }
        h -= 1;
    }
    if w != i {
        return Err(elk_unknown(format!("can't derive index {} from node {}", w, i)));
    }
    Ok(sha)
}

/// The sending side of an elkrem tree, seeded from a channel-specific secret.
///
/// Derived state; reconstructed from the wallet at load time rather than
/// persisted.
#[derive(Clone)]
pub struct ElkremSender {
    root: [u8; 32],
}

impl ElkremSender {
    /// Construct from the tree root
    pub fn new(root: [u8; 32]) -> Self {
        ElkremSender { root }
    }

    /// The hash at the given reveal index
    pub fn at_index(&self, w: u64) -> Result<[u8; 32], Status> {
        if w > MAX_INDEX {
            return Err(elk_unknown(format!("elkrem index {} out of range", w)));
        }
        descend(w, MAX_INDEX, MAX_HEIGHT, self.root)
    }
}

/// One retained node of the receiving side
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElkremNode {
    i: u64,
    h: u8,
    sha: [u8; 32],
}

/// The receiving side of an elkrem tree.
///
/// Holds at most one node per height.  When an incoming hash completes a
/// subtree it is checked against both children; a hash arriving as a fresh
/// left leaf cannot be checked until its parent arrives, so roughly half of
/// all invalid reveals pass [`ElkremReceiver::add_next`] - the channel layer
/// catches those against the committed revocation key.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ElkremReceiver {
    stack: Vec<ElkremNode>,
}

impl ElkremReceiver {
    /// An empty receiver
    pub fn new() -> Self {
        Default::default()
    }

    /// Ingest the next hash in reveal order
    pub fn add_next(&mut self, sha: [u8; 32]) -> Result<(), Status> {
        let t = self.stack.len();
        let mut node = ElkremNode { i: 0, h: 0, sha };
        if t > 0 {
            node.i = self.stack[t - 1].i + 1;
        }
        if t > 1 && self.stack[t - 2].h == self.stack[t - 1].h {
            // the incoming hash is the parent of the top two nodes
            node.h = self.stack[t - 1].h + 1;
            if left_sha(&sha) != self.stack[t - 2].sha {
                return Err(elk_inconsistent(format!(
                    "left child mismatch at index {}",
                    node.i
                )));
            }
            if right_sha(&sha) != self.stack[t - 1].sha {
                return Err(elk_inconsistent(format!(
                    "right child mismatch at index {}",
                    node.i
                )));
            }
            self.stack.truncate(t - 2);
        }
        self.stack.push(node);
        Ok(())
    }

    /// Re-derive the hash at a previously revealed index
    pub fn at_index(&self, w: u64) -> Result<[u8; 32], Status> {
        for node in &self.stack {
            if w <= node.i {
                return descend(w, node.i, node.h, node.sha);
            }
        }
        Err(elk_unknown(format!("elkrem index {} not yet revealed", w)))
    }

    /// The highest index revealed so far, or None if nothing was revealed
    pub fn upto(&self) -> Option<u64> {
        self.stack.last().map(|node| node.i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pair() -> (ElkremSender, ElkremReceiver) {
        (ElkremSender::new([42u8; 32]), ElkremReceiver::new())
    }

    #[test]
    fn send_receive_test() {
        let (sender, mut receiver) = make_pair();
        assert_eq!(receiver.upto(), None);
        for w in 0..100 {
            receiver.add_next(sender.at_index(w).unwrap()).unwrap();
            assert_eq!(receiver.upto(), Some(w));
        }
        // every previously revealed hash is recoverable, and matches
        for w in 0..100 {
            assert_eq!(receiver.at_index(w).unwrap(), sender.at_index(w).unwrap());
        }
        assert_eq!(receiver.at_index(100).unwrap_err().code(), crate::util::status::Code::ElkUnknown);
        // the stack stays logarithmic
        assert!(receiver.stack.len() <= 48);
    }

    #[test]
    fn sender_determinism_test() {
        let (sender, _) = make_pair();
        let again = ElkremSender::new([42u8; 32]);
        for w in [0u64, 1, 2, 7, 1000, MAX_INDEX] {
            assert_eq!(sender.at_index(w).unwrap(), again.at_index(w).unwrap());
        }
        assert!(sender.at_index(MAX_INDEX + 1).is_err());
    }

    #[test]
    fn receiver_detects_bad_parent_test() {
        let (sender, mut receiver) = make_pair();
        receiver.add_next(sender.at_index(0).unwrap()).unwrap();
        receiver.add_next(sender.at_index(1).unwrap()).unwrap();
        // index 2 is the parent of 0 and 1; garbage must be caught here
        let err = receiver.add_next([7u8; 32]).unwrap_err();
        assert_eq!(err.code(), crate::util::status::Code::ElkInconsistent);
        // the real parent still goes through
        receiver.add_next(sender.at_index(2).unwrap()).unwrap();
        assert_eq!(receiver.upto(), Some(2));
    }

    #[test]
    fn receiver_accepts_unverifiable_leaf_test() {
        let (sender, mut receiver) = make_pair();
        receiver.add_next(sender.at_index(0).unwrap()).unwrap();
        // index 1 is a fresh leaf with no completed subtree; a bad hash
        // slips through add_next and must be caught by the channel layer
        receiver.add_next([7u8; 32]).unwrap();
        assert_eq!(receiver.upto(), Some(1));
    }

    #[test]
    fn serde_roundtrip_test() {
        let (sender, mut receiver) = make_pair();
        for w in 0..10 {
            receiver.add_next(sender.at_index(w).unwrap()).unwrap();
        }
        let json = serde_json::to_string(&receiver).unwrap();
        let restored: ElkremReceiver = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.upto(), Some(9));
        assert_eq!(restored.at_index(5).unwrap(), sender.at_index(5).unwrap());
    }
}
