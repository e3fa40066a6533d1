#![crate_name = "quickchan"]

//! A bilateral payment channel core.
//!
//! Two parties share an on-chain 2-of-2 funding output and update the split
//! of its value off-chain by exchanging signatures on asymmetric commitment
//! transactions.  Old commitments are revoked with elkrem hash reveals;
//! broadcasting a revoked commitment lets the wronged party sweep the
//! cheater's output.  See [`node::Node`] for the entry point.

#![forbid(unsafe_code)]
#![warn(rustdoc::broken_intra_doc_links)]

/// Chain access
pub mod chain;
/// Channel
pub mod channel;
/// Elkrem hash tree, the basis of revocation
pub mod elkrem;
/// Node
pub mod node;
/// Persistence
pub mod persist;
/// Transaction construction
pub mod tx;
/// Various utilities
pub mod util;
/// Layer-1 wallet interface
pub mod wallet;

/// Convenience trait for Send + Sync
pub trait SendSync: Send + Sync {}

pub mod prelude {
    //! Collection and sync aliases used throughout the crate
    pub use std::collections::HashMap as Map;
    pub use std::sync::{Arc, Mutex, MutexGuard};
}

pub use bitcoin;
