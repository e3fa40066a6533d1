//! A two-party channel fixture.
//!
//! Both ends of one channel, with mirrored setups, wallets holding fixed
//! keys, a shared in-memory chain, and a driver that runs full update
//! rounds the way the wire protocol would.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{OutPoint, Transaction, TxOut, Txid};

use crate::chain::ChainClient;
use crate::channel::{ChannelSetup, Qchan};
use crate::elkrem::ElkremSender;
use crate::node::Node;
use crate::persist::MemoryPersister;
use crate::prelude::*;
use crate::tx::script::{funding_tx_out, p2wpkh_script};
use crate::tx::tx::DEFAULT_TIMEOUT_BLOCKS;
use crate::util::crypto_utils::add_pubkey_tweak;
use crate::util::status::{invalid_argument, Status};
use crate::wallet::Wallet;

pub const TEST_PEER_IDX: u32 = 1;
pub const TEST_KEY_IDX: u32 = 0;

pub fn make_test_privkey(i: u8) -> SecretKey {
    SecretKey::from_slice(&[i; 32]).unwrap()
}

pub fn make_test_pubkey(i: u8) -> PublicKey {
    PublicKey::from_secret_key(&Secp256k1::new(), &make_test_privkey(i))
}

pub fn make_test_txid(i: u8) -> Txid {
    Txid::from_byte_array([i; 32])
}

pub fn make_test_outpoint(i: u8) -> OutPoint {
    OutPoint { txid: make_test_txid(i), vout: 0 }
}

/// A wallet with one fixed key per purpose
pub struct TestWallet {
    pub chan_privkey: SecretKey,
    pub refund_privkey: SecretKey,
    pub change_pubkey: PublicKey,
}

impl Wallet for TestWallet {
    fn get_chan_privkey(&self, _peer_idx: u32, _key_idx: u32) -> SecretKey {
        self.chan_privkey
    }

    fn get_refund_privkey(&self, _peer_idx: u32, _key_idx: u32) -> SecretKey {
        self.refund_privkey
    }

    fn new_change_out(&self, value: i64) -> Result<TxOut, Status> {
        if value < 0 {
            return Err(invalid_argument("negative change value"));
        }
        Ok(TxOut { value: value as u64, script_pubkey: p2wpkh_script(&self.change_pubkey) })
    }
}

/// A chain that remembers whatever was broadcast
pub struct TestChainClient {
    txs: Mutex<Map<Txid, Transaction>>,
}

impl TestChainClient {
    pub fn new() -> Self {
        TestChainClient { txs: Mutex::new(Map::new()) }
    }
}

impl ChainClient for TestChainClient {
    fn get_tx(&self, txid: &Txid) -> Result<Transaction, Status> {
        self.txs
            .lock()
            .unwrap()
            .get(txid)
            .cloned()
            .ok_or_else(|| invalid_argument(format!("unknown tx {}", txid)))
    }

    fn broadcast(&self, tx: &Transaction) -> Result<(), Status> {
        self.txs.lock().unwrap().insert(tx.txid(), tx.clone());
        Ok(())
    }
}

/// The revocation pubkey this side supplies for the peer's *next* state:
/// the peer's base point plus our next still-secret elkrem.
pub fn next_hakd_for_peer(chan: &Qchan) -> PublicKey {
    let elk = chan.elk_send.at_index(chan.state.state_idx + 1).unwrap();
    add_pubkey_tweak(&chan.secp_ctx, &chan.setup.their_hakd_base, &elk).unwrap()
}

/// Build both ends of a funded channel at state 0.
///
/// The funding ritual is simulated: mirrored setups, elkrem 0 exchanged
/// both ways, and each side holding the peer-supplied initial revocation
/// pubkey.  The hakd base of each side is its refund pubkey.
pub fn make_test_channel_pair(
    funding_value: i64,
    alice_amt: i64,
) -> (Arc<Node>, Arc<Node>, Arc<TestChainClient>) {
    let secp_ctx = Secp256k1::new();
    let chain = Arc::new(TestChainClient::new());

    let alice_wallet = Arc::new(TestWallet {
        chan_privkey: make_test_privkey(10),
        refund_privkey: make_test_privkey(11),
        change_pubkey: make_test_pubkey(12),
    });
    let bob_wallet = Arc::new(TestWallet {
        chan_privkey: make_test_privkey(20),
        refund_privkey: make_test_privkey(21),
        change_pubkey: make_test_pubkey(22),
    });

    let alice = Arc::new(Node::new(
        alice_wallet,
        chain.clone(),
        Arc::new(MemoryPersister::new()),
    ));
    let bob = Arc::new(Node::new(bob_wallet, chain.clone(), Arc::new(MemoryPersister::new())));

    let alice_sender =
        ElkremSender::new(alice.derive_elkrem_root(TEST_PEER_IDX, TEST_KEY_IDX));
    let bob_sender = ElkremSender::new(bob.derive_elkrem_root(TEST_PEER_IDX, TEST_KEY_IDX));
    let alice_elk0 = alice_sender.at_index(0).unwrap();
    let bob_elk0 = bob_sender.at_index(0).unwrap();

    // the channel's backing output, already confirmed
    let funding_tx = Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: Vec::new(),
        output: vec![
            funding_tx_out(&make_test_pubkey(10), &make_test_pubkey(20), funding_value).unwrap(),
        ],
    };
    chain.broadcast(&funding_tx).unwrap();
    let funding_outpoint = OutPoint { txid: funding_tx.txid(), vout: 0 };

    let alice_setup = ChannelSetup {
        funding_outpoint,
        funding_value,
        my_chan_pub: make_test_pubkey(10),
        their_chan_pub: make_test_pubkey(20),
        my_refund_pub: make_test_pubkey(11),
        their_refund_pub: make_test_pubkey(21),
        my_hakd_base: make_test_pubkey(11),
        their_hakd_base: make_test_pubkey(21),
        timeout_blocks: DEFAULT_TIMEOUT_BLOCKS,
        peer_idx: TEST_PEER_IDX,
        key_idx: TEST_KEY_IDX,
    };
    let bob_setup = ChannelSetup {
        funding_outpoint,
        funding_value,
        my_chan_pub: make_test_pubkey(20),
        their_chan_pub: make_test_pubkey(10),
        my_refund_pub: make_test_pubkey(21),
        their_refund_pub: make_test_pubkey(11),
        my_hakd_base: make_test_pubkey(21),
        their_hakd_base: make_test_pubkey(11),
        timeout_blocks: DEFAULT_TIMEOUT_BLOCKS,
        peer_idx: TEST_PEER_IDX,
        key_idx: TEST_KEY_IDX,
    };

    // each side's initial revocation pubkey, as the peer would supply it
    let alice_hakd0 =
        add_pubkey_tweak(&secp_ctx, &alice_setup.my_hakd_base, &bob_elk0).unwrap();
    let bob_hakd0 = add_pubkey_tweak(&secp_ctx, &bob_setup.my_hakd_base, &alice_elk0).unwrap();

    let mut alice_chan = Qchan::new(alice_setup, alice_sender, alice_amt, alice_hakd0);
    alice_chan.elk_recv.add_next(bob_elk0).unwrap();
    let mut bob_chan = Qchan::new(bob_setup, bob_sender, funding_value - alice_amt, bob_hakd0);
    bob_chan.elk_recv.add_next(alice_elk0).unwrap();

    alice.add_channel(alice_chan).unwrap();
    bob.add_channel(bob_chan).unwrap();
    (alice, bob, chain)
}

/// Drive one full update round, moving `amt` satoshi from pusher to
/// puller.
///
/// Compresses the RTS / ACKSIG / SIGREV / REVOKE exchange: set deltas,
/// swap next revocation pubkeys, advance, cross-sign, verify, and reveal
/// the previous elkrems.  The first round has nothing to revoke.
pub fn run_update_round(pusher: &Arc<Node>, puller: &Arc<Node>, amt: i32) {
    let (p, k) = (TEST_PEER_IDX, TEST_KEY_IDX);
    let prev_idx = pusher.with_channel(p, k, |c| Ok(c.state.state_idx)).unwrap();

    pusher
        .with_channel(p, k, |c| {
            c.state.delta = -amt;
            Ok(())
        })
        .unwrap();
    puller
        .with_channel(p, k, |c| {
            c.state.delta = amt;
            Ok(())
        })
        .unwrap();

    let next_for_pusher = puller.with_channel(p, k, |c| Ok(next_hakd_for_peer(c))).unwrap();
    let next_for_puller = pusher.with_channel(p, k, |c| Ok(next_hakd_for_peer(c))).unwrap();
    pusher.advance_state(p, k, next_for_pusher).unwrap();
    puller.advance_state(p, k, next_for_puller).unwrap();

    let pusher_sig = pusher.sign_state(p, k).unwrap();
    let puller_sig = puller.sign_state(p, k).unwrap();
    puller.verify_sig(p, k, &pusher_sig).unwrap();
    pusher.verify_sig(p, k, &puller_sig).unwrap();

    if prev_idx >= 1 {
        let pusher_elk = pusher.with_channel(p, k, |c| c.elk_send.at_index(prev_idx)).unwrap();
        puller.ingest_elkrem(p, k, pusher_elk).unwrap();
        let puller_elk = puller.with_channel(p, k, |c| c.elk_send.at_index(prev_idx)).unwrap();
        pusher.ingest_elkrem(p, k, puller_elk).unwrap();
    }
}
