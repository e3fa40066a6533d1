//! Local types describing the durable image of a channel.
//!
//! By convention, structs ending with `Entry` are the storage shape,
//! converted from the live type with `From` and back with
//! [`crate::channel::Qchan::restore`].

use serde_derive::{Deserialize, Serialize};

use crate::channel::{ChannelSetup, CloseData, Qchan, StatCom};
use crate::elkrem::ElkremReceiver;

/// The durable image of one channel.
///
/// Everything except the elkrem sender, which is re-derived from the
/// wallet's channel secret on restore.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelEntry {
    /// The immutable channel parameters
    pub setup: ChannelSetup,
    /// The counterparty's revealed elkrems
    pub elk_recv: ElkremReceiver,
    /// The current state commitment
    pub state: StatCom,
    /// The close record, if the channel ended
    pub close_data: Option<CloseData>,
}

impl From<&Qchan> for ChannelEntry {
    fn from(chan: &Qchan) -> Self {
        ChannelEntry {
            setup: chan.setup.clone(),
            elk_recv: chan.elk_recv.clone(),
            state: chan.state.clone(),
            close_data: chan.close_data.clone(),
        }
    }
}
