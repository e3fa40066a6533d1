use crate::channel::Qchan;
use crate::prelude::*;

pub mod model;

/// Storage for channel records, keyed by `(peer_idx, key_idx)`.
///
/// The elkrem sender is derived state and is not part of the stored image;
/// everything else a channel needs to resume is.
pub trait Persist: Send + Sync {
    /// Will error if exists
    fn new_channel(&self, chan: &Qchan) -> Result<(), ()>;
    /// Will error if doesn't exist
    fn update_channel(&self, chan: &Qchan) -> Result<(), ()>;
    /// Fetch one channel's durable image
    fn get_channel(&self, peer_idx: u32, key_idx: u32) -> Result<model::ChannelEntry, ()>;
    /// All stored channels
    fn get_channels(&self) -> Vec<model::ChannelEntry>;
    /// Clears the database.  Not for production use.
    fn clear_database(&self);
}

/// A persister that drops everything on the floor
pub struct DummyPersister;

#[allow(unused_variables)]
impl Persist for DummyPersister {
    fn new_channel(&self, chan: &Qchan) -> Result<(), ()> {
        Ok(())
    }

    fn update_channel(&self, chan: &Qchan) -> Result<(), ()> {
        Ok(())
    }

    fn get_channel(&self, peer_idx: u32, key_idx: u32) -> Result<model::ChannelEntry, ()> {
        Err(())
    }

    fn get_channels(&self) -> Vec<model::ChannelEntry> {
        Vec::new()
    }

    fn clear_database(&self) {}
}

/// An in-memory persister, for tests and embedding hosts
pub struct MemoryPersister {
    channels: Mutex<Map<(u32, u32), model::ChannelEntry>>,
}

impl MemoryPersister {
    /// An empty store
    pub fn new() -> Self {
        MemoryPersister { channels: Mutex::new(Map::new()) }
    }
}

impl Persist for MemoryPersister {
    fn new_channel(&self, chan: &Qchan) -> Result<(), ()> {
        let mut channels = self.channels.lock().unwrap();
        let key = (chan.setup.peer_idx, chan.setup.key_idx);
        if channels.contains_key(&key) {
            return Err(());
        }
        channels.insert(key, model::ChannelEntry::from(chan));
        Ok(())
    }

    fn update_channel(&self, chan: &Qchan) -> Result<(), ()> {
        let mut channels = self.channels.lock().unwrap();
        let key = (chan.setup.peer_idx, chan.setup.key_idx);
        if !channels.contains_key(&key) {
            return Err(());
        }
        channels.insert(key, model::ChannelEntry::from(chan));
        Ok(())
    }

    fn get_channel(&self, peer_idx: u32, key_idx: u32) -> Result<model::ChannelEntry, ()> {
        self.channels.lock().unwrap().get(&(peer_idx, key_idx)).cloned().ok_or(())
    }

    fn get_channels(&self) -> Vec<model::ChannelEntry> {
        self.channels.lock().unwrap().values().cloned().collect()
    }

    fn clear_database(&self) {
        self.channels.lock().unwrap().clear();
    }
}
