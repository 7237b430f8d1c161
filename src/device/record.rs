//! Per-device state aggregate.
//!
//! A [`DeviceRecord`] carries everything the daemon knows about one
//! peripheral: identity, lifecycle flags, the UUID → object-path
//! characteristic index and the live signal-watch handle. All of it
//! sits behind a single mutex held only for field access; callers must
//! never keep it across a bus call. Getters return copies, and
//! multi-field reads go through [`DeviceRecord::snapshot`].

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::signals::WatchHandle;

/// Mutable state of one device, all behind the record lock.
#[derive(Default)]
struct RecordState {
    object_path: String,
    name: String,
    discovered: bool,
    connected: bool,
    paired: bool,
    trusted: bool,
    rssi: Option<i16>,
    characteristics: HashMap<String, String>,
    watch: Option<WatchHandle>,
}

/// A point-in-time copy of a record's fields, taken under one lock hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub mac: String,
    pub object_path: String,
    pub name: String,
    pub discovered: bool,
    pub connected: bool,
    pub paired: bool,
    pub trusted: bool,
    pub characteristics: HashMap<String, String>,
}

/// One tracked peripheral, keyed by its canonical MAC.
pub struct DeviceRecord {
    mac: String,
    state: Mutex<RecordState>,
}

impl DeviceRecord {
    pub fn new(mac: impl Into<String>) -> Self {
        Self {
            mac: mac.into(),
            state: Mutex::new(RecordState::default()),
        }
    }

    /// The immutable primary key.
    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn object_path(&self) -> String {
        self.state.lock().object_path.clone()
    }

    pub fn set_object_path(&self, path: impl Into<String>) {
        self.state.lock().object_path = path.into();
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.state.lock().name = name.into();
    }

    pub fn discovered(&self) -> bool {
        self.state.lock().discovered
    }

    /// Returns true when the flag actually changed.
    pub fn set_discovered(&self, discovered: bool) -> bool {
        let mut state = self.state.lock();
        let changed = state.discovered != discovered;
        state.discovered = discovered;
        changed
    }

    pub fn connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Returns true when the flag actually changed. Dropping to
    /// disconnected clears the characteristic index: paths under a dead
    /// connection are meaningless.
    pub fn set_connected(&self, connected: bool) -> bool {
        let mut state = self.state.lock();
        let changed = state.connected != connected;
        state.connected = connected;
        if !connected {
            state.characteristics.clear();
        }
        changed
    }

    pub fn paired(&self) -> bool {
        self.state.lock().paired
    }

    /// Returns true when the flag actually changed. A device can only
    /// be paired to an object we can see, so pairing implies discovery.
    pub fn set_paired(&self, paired: bool) -> bool {
        let mut state = self.state.lock();
        let changed = state.paired != paired;
        state.paired = paired;
        if paired {
            state.discovered = true;
        }
        changed
    }

    pub fn trusted(&self) -> bool {
        self.state.lock().trusted
    }

    /// Returns true when the flag actually changed.
    pub fn set_trusted(&self, trusted: bool) -> bool {
        let mut state = self.state.lock();
        let changed = state.trusted != trusted;
        state.trusted = trusted;
        changed
    }

    pub fn rssi(&self) -> Option<i16> {
        self.state.lock().rssi
    }

    pub fn set_rssi(&self, rssi: i16) {
        self.state.lock().rssi = Some(rssi);
    }

    pub fn characteristics(&self) -> HashMap<String, String> {
        self.state.lock().characteristics.clone()
    }

    /// Resolve a characteristic UUID to its object path.
    pub fn characteristic_path(&self, uuid: &str) -> Option<String> {
        self.state.lock().characteristics.get(uuid).cloned()
    }

    /// Replace the characteristic index wholesale (service resolution).
    pub fn set_characteristics(&self, table: HashMap<String, String>) {
        self.state.lock().characteristics = table;
    }

    /// Attach one characteristic; an existing UUID is overwritten.
    pub fn insert_characteristic(&self, uuid: impl Into<String>, path: impl Into<String>) {
        self.state
            .lock()
            .characteristics
            .insert(uuid.into(), path.into());
    }

    pub fn clear_characteristics(&self) {
        self.state.lock().characteristics.clear();
    }

    /// Whether a live PropertiesChanged subscription is installed.
    pub fn has_watch(&self) -> bool {
        self.state.lock().watch.is_some()
    }

    /// Install or drop the signal subscription. The previous handle (if
    /// any) aborts its task on drop, after the lock is released.
    pub fn set_watch(&self, watch: Option<WatchHandle>) {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.watch, watch)
        };
        drop(previous);
    }

    /// The object vanished from the bus: forget everything tied to its
    /// path in one lock hold, so no observer sees a half-reset record.
    pub fn reset_presence(&self) {
        let previous = {
            let mut state = self.state.lock();
            state.discovered = false;
            state.connected = false;
            state.paired = false;
            state.characteristics.clear();
            state.object_path.clear();
            state.rssi = None;
            state.watch.take()
        };
        drop(previous);
    }

    /// Copy every field out under a single lock hold.
    pub fn snapshot(&self) -> DeviceSnapshot {
        let state = self.state.lock();
        DeviceSnapshot {
            mac: self.mac.clone(),
            object_path: state.object_path.clone(),
            name: state.name.clone(),
            discovered: state.discovered,
            connected: state.connected,
            paired: state.paired,
            trusted: state.trusted,
            characteristics: state.characteristics.clone(),
        }
    }
}

impl std::fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DeviceRecord")
            .field("mac", &self.mac)
            .field("object_path", &state.object_path)
            .field("name", &state.name)
            .field("discovered", &state.discovered)
            .field("connected", &state.connected)
            .field("paired", &state.paired)
            .field("trusted", &state.trusted)
            .field("characteristics", &state.characteristics.len())
            .field("watched", &state.watch.is_some())
            .finish()
    }
}
