//! Process-wide device registry.
//!
//! The registry owns the only strong references to tracked
//! [`DeviceRecord`]s. Signal tasks hold weak references and treat a
//! failed upgrade as "record gone, drop the event". Lock ordering is
//! registry → record, and neither lock is ever held across bus I/O.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::props;
use crate::bus::proxies::DEVICE_IFACE;
use crate::events::Event;
use crate::lifecycle;
use crate::mac;
use crate::reconcile;
use crate::signals;
use crate::system::System;

use super::record::DeviceRecord;

/// MAC → record map. Plain storage; orchestration lives in
/// [`add_device`] / [`remove_device`].
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, Arc<DeviceRecord>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the strong reference, or `None` if the MAC is unknown.
    pub fn get(&self, mac: &str) -> Option<Arc<DeviceRecord>> {
        self.devices.lock().get(mac).cloned()
    }

    /// Insert a record unless its MAC is already present. Returns false
    /// when an existing record won.
    pub fn insert(&self, record: Arc<DeviceRecord>) -> bool {
        let mut devices = self.devices.lock();
        if devices.contains_key(record.mac()) {
            return false;
        }
        devices.insert(record.mac().to_string(), record);
        true
    }

    /// Remove and return the record. Once this returns, no `get` will
    /// observe the MAC again until a fresh add.
    pub fn take(&self, mac: &str) -> Option<Arc<DeviceRecord>> {
        self.devices.lock().remove(mac)
    }

    pub fn contains(&self, mac: &str) -> bool {
        self.devices.lock().contains_key(mac)
    }

    pub fn macs(&self) -> Vec<String> {
        self.devices.lock().keys().cloned().collect()
    }

    pub fn records(&self) -> Vec<Arc<DeviceRecord>> {
        self.devices.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }
}

/// Register a device for management.
///
/// Idempotent: a MAC that is already tracked leaves the registry
/// untouched and re-emits its current snapshot. If the bus already
/// exposes the device, the record is populated from the managed-objects
/// snapshot and a PropertiesChanged watch is installed; otherwise it is
/// inserted with all flags down and waits for InterfacesAdded.
pub async fn add_device(system: &Arc<System>, mac_input: &str) {
    let Some(mac) = mac::normalize(mac_input) else {
        warn!("add_device: invalid MAC {mac_input:?}");
        system.events.send(Event::device_added_error(
            mac_input,
            "invalid MAC address",
        ));
        return;
    };

    if let Some(existing) = system.registry.get(&mac) {
        debug!("add_device: {mac} already registered");
        system.events.send(Event::device_added(&existing.snapshot()));
        return;
    }

    let record = Arc::new(DeviceRecord::new(mac.clone()));

    match system.bus.get_managed_objects().await {
        Ok(objects) => {
            let found = objects.iter().find_map(|(path, interfaces)| {
                let props = interfaces.get(DEVICE_IFACE)?;
                let address = props::string_prop(props, "Address")
                    .and_then(|a| mac::normalize(&a))
                    .or_else(|| mac::from_object_path(path.as_str()))?;
                (address == mac).then(|| (path.as_str().to_string(), props))
            });

            if let Some((path, props)) = found {
                record.set_object_path(&path);
                if let Some(name) = props::string_prop(props, "Name") {
                    record.set_name(name);
                }
                record.set_connected(props::bool_prop(props, "Connected").unwrap_or(false));
                record.set_paired(props::bool_prop(props, "Paired").unwrap_or(false));
                record.set_trusted(props::bool_prop(props, "Trusted").unwrap_or(false));
                if let Some(rssi) = props::i16_prop(props, "RSSI") {
                    record.set_rssi(rssi);
                }
                record.set_discovered(true);
                record.set_characteristics(reconcile::characteristics_under(&objects, &path));
            }
        }
        Err(err) => {
            warn!("add_device: managed-objects snapshot failed, {mac} will wait for signals: {err}");
        }
    }

    if !system.registry.insert(record.clone()) {
        // Lost a race with a concurrent add; the winner's state stands.
        if let Some(existing) = system.registry.get(&mac) {
            system.events.send(Event::device_added(&existing.snapshot()));
        }
        return;
    }

    if record.discovered() {
        if let Err(err) = signals::install_device_watch(system, &record).await {
            warn!("add_device: failed to install watch for {mac}: {err}");
        }
    }

    info!("device {mac} registered (discovered: {})", record.discovered());
    system.events.send(Event::device_added(&record.snapshot()));
}

/// Unregister a device.
///
/// The record is extracted under the registry lock; the best-effort
/// `Disconnect` and the watch teardown happen outside it. In-flight
/// signal handlers holding weak references simply fail to upgrade.
pub async fn remove_device(system: &Arc<System>, mac_input: &str) {
    let Some(mac) = mac::normalize(mac_input) else {
        warn!("remove_device: invalid MAC {mac_input:?}");
        system
            .events
            .send(Event::device_removed_error(mac_input, "invalid MAC address"));
        return;
    };

    let Some(record) = system.registry.take(&mac) else {
        debug!("remove_device: {mac} not found");
        system
            .events
            .send(Event::device_removed_error(&mac, "Device not found"));
        return;
    };

    if !record.object_path().is_empty() {
        if let Err(err) = lifecycle::disconnect(system, &record).await {
            debug!("remove_device: best-effort disconnect of {mac} failed: {err}");
        }
    }

    record.set_watch(None);
    info!("device {mac} removed");
    system.events.send(Event::device_removed(&mac));
}
