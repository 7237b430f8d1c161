//! Per-device property reconciliation.
//!
//! Incoming `PropertiesChanged` payloads are decoded into a typed
//! [`DeviceChange`], applied to the record inline (so per-object
//! ordering is preserved), and anything that needs the bus again
//! (trusting a freshly connected device, rebuilding the characteristic
//! table after service resolution) is returned as a [`FollowUp`] for
//! the watch task to run on a worker. A signal produces at most one
//! outbound event.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::bus::props;
use crate::bus::proxies::{ManagedObjects, PropMap, CHARACTERISTIC_IFACE};
use crate::bus::BusError;
use crate::device::DeviceRecord;
use crate::events::{Event, EventSender};
use crate::system::System;

/// The decoded subset of a `PropertiesChanged` payload the daemon
/// reacts to. Unknown keys and malformed values are dropped.
#[derive(Debug, Default)]
pub struct DeviceChange {
    pub connected: Option<bool>,
    pub paired: Option<bool>,
    pub trusted: Option<bool>,
    pub services_resolved: Option<bool>,
    pub service_data: Option<HashMap<String, Vec<u8>>>,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl DeviceChange {
    pub fn parse(changed: &PropMap) -> Self {
        Self {
            connected: props::bool_prop(changed, "Connected"),
            paired: props::bool_prop(changed, "Paired"),
            trusted: props::bool_prop(changed, "Trusted"),
            services_resolved: props::bool_prop(changed, "ServicesResolved"),
            service_data: props::byte_map_prop(changed, "ServiceData"),
            name: props::string_prop(changed, "Name"),
            rssi: props::i16_prop(changed, "RSSI"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.connected.is_none()
            && self.paired.is_none()
            && self.trusted.is_none()
            && self.services_resolved.is_none()
            && self.service_data.is_none()
            && self.name.is_none()
            && self.rssi.is_none()
    }
}

/// Bus work a reconciliation pass deferred off the signal path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// Set the remote `Trusted` property after a connect.
    SetTrusted,
    /// Re-fetch managed objects and rebuild the characteristic table.
    RefreshCharacteristics,
}

/// Apply a change to the record and emit the outbound event, if any.
///
/// Runs inline on the per-device watch task: only record mutation and
/// channel sends, no bus I/O. Returned follow-ups must be executed on
/// a worker task via [`run_follow_up`].
pub fn apply(events: &EventSender, record: &DeviceRecord, change: &DeviceChange) -> Vec<FollowUp> {
    let mut follow_ups = Vec::new();
    let mut upd_connected = None;
    let mut upd_paired = None;
    let mut upd_trusted = None;

    if let Some(connected) = change.connected {
        if record.set_connected(connected) {
            upd_connected = Some(connected);
        }
        if connected && !record.trusted() {
            follow_ups.push(FollowUp::SetTrusted);
        }
    }

    if let Some(resolved) = change.services_resolved {
        if resolved {
            follow_ups.push(FollowUp::RefreshCharacteristics);
        } else {
            record.clear_characteristics();
        }
    }

    if let Some(paired) = change.paired {
        if record.set_paired(paired) {
            upd_paired = Some(paired);
        }
    }

    if let Some(trusted) = change.trusted {
        if record.set_trusted(trusted) {
            upd_trusted = Some(trusted);
        }
    }

    if let Some(ref name) = change.name {
        record.set_name(name.clone());
    }

    if let Some(rssi) = change.rssi {
        record.set_rssi(rssi);
    }

    if upd_connected.is_some() || upd_paired.is_some() || upd_trusted.is_some() {
        events.send(Event::DeviceUpdate {
            device_mac: record.mac().to_string(),
            discovered: None,
            connected: upd_connected,
            paired: upd_paired,
            trusted: upd_trusted,
            error: None,
        });
    } else if let Some(ref data) = change.service_data {
        // Deterministic pick when the stack batches several UUIDs.
        if let Some(uuid) = data.keys().min().cloned() {
            events.send(Event::device_broadcast(record.mac(), &uuid, &data[&uuid]));
        }
    }

    follow_ups
}

/// Execute one deferred action. Failures are logged and dropped; the
/// authoritative state keeps arriving through property signals.
pub async fn run_follow_up(system: Arc<System>, record: Arc<DeviceRecord>, action: FollowUp) {
    match action {
        FollowUp::SetTrusted => {
            let path = record.object_path();
            if path.is_empty() {
                return;
            }
            let result = match system.bus.device(&path).await {
                Ok(device) => system
                    .bus
                    .call("Set Trusted", device.set_trusted(true))
                    .await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                warn!("failed to trust {}: {err}", record.mac());
            }
        }
        FollowUp::RefreshCharacteristics => {
            if let Err(err) = refresh_characteristics(&system, &record).await {
                warn!(
                    "characteristic refresh for {} failed: {err}",
                    record.mac()
                );
            }
        }
    }
}

/// Rebuild the record's UUID → path table from a fresh managed-objects
/// snapshot. The table is only committed while the device is still
/// connected; a disconnect racing the fetch wins.
pub async fn refresh_characteristics(
    system: &System,
    record: &DeviceRecord,
) -> Result<(), BusError> {
    let path = record.object_path();
    if path.is_empty() {
        return Ok(());
    }

    let objects = system.bus.get_managed_objects().await?;
    let table = characteristics_under(&objects, &path);

    if !record.connected() {
        debug!(
            "{} disconnected during characteristic refresh, discarding",
            record.mac()
        );
        return Ok(());
    }

    debug!("{}: {} characteristics resolved", record.mac(), table.len());
    record.set_characteristics(table);
    Ok(())
}

/// Collect every GATT characteristic whose path sits under
/// `device_path`, keyed by UUID. Duplicate UUIDs resolve to the last
/// writer.
pub fn characteristics_under(
    objects: &ManagedObjects,
    device_path: &str,
) -> HashMap<String, String> {
    let prefix = format!("{device_path}/");
    let mut table = HashMap::new();
    for (path, interfaces) in objects {
        let Some(chr) = interfaces.get(CHARACTERISTIC_IFACE) else {
            continue;
        };
        if !path.as_str().starts_with(&prefix) {
            continue;
        }
        if let Some(uuid) = props::string_prop(chr, "UUID") {
            table.insert(uuid, path.as_str().to_string());
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use zbus::zvariant::Value;

    fn prop_map(entries: Vec<(&str, Value<'static>)>) -> PropMap {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.try_to_owned().unwrap()))
            .collect()
    }

    fn make_record() -> DeviceRecord {
        let record = DeviceRecord::new("38:39:8F:82:18:7E");
        record.set_object_path("/org/bluez/hci0/dev_38_39_8F_82_18_7E");
        record.set_discovered(true);
        record
    }

    #[test]
    fn test_connect_emits_update_and_requests_trust() {
        let (tx, mut rx) = events::channel();
        let record = make_record();

        let change = DeviceChange::parse(&prop_map(vec![("Connected", Value::from(true))]));
        let follow_ups = apply(&tx, &record, &change);

        assert!(record.connected());
        assert!(follow_ups.contains(&FollowUp::SetTrusted));
        match rx.try_recv().unwrap() {
            Event::DeviceUpdate {
                connected: Some(true),
                paired: None,
                trusted: None,
                ..
            } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_connect_when_already_trusted_skips_trust() {
        let (tx, _rx) = events::channel();
        let record = make_record();
        record.set_trusted(true);

        let change = DeviceChange::parse(&prop_map(vec![("Connected", Value::from(true))]));
        let follow_ups = apply(&tx, &record, &change);

        assert!(!follow_ups.contains(&FollowUp::SetTrusted));
    }

    #[test]
    fn test_disconnect_clears_characteristics_and_emits() {
        let (tx, mut rx) = events::channel();
        let record = make_record();
        record.set_connected(true);
        record.set_characteristics(HashMap::from([(
            "d52246df-98ac-4d21-be1b-70d5f66a5ddb".to_string(),
            "/org/bluez/hci0/dev_38_39_8F_82_18_7E/service0021/char0025".to_string(),
        )]));

        let change = DeviceChange::parse(&prop_map(vec![("Connected", Value::from(false))]));
        apply(&tx, &record, &change);

        assert!(record.characteristics().is_empty());
        match rx.try_recv().unwrap() {
            Event::DeviceUpdate {
                connected: Some(false),
                ..
            } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_services_resolved_schedules_refresh_and_clears_on_false() {
        let (tx, _rx) = events::channel();
        let record = make_record();
        record.set_connected(true);

        let change =
            DeviceChange::parse(&prop_map(vec![("ServicesResolved", Value::from(true))]));
        let follow_ups = apply(&tx, &record, &change);
        assert!(follow_ups.contains(&FollowUp::RefreshCharacteristics));

        record.set_characteristics(HashMap::from([("u".to_string(), "p".to_string())]));
        let change =
            DeviceChange::parse(&prop_map(vec![("ServicesResolved", Value::from(false))]));
        apply(&tx, &record, &change);
        assert!(record.characteristics().is_empty());
    }

    #[test]
    fn test_service_data_emits_broadcast_without_touching_flags() {
        let (tx, mut rx) = events::channel();
        let record = make_record();

        let mut inner = HashMap::new();
        inner.insert("fea0", Value::from(vec![0x01u8, 0x02, 0x03]));
        let change =
            DeviceChange::parse(&prop_map(vec![("ServiceData", Value::from(inner))]));
        apply(&tx, &record, &change);

        assert!(!record.connected());
        match rx.try_recv().unwrap() {
            Event::DeviceBroadcast {
                device_mac,
                service_data,
            } => {
                assert_eq!(device_mac, "38:39:8F:82:18:7E");
                assert_eq!(service_data.uuid, "fea0");
                assert_eq!(service_data.data, "01 02 03");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_lifecycle_update_outranks_service_data() {
        let (tx, mut rx) = events::channel();
        let record = make_record();

        let mut inner = HashMap::new();
        inner.insert("fea0", Value::from(vec![0x01u8]));
        let change = DeviceChange::parse(&prop_map(vec![
            ("Connected", Value::from(true)),
            ("ServiceData", Value::from(inner)),
        ]));
        apply(&tx, &record, &change);

        match rx.try_recv().unwrap() {
            Event::DeviceUpdate { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let (tx, mut rx) = events::channel();
        let record = make_record();

        let change = DeviceChange::parse(&prop_map(vec![
            ("Modalias", Value::from("usb:v1D6Bp0246")),
            ("TxPower", Value::from(4i16)),
        ]));
        assert!(change.is_empty());
        let follow_ups = apply(&tx, &record, &change);

        assert!(follow_ups.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_repeated_flag_value_emits_nothing() {
        let (tx, mut rx) = events::channel();
        let record = make_record();
        record.set_connected(true);
        record.set_trusted(true);

        let change = DeviceChange::parse(&prop_map(vec![("Connected", Value::from(true))]));
        apply(&tx, &record, &change);

        assert!(rx.try_recv().is_err());
    }
}
