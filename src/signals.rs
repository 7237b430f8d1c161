//! Signal fan-out.
//!
//! Two kinds of subscriptions exist: one `PropertiesChanged` watch per
//! registered device, and one root `InterfacesAdded`/`InterfacesRemoved`
//! watch for the whole registry. Each subscription is a dedicated task
//! consuming its signal stream, which gives per-object ordering and
//! keeps handlers from re-entering. Watch tasks capture only weak
//! references; a failed upgrade means the record (or the whole system)
//! is gone and the event is dropped.
//!
//! Handlers never wait on bus state inline. Record mutation and event
//! emission happen on the watch task; anything that needs the bus again
//! is spawned through [`reconcile::run_follow_up`].

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::props;
use crate::bus::proxies::{InterfaceMap, DEVICE_IFACE};
use crate::bus::BusError;
use crate::device::DeviceRecord;
use crate::events::Event;
use crate::mac;
use crate::reconcile::{self, DeviceChange};
use crate::system::System;

/// A live signal subscription. Dropping the handle aborts the task,
/// which is how a record's subscription is torn down on removal.
pub struct WatchHandle {
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Install the per-device `PropertiesChanged` subscription and store
/// its handle on the record. Requires the record to carry an object
/// path, i.e. the device must be discovered.
pub async fn install_device_watch(
    system: &Arc<System>,
    record: &Arc<DeviceRecord>,
) -> Result<(), BusError> {
    let path = record.object_path();
    if path.is_empty() {
        return Err(BusError::other(format!(
            "{} has no object path to watch",
            record.mac()
        )));
    }

    let proxy = system.bus.properties(&path).await?;
    let mut stream = proxy.receive_properties_changed().await?;

    let weak_system = Arc::downgrade(system);
    let weak_record = Arc::downgrade(record);
    let mac = record.mac().to_string();

    let task = tokio::spawn(async move {
        while let Some(signal) = stream.next().await {
            let args = match signal.args() {
                Ok(args) => args,
                Err(err) => {
                    debug!("undecodable PropertiesChanged for {mac}: {err}");
                    continue;
                }
            };
            if args.interface_name != DEVICE_IFACE {
                continue;
            }

            let (Some(system), Some(record)) = (weak_system.upgrade(), weak_record.upgrade())
            else {
                debug!("record {mac} gone, dropping signal and ending watch");
                return;
            };

            let change = DeviceChange::parse(&args.changed_properties);
            if change.is_empty() {
                continue;
            }
            for action in reconcile::apply(&system.events, &record, &change) {
                tokio::spawn(reconcile::run_follow_up(
                    system.clone(),
                    record.clone(),
                    action,
                ));
            }
        }
        debug!("PropertiesChanged stream for {mac} ended");
    });

    record.set_watch(Some(WatchHandle::new(task)));
    debug!("watch installed for {} at {path}", record.mac());
    Ok(())
}

/// Start the registry's root object-manager watch.
///
/// `InterfacesAdded` binds records that were registered before the
/// device appeared on the bus; `InterfacesRemoved` resets a record's
/// presence in one step so no later event sees a half-dead device.
pub async fn run_root_watch(system: &Arc<System>) -> Result<JoinHandle<()>, BusError> {
    let om = system.bus.object_manager().await?;
    let mut added = om.receive_interfaces_added().await?;
    let mut removed = om.receive_interfaces_removed().await?;
    let weak_system = Arc::downgrade(system);

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                signal = added.next() => {
                    let Some(signal) = signal else { break };
                    let Ok(args) = signal.args() else { continue };
                    let Some(system) = weak_system.upgrade() else { return };
                    on_interfaces_added(&system, args.object_path.as_str(), &args.interfaces)
                        .await;
                }
                signal = removed.next() => {
                    let Some(signal) = signal else { break };
                    let Ok(args) = signal.args() else { continue };
                    let Some(system) = weak_system.upgrade() else { return };
                    on_interfaces_removed(&system, args.object_path.as_str(), &args.interfaces);
                }
            }
        }
        debug!("root object-manager streams ended");
    }))
}

async fn on_interfaces_added(system: &Arc<System>, path: &str, interfaces: &InterfaceMap) {
    let Some(device_props) = interfaces.get(DEVICE_IFACE) else {
        return;
    };
    let Some(mac) = props::string_prop(device_props, "Address")
        .and_then(|a| mac::normalize(&a))
        .or_else(|| mac::from_object_path(path))
    else {
        return;
    };
    let Some(record) = system.registry.get(&mac) else {
        return;
    };
    if record.discovered() {
        return;
    }

    record.set_object_path(path);
    if let Some(name) = props::string_prop(device_props, "Name") {
        record.set_name(name);
    }
    record.set_connected(props::bool_prop(device_props, "Connected").unwrap_or(false));
    record.set_paired(props::bool_prop(device_props, "Paired").unwrap_or(false));
    record.set_trusted(props::bool_prop(device_props, "Trusted").unwrap_or(false));
    if let Some(rssi) = props::i16_prop(device_props, "RSSI") {
        record.set_rssi(rssi);
    }
    record.set_discovered(true);

    if let Err(err) = install_device_watch(system, &record).await {
        warn!("failed to install watch for {mac}: {err}");
    }
    debug!("registered device {mac} appeared at {path}");
    system.events.send(Event::discovered_update(&mac, true));
}

fn on_interfaces_removed(system: &Arc<System>, path: &str, interfaces: &[String]) {
    if !interfaces.iter().any(|iface| iface == DEVICE_IFACE) {
        return;
    }
    let Some(mac) = mac::from_object_path(path) else {
        return;
    };
    let Some(record) = system.registry.get(&mac) else {
        return;
    };

    record.reset_presence();
    debug!("device {mac} vanished from the bus");
    system.events.send(Event::discovered_update(&mac, false));
}
