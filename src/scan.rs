//! Discovery control.
//!
//! A scan seeds a view of currently visible devices from the
//! managed-objects snapshot, keeps it fresh through the root
//! object-manager signals, and restarts adapter discovery. The restart
//! is deliberately StopDiscovery → settle → StartDiscovery: it flushes
//! the adapter's cache of recently seen advertisements so quiet devices
//! reappear. A worker task watches the cooperative stop flag at 100 ms
//! granularity and stops discovery on its way out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::bus::props;
use crate::bus::proxies::{InterfaceMap, PropMap, CHARACTERISTIC_IFACE, DEVICE_IFACE};
use crate::bus::{BusClient, BusError};
use crate::device::DeviceRecord;
use crate::events::{Event, EventSender};
use crate::mac;
use crate::reconcile;
use crate::system::System;

/// Worker wake-up cadence; the stop flag is honored within this bound.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Devices visible in the current discovery cycle.
///
/// Scan-local: it may contain devices that were never registered, and
/// its records are ephemeral until the link loop merges them into the
/// registry.
#[derive(Clone, Default)]
pub struct DiscoveredView {
    inner: Arc<Mutex<HashMap<String, Arc<DeviceRecord>>>>,
}

impl DiscoveredView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, mac: &str) -> Option<Arc<DeviceRecord>> {
        self.inner.lock().get(mac).cloned()
    }

    pub fn contains(&self, mac: &str) -> bool {
        self.inner.lock().contains_key(mac)
    }

    pub fn insert(&self, record: Arc<DeviceRecord>) {
        self.inner
            .lock()
            .insert(record.mac().to_string(), record);
    }

    pub fn remove(&self, mac: &str) -> Option<Arc<DeviceRecord>> {
        self.inner.lock().remove(mac)
    }

    pub fn macs(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// A running scan. `stop()` is idempotent; dropping the handle stops
/// the scan too, joining the worker so the adapter's StopDiscovery has
/// been attempted by the time the handle is gone.
pub struct ScanHandle {
    view: DiscoveredView,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    signal_task: Option<JoinHandle<()>>,
}

impl ScanHandle {
    pub fn view(&self) -> &DiscoveredView {
        &self.view
    }

    /// Ask the worker to wind down without waiting for it.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Stop the scan: set the flag, join the worker (which issues the
    /// best-effort StopDiscovery), drop the signal subscriptions.
    pub async fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                debug!("scan worker join failed: {err}");
            }
        }
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
    }

    /// Whether the worker has finished (duration elapsed or stopped).
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
        let Some(worker) = self.worker.take() else {
            // stop() already joined it.
            return;
        };
        // Join the worker so discovery has been stopped by the time the
        // handle is gone. Blocking in place needs the multi-thread
        // runtime; without one (runtime teardown, current-thread tests)
        // the worker finishes detached within one poll interval.
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                if let Err(err) = tokio::task::block_in_place(|| handle.block_on(worker)) {
                    debug!("scan worker join failed: {err}");
                }
            }
            _ => debug!("no multi-thread runtime at scan drop, worker detaches"),
        }
    }
}

/// Start a discovery cycle. `duration` of zero scans until `stop()`.
pub async fn start(system: &Arc<System>, duration: Duration) -> Result<ScanHandle, BusError> {
    let view = DiscoveredView::new();
    let stop = Arc::new(AtomicBool::new(false));

    // Seed the view from the current object tree.
    let objects = system.bus.get_managed_objects().await?;
    for (path, interfaces) in &objects {
        let Some(device_props) = interfaces.get(DEVICE_IFACE) else {
            continue;
        };
        if let Some(record) = synthesize_record(path.as_str(), device_props) {
            record.set_characteristics(reconcile::characteristics_under(&objects, path.as_str()));
            view.insert(Arc::new(record));
        }
    }

    let mut existing = view.macs();
    existing.sort();
    info!("scan seeded with {} known devices", existing.len());
    system
        .events
        .send(Event::ScanExistingDevices { devices: existing });

    // Keep the view fresh while the scan runs.
    let om = system.bus.object_manager().await?;
    let mut added = om.receive_interfaces_added().await?;
    let mut removed = om.receive_interfaces_removed().await?;
    let signal_view = view.clone();
    let signal_events = system.events.clone();
    let signal_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                signal = added.next() => {
                    let Some(signal) = signal else { break };
                    let Ok(args) = signal.args() else { continue };
                    on_view_added(&signal_view, &signal_events, args.object_path.as_str(), &args.interfaces);
                }
                signal = removed.next() => {
                    let Some(signal) = signal else { break };
                    let Ok(args) = signal.args() else { continue };
                    on_view_removed(&signal_view, &signal_events, args.object_path.as_str(), &args.interfaces);
                }
            }
        }
    });

    // Restart discovery so the adapter forgets what it has "recently
    // seen" and re-reports everything.
    let adapter = system.bus.adapter(&system.adapter_path).await?;
    if let Err(err) = system
        .bus
        .call("StopDiscovery", adapter.stop_discovery())
        .await
    {
        debug!("pre-scan StopDiscovery: {err}");
    }
    sleep(system.scan.settle()).await;
    if let Err(err) = system
        .bus
        .call("StartDiscovery", adapter.start_discovery())
        .await
    {
        // Keep the subscriptions: cached devices are still observable.
        warn!("StartDiscovery failed, relying on cached objects: {err}");
    } else {
        info!(
            "discovery started on {} ({})",
            system.adapter_path,
            if duration.is_zero() {
                "until stopped".to_string()
            } else {
                format!("{}s", duration.as_secs())
            }
        );
    }

    let worker_stop = stop.clone();
    let worker_bus: BusClient = system.bus.clone();
    let worker = tokio::spawn(async move {
        let started = Instant::now();
        loop {
            if worker_stop.load(Ordering::Relaxed) {
                break;
            }
            if !duration.is_zero() && started.elapsed() >= duration {
                break;
            }
            sleep(STOP_POLL).await;
        }
        if let Err(err) = worker_bus
            .call("StopDiscovery", adapter.stop_discovery())
            .await
        {
            debug!("post-scan StopDiscovery: {err}");
        }
        debug!("scan worker exited after {:?}", started.elapsed());
    });

    Ok(ScanHandle {
        view,
        stop,
        worker: Some(worker),
        signal_task: Some(signal_task),
    })
}

/// Build a view record from one device object's properties.
fn synthesize_record(path: &str, props: &PropMap) -> Option<DeviceRecord> {
    let mac = props::string_prop(props, "Address")
        .and_then(|a| mac::normalize(&a))
        .or_else(|| mac::from_object_path(path))?;

    let record = DeviceRecord::new(mac);
    record.set_object_path(path);
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
    Some(record)
}

fn on_view_added(
    view: &DiscoveredView,
    events: &EventSender,
    path: &str,
    interfaces: &InterfaceMap,
) {
    if let Some(device_props) = interfaces.get(DEVICE_IFACE) {
        if let Some(record) = synthesize_record(path, device_props) {
            let mac = record.mac().to_string();
            let name = record.name();
            let rssi = record.rssi();
            view.insert(Arc::new(record));
            debug!("scan: device {mac} appeared at {path}");
            events.send(Event::ScanAddedDevice {
                device_mac: mac,
                name,
                rssi,
            });
        }
        return;
    }

    // A characteristic object showing up attaches to its device by
    // path prefix.
    if let Some(chr_props) = interfaces.get(CHARACTERISTIC_IFACE) {
        let Some(mac) = mac::from_object_path(path) else {
            return;
        };
        let Some(record) = view.get(&mac) else {
            return;
        };
        if let Some(uuid) = props::string_prop(chr_props, "UUID") {
            record.insert_characteristic(uuid, path);
        }
    }
}

fn on_view_removed(
    view: &DiscoveredView,
    events: &EventSender,
    path: &str,
    interfaces: &[String],
) {
    if !interfaces.iter().any(|iface| iface == DEVICE_IFACE) {
        return;
    }
    let Some(mac) = mac::from_object_path(path) else {
        return;
    };
    if view.remove(&mac).is_some() {
        debug!("scan: device {mac} vanished");
        events.send(Event::ScanRemovedDevice { device_mac: mac });
    }
}
