//! The link loop.
//!
//! Given the current registry, make sure every recorded device is
//! discovered, connected and paired: scan until each registered MAC
//! shows up in the discovered view (or the scan budget runs out), merge
//! the view into the registry, reinstall the per-device watches and
//! drive connect/pair on whatever is still down.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::bus::BusError;
use crate::lifecycle::{self, OpOptions};
use crate::scan;
use crate::signals;
use crate::system::System;

/// Cadence of the "is everyone visible yet" check.
const LINK_POLL: Duration = Duration::from_millis(200);

/// Grace period for signals still in flight once the last expected
/// device shows up.
const SETTLE_GRACE: Duration = Duration::from_millis(500);

/// Run one link pass over every registered device.
pub async fn link_devices(system: &Arc<System>, max_scan: Duration) -> Result<(), BusError> {
    let targets = system.registry.macs();
    if targets.is_empty() {
        debug!("link: no devices registered, skipping scan");
        return Ok(());
    }

    info!("link: scanning for {} registered devices", targets.len());
    let mut scan = scan::start(system, max_scan).await?;

    loop {
        if targets.iter().all(|mac| scan.view().contains(mac)) {
            debug!("link: all registered devices visible");
            sleep(SETTLE_GRACE).await;
            break;
        }
        if scan.is_finished() {
            debug!("link: scan budget elapsed");
            break;
        }
        sleep(LINK_POLL).await;
    }
    scan.stop().await;

    for mac in &targets {
        let Some(record) = system.registry.get(mac) else {
            // Removed while we were scanning.
            continue;
        };
        let Some(found) = scan.view().get(mac) else {
            warn!("link: {mac} was not discovered");
            continue;
        };

        record.set_object_path(found.object_path());
        record.set_name(found.name());
        record.set_connected(found.connected());
        record.set_paired(found.paired());
        record.set_trusted(found.trusted());
        if let Some(rssi) = found.rssi() {
            record.set_rssi(rssi);
        }
        record.set_characteristics(found.characteristics());
        record.set_discovered(true);

        if let Err(err) = signals::install_device_watch(system, &record).await {
            warn!("link: watch install for {mac} failed: {err}");
            continue;
        }

        let opts = OpOptions::from_config(&system.lifecycle);
        if !record.connected() {
            if let Err(err) = lifecycle::connect(system, &record, opts).await {
                warn!("link: connect {mac}: {err}");
            }
        }
        if !record.paired() {
            if let Err(err) = lifecycle::pair(system, &record, opts).await {
                warn!("link: pair {mac}: {err}");
            }
        }
    }

    info!("link pass complete");
    Ok(())
}
