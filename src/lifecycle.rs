//! Connect, pair and disconnect operations.
//!
//! Bus method returns are advisory: the stack may acknowledge a
//! `Connect` before the link is actually up, or fail it while the link
//! comes up anyway. The only portable completion signal is the property
//! flip delivered through the per-device subscription, so every
//! operation polls the record flag the reconciliation handler sets.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::bus::{BusError, BusErrorKind};
use crate::config::LifecycleConfig;
use crate::device::DeviceRecord;
use crate::reconcile;
use crate::system::System;

/// Cadence at which operations re-check the signal-driven flags.
const FLAG_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("device {mac} is not discovered")]
    NotDiscovered { mac: String },

    #[error("device {mac} disappeared from the bus")]
    DeviceGone { mac: String },

    #[error("{op} on {mac} gave up after {attempts} attempts")]
    RetriesExhausted {
        op: &'static str,
        mac: String,
        attempts: u32,
    },

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Retry budget for one operation.
#[derive(Debug, Clone, Copy)]
pub struct OpOptions {
    pub max_retries: u32,
    pub timeout: Duration,
}

impl Default for OpOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(8),
        }
    }
}

impl OpOptions {
    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            timeout: config.timeout(),
        }
    }

    /// One attempt, as used by the command surface.
    pub fn single(config: &LifecycleConfig) -> Self {
        Self {
            max_retries: 1,
            timeout: config.timeout(),
        }
    }
}

/// Connect to a device and refresh its characteristic table.
///
/// Already-connected devices return success without issuing `Connect`.
pub async fn connect(
    system: &System,
    record: &DeviceRecord,
    opts: OpOptions,
) -> Result<(), LifecycleError> {
    let mac = record.mac().to_string();
    let path = discovered_path(record)?;

    if record.connected() {
        return Ok(());
    }

    let device = system.bus.device(&path).await?;
    let attempts = opts.max_retries.max(1);

    for attempt in 1..=attempts {
        if record.connected() {
            break;
        }

        match system
            .bus
            .call_with_timeout("Connect", opts.timeout, device.connect())
            .await
        {
            Ok(()) => {}
            Err(err) if err.kind() == BusErrorKind::UnknownObject => {
                record.reset_presence();
                return Err(LifecycleError::DeviceGone { mac });
            }
            Err(err)
                if matches!(
                    err.kind(),
                    BusErrorKind::NotReady | BusErrorKind::NotAuthorized
                ) =>
            {
                // Not retryable; surface to the caller.
                return Err(err.into());
            }
            // The signal decides; a failed return may still connect.
            Err(err) => debug!("Connect attempt {attempt} on {mac}: {err}"),
        }

        if wait_for_flag(record, DeviceRecord::connected, opts.timeout).await {
            break;
        }

        warn!("Connect attempt {attempt}/{attempts} on {mac} timed out");
        if attempt < attempts {
            sleep(system.lifecycle.backoff()).await;
            // Reset the peer so the next attempt starts clean.
            if let Err(err) = system
                .bus
                .call_with_timeout("Disconnect", opts.timeout, device.disconnect())
                .await
            {
                debug!("reset Disconnect on {mac}: {err}");
            }
        }
    }

    if !record.connected() {
        return Err(LifecycleError::RetriesExhausted {
            op: "Connect",
            mac,
            attempts,
        });
    }

    info!("{mac} connected");
    if let Err(err) = reconcile::refresh_characteristics(system, record).await {
        warn!("characteristic refresh after connect on {mac}: {err}");
    }
    Ok(())
}

/// Pair with a device, then mark it trusted.
pub async fn pair(
    system: &System,
    record: &DeviceRecord,
    opts: OpOptions,
) -> Result<(), LifecycleError> {
    let mac = record.mac().to_string();
    let path = discovered_path(record)?;

    let device = system.bus.device(&path).await?;
    let attempts = opts.max_retries.max(1);

    if record.paired() {
        ensure_trusted(system, record, &device, &mac).await;
        return Ok(());
    }

    for attempt in 1..=attempts {
        if record.paired() {
            break;
        }

        match system
            .bus
            .call_with_timeout("Pair", opts.timeout, device.pair())
            .await
        {
            Ok(()) => {}
            Err(err) if err.kind() == BusErrorKind::UnknownObject => {
                record.reset_presence();
                return Err(LifecycleError::DeviceGone { mac });
            }
            Err(err) if err.kind() == BusErrorKind::InProgress => {
                debug!("pairing already in flight on {mac}, cancelling: {err}");
                if let Err(err) = system
                    .bus
                    .call_with_timeout("CancelPairing", opts.timeout, device.cancel_pairing())
                    .await
                {
                    debug!("CancelPairing on {mac}: {err}");
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    BusErrorKind::NotReady | BusErrorKind::NotAuthorized
                ) =>
            {
                // Not retryable; surface to the caller.
                return Err(err.into());
            }
            Err(err) => debug!("Pair attempt {attempt} on {mac}: {err}"),
        }

        if wait_for_flag(record, DeviceRecord::paired, opts.timeout).await {
            break;
        }

        warn!("Pair attempt {attempt}/{attempts} on {mac} timed out");
        if attempt < attempts {
            sleep(system.lifecycle.backoff()).await;
        }
    }

    if !record.paired() {
        return Err(LifecycleError::RetriesExhausted {
            op: "Pair",
            mac,
            attempts,
        });
    }

    info!("{mac} paired");
    ensure_trusted(system, record, &device, &mac).await;
    Ok(())
}

/// Disconnect a device. Single attempt; the `connected:false` update is
/// published by the reconciliation handler when the flip arrives, so
/// this does not wait for it.
pub async fn disconnect(system: &System, record: &DeviceRecord) -> Result<(), LifecycleError> {
    let mac = record.mac().to_string();
    let path = record.object_path();
    if path.is_empty() {
        return Err(LifecycleError::NotDiscovered { mac });
    }

    let device = system.bus.device(&path).await?;
    match system.bus.call("Disconnect", device.disconnect()).await {
        Ok(()) => {
            info!("{mac} disconnect requested");
            Ok(())
        }
        Err(err) if err.kind() == BusErrorKind::UnknownObject => {
            record.reset_presence();
            Err(LifecycleError::DeviceGone { mac })
        }
        Err(err) => Err(err.into()),
    }
}

fn discovered_path(record: &DeviceRecord) -> Result<String, LifecycleError> {
    let path = record.object_path();
    if path.is_empty() || !record.has_watch() {
        return Err(LifecycleError::NotDiscovered {
            mac: record.mac().to_string(),
        });
    }
    Ok(path)
}

/// Poll a signal-driven flag until it goes up or the budget runs out.
async fn wait_for_flag(
    record: &DeviceRecord,
    flag: fn(&DeviceRecord) -> bool,
    budget: Duration,
) -> bool {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        if flag(record) {
            return true;
        }
        sleep(FLAG_POLL).await;
    }
    flag(record)
}

async fn ensure_trusted(
    system: &System,
    record: &DeviceRecord,
    device: &crate::bus::proxies::Device1Proxy<'_>,
    mac: &str,
) {
    if record.trusted() {
        return;
    }
    if let Err(err) = system.bus.call("Set Trusted", device.set_trusted(true)).await {
        warn!("failed to trust {mac}: {err}");
    }
}
