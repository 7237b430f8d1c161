//! Daemon wiring and lifecycle.
//!
//! Startup order matters: the root object-manager watch goes up before
//! any device is registered so an InterfacesAdded racing the first add
//! is not lost, then the configured devices are added, an initial link
//! pass runs in the background, and the MQTT transport takes over until
//! Ctrl-C.

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::BusError;
use crate::config::{Config, ConfigError};
use crate::device;
use crate::events;
use crate::link;
use crate::mqtt;
use crate::signals;
use crate::system::System;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Run the daemon until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<(), DaemonError> {
    let (events, events_rx) = events::channel();
    let system = System::connect(&config, events).await?;

    let root_watch = signals::run_root_watch(&system).await?;

    for mac in &config.devices {
        device::add_device(&system, mac).await;
    }
    info!("{} devices registered from config", system.registry.len());

    let link_task: JoinHandle<()> = {
        let system = system.clone();
        let max_scan = config.scan.duration();
        tokio::spawn(async move {
            if let Err(err) = link::link_devices(&system, max_scan).await {
                warn!("initial link pass failed: {err}");
            }
        })
    };

    let mqtt_task = tokio::spawn(mqtt::run(system.clone(), events_rx, config.mqtt.clone()));

    info!("bluehub running");
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
    }

    info!("shutting down");
    mqtt_task.abort();
    link_task.abort();
    root_watch.abort();

    // A scan interrupted mid-flight leaves discovery on; turn it off
    // best-effort before the connection goes away.
    match system.bus.adapter(&system.adapter_path).await {
        Ok(adapter) => {
            if let Err(err) = system
                .bus
                .call("StopDiscovery", adapter.stop_discovery())
                .await
            {
                debug!("shutdown StopDiscovery: {err}");
            }
        }
        Err(err) => debug!("shutdown: no adapter proxy: {err}"),
    }

    // Dropping the system tears down the registry and with it every
    // per-device watch task.
    drop(system);
    Ok(())
}
