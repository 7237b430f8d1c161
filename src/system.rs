//! The daemon's shared aggregate.
//!
//! One [`System`] holds the bus client, the device registry, the
//! outbound event sender and the tuning knobs. It is created once at
//! startup and passed explicitly as `Arc<System>`; long-lived tasks
//! hold it weakly so shutdown is just dropping the last strong
//! reference.

use std::sync::Arc;

use crate::bus::{BusClient, BusError};
use crate::config::{Config, LifecycleConfig, ScanConfig};
use crate::device::DeviceRegistry;
use crate::events::EventSender;

pub struct System {
    pub bus: BusClient,
    pub registry: DeviceRegistry,
    pub events: EventSender,
    /// Object path of the adapter used for discovery.
    pub adapter_path: String,
    pub lifecycle: LifecycleConfig,
    pub scan: ScanConfig,
}

impl System {
    /// Connect to the system bus and assemble the aggregate.
    pub async fn connect(config: &Config, events: EventSender) -> Result<Arc<Self>, BusError> {
        let bus = BusClient::system(config.lifecycle.timeout()).await?;
        Ok(Arc::new(Self {
            bus,
            registry: DeviceRegistry::new(),
            events,
            adapter_path: config.adapter.path.clone(),
            lifecycle: config.lifecycle.clone(),
            scan: config.scan.clone(),
        }))
    }

    /// Assemble around an existing bus client (tests use a private bus).
    pub fn with_bus(bus: BusClient, config: &Config, events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            bus,
            registry: DeviceRegistry::new(),
            events,
            adapter_path: config.adapter.path.clone(),
            lifecycle: config.lifecycle.clone(),
            scan: config.scan.clone(),
        })
    }
}
