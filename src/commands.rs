//! Inbound command surface.
//!
//! Commands arrive as JSON documents keyed on `command`. Dispatch
//! parses on the ingress callback and moves every verb onto a worker
//! task, so a slow connect or read never blocks the transport's poll
//! loop. Every well-formed command ends in an outbound event; failures
//! carry an `error` field instead of panicking.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};
use zbus::zvariant::Value;

use crate::device::{self, DeviceRecord};
use crate::events::Event;
use crate::lifecycle::{self, OpOptions};
use crate::mac;
use crate::system::System;

/// Inbound verbs.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    AddDevices {
        mac: Vec<String>,
    },
    RemoveDevices {
        mac: Vec<String>,
    },
    ConnectDevice {
        mac: String,
    },
    PairDevice {
        mac: String,
    },
    ReadCharacteristic {
        mac: String,
        uuid: String,
    },
    WriteCharacteristic {
        mac: String,
        uuid: String,
        /// Payload as lowercase hex without separators.
        value: String,
        #[serde(rename = "type", default)]
        write_type: WriteType,
    },
    Print,
}

/// GATT write mode, `type` on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteType {
    /// Acknowledged write.
    #[default]
    Request,
    /// Write without response.
    Command,
}

impl WriteType {
    fn as_str(self) -> &'static str {
        match self {
            WriteType::Request => "request",
            WriteType::Command => "command",
        }
    }
}

/// Parse an inbound payload and run the verb on a worker task.
///
/// Unparseable documents are logged and dropped: there is no verb to
/// attribute an error event to.
pub fn dispatch(system: &Arc<System>, payload: &[u8]) {
    let command = match serde_json::from_slice::<Command>(payload) {
        Ok(command) => command,
        Err(err) => {
            warn!("dropping unparseable command: {err}");
            return;
        }
    };

    debug!("dispatching {command:?}");
    let system = system.clone();
    tokio::spawn(async move {
        run(&system, command).await;
    });
}

async fn run(system: &Arc<System>, command: Command) {
    match command {
        Command::AddDevices { mac } => {
            for mac in mac {
                device::add_device(system, &mac).await;
            }
        }
        Command::RemoveDevices { mac } => {
            for mac in mac {
                device::remove_device(system, &mac).await;
            }
        }
        Command::ConnectDevice { mac } => connect_device(system, &mac).await,
        Command::PairDevice { mac } => pair_device(system, &mac).await,
        Command::ReadCharacteristic { mac, uuid } => {
            read_characteristic(system, &mac, &uuid).await
        }
        Command::WriteCharacteristic {
            mac,
            uuid,
            value,
            write_type,
        } => write_characteristic(system, &mac, &uuid, &value, write_type).await,
        Command::Print => print_registry(system),
    }
}

/// Look a command's target up by MAC, answering with an error event
/// through `on_missing` when it is not registered.
fn resolve_device(
    system: &System,
    mac_input: &str,
    on_missing: impl Fn(&str, &str) -> Event,
) -> Option<(String, Arc<DeviceRecord>)> {
    let Some(mac) = mac::normalize(mac_input) else {
        system.events.send(on_missing(mac_input, "invalid MAC address"));
        return None;
    };
    match system.registry.get(&mac) {
        Some(record) => Some((mac, record)),
        None => {
            system.events.send(on_missing(&mac, "Device not found"));
            None
        }
    }
}

async fn connect_device(system: &Arc<System>, mac_input: &str) {
    let Some((mac, record)) = resolve_device(system, mac_input, Event::device_update_error)
    else {
        return;
    };
    // Success is announced by the reconciliation handler when the
    // Connected flip lands.
    if let Err(err) =
        lifecycle::connect(system, &record, OpOptions::single(&system.lifecycle)).await
    {
        warn!("connect_device {mac}: {err}");
        system
            .events
            .send(Event::device_update_error(&mac, &err.to_string()));
    }
}

async fn pair_device(system: &Arc<System>, mac_input: &str) {
    let Some((mac, record)) = resolve_device(system, mac_input, Event::device_update_error)
    else {
        return;
    };
    if let Err(err) = lifecycle::pair(system, &record, OpOptions::single(&system.lifecycle)).await
    {
        warn!("pair_device {mac}: {err}");
        system
            .events
            .send(Event::device_update_error(&mac, &err.to_string()));
    }
}

async fn read_characteristic(system: &Arc<System>, mac_input: &str, uuid: &str) {
    let read_error = |mac: &str, error: &str| Event::ReadCharacteristic {
        device_mac: mac.to_string(),
        uuid: uuid.to_string(),
        data: None,
        error: Some(error.to_string()),
    };

    let Some((mac, record)) = resolve_device(system, mac_input, read_error) else {
        return;
    };
    let Some(path) = record.characteristic_path(uuid) else {
        system
            .events
            .send(read_error(&mac, "characteristic not resolved"));
        return;
    };

    let result = match system.bus.characteristic(&path).await {
        Ok(chr) => {
            system
                .bus
                .call("ReadValue", chr.read_value(HashMap::new()))
                .await
        }
        Err(err) => Err(err),
    };

    match result {
        Ok(bytes) => {
            debug!("read {} bytes from {uuid} on {mac}", bytes.len());
            system.events.send(Event::ReadCharacteristic {
                device_mac: mac,
                uuid: uuid.to_string(),
                data: Some(hex::encode(&bytes)),
                error: None,
            });
        }
        Err(err) => {
            warn!("read_characteristic {uuid} on {mac}: {err}");
            system.events.send(read_error(&mac, &err.to_string()));
        }
    }
}

async fn write_characteristic(
    system: &Arc<System>,
    mac_input: &str,
    uuid: &str,
    value: &str,
    write_type: WriteType,
) {
    let write_error = |mac: &str, error: &str| Event::WriteCharacteristic {
        device_mac: mac.to_string(),
        uuid: uuid.to_string(),
        error: Some(error.to_string()),
    };

    let Some((mac, record)) = resolve_device(system, mac_input, write_error) else {
        return;
    };
    let Ok(bytes) = hex::decode(value) else {
        system.events.send(write_error(&mac, "invalid hex payload"));
        return;
    };
    let Some(path) = record.characteristic_path(uuid) else {
        system
            .events
            .send(write_error(&mac, "characteristic not resolved"));
        return;
    };

    let options = HashMap::from([("type", Value::from(write_type.as_str()))]);
    let result = match system.bus.characteristic(&path).await {
        Ok(chr) => {
            system
                .bus
                .call("WriteValue", chr.write_value(&bytes, options))
                .await
        }
        Err(err) => Err(err),
    };

    match result {
        Ok(()) => {
            debug!("wrote {} bytes to {uuid} on {mac}", bytes.len());
            system.events.send(Event::WriteCharacteristic {
                device_mac: mac,
                uuid: uuid.to_string(),
                error: None,
            });
        }
        Err(err) => {
            warn!("write_characteristic {uuid} on {mac}: {err}");
            system.events.send(write_error(&mac, &err.to_string()));
        }
    }
}

/// Diagnostic dump to the log; nothing goes out on the wire.
fn print_registry(system: &System) {
    let records = system.registry.records();
    info!("registry holds {} devices", records.len());
    for record in records {
        info!("  {:?}", record);
    }
}
