//! Outbound event surface.
//!
//! Everything the daemon tells the control plane goes through one
//! [`Event`] enum, serialized as a JSON object keyed on `type` and
//! wrapped in an envelope carrying `origin: "ble_handler"`. Producers
//! push events into an unbounded channel; the MQTT transport drains it.
//! No lock is ever held while sending.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::device::DeviceSnapshot;

/// `origin` field stamped on every outbound payload.
pub const ORIGIN: &str = "ble_handler";

/// A service-data advertisement payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceData {
    pub uuid: String,
    /// Space-separated lowercase hex, e.g. `"01 02 03"`.
    pub data: String,
}

/// Outbound events, keyed on the serialized `type` field.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    DeviceAdded {
        device_mac: String,
        name: String,
        discovered: bool,
        connected: bool,
        paired: bool,
        trusted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DeviceRemoved {
        device_mac: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A lifecycle flag changed; only the flags that moved are present.
    /// Failed connect/pair commands answer with `error` set.
    DeviceUpdate {
        device_mac: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        discovered: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        connected: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        paired: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        trusted: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DeviceBroadcast {
        device_mac: String,
        service_data: ServiceData,
    },
    ReadCharacteristic {
        device_mac: String,
        uuid: String,
        /// Lowercase hex without separators.
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    WriteCharacteristic {
        device_mac: String,
        uuid: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ScanExistingDevices {
        devices: Vec<String>,
    },
    ScanAddedDevice {
        device_mac: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        rssi: Option<i16>,
    },
    ScanRemovedDevice {
        device_mac: String,
    },
}

#[derive(Serialize)]
struct Envelope<'a> {
    origin: &'static str,
    #[serde(flatten)]
    event: &'a Event,
}

impl Event {
    pub fn device_added(snapshot: &DeviceSnapshot) -> Self {
        Event::DeviceAdded {
            device_mac: snapshot.mac.clone(),
            name: snapshot.name.clone(),
            discovered: snapshot.discovered,
            connected: snapshot.connected,
            paired: snapshot.paired,
            trusted: snapshot.trusted,
            error: None,
        }
    }

    pub fn device_added_error(mac: &str, error: &str) -> Self {
        Event::DeviceAdded {
            device_mac: mac.to_string(),
            name: String::new(),
            discovered: false,
            connected: false,
            paired: false,
            trusted: false,
            error: Some(error.to_string()),
        }
    }

    pub fn device_removed(mac: &str) -> Self {
        Event::DeviceRemoved {
            device_mac: mac.to_string(),
            error: None,
        }
    }

    pub fn device_removed_error(mac: &str, error: &str) -> Self {
        Event::DeviceRemoved {
            device_mac: mac.to_string(),
            error: Some(error.to_string()),
        }
    }

    /// An update carrying only the discovery flag.
    pub fn discovered_update(mac: &str, discovered: bool) -> Self {
        Event::DeviceUpdate {
            device_mac: mac.to_string(),
            discovered: Some(discovered),
            connected: None,
            paired: None,
            trusted: None,
            error: None,
        }
    }

    /// A failed lifecycle command, answered on the update channel.
    pub fn device_update_error(mac: &str, error: &str) -> Self {
        Event::DeviceUpdate {
            device_mac: mac.to_string(),
            discovered: None,
            connected: None,
            paired: None,
            trusted: None,
            error: Some(error.to_string()),
        }
    }

    pub fn device_broadcast(mac: &str, uuid: &str, payload: &[u8]) -> Self {
        Event::DeviceBroadcast {
            device_mac: mac.to_string(),
            service_data: ServiceData {
                uuid: uuid.to_string(),
                data: spaced_hex(payload),
            },
        }
    }

    /// Serialize with the `origin` envelope for the wire.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&Envelope {
            origin: ORIGIN,
            event: self,
        })
    }
}

/// Space-separated lowercase hex ("01 02 03"); empty input yields "".
pub fn spaced_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cloneable sending half of the outbound event channel.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Queue an event for publication. A closed channel (shutdown in
    /// progress) drops the event with a debug note.
    pub fn send(&self, event: Event) {
        if self.tx.send(event).is_err() {
            debug!("event channel closed, dropping outbound event");
        }
    }
}

/// Create the outbound event channel.
pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}
