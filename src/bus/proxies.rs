//! D-Bus proxy trait definitions for BlueZ interfaces.
//!
//! These traits are used by the zbus `#[proxy]` macro to generate
//! async proxy types for communicating with BlueZ over the **system**
//! bus. Signal arguments use owned types so handler tasks can keep them
//! past the lifetime of the incoming message.

use std::collections::HashMap;
use zbus::proxy;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

/// Well-known bus name of the BlueZ daemon.
pub const BLUEZ_SERVICE: &str = "org.bluez";

/// Interface implemented by remote device objects.
pub const DEVICE_IFACE: &str = "org.bluez.Device1";

/// Interface implemented by the local adapter object.
pub const ADAPTER_IFACE: &str = "org.bluez.Adapter1";

/// Interface implemented by GATT characteristic objects.
pub const CHARACTERISTIC_IFACE: &str = "org.bluez.GattCharacteristic1";

/// A single object's properties for one interface: `{ property → value }`.
pub type PropMap = HashMap<String, OwnedValue>;

/// Interfaces carried by one object: `{ interface → { property → value } }`.
pub type InterfaceMap = HashMap<String, PropMap>;

/// The object-manager snapshot: `{ path → { interface → { property → value } } }`.
pub type ManagedObjects = HashMap<OwnedObjectPath, InterfaceMap>;

/// Proxy for org.bluez.Adapter1 (the local controller, e.g. hci0).
#[proxy(interface = "org.bluez.Adapter1", default_service = "org.bluez")]
pub trait Adapter1 {
    /// Start scanning for nearby devices.
    fn start_discovery(&self) -> zbus::Result<()>;

    /// Stop an ongoing discovery session.
    fn stop_discovery(&self) -> zbus::Result<()>;

    /// Whether the adapter is powered on.
    #[zbus(property)]
    fn powered(&self) -> zbus::Result<bool>;

    /// Whether the adapter is currently discovering.
    #[zbus(property)]
    fn discovering(&self) -> zbus::Result<bool>;
}

/// Proxy for org.bluez.Device1 (a remote peripheral).
#[proxy(interface = "org.bluez.Device1", default_service = "org.bluez")]
pub trait Device1 {
    /// Connect all auto-connectable profiles.
    fn connect(&self) -> zbus::Result<()>;

    /// Disconnect all profiles and the underlying link.
    fn disconnect(&self) -> zbus::Result<()>;

    /// Initiate pairing.
    fn pair(&self) -> zbus::Result<()>;

    /// Cancel an in-progress pairing attempt.
    fn cancel_pairing(&self) -> zbus::Result<()>;

    /// Bluetooth address, e.g. "38:39:8F:82:18:7E".
    #[zbus(property)]
    fn address(&self) -> zbus::Result<String>;

    /// Remote device name (absent for anonymous advertisers).
    #[zbus(property)]
    fn name(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn connected(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn paired(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn trusted(&self) -> zbus::Result<bool>;

    /// Mark the device trusted so the stack auto-accepts its connections.
    #[zbus(property)]
    fn set_trusted(&self, trusted: bool) -> zbus::Result<()>;

    /// Whether GATT service discovery has completed for this connection.
    #[zbus(property)]
    fn services_resolved(&self) -> zbus::Result<bool>;
}

/// Proxy for org.bluez.GattCharacteristic1.
#[proxy(
    interface = "org.bluez.GattCharacteristic1",
    default_service = "org.bluez"
)]
pub trait GattCharacteristic1 {
    /// Read the characteristic value.
    fn read_value(&self, options: HashMap<&str, Value<'_>>) -> zbus::Result<Vec<u8>>;

    /// Write the characteristic value. `options` may carry
    /// `type: "request"` (acknowledged) or `type: "command"`.
    fn write_value(&self, value: &[u8], options: HashMap<&str, Value<'_>>) -> zbus::Result<()>;

    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> zbus::Result<String>;
}

/// Proxy for org.freedesktop.DBus.ObjectManager on the BlueZ root.
///
/// Used to snapshot the object tree and to receive
/// InterfacesAdded/InterfacesRemoved for live updates.
#[proxy(
    interface = "org.freedesktop.DBus.ObjectManager",
    default_service = "org.bluez",
    default_path = "/"
)]
pub trait ObjectManager {
    /// Get all managed objects with their interfaces and properties.
    fn get_managed_objects(&self) -> zbus::Result<ManagedObjects>;

    /// Signal: new interfaces appeared on an object.
    #[zbus(signal)]
    fn interfaces_added(
        &self,
        object_path: OwnedObjectPath,
        interfaces: InterfaceMap,
    ) -> zbus::Result<()>;

    /// Signal: interfaces were removed from an object.
    #[zbus(signal)]
    fn interfaces_removed(
        &self,
        object_path: OwnedObjectPath,
        interfaces: Vec<String>,
    ) -> zbus::Result<()>;
}

/// Proxy for org.freedesktop.DBus.Properties on a BlueZ object.
///
/// Each registered device keeps one of these alive; its
/// PropertiesChanged stream is the authoritative completion signal for
/// connect/pair operations.
#[proxy(
    interface = "org.freedesktop.DBus.Properties",
    default_service = "org.bluez"
)]
pub trait Properties {
    /// Read one property of `interface_name`.
    fn get(&self, interface_name: &str, property_name: &str) -> zbus::Result<OwnedValue>;

    /// Write one property of `interface_name`.
    fn set(
        &self,
        interface_name: &str,
        property_name: &str,
        value: Value<'_>,
    ) -> zbus::Result<()>;

    /// Signal: properties changed on this object.
    #[zbus(signal)]
    fn properties_changed(
        &self,
        interface_name: String,
        changed_properties: PropMap,
        invalidated_properties: Vec<String>,
    ) -> zbus::Result<()>;
}
