//! In-process mock of the BlueZ object tree for integration tests.
//!
//! A peer-to-peer zbus connection pair stands in for the system bus:
//! the server side serves ObjectManager, Adapter1, Device1 and
//! GattCharacteristic1 implementations, the client side is wrapped in
//! the daemon's own `BusClient`. Every method and property-set the mock
//! receives is recorded in a [`CallLog`] so tests can assert what
//! actually reached the stack, and property flips are emitted as real
//! `PropertiesChanged` signals.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio::sync::mpsc::UnboundedReceiver;
use zbus::interface;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

use bluehub::bus::BusClient;
use bluehub::config::Config;
use bluehub::events::Event;
use bluehub::system::System;

pub const ADAPTER_PATH: &str = "/org/bluez/hci0";

/// Log of method calls and property writes the mock stack received.
#[derive(Clone, Default)]
pub struct CallLog {
    inner: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn record(&self, call: impl Into<String>) {
        self.inner.lock().push(call.into());
    }

    pub fn count(&self, call: &str) -> usize {
        self.inner.lock().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn contains(&self, call: &str) -> bool {
        self.count(call) > 0
    }
}

/// Plain property values the object tree can describe.
#[derive(Clone)]
pub enum PropValue {
    Bool(bool),
    Str(String),
    I16(i16),
}

impl PropValue {
    fn to_variant(&self) -> OwnedValue {
        let value = match self {
            PropValue::Bool(b) => Value::from(*b),
            PropValue::Str(s) => Value::from(s.clone()),
            PropValue::I16(i) => Value::from(*i),
        };
        value.try_to_owned().expect("plain values clone")
    }
}

type ObjectSpec = HashMap<String, HashMap<String, PropValue>>;
type VariantInterfaces = HashMap<String, HashMap<String, OwnedValue>>;

/// The object tree `GetManagedObjects` serves.
#[derive(Clone, Default)]
pub struct Tree {
    inner: Arc<Mutex<BTreeMap<String, ObjectSpec>>>,
}

impl Tree {
    pub fn insert(&self, path: &str, iface: &str, props: Vec<(&str, PropValue)>) {
        let mut inner = self.inner.lock();
        let object = inner.entry(path.to_string()).or_default();
        object.insert(
            iface.to_string(),
            props
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        );
    }

    pub fn remove(&self, path: &str) {
        self.inner.lock().remove(path);
    }

    fn variants_of(spec: &ObjectSpec) -> VariantInterfaces {
        spec.iter()
            .map(|(iface, props)| {
                (
                    iface.clone(),
                    props
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_variant()))
                        .collect(),
                )
            })
            .collect()
    }

    /// The `InterfacesAdded` payload for one object.
    pub fn interfaces_of(&self, path: &str) -> VariantInterfaces {
        self.inner
            .lock()
            .get(path)
            .map(Self::variants_of)
            .unwrap_or_default()
    }

    fn managed_objects(&self) -> HashMap<OwnedObjectPath, VariantInterfaces> {
        self.inner
            .lock()
            .iter()
            .map(|(path, spec)| {
                (
                    OwnedObjectPath::try_from(path.clone()).expect("valid object path"),
                    Self::variants_of(spec),
                )
            })
            .collect()
    }
}

struct MockObjectManager {
    tree: Tree,
}

#[interface(name = "org.freedesktop.DBus.ObjectManager")]
impl MockObjectManager {
    fn get_managed_objects(&self) -> HashMap<OwnedObjectPath, VariantInterfaces> {
        self.tree.managed_objects()
    }

    #[zbus(signal)]
    async fn interfaces_added(
        emitter: &SignalEmitter<'_>,
        object_path: OwnedObjectPath,
        interfaces: VariantInterfaces,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn interfaces_removed(
        emitter: &SignalEmitter<'_>,
        object_path: OwnedObjectPath,
        interfaces: Vec<String>,
    ) -> zbus::Result<()>;
}

struct MockAdapter {
    calls: CallLog,
}

#[interface(name = "org.bluez.Adapter1")]
impl MockAdapter {
    fn start_discovery(&self) {
        self.calls.record("StartDiscovery");
    }

    fn stop_discovery(&self) {
        self.calls.record("StopDiscovery");
    }

    #[zbus(property)]
    fn powered(&self) -> bool {
        true
    }

    #[zbus(property)]
    fn discovering(&self) -> bool {
        false
    }
}

pub struct MockDevice {
    pub address: String,
    pub name: String,
    pub connected: bool,
    pub paired: bool,
    pub trusted: bool,
    pub services_resolved: bool,
    calls: CallLog,
}

#[interface(name = "org.bluez.Device1")]
impl MockDevice {
    fn connect(&self) {
        self.calls.record("Connect");
    }

    fn disconnect(&self) {
        self.calls.record("Disconnect");
    }

    fn pair(&self) {
        self.calls.record("Pair");
    }

    fn cancel_pairing(&self) {
        self.calls.record("CancelPairing");
    }

    #[zbus(property)]
    fn address(&self) -> String {
        self.address.clone()
    }

    #[zbus(property)]
    fn name(&self) -> String {
        self.name.clone()
    }

    #[zbus(property)]
    fn connected(&self) -> bool {
        self.connected
    }

    #[zbus(property)]
    fn paired(&self) -> bool {
        self.paired
    }

    #[zbus(property)]
    fn trusted(&self) -> bool {
        self.trusted
    }

    #[zbus(property)]
    fn set_trusted(&mut self, trusted: bool) {
        self.calls.record("SetTrusted");
        self.trusted = trusted;
    }

    #[zbus(property)]
    fn services_resolved(&self) -> bool {
        self.services_resolved
    }
}

pub struct MockCharacteristic {
    uuid: String,
    pub value: Vec<u8>,
    calls: CallLog,
}

#[interface(name = "org.bluez.GattCharacteristic1")]
impl MockCharacteristic {
    fn read_value(&self, _options: HashMap<String, OwnedValue>) -> Vec<u8> {
        self.calls.record("ReadValue");
        self.value.clone()
    }

    fn write_value(&mut self, value: Vec<u8>, _options: HashMap<String, OwnedValue>) {
        self.calls.record("WriteValue");
        self.value = value;
    }

    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.uuid.clone()
    }
}

/// One mock stack plus a `System` wired to it over a private bus.
pub struct MockBus {
    pub server: zbus::Connection,
    pub system: Arc<System>,
    pub events: UnboundedReceiver<Event>,
    pub calls: CallLog,
    pub tree: Tree,
}

impl MockBus {
    pub async fn start() -> Self {
        let (client_stream, server_stream) = UnixStream::pair().expect("socket pair");
        let calls = CallLog::default();
        let tree = Tree::default();
        tree.insert(
            ADAPTER_PATH,
            "org.bluez.Adapter1",
            vec![("Powered", PropValue::Bool(true))],
        );

        let server_fut = zbus::connection::Builder::unix_stream(server_stream)
            .server(zbus::Guid::generate())
            .expect("server guid")
            .p2p()
            .serve_at("/", MockObjectManager { tree: tree.clone() })
            .expect("serve object manager")
            .serve_at(ADAPTER_PATH, MockAdapter { calls: calls.clone() })
            .expect("serve adapter")
            .build();

        let client_fut = zbus::connection::Builder::unix_stream(client_stream)
            .p2p()
            .build();

        let (server, client) = tokio::join!(server_fut, client_fut);
        let server = server.expect("server connection");
        let client = client.expect("client connection");

        let (events_tx, events_rx) = bluehub::events::channel();
        let bus = BusClient::from_connection(client, Duration::from_secs(2));
        let system = System::with_bus(bus, &Config::default(), events_tx);

        Self {
            server,
            system,
            events: events_rx,
            calls,
            tree,
        }
    }

    pub fn device_path(mac: &str) -> String {
        format!("{ADAPTER_PATH}/dev_{}", mac.replace(':', "_"))
    }

    /// Serve a device object and record it in the managed-objects tree.
    pub async fn add_device(&self, mac: &str, name: &str) -> String {
        let path = Self::device_path(mac);
        let device = MockDevice {
            address: mac.to_string(),
            name: name.to_string(),
            connected: false,
            paired: false,
            trusted: false,
            services_resolved: false,
            calls: self.calls.clone(),
        };
        self.server
            .object_server()
            .at(path.as_str(), device)
            .await
            .expect("serve device");
        self.tree.insert(
            &path,
            "org.bluez.Device1",
            vec![
                ("Address", PropValue::Str(mac.to_string())),
                ("Name", PropValue::Str(name.to_string())),
                ("Connected", PropValue::Bool(false)),
                ("Paired", PropValue::Bool(false)),
                ("Trusted", PropValue::Bool(false)),
                ("RSSI", PropValue::I16(-60)),
            ],
        );
        path
    }

    /// Serve a characteristic under a device, e.g. with segment
    /// `"service0021/char0025"`.
    pub async fn add_characteristic(
        &self,
        device_path: &str,
        segment: &str,
        uuid: &str,
        value: Vec<u8>,
    ) -> String {
        let path = format!("{device_path}/{segment}");
        let chr = MockCharacteristic {
            uuid: uuid.to_string(),
            value,
            calls: self.calls.clone(),
        };
        self.server
            .object_server()
            .at(path.as_str(), chr)
            .await
            .expect("serve characteristic");
        self.tree.insert(
            &path,
            "org.bluez.GattCharacteristic1",
            vec![("UUID", PropValue::Str(uuid.to_string()))],
        );
        path
    }

    /// Flip `Connected` server-side and emit the PropertiesChanged.
    pub async fn set_device_connected(&self, path: &str, connected: bool) {
        let iface = self
            .server
            .object_server()
            .interface::<_, MockDevice>(path)
            .await
            .expect("device interface");
        let mut device = iface.get_mut().await;
        device.connected = connected;
        device
            .connected_changed(iface.signal_emitter())
            .await
            .expect("emit Connected change");
    }

    /// Re-emit the current `Trusted` value as a PropertiesChanged.
    /// Harmless when the object server already announced it: repeated
    /// values are deduplicated by the reconciliation handler.
    pub async fn emit_device_trusted(&self, path: &str) {
        let iface = self
            .server
            .object_server()
            .interface::<_, MockDevice>(path)
            .await
            .expect("device interface");
        let device = iface.get().await;
        device
            .trusted_changed(iface.signal_emitter())
            .await
            .expect("emit Trusted change");
    }

    /// Flip `Paired` server-side and emit the PropertiesChanged.
    pub async fn set_device_paired(&self, path: &str, paired: bool) {
        let iface = self
            .server
            .object_server()
            .interface::<_, MockDevice>(path)
            .await
            .expect("device interface");
        let mut device = iface.get_mut().await;
        device.paired = paired;
        device
            .paired_changed(iface.signal_emitter())
            .await
            .expect("emit Paired change");
    }

    /// Flip `ServicesResolved` server-side and emit the PropertiesChanged.
    pub async fn set_services_resolved(&self, path: &str, resolved: bool) {
        let iface = self
            .server
            .object_server()
            .interface::<_, MockDevice>(path)
            .await
            .expect("device interface");
        let mut device = iface.get_mut().await;
        device.services_resolved = resolved;
        device
            .services_resolved_changed(iface.signal_emitter())
            .await
            .expect("emit ServicesResolved change");
    }

    /// Announce an object through `InterfacesAdded`, as the stack does
    /// when an advertisement arrives mid-scan.
    pub async fn announce(&self, path: &str) {
        let emitter = SignalEmitter::new(&self.server, "/").expect("root emitter");
        MockObjectManager::interfaces_added(
            &emitter,
            OwnedObjectPath::try_from(path.to_string()).expect("valid object path"),
            self.tree.interfaces_of(path),
        )
        .await
        .expect("emit InterfacesAdded");
    }

    /// Drop an object from the tree and emit `InterfacesRemoved`.
    pub async fn vanish_device(&self, path: &str) {
        self.tree.remove(path);
        let emitter = SignalEmitter::new(&self.server, "/").expect("root emitter");
        MockObjectManager::interfaces_removed(
            &emitter,
            OwnedObjectPath::try_from(path.to_string()).expect("valid object path"),
            vec!["org.bluez.Device1".to_string()],
        )
        .await
        .expect("emit InterfacesRemoved");
    }
}

/// Receive the next outbound event or panic after a bounded wait.
pub async fn next_event(rx: &mut UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Drain events until one matches, panicking after a bounded wait.
pub async fn expect_event<F>(rx: &mut UnboundedReceiver<Event>, pred: F) -> Event
where
    F: Fn(&Event) -> bool,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

/// Poll a condition until it holds, panicking after a bounded wait.
pub async fn wait_until<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not met within 3s");
}
