//! Shared system-bus connection and proxy construction.
//!
//! One [`BusClient`] is created at startup and shared by reference
//! through the [`System`](crate::system::System) aggregate. zbus runs
//! the connection's I/O in its own task; everything here is cheap
//! handle construction plus a local deadline around each method call.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;
use zbus::zvariant::Value;
use zbus::{proxy::CacheProperties, Connection};

use super::error::BusError;
use super::proxies::{
    Adapter1Proxy, Device1Proxy, GattCharacteristic1Proxy, ManagedObjects, ObjectManagerProxy,
    PropertiesProxy,
};

/// Default per-call deadline; BlueZ method calls that hang longer than
/// this are treated as [`BusErrorKind::Timeout`](super::BusErrorKind::Timeout).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(8);

/// A handle to the system bus, scoped to the BlueZ service.
#[derive(Clone)]
pub struct BusClient {
    conn: Connection,
    call_timeout: Duration,
}

impl BusClient {
    /// Open a connection to the system bus.
    pub async fn system(call_timeout: Duration) -> Result<Self, BusError> {
        let conn = Connection::system().await.map_err(BusError::from)?;
        debug!("system bus connection established");
        Ok(Self { conn, call_timeout })
    }

    /// Wrap an existing connection (used by tests against a private bus).
    pub fn from_connection(conn: Connection, call_timeout: Duration) -> Self {
        Self { conn, call_timeout }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Proxy to the object-manager root (`/` on org.bluez).
    pub async fn object_manager(&self) -> Result<ObjectManagerProxy<'static>, BusError> {
        Ok(ObjectManagerProxy::new(&self.conn).await?)
    }

    /// Proxy to an adapter object, e.g. `/org/bluez/hci0`.
    pub async fn adapter(&self, path: &str) -> Result<Adapter1Proxy<'static>, BusError> {
        Ok(Adapter1Proxy::builder(&self.conn)
            .path(path.to_owned())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?)
    }

    /// Proxy to a device object.
    pub async fn device(&self, path: &str) -> Result<Device1Proxy<'static>, BusError> {
        Ok(Device1Proxy::builder(&self.conn)
            .path(path.to_owned())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?)
    }

    /// Proxy to a GATT characteristic object.
    pub async fn characteristic(
        &self,
        path: &str,
    ) -> Result<GattCharacteristic1Proxy<'static>, BusError> {
        Ok(GattCharacteristic1Proxy::builder(&self.conn)
            .path(path.to_owned())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?)
    }

    /// Properties proxy for an object; its PropertiesChanged stream is
    /// the per-device signal subscription.
    pub async fn properties(&self, path: &str) -> Result<PropertiesProxy<'static>, BusError> {
        Ok(PropertiesProxy::builder(&self.conn)
            .path(path.to_owned())?
            .build()
            .await?)
    }

    /// Snapshot the full object tree.
    pub async fn get_managed_objects(&self) -> Result<ManagedObjects, BusError> {
        let om = self.object_manager().await?;
        self.call("GetManagedObjects", om.get_managed_objects())
            .await
    }

    /// Read one property of a remote interface.
    pub async fn get_property(
        &self,
        path: &str,
        iface: &str,
        name: &str,
    ) -> Result<zbus::zvariant::OwnedValue, BusError> {
        let props = self.properties(path).await?;
        self.call(name, props.get(iface, name)).await
    }

    /// Write one property of a remote interface.
    pub async fn set_property(
        &self,
        path: &str,
        iface: &str,
        name: &str,
        value: Value<'_>,
    ) -> Result<(), BusError> {
        let props = self.properties(path).await?;
        self.call(name, props.set(iface, name, value)).await
    }

    /// Run a proxy method call under the client's deadline.
    pub async fn call<T, F>(&self, context: &str, fut: F) -> Result<T, BusError>
    where
        F: Future<Output = zbus::Result<T>>,
    {
        self.call_with_timeout(context, self.call_timeout, fut).await
    }

    /// Run a proxy method call under an explicit deadline.
    pub async fn call_with_timeout<T, F>(
        &self,
        context: &str,
        budget: Duration,
        fut: F,
    ) -> Result<T, BusError>
    where
        F: Future<Output = zbus::Result<T>>,
    {
        match timeout(budget, fut).await {
            Ok(result) => result.map_err(BusError::from),
            Err(_) => Err(BusError::timeout(context)),
        }
    }
}
