//! BlueZ system-bus access: connection handle, proxy definitions,
//! property-map decoding and the error taxonomy.

mod client;
mod error;
pub mod props;
pub mod proxies;

pub use client::{BusClient, DEFAULT_CALL_TIMEOUT};
pub use error::{BusError, BusErrorKind};
