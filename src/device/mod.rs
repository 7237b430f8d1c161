//! Device records and the process-wide registry.

mod record;
mod registry;

pub use record::{DeviceRecord, DeviceSnapshot};
pub use registry::{add_device, remove_device, DeviceRegistry};
