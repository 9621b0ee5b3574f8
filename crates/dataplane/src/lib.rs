//! Dataplane map protocol.
//!
//! The tc programs attached to pod veths and the overlay tunnel read three
//! pinned hash maps:
//!
//! | Map | Key | Value |
//! |---|---|---|
//! | `local_dev` | device role (`u32`) | ifindex (`u32`) |
//! | `local_pod_ips` | pod IPv4 (`u32`) | ifindex, host ifindex, pod MAC, host MAC (24 bytes) |
//! | `cluster_pod_ips` | pod IPv4 (`u32`) | node IPv4 (`u32`) |
//!
//! The layouts in [`records`] must match the programs byte for byte; there
//! is no versioning. [`DataplaneMaps`] opens the maps once and is passed to
//! whoever writes them.

pub mod error;
pub mod map;
pub mod maps;
pub mod records;

pub use error::DataplaneError;
pub use map::{MapBackend, PinnedMap};
#[cfg(any(test, feature = "test-util"))]
pub use map::MemoryMap;
pub use maps::{DEFAULT_PIN_DIR, DataplaneMaps};
pub use records::{DeviceRole, LocalPodValue, MacAddr};
