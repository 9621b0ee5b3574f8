//! Attaching pod sandboxes to the podnet dataplane.
//!
//! An ADD allocates the pod an address, wires a veth pair between the
//! sandbox and the host, installs the pod's routes and neighbor entries,
//! publishes the pair into the dataplane maps and makes sure the tc programs
//! are attached to the host peer and the overlay tunnel. A DEL releases the
//! address and removes the host peer.
//!
//! | Module | Contents |
//! |---|---|
//! | [`cni`] | network configuration, `CNI_ARGS`, results and error codes |
//! | [`naming`] | deterministic interface and program names |
//! | [`netops`] | the [`NetworkOps`] seam and its iproute2 implementation |
//! | [`orchestrator`] | the ADD and DEL sequences |

pub mod cni;
pub mod error;
pub mod naming;
pub mod netops;
pub mod orchestrator;

#[cfg(test)]
mod orchestrator_test;

pub use cni::{CniError, CniResult, Command, NetConf, PodArgs, VersionResult};
pub use error::{AttachError, NetError};
pub use naming::host_veth_name;
pub use netops::{Direction, LinkInfo, LinuxNetwork, NetworkOps, Route};
#[cfg(any(test, feature = "test-util"))]
pub use netops::RecordingNetwork;
pub use orchestrator::{AddressAllocator, AttachConfig, AttachRequest, Attachment, Orchestrator};
