//! open-mouse-core: vendor protocol adapters, device connections, and macro
//! capture and playback for gaming mice.
//!
//! Devices are matched against a [`registry::Registry`] of descriptors, each
//! naming a protocol family (Razer, Logitech HID++ or a generic report scheme).
//! A [`connection::ConnectionManager`] probes them over HID and runs one worker
//! per device that serializes commands and recovers from failures.

pub mod comm;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
#[cfg(test)]
mod integration_tests;
pub mod macros;
pub mod profile;
pub mod protocol;
pub mod registry;
pub mod safety;
pub mod transport;

pub use config::{CoreConfig, CoreContext};
pub use connection::{ConnectionManager, ConnectionMetrics, ConnectionState, StateEvent};
pub use coordinator::CommandFuture;
pub use error::{Error, ErrorContext, Result};
pub use protocol::{Adapter, Capability, CommandResult, CommandStatus, ProtocolCommand};
pub use registry::{DeviceDescriptor, DeviceId, EnumeratedDevice, Registry};
