//! reflash-sim - simulated ECU for reflashing tests
//!
//! [`SimulatedEcu`] implements [`reflash_uds::TransportAdapter`] in-process.
//! It starts in boot ROM mode, accepts a loader upload after security
//! access, and then answers the loader's services against an in-memory
//! flash laid out by the target's partition table. [`FaultPlan`] injects
//! the failures the engine has to survive.

mod ecu;
pub mod faults;
mod memory;
mod protocol;

pub use ecu::{EcuMode, EcuRecord, SimulatedEcu, BOOT_IDENTITY};
pub use faults::FaultPlan;
pub use memory::{Memory, RAM_BASE, RAM_SIZE};
