//! reflash-uds - diagnostic service layer for ECU reflashing
//!
//! This crate carries the request/response primitives the reflashing engine
//! speaks to an ECU: the standard bring-up services (session control,
//! security access, programming mode, download) and the services understood
//! by the secondary loader once it runs (memory read, hash and erase
//! routines, compressed write).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                UdsService                   │
//! │  request / response pending / checksums     │
//! │                     │                       │
//! │            ┌────────┴────────┐              │
//! │            │TransportAdapter │              │
//! │            │ (J2534/CAN/mock)│              │
//! │            └─────────────────┘              │
//! └─────────────────────────────────────────────┘
//! ```

pub mod checksum;
pub mod config;
pub mod transport;
pub mod uds;

pub use config::{MockConfig, ServiceOverrides};
pub use transport::{AddressInfo, TransportAdapter, TransportError};
pub use uds::{
    AddressWidth, MemoryBlock, NegativeResponseCode, ServiceIds, UdsError, UdsService,
};
