//! Transport layer for diagnostic communication
//!
//! The physical CAN adapters (J2534, SocketCAN, ELM327, Kvaser, ...) live
//! outside this workspace and plug in through [`TransportAdapter`]. This
//! module only carries the trait and a scripted mock for tests.
//!
//! # Example
//!
//! ```ignore
//! use reflash_uds::transport::{mock::MockTransportAdapter, TransportAdapter};
//!
//! let transport = MockTransportAdapter::new(&Default::default());
//! let response = transport.send_receive(&[0x1A, 0xC1], Duration::from_secs(1)).await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;

pub use adapter::{AddressInfo, TransportAdapter};
pub use error::TransportError;
