//! reflash-core - ECU reflashing engine
//!
//! Reprograms engine-control-unit firmware through a secondary loader that
//! is uploaded into the ECU's RAM during bring-up. Only partitions whose
//! contents differ from the image are erased and rewritten, compressed
//! where possible and verified by hash afterwards.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Reflasher                         │
//! │                                                          │
//! │  SessionBringup ──► FlashOrchestrator ──► teardown       │
//! │   (keys)        │    (codec, frames, mask)               │
//! │                 └─► DumpReader                           │
//! │                                                          │
//! │        Heartbeat · EventSink · RetryPolicy               │
//! └──────────────────────────┬───────────────────────────────┘
//!                            │
//!                ┌───────────┴───────────┐
//!                │      UdsService       │
//!                └───────────────────────┘
//! ```
//!
//! Targets are described by data ([`TargetDescriptor`]), not by type: the
//! E39 and E78 variants differ only in their partition tables, identifiers
//! and feature flags.

pub mod bringup;
pub mod codec;
pub mod dump;
pub mod error;
pub mod event;
pub mod flash;
pub mod heartbeat;
pub mod image;
pub mod keys;
pub mod reflasher;
pub mod retry;
pub mod settings;
pub mod target;

pub use bringup::{BringupError, BringupStep, SessionBringup, SessionState};
pub use codec::{compress, decompress, CodecError, CompressionJob, Compressor};
pub use dump::{BlockSource, DumpError, DumpReader, ReadOptions};
pub use error::{FailureKind, ReflashError, Result};
pub use event::{EventSink, ProgressTracker, ReflashEvent};
pub use flash::{FlashError, FlashOrchestrator, FlashOutcome, Interlock};
pub use heartbeat::Heartbeat;
pub use image::{write_dump, FirmwareImage};
pub use keys::{derive_key, KeyFamily};
pub use reflasher::Reflasher;
pub use retry::RetryPolicy;
pub use settings::{ConfigError, ReflashSettings};
pub use target::{Partition, TargetDescriptor, TargetError, TargetId, VerifyStrategy};
