//! End-to-end tests for the reflashing engine
//!
//! Every test drives `reflash-core` against the in-process ECU from
//! `reflash-sim`: a boot ROM that accepts the loader upload, and the loader
//! that then serves hashes, erases, compressed and raw writes and memory
//! reads. No hardware or CAN interface is involved.
//!
//! # Test Structure
//!
//! - `bringup_test.rs` - Loader bring-up, session recovery and teardown
//! - `flash_test.rs` - Partition selection, interlocks, fallbacks and verification
//! - `dump_test.rs` - Flash and RAM dumps, dump files and read-back verification
//!
//! ```bash
//! cargo test -p reflash-tests
//! ```

// This crate only contains tests, no library code
