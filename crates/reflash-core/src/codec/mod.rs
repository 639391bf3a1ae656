//! LZ-style compression codec for loader write frames
//!
//! The stream is a sequence of groups: one mask byte followed by up to
//! eight tokens. Mask bits are read MSB first; a set bit marks a 2-byte
//! back-reference, a clear bit a literal byte.
//!
//! ```text
//! back-reference:  LLLL OOOO  OOOO OOOO
//!                  L = length - 3 (3..=17), O = offset - 1 (1..=4096)
//! ```
//!
//! The stream is zero-padded to a multiple of four bytes. Decoding needs the
//! uncompressed length, since padding is indistinguishable from literals.

mod lz;
mod worker;

use std::time::Duration;

use thiserror::Error;

pub use lz::{compress, decompress, max_compressed_len};
pub use worker::{CompressionJob, Compressor};

/// Back-reference window in bytes
pub const WINDOW_SIZE: usize = 4096;
/// Shortest back-reference worth encoding
pub const MIN_MATCH: usize = 3;
/// Longest back-reference the encoder emits
pub const MAX_MATCH: usize = 17;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Nothing to compress")]
    EmptyInput,

    #[error("A compression job is already outstanding")]
    Busy,

    #[error("Range 0x{offset:X}+0x{length:X} exceeds buffer of 0x{available:X} bytes")]
    OutOfRange {
        offset: usize,
        length: usize,
        available: usize,
    },

    #[error("Compressed output exceeded {limit} bytes")]
    Overrun { limit: usize },

    #[error("Compression cancelled")]
    Cancelled,

    #[error("Compression did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Compression worker failed: {0}")]
    WorkerFailed(String),

    #[error("Compressed stream truncated at byte {offset}")]
    Truncated { offset: usize },

    #[error("Back-reference at byte {offset} reaches {distance} bytes back, only {available} decoded")]
    InvalidBackReference {
        offset: usize,
        distance: usize,
        available: usize,
    },

    #[error("Back-reference at byte {offset} runs past the expected {expected} bytes")]
    LengthExceeded { offset: usize, expected: usize },
}
