//! Retry-driven block reader
//!
//! Used for flash and RAM dumps and for read-back verification. Blocks are
//! read strictly in order; the keep-alive keeps running while a block is in
//! flight so a slow or failing range never starves the session.

use async_trait::async_trait;
use reflash_uds::{UdsError, UdsService};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::FailureKind;
use crate::event::EventSink;
use crate::heartbeat::Heartbeat;

/// Anything that can read `len` bytes at an address
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn read_block(&self, address: u32, len: usize) -> Result<Vec<u8>, UdsError>;
}

#[async_trait]
impl BlockSource for UdsService {
    async fn read_block(&self, address: u32, len: usize) -> Result<Vec<u8>, UdsError> {
        let wire_len = u16::try_from(len)
            .map_err(|_| UdsError::InvalidResponse(format!("block of {} bytes too large", len)))?;
        Ok(self.read_memory(address, wire_len).await?.into_bytes(len))
    }
}

#[derive(Debug, Error, Clone)]
pub enum DumpError {
    #[error("Invalid range 0x{start:X}..0x{end:X}")]
    InvalidRange { start: u32, end: u32 },

    #[error("Block at 0x{address:08X} failed after {attempts} attempts: {source}")]
    BlockFailed {
        address: u32,
        attempts: u32,
        #[source]
        source: UdsError,
    },
}

impl DumpError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidRange { .. } => FailureKind::FatalData,
            Self::BlockFailed { .. } => FailureKind::Transient,
        }
    }
}

/// Block sizing and retry bounds for one read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    pub block_size: usize,
    /// Reduced size a failed block is retried at once before it counts as a failure
    pub min_block_size: Option<usize>,
    /// Failures tolerated per block
    pub attempts: u32,
    /// Emit progress events
    pub report_progress: bool,
}

impl ReadOptions {
    /// Fixed-size blocks
    pub fn fixed(block_size: usize, attempts: u32) -> Self {
        Self {
            block_size,
            min_block_size: None,
            attempts,
            report_progress: true,
        }
    }

    /// Blocks that shrink to `min_block_size` after a failure
    pub fn variable(block_size: usize, min_block_size: usize, attempts: u32) -> Self {
        Self {
            min_block_size: Some(min_block_size),
            ..Self::fixed(block_size, attempts)
        }
    }

    pub fn quiet(mut self) -> Self {
        self.report_progress = false;
        self
    }
}

pub struct DumpReader<'a> {
    source: &'a dyn BlockSource,
    heartbeat: &'a mut Heartbeat,
    events: &'a EventSink,
}

impl<'a> DumpReader<'a> {
    pub fn new(
        source: &'a dyn BlockSource,
        heartbeat: &'a mut Heartbeat,
        events: &'a EventSink,
    ) -> Self {
        Self {
            source,
            heartbeat,
            events,
        }
    }

    /// Read `[start, end)` completely or fail
    ///
    /// Never returns a truncated buffer: either every byte was read or the
    /// whole range is reported as failed.
    pub async fn read_range(
        &mut self,
        start: u32,
        end: u32,
        options: &ReadOptions,
    ) -> Result<Vec<u8>, DumpError> {
        if start >= end || options.block_size == 0 {
            return Err(DumpError::InvalidRange { start, end });
        }

        let total = (end - start) as usize;
        let mut out = Vec::with_capacity(total);
        let mut progress = options
            .report_progress
            .then(|| self.events.progress(total as u64));
        let mut address = start;

        debug!(start, end, block = options.block_size, "Reading range");

        while address < end {
            let remaining = (end - address) as usize;
            let mut len = options.block_size.min(remaining);
            let mut failures = 0;

            let data = loop {
                let read = self.source.read_block(address, len);
                let error = match self.heartbeat.during(read).await {
                    Ok(data) if data.len() == len => break data,
                    Ok(data) => UdsError::InvalidResponse(format!(
                        "expected {} bytes, got {}",
                        len,
                        data.len()
                    )),
                    Err(e) => e,
                };

                if let Some(min) = options.min_block_size.filter(|&min| min > 0 && min < len) {
                    debug!(address, len, min, error = %error, "Block failed, retrying smaller");
                    len = min;
                    continue;
                }

                failures += 1;
                warn!(address, len, failures, error = %error, "Block read failed");
                if failures >= options.attempts.max(1) {
                    return Err(DumpError::BlockFailed {
                        address,
                        attempts: failures,
                        source: error,
                    });
                }
            };

            out.extend_from_slice(&data);
            address += len as u32;
            if let Some(progress) = progress.as_mut() {
                progress.update(out.len() as u64);
            }
        }

        Ok(out)
    }
}
