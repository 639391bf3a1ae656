//! Single-slot background compression

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::lz::{encode, max_compressed_len};
use super::CodecError;

/// Starts compression jobs on a blocking worker, one at a time
///
/// The slot is held from [`compress_async`](Self::compress_async) until the
/// worker exits, so a job that was cancelled still occupies it until the
/// encoder notices the flag.
#[derive(Debug, Clone, Default)]
pub struct Compressor {
    busy: Arc<AtomicBool>,
    output_limit: Option<usize>,
}

impl Compressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the compressed size of every job
    ///
    /// Without a cap the worst-case encoded size of the input is used.
    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = Some(limit);
        self
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Queue `buffer[offset..offset + length]` for compression
    ///
    /// Fails immediately if a job is still outstanding. Must be called from
    /// within a Tokio runtime.
    pub fn compress_async(
        &self,
        buffer: &Bytes,
        offset: usize,
        length: usize,
    ) -> Result<CompressionJob, CodecError> {
        if length == 0 {
            return Err(CodecError::EmptyInput);
        }
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= buffer.len())
            .ok_or(CodecError::OutOfRange {
                offset,
                length,
                available: buffer.len(),
            })?;

        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CodecError::Busy);
        }

        let input = buffer.slice(offset..end);
        let limit = self
            .output_limit
            .unwrap_or_else(|| max_compressed_len(length));
        let cancel = Arc::new(AtomicBool::new(false));
        let slot = SlotGuard(self.busy.clone());
        let worker_cancel = cancel.clone();

        debug!(offset, length, "Compression job queued");
        let handle = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            encode(&input, limit, Some(&worker_cancel))
        });

        Ok(CompressionJob {
            handle: Some(handle),
            cancel,
            input_len: length,
        })
    }
}

/// Frees the compressor slot when the worker exits
struct SlotGuard(Arc<AtomicBool>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle to one outstanding compression
///
/// Dropping the handle without retrieving cancels the job.
#[derive(Debug)]
pub struct CompressionJob {
    handle: Option<JoinHandle<Result<Vec<u8>, CodecError>>>,
    cancel: Arc<AtomicBool>,
    input_len: usize,
}

impl CompressionJob {
    /// Uncompressed length of the job's input
    pub fn input_len(&self) -> usize {
        self.input_len
    }

    /// Wait for the compressed bytes
    ///
    /// A zero timeout waits without bound. On timeout the worker is told to
    /// stop, joined, and the job reports failure.
    pub async fn retrieve(mut self, timeout: Duration) -> Result<Vec<u8>, CodecError> {
        let Some(mut handle) = self.handle.take() else {
            return Err(CodecError::Cancelled);
        };

        let joined = if timeout.is_zero() {
            handle.await
        } else {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(?timeout, "Compression timed out, cancelling worker");
                    self.cancel.store(true, Ordering::Relaxed);
                    // The encoder checks the flag often; wait for it to let go of the slot
                    let _ = handle.await;
                    return Err(CodecError::Timeout(timeout));
                }
            }
        };

        let output = joined.map_err(|e| CodecError::WorkerFailed(e.to_string()))??;
        debug!(
            input = self.input_len,
            output = output.len(),
            "Compression job finished"
        );
        Ok(output)
    }
}

impl Drop for CompressionJob {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel.store(true, Ordering::Relaxed);
        }
    }
}
