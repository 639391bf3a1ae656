//! Partition-aware flash writer
//!
//! One pass over a firmware image:
//!
//! 1. check the hardware ID
//! 2. hash every candidate partition on both sides, collecting a diff mask
//! 3. `(diff | force) & !lock`, then the protected-partition interlock
//! 4. one erase call for the whole mask
//! 5. stream each partition in chunks, compressing chunk N+1 while chunk N
//!    is on the wire, falling back to raw blocks for good on any codec error
//! 6. re-hash each partition; on mismatch erase and rewrite it once, raw
//!
//! Teardown is left to the caller so it happens on every exit path.

mod frames;
mod mask;

use std::ops::Range;

use bytes::Bytes;
use reflash_uds::uds::{positive_response_id, transfer_sub_function};
use reflash_uds::{AddressWidth, UdsError, UdsService};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::codec::{CodecError, CompressionJob, Compressor};
use crate::dump::{DumpError, DumpReader, ReadOptions};
use crate::error::{classify_uds, FailureKind};
use crate::event::{EventSink, ProgressTracker};
use crate::heartbeat::Heartbeat;
use crate::image::{sha256, FirmwareImage};
use crate::settings::ReflashSettings;
use crate::target::{Partition, TargetDescriptor, TargetError, VerifyStrategy};

pub use frames::{build_frames, next_step, Frame, FIRST_PAYLOAD, NEXT_PAYLOAD};
pub use mask::{apply_interlock, combine, Interlock};

#[derive(Debug, Error, Clone)]
pub enum FlashError {
    #[error("Invalid target description: {0}")]
    InvalidTarget(#[from] TargetError),

    #[error("Image is 0x{actual:X} bytes, target expects 0x{expected:X}")]
    ImageSize { expected: usize, actual: usize },

    #[error("Hardware ID could not be read: {0}")]
    HardwareIdUnreadable(UdsError),

    #[error("Hardware ID 0x{found:08X} does not match 0x{expected:08X}")]
    HardwareMismatch { expected: u32, found: u32 },

    #[error("Partition {index} range is out of bounds")]
    PartitionOutOfBounds { index: u8 },

    #[error("Erase of mask 0x{mask:08X} failed: {source}")]
    EraseFailed {
        mask: u32,
        #[source]
        source: UdsError,
    },

    #[error("Erase of mask 0x{mask:08X} rejected with status {status:?}")]
    EraseRejected { mask: u32, status: Option<u8> },

    #[error("ECU reported a programming failure at 0x{address:08X}")]
    ProgrammingFailure { address: u32 },

    #[error("Compressed transfer at 0x{address:08X} failed after {attempts} attempts: {source}")]
    Transfer {
        address: u32,
        attempts: u32,
        #[source]
        source: UdsError,
    },

    #[error("Raw write at 0x{address:08X} failed: {source}")]
    RawWrite {
        address: u32,
        #[source]
        source: UdsError,
    },

    #[error("Partition {index} failed verification twice")]
    VerificationFailed { index: u8 },
}

impl FlashError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidTarget(_)
            | Self::ImageSize { .. }
            | Self::HardwareMismatch { .. }
            | Self::PartitionOutOfBounds { .. }
            | Self::VerificationFailed { .. } => FailureKind::FatalData,
            Self::HardwareIdUnreadable(e) => classify_uds(e),
            // Anything after the erase stops the run
            Self::EraseFailed { .. }
            | Self::EraseRejected { .. }
            | Self::ProgrammingFailure { .. }
            | Self::Transfer { .. }
            | Self::RawWrite { .. } => FailureKind::FatalSession,
        }
    }
}

/// Result of one flash pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashOutcome {
    /// Partitions erased and written
    pub written_mask: u32,
    pub bytes_written: u64,
    /// Nothing differed; nothing was erased
    pub already_identical: bool,
    /// Protected partition differs but waits for a pass of its own
    pub deferred_protected: bool,
    /// Protected partition content carries a guard pattern and was skipped
    pub protected_guarded: bool,
    /// Compression was still enabled at the end of the pass
    pub compressed: bool,
}

fn is_programming_failure(error: &UdsError) -> bool {
    error.nrc().is_some_and(|nrc| nrc.is_programming_failure())
}

/// SHA-256 of a partition as computed by the ECU's hash routine
async fn remote_hash(
    uds: &UdsService,
    routine: u16,
    partition: &Partition,
) -> Result<[u8; 32], UdsError> {
    let mut params = Vec::with_capacity(8);
    params.extend_from_slice(&partition.phys_start.to_be_bytes());
    params.extend_from_slice(&partition.phys_end.to_be_bytes());

    let status = uds.routine_control_start(routine, &params).await?;
    if status.first() != Some(&0) {
        return Err(UdsError::InvalidResponse(format!(
            "hash routine status {:02X?}",
            status
        )));
    }

    let result = uds.routine_control_result(routine).await?;
    result
        .get(..32)
        .and_then(|hash| <[u8; 32]>::try_from(hash).ok())
        .ok_or_else(|| UdsError::InvalidResponse("hash result too short".to_string()))
}

pub struct FlashOrchestrator<'a> {
    uds: &'a UdsService,
    target: &'a TargetDescriptor,
    settings: &'a ReflashSettings,
    heartbeat: &'a mut Heartbeat,
    events: &'a EventSink,
    compressor: Compressor,
    compression: bool,
}

impl<'a> FlashOrchestrator<'a> {
    pub fn new(
        uds: &'a UdsService,
        target: &'a TargetDescriptor,
        settings: &'a ReflashSettings,
        heartbeat: &'a mut Heartbeat,
        events: &'a EventSink,
    ) -> Self {
        Self {
            uds,
            target,
            settings,
            heartbeat,
            events,
            compressor: Compressor::new(),
            compression: settings.transfer.compression && target.compressed_write,
        }
    }

    pub fn with_compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression
    }

    /// Run one flash pass
    pub async fn run(
        &mut self,
        image: &FirmwareImage,
        force_mask: u32,
        lock_mask: u32,
    ) -> Result<FlashOutcome, FlashError> {
        let target = self.target;
        target.validate()?;
        if image.len() != target.image_len {
            return Err(FlashError::ImageSize {
                expected: target.image_len,
                actual: image.len(),
            });
        }

        self.check_hardware().await?;

        self.events.info("Comparing partitions");
        let diff = self.diff(image).await;
        let combined = combine(diff, force_mask, lock_mask) & target.writable_mask();
        let (mask, interlock) =
            apply_interlock(combined, target.protected_bit(), self.guard_hit(image));
        info!(
            diff = format!("0x{:08X}", diff),
            mask = format!("0x{:08X}", mask),
            ?interlock,
            "Partition mask"
        );

        let mut outcome = FlashOutcome {
            deferred_protected: interlock == Interlock::Deferred,
            protected_guarded: interlock == Interlock::Guarded,
            ..Default::default()
        };
        match interlock {
            Interlock::Deferred => self.events.info(
                "Protected partition held back; flash the same image again after this pass",
            ),
            Interlock::Guarded => self
                .events
                .info("Protected partition content carries a guard pattern; not writing it"),
            Interlock::Included | Interlock::NotSelected => {}
        }

        if mask == 0 {
            self.events.info("Already identical, nothing to write");
            outcome.already_identical = true;
            outcome.compressed = self.compression;
            return Ok(outcome);
        }

        // Every selected range must be sound before anything is erased
        let selected: Vec<&Partition> = target.selected(mask).collect();
        let mut total = 0u64;
        for p in &selected {
            let range = p
                .file_range(image.len())
                .ok_or(FlashError::PartitionOutOfBounds { index: p.index })?;
            total += range.len() as u64;
        }

        self.events
            .info(format!("Erasing partitions (mask 0x{:08X})", mask));
        self.erase(mask).await?;

        let mut progress = self.events.progress(total);
        progress.update(0);
        let mut done = 0u64;
        // First chunk of the next partition, compressed while the current one finishes
        let mut lookahead = None;

        for (i, &p) in selected.iter().enumerate() {
            let next = selected.get(i + 1).copied();
            let start = done;
            self.events
                .info(format!("Writing {} ({} bytes)", p.name, p.len()));
            self.write_partition(image, p, next, &mut lookahead, &mut done, &mut progress)
                .await?;

            if self.partition_matches(image, p, true).await {
                continue;
            }

            self.events.info(format!(
                "Verification of {} failed, rewriting uncompressed",
                p.name
            ));
            done = start;
            // Cancels the look-ahead job
            lookahead = None;
            if self.compression {
                self.compression = false;
                self.events
                    .info("Compression disabled for the rest of this run");
            }
            self.erase(p.bit()).await?;
            self.write_partition(image, p, next, &mut lookahead, &mut done, &mut progress)
                .await?;

            if !self.partition_matches(image, p, true).await {
                error!(partition = p.index, "Second verification failed");
                return Err(FlashError::VerificationFailed { index: p.index });
            }
        }

        progress.finish();
        self.events.info("Flash complete");

        outcome.written_mask = mask;
        outcome.bytes_written = done;
        outcome.compressed = self.compression;
        Ok(outcome)
    }

    /// Compare the masked hardware ID with the target's
    pub async fn check_hardware(&self) -> Result<u32, FlashError> {
        let raw = self
            .uds
            .read_data_by_id(self.target.hardware_id_did)
            .await
            .map_err(FlashError::HardwareIdUnreadable)?;
        let reported = raw
            .iter()
            .take(4)
            .fold(0u32, |acc, &b| acc << 8 | u32::from(b));

        if !self.target.hardware_matches(reported) {
            return Err(FlashError::HardwareMismatch {
                expected: self.target.hardware_id,
                found: reported,
            });
        }
        debug!(hardware_id = format!("0x{:08X}", reported), "Hardware ID matches");
        Ok(reported)
    }

    /// Mask of candidate partitions whose content differs from the image
    pub async fn diff(&mut self, image: &FirmwareImage) -> u32 {
        let target = self.target;
        let mut diff = 0;
        for p in target.candidates() {
            if !self.partition_matches(image, p, false).await {
                diff |= p.bit();
            }
        }
        diff
    }

    /// Compare the device hash of a partition with the image
    ///
    /// Anything that prevents a comparison counts as a difference.
    pub async fn partition_matches(
        &mut self,
        image: &FirmwareImage,
        partition: &Partition,
        quiet: bool,
    ) -> bool {
        let Some(range) = partition.file_range(image.len()) else {
            error!(partition = partition.index, "Partition range out of bounds");
            return false;
        };
        let local = sha256(&image.bytes()[range]);

        let remote = match self.target.verify {
            VerifyStrategy::RemoteHash => {
                let hash = remote_hash(self.uds, self.target.hash_routine, partition);
                self.heartbeat.during(hash).await.map_err(|e| e.to_string())
            }
            VerifyStrategy::ReadBack => self.read_back_hash(partition).await.map_err(|e| e.to_string()),
        };

        let matches = match remote {
            Ok(hash) => hash == local,
            Err(e) => {
                warn!(partition = partition.index, error = %e, "Partition hash unavailable");
                false
            }
        };

        if !matches && !quiet {
            self.events
                .info(format!("Partition {} differs", partition.name));
        }
        matches
    }

    async fn read_back_hash(&mut self, partition: &Partition) -> Result<[u8; 32], DumpError> {
        let t = &self.settings.transfer;
        let options = ReadOptions::variable(
            t.flash_read_block,
            t.flash_read_min_block,
            self.settings.retries.block_attempts,
        )
        .quiet();

        let data = DumpReader::new(self.uds, &mut *self.heartbeat, self.events)
            .read_range(partition.phys_start, partition.phys_end, &options)
            .await?;
        Ok(sha256(&data))
    }

    fn guard_hit(&self, image: &FirmwareImage) -> bool {
        let target = self.target;
        target
            .protected_partition
            .and_then(|index| target.partition(index))
            .and_then(|p| p.file_range(image.len()))
            .is_some_and(|range| {
                target
                    .guard_patterns
                    .iter()
                    .any(|pattern| image.contains(range.clone(), pattern))
            })
    }

    /// Erase every partition in `mask` with one routine call
    pub async fn erase(&mut self, mask: u32) -> Result<(), FlashError> {
        let mut params = Vec::with_capacity(8);
        params.extend_from_slice(&mask.to_be_bytes());
        params.extend_from_slice(&(!mask).to_be_bytes());

        let request = self
            .uds
            .routine_control_start(self.target.erase_routine, &params);
        let status = self
            .heartbeat
            .during(request)
            .await
            .map_err(|source| FlashError::EraseFailed { mask, source })?;

        match status.first() {
            Some(0) => {
                info!(mask = format!("0x{:08X}", mask), "Erase complete");
                Ok(())
            }
            other => Err(FlashError::EraseRejected {
                mask,
                status: other.copied(),
            }),
        }
    }

    fn chunks(
        &self,
        image: &FirmwareImage,
        partition: &Partition,
    ) -> Result<Vec<Range<usize>>, FlashError> {
        let range = partition
            .file_range(image.len())
            .ok_or(FlashError::PartitionOutOfBounds {
                index: partition.index,
            })?;
        let chunk_size = self.settings.transfer.chunk_size.max(1);
        Ok(range
            .clone()
            .step_by(chunk_size)
            .map(|start| start..(start + chunk_size).min(range.end))
            .collect())
    }

    /// Write one partition chunk by chunk
    ///
    /// `lookahead` holds the job for this partition's first chunk on entry
    /// and, with compression still on, the job for `next`'s first chunk on
    /// return.
    async fn write_partition(
        &mut self,
        image: &FirmwareImage,
        partition: &Partition,
        next: Option<&Partition>,
        lookahead: &mut Option<CompressionJob>,
        done: &mut u64,
        progress: &mut ProgressTracker,
    ) -> Result<(), FlashError> {
        let chunks = self.chunks(image, partition)?;
        let next_first = match next {
            Some(p) => self.chunks(image, p)?.into_iter().next(),
            None => None,
        };
        let bytes = image.bytes();

        let mut pending = lookahead.take();
        if self.compression && pending.is_none() {
            pending = chunks.first().and_then(|first| self.queue(bytes, first));
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let compressed = match pending.take() {
                Some(job) => match self.await_compression(job).await {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        self.disable_compression(&e);
                        None
                    }
                },
                None => None,
            };

            // Compress the next chunk while this one is on the wire
            if self.compression {
                match chunks.get(i + 1) {
                    Some(following) => pending = self.queue(bytes, following),
                    None => {
                        *lookahead = next_first
                            .as_ref()
                            .and_then(|first| self.queue(bytes, first))
                    }
                }
            }

            let address = partition.physical(chunk.start);
            match compressed {
                Some(payload) => {
                    self.send_compressed(address, chunk.len(), &payload)
                        .await?;
                    *done += chunk.len() as u64;
                    progress.update(*done);
                }
                None => {
                    self.send_raw(bytes, partition, chunk.clone(), done, progress)
                        .await?
                }
            }
        }

        Ok(())
    }

    fn queue(&mut self, bytes: &Bytes, chunk: &Range<usize>) -> Option<CompressionJob> {
        match self
            .compressor
            .compress_async(bytes, chunk.start, chunk.len())
        {
            Ok(job) => Some(job),
            Err(e) => {
                self.disable_compression(&e);
                None
            }
        }
    }

    fn disable_compression(&mut self, error: &CodecError) {
        warn!(error = %error, "Compression failed, falling back to raw transfer");
        self.compression = false;
        self.events.info(format!(
            "Compression failed ({}); continuing uncompressed",
            error
        ));
    }

    /// Wait for a compression job, keeping the session alive meanwhile
    async fn await_compression(&mut self, job: CompressionJob) -> Result<Vec<u8>, CodecError> {
        let retrieve = job.retrieve(self.settings.compression_timeout());
        self.heartbeat.during(retrieve).await
    }

    /// Send one compressed chunk, restarting from the first frame on error
    async fn send_compressed(
        &mut self,
        address: u32,
        final_len: usize,
        payload: &[u8],
    ) -> Result<(), FlashError> {
        let frames = build_frames(
            self.uds.service_ids().compressed_write,
            address,
            final_len as u32,
            payload,
        );
        let attempts = self.settings.retries.transfer_attempts.max(1);
        debug!(address, final_len, compressed = payload.len(), frames = frames.len(), "Compressed transfer");

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_frames(&frames).await {
                Ok(()) => return Ok(()),
                Err(e) if is_programming_failure(&e) => {
                    error!(address, "Programming failure reported");
                    return Err(FlashError::ProgrammingFailure { address });
                }
                Err(source) if attempt >= attempts => {
                    return Err(FlashError::Transfer {
                        address,
                        attempts,
                        source,
                    })
                }
                Err(e) => {
                    warn!(address, attempt, error = %e, "Transfer failed, restarting from the first frame")
                }
            }
        }
    }

    async fn send_frames(&mut self, frames: &[Frame]) -> Result<(), UdsError> {
        let ack = positive_response_id(self.uds.service_ids().compressed_write);
        for frame in frames {
            let response = self.heartbeat.during(self.uds.request(&frame.bytes)).await?;
            if response.len() < 2 || response[0] != ack || response[1] != frame.step {
                return Err(UdsError::InvalidResponse(format!(
                    "frame {} acknowledged with {:02X?}",
                    frame.step, response
                )));
            }
        }
        Ok(())
    }

    /// Write a chunk as raw blocks, skipping blocks that are all 0xFF
    async fn send_raw(
        &mut self,
        bytes: &Bytes,
        partition: &Partition,
        chunk: Range<usize>,
        done: &mut u64,
        progress: &mut ProgressTracker,
    ) -> Result<(), FlashError> {
        let policy = self.settings.block_retry();
        let block = self.settings.transfer.raw_block_size.max(1);
        let uds = self.uds;

        for start in chunk.clone().step_by(block) {
            let data = &bytes[start..(start + block).min(chunk.end)];

            // Erased flash already reads as 0xFF
            if data.iter().any(|&b| b != 0xFF) {
                let address = partition.physical(start);
                let write = policy.run_until(
                    move |_| {
                        uds.transfer_data(
                            transfer_sub_function::DOWNLOAD,
                            address,
                            AddressWidth::Bits32,
                            data,
                        )
                    },
                    is_programming_failure,
                );
                self.heartbeat
                    .during(write)
                    .await
                    .map_err(|source| FlashError::RawWrite { address, source })?;
            }

            *done += data.len() as u64;
            progress.update(*done);
        }

        Ok(())
    }
}
