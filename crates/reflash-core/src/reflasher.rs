//! One-device reflashing session
//!
//! [`Reflasher`] owns the diagnostic service, the keep-alive and the
//! bring-up state for a single ECU and sequences the engine's parts:
//! bring-up, then either a flash pass or dumps, then teardown.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use reflash_uds::{ServiceIds, TransportAdapter, UdsService};
use tracing::{info, warn};

use crate::bringup::{SessionBringup, SessionState};
use crate::dump::{DumpReader, ReadOptions};
use crate::error::Result;
use crate::event::EventSink;
use crate::flash::{FlashError, FlashOrchestrator, FlashOutcome};
use crate::heartbeat::Heartbeat;
use crate::image::{write_dump, FirmwareImage};
use crate::settings::ReflashSettings;
use crate::target::TargetDescriptor;

pub struct Reflasher {
    uds: UdsService,
    target: TargetDescriptor,
    settings: ReflashSettings,
    loader: Bytes,
    events: EventSink,
    bringup: SessionBringup,
    heartbeat: Heartbeat,
}

impl Reflasher {
    pub fn new(
        transport: Arc<dyn TransportAdapter>,
        target: TargetDescriptor,
        settings: ReflashSettings,
        loader: impl Into<Bytes>,
    ) -> Self {
        let uds = UdsService::with_service_ids(
            transport,
            ServiceIds::from_overrides(&target.services),
        )
        .with_timeout(settings.request_timeout())
        .with_pending_timeout(settings.response_pending_timeout())
        .with_keepalive(settings.heartbeat_interval());

        Self {
            bringup: SessionBringup::new(uds.clone(), target.clone(), settings.clone()),
            heartbeat: Heartbeat::new(uds.clone(), settings.heartbeat_interval()),
            uds,
            target,
            settings,
            loader: loader.into(),
            events: EventSink::disabled(),
        }
    }

    /// Route progress and info events to `events`
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        self.bringup.state()
    }

    pub fn uds(&self) -> &UdsService {
        &self.uds
    }

    /// Bring the loader up, or recover one that is already running
    ///
    /// A failed bring-up still leaves programming mode when it was entered.
    pub async fn connect(&mut self) -> Result<SessionState> {
        match self
            .bringup
            .start(&self.loader, &mut self.heartbeat, &self.events)
            .await
        {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(error = %e, "Bring-up failed");
                self.events.info(format!("Bring-up failed: {}", e));
                self.bringup.teardown(&self.events).await;
                Err(e.into())
            }
        }
    }

    /// Leave programming mode; false means the ECU needs a power-cycle
    pub async fn disconnect(&mut self) -> bool {
        self.bringup.teardown(&self.events).await
    }

    /// Bring-up, one flash pass, teardown
    ///
    /// Teardown runs on every exit path except a hardware mismatch on a
    /// recovered session: that loader is left running so the operator can
    /// retry with the right target.
    pub async fn flash(
        &mut self,
        image: &FirmwareImage,
        force_mask: u32,
        lock_mask: u32,
    ) -> Result<FlashOutcome> {
        self.connect().await?;

        let result = FlashOrchestrator::new(
            &self.uds,
            &self.target,
            &self.settings,
            &mut self.heartbeat,
            &self.events,
        )
        .run(image, force_mask, lock_mask)
        .await;

        let keep_loader = self.bringup.is_recovered()
            && matches!(result, Err(FlashError::HardwareMismatch { .. }));
        if keep_loader {
            warn!("Hardware mismatch on a recovered session, leaving the loader running");
            self.events
                .info("Hardware ID mismatch; loader left running, select the correct target");
        } else {
            self.disconnect().await;
        }

        match &result {
            Ok(outcome) => info!(
                mask = format!("0x{:08X}", outcome.written_mask),
                bytes = outcome.bytes_written,
                "Flash pass finished"
            ),
            Err(e) => self.events.info(format!("Flash failed: {}", e)),
        }
        result.map_err(Into::into)
    }

    /// Dump `[start, end)` of flash in 240-byte blocks, shrinking to 16 on error
    ///
    /// The session stays open for further reads; call [`disconnect`](Self::disconnect)
    /// when done.
    pub async fn read_flash(&mut self, start: u32, end: u32) -> Result<Vec<u8>> {
        let t = &self.settings.transfer;
        let options = ReadOptions::variable(
            t.flash_read_block,
            t.flash_read_min_block,
            self.settings.retries.block_attempts,
        );
        self.read(start, end, options).await
    }

    /// Dump `[start, end)` of RAM in fixed 16-byte blocks
    pub async fn read_ram(&mut self, start: u32, end: u32) -> Result<Vec<u8>> {
        let options = ReadOptions::fixed(
            self.settings.transfer.ram_read_block,
            self.settings.retries.block_attempts,
        );
        self.read(start, end, options).await
    }

    /// Dump flash to `path`, writing the `.sha256` sidecar next to it
    pub async fn dump_flash_to(
        &mut self,
        path: impl AsRef<Path>,
        start: u32,
        end: u32,
    ) -> Result<PathBuf> {
        let data = self.read_flash(start, end).await?;
        let sidecar = write_dump(path, &data)?;
        self.events
            .info(format!("Saved {} bytes, hash in {}", data.len(), sidecar.display()));
        Ok(sidecar)
    }

    async fn read(&mut self, start: u32, end: u32, options: ReadOptions) -> Result<Vec<u8>> {
        if !self.bringup.state().loader_active() {
            self.connect().await?;
        }

        self.events
            .info(format!("Reading 0x{:08X}..0x{:08X}", start, end));
        let data = DumpReader::new(&self.uds, &mut self.heartbeat, &self.events)
            .read_range(start, end, &options)
            .await;

        match data {
            Ok(data) => Ok(data),
            Err(e) => {
                self.events.info(format!("Read failed: {}", e));
                Err(e.into())
            }
        }
    }
}
