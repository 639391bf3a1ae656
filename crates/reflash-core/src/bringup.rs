//! Bootloader bring-up and teardown
//!
//! ```text
//!  NotStarted ──probe: signature──────────────► Recovered
//!      │
//!      └─ keep-alive, extended session, security access,
//!         disable comms, programmed state, programming mode,
//!         loader download + execute, probe ──────► LoaderRunning
//!
//!  LoaderRunning | Recovered ──return to normal──► NotStarted
//! ```

use std::time::Duration;

use reflash_uds::uds::{session_type, transfer_sub_function};
use reflash_uds::{UdsError, UdsService};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{classify_uds, FailureKind};
use crate::event::EventSink;
use crate::heartbeat::Heartbeat;
use crate::keys::derive_key;
use crate::retry::RetryPolicy;
use crate::settings::ReflashSettings;
use crate::target::TargetDescriptor;

/// Pause between identity probes while the loader starts
const PROBE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    LoaderRunning,
    /// A loader from an earlier run answered the first probe
    Recovered,
}

impl SessionState {
    pub fn loader_active(self) -> bool {
        !matches!(self, SessionState::NotStarted)
    }
}

/// Bring-up step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringupStep {
    ExtendedSession,
    SecurityAccess,
    DisableCommunication,
    ProgrammedState,
    ProgrammingMode,
    LoaderDownload,
    FrameDelay,
}

#[derive(Debug, Error, Clone)]
pub enum BringupError {
    #[error("{step:?} failed: {source}")]
    Step {
        step: BringupStep,
        #[source]
        source: UdsError,
    },

    #[error("Security access denied: {0}")]
    SecurityDenied(UdsError),

    #[error("Loader chunk at offset 0x{offset:X} failed: {source}")]
    Upload {
        offset: usize,
        #[source]
        source: UdsError,
    },

    #[error("Loader answered {found:?}, expected {expected:?}")]
    SignatureMismatch { expected: String, found: String },

    #[error("Loader did not answer after upload: {0}")]
    LoaderSilent(UdsError),

    #[error("Loader binary is empty")]
    EmptyLoader,
}

impl BringupError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Step { source, .. } | Self::Upload { source, .. } => classify_uds(source),
            Self::SecurityDenied(_)
            | Self::SignatureMismatch { .. }
            | Self::LoaderSilent(_)
            | Self::EmptyLoader => FailureKind::FatalSession,
        }
    }
}

fn step(step: BringupStep) -> impl FnOnce(UdsError) -> BringupError {
    move |source| BringupError::Step { step, source }
}

pub struct SessionBringup {
    uds: UdsService,
    target: TargetDescriptor,
    settings: ReflashSettings,
    state: SessionState,
    /// Programming mode was entered, so the boot ROM needs a return to normal
    programming_entered: bool,
}

impl SessionBringup {
    pub fn new(uds: UdsService, target: TargetDescriptor, settings: ReflashSettings) -> Self {
        Self {
            uds,
            target,
            settings,
            state: SessionState::NotStarted,
            programming_entered: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_recovered(&self) -> bool {
        self.state == SessionState::Recovered
    }

    /// Read the identity identifier as text
    pub async fn probe_identity(&self) -> Result<String, UdsError> {
        let raw = self.uds.read_data_by_id(self.target.identity_did).await?;
        Ok(String::from_utf8_lossy(&raw)
            .trim_end_matches(['\0', ' '])
            .to_string())
    }

    /// Bring the ECU up to a running loader
    pub async fn start(
        &mut self,
        loader: &[u8],
        heartbeat: &mut Heartbeat,
        events: &EventSink,
    ) -> Result<SessionState, BringupError> {
        if self.state.loader_active() {
            return Ok(self.state);
        }

        if let Ok(identity) = self.probe_identity().await {
            if identity == self.target.loader_signature {
                events.info(format!(
                    "Loader {} already running, recovering session",
                    identity
                ));
                self.state = SessionState::Recovered;
                self.write_frame_delay().await?;
                return Ok(self.state);
            }
            debug!(identity = %identity, "ECU identity before bring-up");
        }

        if loader.is_empty() {
            return Err(BringupError::EmptyLoader);
        }

        heartbeat.beat().await;
        self.uds
            .diagnostic_session_control(session_type::EXTENDED)
            .await
            .map_err(step(BringupStep::ExtendedSession))?;

        self.unlock().await?;
        events.info("Security access granted");

        self.uds
            .disable_normal_communication()
            .await
            .map_err(step(BringupStep::DisableCommunication))?;
        self.uds
            .report_programmed_state()
            .await
            .map_err(step(BringupStep::ProgrammedState))?;
        self.uds
            .programming_mode_request()
            .await
            .map_err(step(BringupStep::ProgrammingMode))?;
        self.uds
            .programming_mode_enable()
            .await
            .map_err(step(BringupStep::ProgrammingMode))?;
        self.programming_entered = true;

        events.info(format!("Uploading loader ({} bytes)", loader.len()));
        self.upload_loader(loader, heartbeat, events).await?;

        let identity = self.await_loader().await?;
        if identity != self.target.loader_signature {
            return Err(BringupError::SignatureMismatch {
                expected: self.target.loader_signature.clone(),
                found: identity,
            });
        }

        self.state = SessionState::LoaderRunning;
        info!(target = %self.target.id, "Loader running");
        self.write_frame_delay().await?;
        events.info(format!("Loader {} running", identity));
        Ok(self.state)
    }

    async fn unlock(&self) -> Result<(), BringupError> {
        let level = self.target.security_level;
        let seed = self
            .uds
            .security_access_request_seed(level)
            .await
            .map_err(step(BringupStep::SecurityAccess))?;

        if seed == 0 {
            debug!(level, "Zero seed, already unlocked");
            return Ok(());
        }

        let key = derive_key(seed, level, self.target.key_family);
        debug!(level, seed = format!("0x{:04X}", seed), "Sending key");
        self.uds
            .security_access_send_key(level, key)
            .await
            .map_err(BringupError::SecurityDenied)
    }

    async fn upload_loader(
        &self,
        loader: &[u8],
        heartbeat: &mut Heartbeat,
        events: &EventSink,
    ) -> Result<(), BringupError> {
        let width = self.target.address_width;
        let base = self.target.loader_address;
        let uds = &self.uds;

        uds.request_download(loader.len() as u32, width)
            .await
            .map_err(step(BringupStep::LoaderDownload))?;

        let policy = self.settings.loader_chunk_retry();
        let mut progress = events.progress(loader.len() as u64);
        let chunk_size = self.settings.transfer.loader_chunk_size.max(1);

        for (i, chunk) in loader.chunks(chunk_size).enumerate() {
            let offset = i * chunk_size;
            let address = base + offset as u32;

            // Keep-alive goes out before the chunk when one is due
            let transfer = policy.run(move |_| {
                uds.transfer_data(transfer_sub_function::DOWNLOAD, address, width, chunk)
            });
            heartbeat
                .during(transfer)
                .await
                .map_err(|source| BringupError::Upload { offset, source })?;

            progress.update((offset + chunk.len()) as u64);
        }

        uds.request_transfer_exit()
            .await
            .map_err(step(BringupStep::LoaderDownload))?;
        uds.transfer_data(
            transfer_sub_function::DOWNLOAD_AND_EXECUTE,
            base,
            width,
            &[],
        )
        .await
        .map_err(step(BringupStep::LoaderDownload))?;

        Ok(())
    }

    /// Probe until the freshly started loader answers
    async fn await_loader(&self) -> Result<String, BringupError> {
        let policy = RetryPolicy::new(self.settings.retries.block_attempts, PROBE_BACKOFF);
        policy
            .run(move |_| self.probe_identity())
            .await
            .map_err(BringupError::LoaderSilent)
    }

    async fn write_frame_delay(&self) -> Result<(), BringupError> {
        let delay = self.settings.transfer.inter_frame_delay_ms;
        self.uds
            .write_data_by_id(self.target.frame_delay_did, &[delay])
            .await
            .map_err(step(BringupStep::FrameDelay))
    }

    /// Ask the ECU to leave programming mode
    ///
    /// Returns false if the ECU never acknowledged; it then has to be
    /// power-cycled. The session is considered closed either way.
    pub async fn teardown(&mut self, events: &EventSink) -> bool {
        if !self.state.loader_active() && !self.programming_entered {
            return true;
        }

        let uds = &self.uds;
        let result = self
            .settings
            .teardown_retry()
            .run(move |_| uds.return_to_normal())
            .await;
        self.state = SessionState::NotStarted;
        self.programming_entered = false;

        match result {
            Ok(()) => {
                events.info("ECU returned to normal operation");
                true
            }
            Err(e) => {
                warn!(error = %e, "Return to normal not acknowledged");
                events.info("ECU did not leave programming mode; power-cycle it to recover");
                false
            }
        }
    }
}
