//! Error taxonomy for the reflashing engine

use reflash_uds::UdsError;
use thiserror::Error;

use crate::bringup::BringupError;
use crate::codec::CodecError;
use crate::dump::DumpError;
use crate::flash::FlashError;
use crate::settings::ConfigError;

/// How a failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// One block or frame failed; retried locally
    Transient,
    /// Unexpected or malformed response; the enclosing transfer is retried
    Protocol,
    /// The session cannot continue; teardown may still be attempted
    FatalSession,
    /// Continuing would risk repeated destructive writes
    FatalData,
}

impl FailureKind {
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::FatalSession | Self::FatalData)
    }
}

/// Classify a diagnostic-layer error
pub fn classify_uds(error: &UdsError) -> FailureKind {
    match error {
        UdsError::Timeout | UdsError::Transport(_) => FailureKind::Transient,
        UdsError::NegativeResponse { nrc, .. } if nrc.is_programming_failure() => {
            FailureKind::FatalSession
        }
        UdsError::SecurityAccessFailed(_) => FailureKind::FatalSession,
        UdsError::NegativeResponse { .. }
        | UdsError::InvalidResponse(_)
        | UdsError::ChecksumMismatch { .. } => FailureKind::Protocol,
    }
}

#[derive(Debug, Error)]
pub enum ReflashError {
    #[error(transparent)]
    Uds(#[from] UdsError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Dump(#[from] DumpError),

    #[error(transparent)]
    Bringup(#[from] BringupError),

    #[error(transparent)]
    Flash(#[from] FlashError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReflashError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Uds(e) => classify_uds(e),
            Self::Codec(_) => FailureKind::Transient,
            Self::Dump(e) => e.kind(),
            Self::Bringup(e) => e.kind(),
            Self::Flash(e) => e.kind(),
            Self::Config(_) | Self::Io(_) => FailureKind::FatalData,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReflashError>;

#[cfg(test)]
mod tests {
    use super::*;
    use reflash_uds::NegativeResponseCode;

    #[test]
    fn test_uds_classification() {
        assert_eq!(classify_uds(&UdsError::Timeout), FailureKind::Transient);
        assert_eq!(
            classify_uds(&UdsError::NegativeResponse {
                service_id: 0xB0,
                nrc: NegativeResponseCode::GeneralProgrammingFailure,
            }),
            FailureKind::FatalSession
        );
        assert_eq!(
            classify_uds(&UdsError::NegativeResponse {
                service_id: 0xB0,
                nrc: NegativeResponseCode::WrongBlockSequenceCounter,
            }),
            FailureKind::Protocol
        );
        assert_eq!(
            classify_uds(&UdsError::ChecksumMismatch {
                expected: 1,
                actual: 2
            }),
            FailureKind::Protocol
        );
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(FailureKind::FatalData.is_fatal());
        assert!(FailureKind::FatalSession.is_fatal());
        assert!(!FailureKind::Protocol.is_fatal());
        assert!(!FailureKind::Transient.is_fatal());
    }
}
