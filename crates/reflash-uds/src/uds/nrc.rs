//! Negative Response Codes (NRC)

use std::fmt;

/// Negative Response Codes seen during bring-up and programming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeResponseCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrFormat,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    UploadDownloadNotAccepted,
    TransferDataSuspended,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,
    ResponsePending,
    ServiceNotSupportedInActiveSession,
    /// Unknown/reserved NRC
    Unknown(u8),
}

const CODES: &[(NegativeResponseCode, u8, &str)] = &[
    (NegativeResponseCode::GeneralReject, 0x10, "GeneralReject"),
    (NegativeResponseCode::ServiceNotSupported, 0x11, "ServiceNotSupported"),
    (NegativeResponseCode::SubFunctionNotSupported, 0x12, "SubFunctionNotSupported"),
    (
        NegativeResponseCode::IncorrectMessageLengthOrFormat,
        0x13,
        "IncorrectMessageLengthOrFormat",
    ),
    (NegativeResponseCode::BusyRepeatRequest, 0x21, "BusyRepeatRequest"),
    (NegativeResponseCode::ConditionsNotCorrect, 0x22, "ConditionsNotCorrect"),
    (NegativeResponseCode::RequestSequenceError, 0x24, "RequestSequenceError"),
    (NegativeResponseCode::RequestOutOfRange, 0x31, "RequestOutOfRange"),
    (NegativeResponseCode::SecurityAccessDenied, 0x33, "SecurityAccessDenied"),
    (NegativeResponseCode::InvalidKey, 0x35, "InvalidKey"),
    (
        NegativeResponseCode::ExceededNumberOfAttempts,
        0x36,
        "ExceededNumberOfAttempts",
    ),
    (
        NegativeResponseCode::RequiredTimeDelayNotExpired,
        0x37,
        "RequiredTimeDelayNotExpired",
    ),
    (
        NegativeResponseCode::UploadDownloadNotAccepted,
        0x70,
        "UploadDownloadNotAccepted",
    ),
    (NegativeResponseCode::TransferDataSuspended, 0x71, "TransferDataSuspended"),
    (
        NegativeResponseCode::GeneralProgrammingFailure,
        0x72,
        "GeneralProgrammingFailure",
    ),
    (
        NegativeResponseCode::WrongBlockSequenceCounter,
        0x73,
        "WrongBlockSequenceCounter",
    ),
    (NegativeResponseCode::ResponsePending, 0x78, "ResponsePending"),
    (
        NegativeResponseCode::ServiceNotSupportedInActiveSession,
        0x7F,
        "ServiceNotSupportedInActiveSession",
    ),
];

impl NegativeResponseCode {
    /// The device rejected programmed data; retrying the same bytes will not help
    pub fn is_programming_failure(&self) -> bool {
        matches!(self, Self::GeneralProgrammingFailure)
    }
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        CODES
            .iter()
            .find(|(_, byte, _)| *byte == value)
            .map(|(code, _, _)| *code)
            .unwrap_or(Self::Unknown(value))
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        if let NegativeResponseCode::Unknown(v) = nrc {
            return v;
        }
        CODES
            .iter()
            .find(|(code, _, _)| *code == nrc)
            .map(|(_, byte, _)| *byte)
            .unwrap_or(0x10)
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: u8 = (*self).into();
        fmt::UpperHex::fmt(&value, f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Self::Unknown(v) = self {
            return write!(f, "Unknown(0x{:02X})", v);
        }
        let name = CODES
            .iter()
            .find(|(code, _, _)| code == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("Unknown");
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_conversion_is_symmetric() {
        for (code, byte, _) in CODES {
            assert_eq!(NegativeResponseCode::from(*byte), *code);
            assert_eq!(u8::from(*code), *byte);
        }
        assert_eq!(
            NegativeResponseCode::from(0xEE),
            NegativeResponseCode::Unknown(0xEE)
        );
        assert_eq!(u8::from(NegativeResponseCode::Unknown(0xEE)), 0xEE);
    }

    #[test]
    fn test_display_and_hex() {
        let nrc = NegativeResponseCode::GeneralProgrammingFailure;
        assert_eq!(nrc.to_string(), "GeneralProgrammingFailure");
        assert_eq!(format!("{:02X}", nrc), "72");
        assert!(nrc.is_programming_failure());
        assert!(!NegativeResponseCode::InvalidKey.is_programming_failure());
    }
}
