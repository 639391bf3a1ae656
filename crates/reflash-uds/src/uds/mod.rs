//! Diagnostic service layer
//!
//! GMLAN-flavoured services used to bring an ECU into programming mode and
//! the custom services understood by the secondary loader once it runs.

mod error;
mod nrc;
mod services;

pub use error::UdsError;
pub use nrc::NegativeResponseCode;
pub use services::{AddressWidth, MemoryBlock, UdsService};

/// RoutineControl (0x31) sub-functions
pub mod routine_sub_function {
    /// Start routine
    pub const START_ROUTINE: u8 = 0x01;
    /// Request routine results
    pub const REQUEST_ROUTINE_RESULTS: u8 = 0x03;
}

/// TransferData (0x36) sub-functions
pub mod transfer_sub_function {
    /// Store the block
    pub const DOWNLOAD: u8 = 0x00;
    /// Store the block and jump to the download address
    pub const DOWNLOAD_AND_EXECUTE: u8 = 0x80;
}

/// ProgrammingMode (0xA5) sub-functions
pub mod programming_mode {
    /// Ask the ECU whether programming is possible
    pub const REQUEST: u8 = 0x01;
    /// Commit to programming; the ECU does not answer this one
    pub const ENABLE: u8 = 0x03;
}

/// DiagnosticSessionControl (0x10) sessions
pub mod session_type {
    pub const EXTENDED: u8 = 0x03;
}

/// ReadMemory (0x23) response formats
pub mod read_memory_format {
    /// Data bytes and a trailing checksum follow the address
    pub const DATA: u8 = 0x00;
    /// Block is erased; no data follows and every byte reads as 0xFF
    pub const ERASED: u8 = 0x01;
}

/// Default service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const READ_DATA_BY_ID: u8 = 0x1A;
    pub const RETURN_TO_NORMAL: u8 = 0x20;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const DISABLE_NORMAL_COMMUNICATION: u8 = 0x28;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const WRITE_DATA_BY_ID: u8 = 0x3B;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const REPORT_PROGRAMMED_STATE: u8 = 0xA2;
    pub const PROGRAMMING_MODE: u8 = 0xA5;
    pub const COMPRESSED_WRITE: u8 = 0xB0;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// Positive response SID for a request SID
pub const fn positive_response_id(service_id: u8) -> u8 {
    service_id.wrapping_add(0x40)
}

use crate::config::ServiceOverrides;

/// Resolved service IDs for a specific ECU
///
/// This struct holds the actual service IDs to use when communicating with an ECU.
/// It starts with the default IDs and applies any target-specific overrides.
#[derive(Debug, Clone, Copy)]
pub struct ServiceIds {
    pub diagnostic_session_control: u8,
    pub read_data_by_id: u8,
    pub return_to_normal: u8,
    pub read_memory_by_address: u8,
    pub security_access: u8,
    pub disable_normal_communication: u8,
    pub routine_control: u8,
    pub request_download: u8,
    pub transfer_data: u8,
    pub request_transfer_exit: u8,
    pub write_data_by_id: u8,
    pub tester_present: u8,
    pub report_programmed_state: u8,
    pub programming_mode: u8,
    pub compressed_write: u8,
}

impl Default for ServiceIds {
    fn default() -> Self {
        Self {
            diagnostic_session_control: service_id::DIAGNOSTIC_SESSION_CONTROL,
            read_data_by_id: service_id::READ_DATA_BY_ID,
            return_to_normal: service_id::RETURN_TO_NORMAL,
            read_memory_by_address: service_id::READ_MEMORY_BY_ADDRESS,
            security_access: service_id::SECURITY_ACCESS,
            disable_normal_communication: service_id::DISABLE_NORMAL_COMMUNICATION,
            routine_control: service_id::ROUTINE_CONTROL,
            request_download: service_id::REQUEST_DOWNLOAD,
            transfer_data: service_id::TRANSFER_DATA,
            request_transfer_exit: service_id::REQUEST_TRANSFER_EXIT,
            write_data_by_id: service_id::WRITE_DATA_BY_ID,
            tester_present: service_id::TESTER_PRESENT,
            report_programmed_state: service_id::REPORT_PROGRAMMED_STATE,
            programming_mode: service_id::PROGRAMMING_MODE,
            compressed_write: service_id::COMPRESSED_WRITE,
        }
    }
}

impl ServiceIds {
    /// Create ServiceIds with target-specific overrides applied
    pub fn from_overrides(overrides: &ServiceOverrides) -> Self {
        let defaults = Self::default();
        let pick = |value: Option<u8>, default: u8| value.unwrap_or(default);

        Self {
            diagnostic_session_control: pick(
                overrides.diagnostic_session_control,
                defaults.diagnostic_session_control,
            ),
            read_data_by_id: pick(overrides.read_data_by_id, defaults.read_data_by_id),
            return_to_normal: pick(overrides.return_to_normal, defaults.return_to_normal),
            read_memory_by_address: pick(
                overrides.read_memory_by_address,
                defaults.read_memory_by_address,
            ),
            security_access: pick(overrides.security_access, defaults.security_access),
            disable_normal_communication: pick(
                overrides.disable_normal_communication,
                defaults.disable_normal_communication,
            ),
            routine_control: pick(overrides.routine_control, defaults.routine_control),
            request_download: pick(overrides.request_download, defaults.request_download),
            transfer_data: pick(overrides.transfer_data, defaults.transfer_data),
            request_transfer_exit: pick(
                overrides.request_transfer_exit,
                defaults.request_transfer_exit,
            ),
            write_data_by_id: pick(overrides.write_data_by_id, defaults.write_data_by_id),
            tester_present: pick(overrides.tester_present, defaults.tester_present),
            report_programmed_state: pick(
                overrides.report_programmed_state,
                defaults.report_programmed_state,
            ),
            programming_mode: pick(overrides.programming_mode, defaults.programming_mode),
            compressed_write: pick(overrides.compressed_write, defaults.compressed_write),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_only_given_ids() {
        let overrides = ServiceOverrides {
            compressed_write: Some(0xB6),
            read_data_by_id: Some(0x22),
            ..Default::default()
        };

        let ids = ServiceIds::from_overrides(&overrides);
        assert_eq!(ids.compressed_write, 0xB6);
        assert_eq!(ids.read_data_by_id, 0x22);
        assert_eq!(ids.security_access, service_id::SECURITY_ACCESS);
        assert_eq!(ids.transfer_data, service_id::TRANSFER_DATA);
    }

    #[test]
    fn test_positive_response_id() {
        assert_eq!(positive_response_id(service_id::COMPRESSED_WRITE), 0xF0);
        assert_eq!(positive_response_id(service_id::READ_MEMORY_BY_ADDRESS), 0x63);
    }
}
