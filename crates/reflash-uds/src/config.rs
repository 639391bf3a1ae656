//! Diagnostic layer configuration
//!
//! Service ID overrides for target variants and mock transport settings.

use serde::{Deserialize, Serialize};

/// Mock transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

/// Service ID overrides for target variants
///
/// Some ECU families answer on non-default service IDs, most often for the
/// loader-specific services. Anything left unset keeps its default.
///
/// # Example
/// ```yaml
/// service_overrides:
///   compressed_write: 0xB6     # Default: 0xB0
///   read_data_by_id: 0x22      # Default: 0x1A
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOverrides {
    /// DiagnosticSessionControl (default: 0x10)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_session_control: Option<u8>,
    /// ReadDataByIdentifier (default: 0x1A)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_data_by_id: Option<u8>,
    /// ReturnToNormal (default: 0x20)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_to_normal: Option<u8>,
    /// ReadMemoryByAddress (default: 0x23)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_memory_by_address: Option<u8>,
    /// SecurityAccess (default: 0x27)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_access: Option<u8>,
    /// DisableNormalCommunication (default: 0x28)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_normal_communication: Option<u8>,
    /// RoutineControl (default: 0x31)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routine_control: Option<u8>,
    /// RequestDownload (default: 0x34)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_download: Option<u8>,
    /// TransferData (default: 0x36)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_data: Option<u8>,
    /// RequestTransferExit (default: 0x37)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_transfer_exit: Option<u8>,
    /// WriteDataByIdentifier (default: 0x3B)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_data_by_id: Option<u8>,
    /// TesterPresent (default: 0x3E)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tester_present: Option<u8>,
    /// ReportProgrammedState (default: 0xA2)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_programmed_state: Option<u8>,
    /// ProgrammingMode (default: 0xA5)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub programming_mode: Option<u8>,
    /// Loader compressed write (default: 0xB0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_write: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_overrides() {
        let yaml = "compressed_write: 0xB6\nread_data_by_id: 34\n";
        let overrides: ServiceOverrides = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(overrides.compressed_write, Some(0xB6));
        assert_eq!(overrides.read_data_by_id, Some(0x22));
        assert_eq!(overrides.security_access, None);
    }
}
