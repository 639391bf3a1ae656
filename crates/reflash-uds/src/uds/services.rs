//! Service layer for diagnostic communication

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    positive_response_id, programming_mode, read_memory_format, routine_sub_function, service_id,
    NegativeResponseCode, ServiceIds, UdsError,
};
use crate::checksum::{append_checksum, verify_checksum};
use crate::transport::{TransportAdapter, TransportError};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
const RESPONSE_PENDING_TIMEOUT: Duration = Duration::from_millis(30000);
/// Keep-alive period while the ECU answers "response pending"
const PENDING_KEEPALIVE: Duration = Duration::from_millis(800);

/// Width of the address/size fields in download requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressWidth {
    Bits16,
    #[default]
    Bits32,
}

impl AddressWidth {
    fn encode(self, value: u32, out: &mut Vec<u8>) -> Result<(), UdsError> {
        match self {
            AddressWidth::Bits16 => {
                let narrow = u16::try_from(value).map_err(|_| {
                    UdsError::InvalidResponse(format!(
                        "0x{:X} does not fit a 16-bit address field",
                        value
                    ))
                })?;
                out.extend_from_slice(&narrow.to_be_bytes());
            }
            AddressWidth::Bits32 => out.extend_from_slice(&value.to_be_bytes()),
        }
        Ok(())
    }
}

/// One block returned by the loader's memory read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryBlock {
    /// Bytes as read, checksum already verified
    Data(Vec<u8>),
    /// Block is erased and reads as all 0xFF
    Erased,
}

impl MemoryBlock {
    /// Materialize the block as `len` bytes
    pub fn into_bytes(self, len: usize) -> Vec<u8> {
        match self {
            MemoryBlock::Data(data) => data,
            MemoryBlock::Erased => vec![0xFF; len],
        }
    }
}

/// Service layer for diagnostic communication
#[derive(Clone)]
pub struct UdsService {
    transport: Arc<dyn TransportAdapter>,
    timeout: Duration,
    pending_timeout: Duration,
    keepalive: Duration,
    /// Service IDs to use (may include target overrides)
    svc: ServiceIds,
}

impl UdsService {
    pub fn new(transport: Arc<dyn TransportAdapter>) -> Self {
        Self::with_service_ids(transport, ServiceIds::default())
    }

    /// Create a service layer with custom service IDs (for target variants)
    pub fn with_service_ids(transport: Arc<dyn TransportAdapter>, service_ids: ServiceIds) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT,
            pending_timeout: RESPONSE_PENDING_TIMEOUT,
            keepalive: PENDING_KEEPALIVE,
            svc: service_ids,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// How long to keep waiting while the ECU answers "response pending"
    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    /// Keep-alive period while waiting out "response pending"
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }

    /// Get the service IDs being used
    pub fn service_ids(&self) -> &ServiceIds {
        &self.svc
    }

    /// Check whether the underlying transport is still open
    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await
    }

    /// Exchange one raw frame, returning the response bytes as received
    ///
    /// No negative-response interpretation is applied.
    pub async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, UdsError> {
        self.transport
            .send_receive(request, self.timeout)
            .await
            .map_err(|e| match e {
                TransportError::Timeout(_) => UdsError::Timeout,
                other => UdsError::Transport(other.to_string()),
            })
    }

    /// Send a request and handle response pending
    ///
    /// The request goes out once. After "response pending" only the final
    /// reply is awaited, with keep-alives on the functional address.
    pub async fn request(&self, request: &[u8]) -> Result<Vec<u8>, UdsError> {
        let mut response = self.exchange(request).await?;
        let mut deadline = None;

        loop {
            // Check for negative response
            if response.first() == Some(&service_id::NEGATIVE_RESPONSE) {
                if response.len() < 3 {
                    return Err(UdsError::InvalidResponse(
                        "Negative response too short".to_string(),
                    ));
                }

                let service_id = response[1];
                let nrc = NegativeResponseCode::from(response[2]);

                // Handle response pending
                if nrc == NegativeResponseCode::ResponsePending {
                    let deadline =
                        *deadline.get_or_insert_with(|| Instant::now() + self.pending_timeout);
                    response = self.await_final_response(deadline).await?;
                    continue;
                }

                return Err(UdsError::NegativeResponse { service_id, nrc });
            }

            if response.is_empty() {
                return Err(UdsError::InvalidResponse("Empty response".to_string()));
            }

            return Ok(response);
        }
    }

    async fn await_final_response(&self, deadline: Instant) -> Result<Vec<u8>, UdsError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(UdsError::Timeout);
            }

            match self.transport.receive(remaining.min(self.keepalive)).await {
                Ok(response) => return Ok(response),
                Err(TransportError::Timeout(_)) => {
                    debug!("Still pending, sending keep-alive");
                    if let Err(e) = self.tester_present_broadcast().await {
                        warn!(error = %e, "Keep-alive broadcast failed");
                    }
                }
                Err(e) => return Err(UdsError::Transport(e.to_string())),
            }
        }
    }

    /// Send a request and require the matching positive response SID
    async fn request_positive(&self, request: &[u8]) -> Result<Vec<u8>, UdsError> {
        let response = self.request(request).await?;
        let expected = positive_response_id(request[0]);
        if response[0] != expected {
            return Err(UdsError::InvalidResponse(format!(
                "Expected response 0x{:02X}, got 0x{:02X}",
                expected, response[0]
            )));
        }
        Ok(response)
    }

    /// Tester Present on the functional address, no response expected
    pub async fn tester_present_broadcast(&self) -> Result<(), UdsError> {
        let request = [self.svc.tester_present, 0x80];
        self.transport
            .broadcast(&request)
            .await
            .map_err(|e| UdsError::Transport(e.to_string()))
    }

    /// Diagnostic Session Control (0x10)
    pub async fn diagnostic_session_control(&self, session: u8) -> Result<(), UdsError> {
        let request = [self.svc.diagnostic_session_control, session];
        self.request_positive(&request).await?;
        Ok(())
    }

    /// Security Access - Request Seed (0x27 odd)
    ///
    /// Returns the 16-bit seed; zero means the ECU is already unlocked.
    pub async fn security_access_request_seed(&self, level: u8) -> Result<u16, UdsError> {
        // Seed requests use the odd sub-function for the level
        let sub_function = level.wrapping_mul(2).wrapping_sub(1);
        let request = [self.svc.security_access, sub_function];
        let response = self.request_positive(&request).await?;

        // Response: 0x67 [sub_function] [seedHi] [seedLo]
        if response.len() < 4 {
            return Err(UdsError::InvalidResponse(
                "Seed response too short".to_string(),
            ));
        }

        Ok(u16::from_be_bytes([response[2], response[3]]))
    }

    /// Security Access - Send Key (0x27 even)
    pub async fn security_access_send_key(&self, level: u8, key: u16) -> Result<(), UdsError> {
        let sub_function = level.wrapping_mul(2);
        let mut request = vec![self.svc.security_access, sub_function];
        request.extend_from_slice(&key.to_be_bytes());

        self.request_positive(&request).await.map_err(|e| match e {
            UdsError::NegativeResponse { nrc, .. } => {
                UdsError::SecurityAccessFailed(format!("key rejected: {}", nrc))
            }
            other => other,
        })?;
        Ok(())
    }

    /// Disable Normal Communication (0x28)
    pub async fn disable_normal_communication(&self) -> Result<(), UdsError> {
        self.request_positive(&[self.svc.disable_normal_communication])
            .await?;
        Ok(())
    }

    /// Report Programmed State (0xA2)
    pub async fn report_programmed_state(&self) -> Result<u8, UdsError> {
        let response = self
            .request_positive(&[self.svc.report_programmed_state])
            .await?;
        Ok(response.get(1).copied().unwrap_or(0))
    }

    /// Programming Mode - request (0xA5 01)
    pub async fn programming_mode_request(&self) -> Result<(), UdsError> {
        let request = [self.svc.programming_mode, programming_mode::REQUEST];
        self.request_positive(&request).await?;
        Ok(())
    }

    /// Programming Mode - enable (0xA5 03), sent without waiting for a reply
    pub async fn programming_mode_enable(&self) -> Result<(), UdsError> {
        let request = [self.svc.programming_mode, programming_mode::ENABLE];
        self.transport
            .send(&request)
            .await
            .map_err(|e| UdsError::Transport(e.to_string()))
    }

    /// Read Data By Identifier (0x1A) - returns the data after the echoed DID
    pub async fn read_data_by_id(&self, did: u8) -> Result<Vec<u8>, UdsError> {
        let request = [self.svc.read_data_by_id, did];
        let response = self.request_positive(&request).await?;

        // Format: 0x5A [DID] [DATA...]
        if response.len() < 2 || response[1] != did {
            return Err(UdsError::InvalidResponse(format!(
                "Identifier 0x{:02X} not echoed",
                did
            )));
        }

        Ok(response[2..].to_vec())
    }

    /// Write Data By Identifier (0x3B)
    pub async fn write_data_by_id(&self, did: u8, data: &[u8]) -> Result<(), UdsError> {
        let mut request = vec![self.svc.write_data_by_id, did];
        request.extend_from_slice(data);

        self.request_positive(&request).await?;
        Ok(())
    }

    /// Request Download (0x34) with a 16- or 32-bit size field
    pub async fn request_download(&self, size: u32, width: AddressWidth) -> Result<(), UdsError> {
        let mut request = vec![self.svc.request_download, 0x00];
        width.encode(size, &mut request)?;

        self.request_positive(&request).await?;
        Ok(())
    }

    /// Transfer Data (0x36) - one block with trailing checksum
    pub async fn transfer_data(
        &self,
        sub_function: u8,
        address: u32,
        width: AddressWidth,
        data: &[u8],
    ) -> Result<(), UdsError> {
        let mut request = Vec::with_capacity(data.len() + 8);
        request.push(self.svc.transfer_data);
        request.push(sub_function);
        width.encode(address, &mut request)?;
        request.extend_from_slice(data);
        append_checksum(&mut request, 1);

        self.request_positive(&request).await?;
        Ok(())
    }

    /// Request Transfer Exit (0x37) - end-of-transfer marker
    pub async fn request_transfer_exit(&self) -> Result<(), UdsError> {
        self.request_positive(&[self.svc.request_transfer_exit])
            .await?;
        Ok(())
    }

    /// Read Memory (0x23) through the loader
    ///
    /// Verifies the echoed address, the byte count and the trailing checksum.
    pub async fn read_memory(&self, address: u32, len: u16) -> Result<MemoryBlock, UdsError> {
        let mut request = vec![self.svc.read_memory_by_address];
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(&len.to_be_bytes());

        let response = self.request_positive(&request).await?;

        // Response: 0x63 [format] [addr x4] ...
        if response.len() < 6 {
            return Err(UdsError::InvalidResponse(
                "ReadMemory response too short".to_string(),
            ));
        }
        let echoed = u32::from_be_bytes([response[2], response[3], response[4], response[5]]);
        if echoed != address {
            return Err(UdsError::InvalidResponse(format!(
                "ReadMemory echoed 0x{:08X}, requested 0x{:08X}",
                echoed, address
            )));
        }

        match response[1] {
            read_memory_format::ERASED => Ok(MemoryBlock::Erased),
            read_memory_format::DATA => {
                let expected_len = 6 + len as usize + 2;
                if response.len() != expected_len {
                    return Err(UdsError::InvalidResponse(format!(
                        "ReadMemory returned {} bytes, expected {}",
                        response.len(),
                        expected_len
                    )));
                }
                verify_checksum(&response, 1).map_err(|(expected, actual)| {
                    UdsError::ChecksumMismatch { expected, actual }
                })?;
                Ok(MemoryBlock::Data(response[6..6 + len as usize].to_vec()))
            }
            other => Err(UdsError::InvalidResponse(format!(
                "Unknown ReadMemory format 0x{:02X}",
                other
            ))),
        }
    }

    /// Start a routine (sub-function 0x01), returning the routine status bytes
    pub async fn routine_control_start(
        &self,
        routine_id: u16,
        params: &[u8],
    ) -> Result<Vec<u8>, UdsError> {
        let mut request = vec![self.svc.routine_control, routine_sub_function::START_ROUTINE];
        request.extend_from_slice(&routine_id.to_be_bytes());
        request.extend_from_slice(params);

        let response = self.request_positive(&request).await?;

        // Response: 0x71 [sub-function] [routineIdHi] [routineIdLo] [routineInfo...]
        if response.len() < 4 {
            return Err(UdsError::InvalidResponse(
                "Routine response too short".to_string(),
            ));
        }

        Ok(response[4..].to_vec())
    }

    /// Request routine results (sub-function 0x03)
    pub async fn routine_control_result(&self, routine_id: u16) -> Result<Vec<u8>, UdsError> {
        let mut request = vec![
            self.svc.routine_control,
            routine_sub_function::REQUEST_ROUTINE_RESULTS,
        ];
        request.extend_from_slice(&routine_id.to_be_bytes());

        let response = self.request_positive(&request).await?;

        if response.len() < 4 {
            return Err(UdsError::InvalidResponse(
                "Routine response too short".to_string(),
            ));
        }

        Ok(response[4..].to_vec())
    }

    /// Return To Normal (0x20) - leave programming mode
    pub async fn return_to_normal(&self) -> Result<(), UdsError> {
        self.request_positive(&[self.svc.return_to_normal]).await?;
        Ok(())
    }
}
