//! Simulated ECU: boot ROM plus the secondary loader it runs

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reflash_core::codec::{decompress, MIN_MATCH};
use reflash_core::flash::{FIRST_PAYLOAD, NEXT_PAYLOAD};
use reflash_core::{derive_key, TargetDescriptor};
use reflash_uds::checksum::{append_checksum, verify_checksum};
use reflash_uds::uds::{programming_mode, read_memory_format, routine_sub_function, transfer_sub_function};
use reflash_uds::{
    AddressInfo, AddressWidth, ServiceIds, TransportAdapter, TransportError,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::faults::{fire, FaultPlan};
use crate::memory::Memory;
use crate::protocol::{negative_response, nrc, positive_response};

/// Largest single ISO-TP message
const MAX_FRAME: usize = 4095;

/// Identity the boot ROM reports before a loader runs
pub const BOOT_IDENTITY: &str = "BOOT-2.1";

/// What is answering requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcuMode {
    Boot,
    Loader,
}

/// What the simulator observed, for assertions
#[derive(Debug, Clone, Default)]
pub struct EcuRecord {
    /// Mask of every accepted erase call, in order
    pub erase_masks: Vec<u32>,
    /// Compressed chunks decoded and written
    pub compressed_chunks: usize,
    /// Raw blocks written
    pub raw_blocks: usize,
    /// Memory reads answered
    pub reads: usize,
    /// Functional keep-alives received
    pub keep_alives: usize,
    /// Accepted return-to-normal requests
    pub returns_to_normal: usize,
    /// Last inter-frame delay written
    pub frame_delay: Option<u8>,
    /// Last loader image that was started
    pub loader: Vec<u8>,
}

struct Download {
    expected: usize,
    data: Vec<u8>,
    finished: bool,
}

struct CompressedTransfer {
    address: u32,
    final_len: usize,
    next_step: u8,
    payload: Vec<u8>,
    cursor: StreamCursor,
    /// Chunk already decoded; later frames only carry padding
    written: bool,
}

/// Tracks how much output the received part of a compressed stream covers
#[derive(Default)]
struct StreamCursor {
    pos: usize,
    produced: usize,
    mask: u8,
    bits_left: u8,
}

impl StreamCursor {
    /// Walk newly received tokens; true once `target` bytes are covered
    fn advance(&mut self, data: &[u8], target: usize) -> bool {
        while self.produced < target {
            if self.bits_left == 0 {
                let Some(&mask) = data.get(self.pos) else {
                    return false;
                };
                self.mask = mask;
                self.bits_left = 8;
                self.pos += 1;
            }

            let reference = self.mask & 0x80 != 0;
            let width = if reference { 2 } else { 1 };
            if self.pos + width > data.len() {
                return false;
            }
            self.produced += if reference {
                (data[self.pos] >> 4) as usize + MIN_MATCH
            } else {
                1
            };
            self.pos += width;
            self.mask <<= 1;
            self.bits_left -= 1;
        }
        true
    }
}

struct EcuState {
    mode: EcuMode,
    session: u8,
    unlocked: bool,
    comms_disabled: bool,
    programming_requested: bool,
    programming_enabled: bool,
    download: Option<Download>,
    transfer: Option<CompressedTransfer>,
    hash: Option<[u8; 32]>,
    memory: Memory,
    faults: FaultPlan,
    record: EcuRecord,
}

impl EcuState {
    fn reset_to_boot(&mut self) {
        self.mode = EcuMode::Boot;
        self.session = 0x01;
        self.unlocked = false;
        self.comms_disabled = false;
        self.programming_requested = false;
        self.programming_enabled = false;
        self.download = None;
        self.transfer = None;
        self.hash = None;
    }

    /// Store `data` at `address`, flipping one bit when a corruption fault fires
    fn program(&mut self, address: u32, data: &[u8]) -> bool {
        if !self.memory.write(address, data) {
            return false;
        }
        if fire(&mut self.faults.corrupt_writes) {
            if let Some(byte) = self.memory.slice_mut(address, 1) {
                byte[0] ^= 0x01;
                warn!(address, "Injected write corruption");
            }
        }
        true
    }
}

/// In-process ECU speaking the reflashing protocol
pub struct SimulatedEcu {
    target: TargetDescriptor,
    svc: ServiceIds,
    hardware_id: u32,
    seed: u16,
    state: Mutex<EcuState>,
}

impl SimulatedEcu {
    /// Boot-mode ECU with erased flash and the target's own hardware ID
    pub fn new(target: TargetDescriptor) -> Self {
        let memory = Memory::for_target(&target);
        Self {
            svc: ServiceIds::from_overrides(&target.services),
            hardware_id: target.hardware_id,
            seed: 0x1234,
            state: Mutex::new(EcuState {
                mode: EcuMode::Boot,
                session: 0x01,
                unlocked: false,
                comms_disabled: false,
                programming_requested: false,
                programming_enabled: false,
                download: None,
                transfer: None,
                hash: None,
                memory,
                faults: FaultPlan::default(),
                record: EcuRecord::default(),
            }),
            target,
        }
    }

    pub fn with_hardware_id(mut self, hardware_id: u32) -> Self {
        self.hardware_id = hardware_id;
        self
    }

    /// Seed handed out on security access; zero means already unlocked
    pub fn with_seed(mut self, seed: u16) -> Self {
        self.seed = seed;
        self
    }

    /// Program the flash from a file image
    pub fn with_image(self, image: &[u8]) -> Self {
        self.state.lock().memory.load_image(&self.target, image);
        self
    }

    /// Start with a loader already running, as after an interrupted session
    pub fn with_loader_running(self) -> Self {
        self.state.lock().mode = EcuMode::Loader;
        self
    }

    pub fn with_faults(self, faults: FaultPlan) -> Self {
        self.set_faults(faults);
        self
    }

    pub fn set_faults(&self, faults: FaultPlan) {
        self.state.lock().faults = faults;
    }

    pub fn mode(&self) -> EcuMode {
        self.state.lock().mode
    }

    pub fn record(&self) -> EcuRecord {
        self.state.lock().record.clone()
    }

    /// Current flash contents as a file image
    pub fn image(&self) -> Vec<u8> {
        self.state.lock().memory.to_image(&self.target)
    }

    /// Raw physical memory, if the range is mapped
    pub fn read_physical(&self, address: u32, len: usize) -> Option<Vec<u8>> {
        self.state
            .lock()
            .memory
            .slice(address, len)
            .map(<[u8]>::to_vec)
    }

    /// Process one request and return the response; empty means no reply
    pub fn process_request(&self, request: &[u8]) -> Vec<u8> {
        if request.is_empty() {
            return negative_response(0x00, nrc::INCORRECT_MESSAGE_LENGTH);
        }

        let mut state = self.state.lock();
        let sid = request[0];

        if sid == self.svc.tester_present {
            return self.handle_tester_present(&mut state, request);
        }
        if sid == self.svc.read_data_by_id {
            return self.handle_read_data_by_id(&state, request);
        }
        if sid == self.svc.return_to_normal {
            return self.handle_return_to_normal(&mut state);
        }

        match state.mode {
            EcuMode::Boot => self.process_boot(&mut state, request),
            EcuMode::Loader => self.process_loader(&mut state, request),
        }
    }

    fn process_boot(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = request[0];

        if sid == self.svc.diagnostic_session_control {
            self.handle_session_control(state, request)
        } else if sid == self.svc.security_access {
            self.handle_security_access(state, request)
        } else if sid == self.svc.disable_normal_communication {
            if !state.unlocked {
                return negative_response(sid, nrc::SECURITY_ACCESS_DENIED);
            }
            state.comms_disabled = true;
            positive_response(sid, &[])
        } else if sid == self.svc.report_programmed_state {
            positive_response(sid, &[0x00])
        } else if sid == self.svc.programming_mode {
            self.handle_programming_mode(state, request)
        } else if sid == self.svc.request_download {
            self.handle_request_download(state, request)
        } else if sid == self.svc.transfer_data {
            self.handle_loader_transfer(state, request)
        } else if sid == self.svc.request_transfer_exit {
            match state.download.as_mut() {
                Some(download) if download.data.len() == download.expected => {
                    download.finished = true;
                    positive_response(sid, &[])
                }
                _ => negative_response(sid, nrc::REQUEST_SEQUENCE_ERROR),
            }
        } else {
            debug!(service_id = sid, "Service not supported by the boot ROM");
            negative_response(sid, nrc::SERVICE_NOT_SUPPORTED)
        }
    }

    fn process_loader(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = request[0];

        if sid == self.svc.write_data_by_id {
            if request.len() < 3 {
                return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
            }
            if request[1] == self.target.frame_delay_did {
                state.record.frame_delay = Some(request[2]);
            }
            positive_response(sid, &[request[1]])
        } else if sid == self.svc.read_memory_by_address {
            self.handle_read_memory(state, request)
        } else if sid == self.svc.routine_control {
            self.handle_routine_control(state, request)
        } else if sid == self.svc.compressed_write {
            self.handle_compressed_write(state, request)
        } else if sid == self.svc.transfer_data {
            self.handle_raw_write(state, request)
        } else {
            debug!(service_id = sid, "Service not supported by the loader");
            negative_response(sid, nrc::SERVICE_NOT_SUPPORTED)
        }
    }

    fn handle_tester_present(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sub_function = request.get(1).copied().unwrap_or(0);
        if sub_function & 0x80 != 0 {
            state.record.keep_alives += 1;
            return Vec::new();
        }
        positive_response(request[0], &[sub_function])
    }

    fn handle_read_data_by_id(&self, state: &EcuState, request: &[u8]) -> Vec<u8> {
        let sid = request[0];
        let Some(&did) = request.get(1) else {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        };

        let data = if did == self.target.identity_did {
            match state.mode {
                EcuMode::Boot => BOOT_IDENTITY.as_bytes().to_vec(),
                EcuMode::Loader => state
                    .faults
                    .loader_identity
                    .clone()
                    .unwrap_or_else(|| self.target.loader_signature.clone())
                    .into_bytes(),
            }
        } else if did == self.target.hardware_id_did {
            self.hardware_id.to_be_bytes().to_vec()
        } else {
            return negative_response(sid, nrc::REQUEST_OUT_OF_RANGE);
        };

        let mut response = vec![did];
        response.extend_from_slice(&data);
        positive_response(sid, &response)
    }

    fn handle_return_to_normal(&self, state: &mut EcuState) -> Vec<u8> {
        let sid = self.svc.return_to_normal;
        if state.faults.refuse_return_to_normal {
            return negative_response(sid, nrc::CONDITIONS_NOT_CORRECT);
        }
        info!(mode = ?state.mode, "Returning to normal operation");
        state.reset_to_boot();
        state.record.returns_to_normal += 1;
        positive_response(sid, &[])
    }

    fn handle_session_control(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = request[0];
        match request.get(1) {
            Some(&session @ (0x01 | 0x03)) => {
                if session != state.session {
                    state.unlocked = false;
                }
                state.session = session;
                positive_response(sid, &[session])
            }
            Some(_) => negative_response(sid, nrc::SUB_FUNCTION_NOT_SUPPORTED),
            None => negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH),
        }
    }

    fn handle_security_access(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = request[0];
        let Some(&sub_function) = request.get(1) else {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        };
        if state.session != 0x03 {
            return negative_response(sid, nrc::CONDITIONS_NOT_CORRECT);
        }

        if sub_function % 2 == 1 {
            if self.seed == 0 {
                state.unlocked = true;
            }
            let seed = if state.unlocked { 0 } else { self.seed };
            let mut data = vec![sub_function];
            data.extend_from_slice(&seed.to_be_bytes());
            return positive_response(sid, &data);
        }

        if request.len() < 4 {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        }
        let level = sub_function / 2;
        let key = u16::from_be_bytes([request[2], request[3]]);
        let expected = derive_key(self.seed, level, self.target.key_family);

        if key == expected && !state.faults.reject_keys {
            info!(level, "Security access: key accepted");
            state.unlocked = true;
            positive_response(sid, &[sub_function])
        } else {
            info!(level, key, expected, "Security access: invalid key");
            negative_response(sid, nrc::INVALID_KEY)
        }
    }

    fn handle_programming_mode(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = request[0];
        match request.get(1) {
            Some(&programming_mode::REQUEST) => {
                if !state.comms_disabled {
                    return negative_response(sid, nrc::CONDITIONS_NOT_CORRECT);
                }
                state.programming_requested = true;
                positive_response(sid, &[])
            }
            Some(&programming_mode::ENABLE) => {
                // Enable is never acknowledged
                state.programming_enabled = state.programming_requested;
                Vec::new()
            }
            _ => negative_response(sid, nrc::SUB_FUNCTION_NOT_SUPPORTED),
        }
    }

    fn address_len(&self) -> usize {
        match self.target.address_width {
            AddressWidth::Bits16 => 2,
            AddressWidth::Bits32 => 4,
        }
    }

    fn decode_address(bytes: &[u8]) -> u32 {
        bytes.iter().fold(0u32, |acc, &b| acc << 8 | u32::from(b))
    }

    fn handle_request_download(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = request[0];
        if !state.programming_enabled {
            return negative_response(sid, nrc::CONDITIONS_NOT_CORRECT);
        }
        let width = self.address_len();
        if request.len() != 2 + width {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        }

        let expected = Self::decode_address(&request[2..]) as usize;
        state.download = Some(Download {
            expected,
            data: Vec::with_capacity(expected),
            finished: false,
        });
        positive_response(sid, &[])
    }

    /// Loader upload into RAM, and the final download-and-execute
    fn handle_loader_transfer(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = request[0];
        let width = self.address_len();
        if request.len() < 2 + width + 2 {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        }
        if verify_checksum(request, 1).is_err() {
            return negative_response(sid, nrc::GENERAL_REJECT);
        }

        let address = Self::decode_address(&request[2..2 + width]);
        let data = &request[2 + width..request.len() - 2];
        let Some(download) = state.download.as_mut() else {
            return negative_response(sid, nrc::REQUEST_SEQUENCE_ERROR);
        };

        match request[1] {
            transfer_sub_function::DOWNLOAD => {
                let offset = address.wrapping_sub(self.target.loader_address) as usize;
                if download.finished || offset != download.data.len() {
                    return negative_response(sid, nrc::REQUEST_SEQUENCE_ERROR);
                }
                if download.data.len() + data.len() > download.expected {
                    return negative_response(sid, nrc::REQUEST_OUT_OF_RANGE);
                }
                download.data.extend_from_slice(data);
                positive_response(sid, &[])
            }
            transfer_sub_function::DOWNLOAD_AND_EXECUTE => {
                if !download.finished || address != self.target.loader_address {
                    return negative_response(sid, nrc::REQUEST_SEQUENCE_ERROR);
                }
                let loader = std::mem::take(&mut download.data);
                info!(len = loader.len(), "Starting loader");
                state.record.loader = loader;
                state.download = None;
                state.mode = EcuMode::Loader;
                positive_response(sid, &[])
            }
            _ => negative_response(sid, nrc::SUB_FUNCTION_NOT_SUPPORTED),
        }
    }

    fn handle_read_memory(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = request[0];
        if request.len() != 7 {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        }
        let address = Self::decode_address(&request[1..5]);
        let len = u16::from_be_bytes([request[5], request[6]]) as usize;

        if state.faults.max_read_len.is_some_and(|max| len > max) {
            return negative_response(sid, nrc::REQUEST_OUT_OF_RANGE);
        }
        if fire(&mut state.faults.failing_reads) {
            return negative_response(sid, nrc::GENERAL_REJECT);
        }

        let Some(data) = state.memory.slice(address, len) else {
            return negative_response(sid, nrc::REQUEST_OUT_OF_RANGE);
        };
        let erased = data.iter().all(|&b| b == 0xFF);

        let mut response = vec![sid.wrapping_add(0x40)];
        if erased {
            response.push(read_memory_format::ERASED);
            response.extend_from_slice(&address.to_be_bytes());
        } else {
            response.push(read_memory_format::DATA);
            response.extend_from_slice(&address.to_be_bytes());
            response.extend_from_slice(data);
            append_checksum(&mut response, 1);
        }
        state.record.reads += 1;
        response
    }

    fn handle_routine_control(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = request[0];
        if request.len() < 4 {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        }
        let sub_function = request[1];
        let routine = u16::from_be_bytes([request[2], request[3]]);
        let params = &request[4..];
        let mut response = request[1..4].to_vec();

        match (sub_function, routine) {
            (routine_sub_function::START_ROUTINE, r) if r == self.target.hash_routine => {
                if params.len() != 8 {
                    return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
                }
                let start = Self::decode_address(&params[..4]);
                let end = Self::decode_address(&params[4..]);
                state.hash = end
                    .checked_sub(start)
                    .and_then(|len| state.memory.slice(start, len as usize))
                    .map(|data| Sha256::digest(data).into());
                response.push(if state.hash.is_some() { 0x00 } else { 0x01 });
            }
            (routine_sub_function::REQUEST_ROUTINE_RESULTS, r) if r == self.target.hash_routine => {
                match state.hash.take() {
                    Some(hash) => response.extend_from_slice(&hash),
                    None => return negative_response(sid, nrc::REQUEST_SEQUENCE_ERROR),
                }
            }
            (routine_sub_function::START_ROUTINE, r) if r == self.target.erase_routine => {
                response.push(self.erase(state, params));
            }
            _ => return negative_response(sid, nrc::REQUEST_OUT_OF_RANGE),
        }

        positive_response(sid, &response)
    }

    /// Erase every partition in the mask; returns the routine status
    fn erase(&self, state: &mut EcuState, params: &[u8]) -> u8 {
        if params.len() != 8 {
            return 0x02;
        }
        let mask = Self::decode_address(&params[..4]);
        let complement = Self::decode_address(&params[4..]);
        if complement != !mask {
            warn!(mask, complement, "Erase mask complement mismatch");
            return 0x02;
        }
        if let Some(status) = state.faults.erase_status {
            return status;
        }

        for p in self.target.selected(mask) {
            state.memory.erase(p.phys_start, p.phys_end);
        }
        info!(mask = format!("0x{:08X}", mask), "Erased");
        state.record.erase_masks.push(mask);
        0x00
    }

    fn handle_compressed_write(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = request[0];
        if state.faults.reject_compressed {
            return negative_response(sid, nrc::GENERAL_PROGRAMMING_FAILURE);
        }
        if request.len() < 4 || request.len() > 255 {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        }
        if verify_checksum(request, 1).is_err() {
            return negative_response(sid, nrc::GENERAL_REJECT);
        }

        let step = request[1];
        let body = &request[2..request.len() - 2];

        if step == 0 {
            if body.len() < 8 || body.len() - 8 > FIRST_PAYLOAD {
                return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
            }
            state.transfer = Some(CompressedTransfer {
                address: Self::decode_address(&body[..4]),
                final_len: Self::decode_address(&body[4..8]) as usize,
                next_step: 1,
                payload: body[8..].to_vec(),
                cursor: StreamCursor::default(),
                written: false,
            });
        } else {
            if fire(&mut state.faults.dropped_frames) {
                state.transfer = None;
                return negative_response(sid, nrc::WRONG_BLOCK_SEQUENCE_COUNTER);
            }
            match state.transfer.as_mut() {
                Some(transfer) if transfer.next_step == step && body.len() <= NEXT_PAYLOAD => {
                    transfer.payload.extend_from_slice(body);
                    transfer.next_step = if step == u8::MAX { 1 } else { step + 1 };
                }
                _ => {
                    state.transfer = None;
                    return negative_response(sid, nrc::WRONG_BLOCK_SEQUENCE_COUNTER);
                }
            }
        }

        let decoded = match state.transfer.as_mut() {
            Some(t) if !t.written => {
                if t.cursor.advance(&t.payload, t.final_len) {
                    t.written = true;
                    Some((t.address, decompress(&t.payload, t.final_len)))
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Some((address, data)) = decoded {
            let written = data.map(|data| state.program(address, &data));
            if !matches!(written, Ok(true)) {
                warn!(address, "Compressed chunk rejected");
                state.transfer = None;
                return negative_response(sid, nrc::GENERAL_PROGRAMMING_FAILURE);
            }
            state.record.compressed_chunks += 1;
        }

        positive_response(sid, &[step])
    }

    fn handle_raw_write(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = request[0];
        if request.len() < 8 || request[1] != transfer_sub_function::DOWNLOAD {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        }
        if verify_checksum(request, 1).is_err() {
            return negative_response(sid, nrc::GENERAL_REJECT);
        }

        let address = Self::decode_address(&request[2..6]);
        let data = &request[6..request.len() - 2];
        if !state.program(address, data) {
            return negative_response(sid, nrc::GENERAL_PROGRAMMING_FAILURE);
        }
        state.record.raw_blocks += 1;
        positive_response(sid, &[])
    }
}

#[async_trait]
impl TransportAdapter for SimulatedEcu {
    async fn send_receive(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if request.len() > MAX_FRAME {
            return Err(TransportError::FrameRejected {
                len: request.len(),
                reason: format!("longer than {} bytes", MAX_FRAME),
            });
        }
        let response = self.process_request(request);
        if response.is_empty() {
            return Err(TransportError::Timeout(timeout));
        }
        Ok(response)
    }

    async fn send(&self, request: &[u8]) -> Result<(), TransportError> {
        self.process_request(request);
        Ok(())
    }

    /// The simulator answers every request in one go; nothing arrives later
    async fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        tokio::time::sleep(timeout).await;
        Err(TransportError::Timeout(timeout))
    }

    async fn broadcast(&self, request: &[u8]) -> Result<(), TransportError> {
        self.process_request(request);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }

    fn address_info(&self) -> AddressInfo {
        AddressInfo {
            tx_id: 0x7E0,
            rx_id: 0x7E8,
            functional_id: 0x101,
        }
    }
}
