//! Fault injection for the simulated ECU

/// Faults the simulator injects; counters count down as they fire
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Memory reads longer than this are refused
    pub max_read_len: Option<usize>,
    /// Number of upcoming memory reads to refuse
    pub failing_reads: u32,
    /// Number of upcoming flash writes stored with one bit flipped
    pub corrupt_writes: u32,
    /// Status the erase routine answers with instead of success
    pub erase_status: Option<u8>,
    /// Every compressed write frame gets a programming failure
    pub reject_compressed: bool,
    /// Number of upcoming follow-up frames refused with a sequence error
    pub dropped_frames: u32,
    /// The loader reports this identity instead of its signature
    pub loader_identity: Option<String>,
    /// Return to normal is refused
    pub refuse_return_to_normal: bool,
    /// Every key is rejected
    pub reject_keys: bool,
}

/// Take one shot from a fault counter
pub(crate) fn fire(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}
