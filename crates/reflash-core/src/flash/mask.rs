//! Partition mask algebra and the protected-partition interlock

/// `(diff | force) & !lock`
pub const fn combine(diff: u32, force: u32, lock: u32) -> u32 {
    (diff | force) & !lock
}

/// What happened to the protected partition's bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interlock {
    /// Protected bit not selected
    NotSelected,
    /// Sole change and no guard pattern: written this pass
    Included,
    /// Other partitions change too: held back for a second pass
    Deferred,
    /// Guard pattern found in its content: never written from this image
    Guarded,
}

/// Apply the protected-partition rule to a combined mask
///
/// The protected partition is only written on a pass where it is the only
/// selected partition and its content carries none of the guard patterns.
pub fn apply_interlock(mask: u32, protected_bit: u32, guard_hit: bool) -> (u32, Interlock) {
    if protected_bit == 0 || mask & protected_bit == 0 {
        return (mask, Interlock::NotSelected);
    }
    if mask != protected_bit {
        return (mask & !protected_bit, Interlock::Deferred);
    }
    if guard_hit {
        return (0, Interlock::Guarded);
    }
    (mask, Interlock::Included)
}
