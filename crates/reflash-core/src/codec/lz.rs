//! Encoder and decoder

use std::sync::atomic::{AtomicBool, Ordering};

use super::{CodecError, MAX_MATCH, MIN_MATCH, WINDOW_SIZE};

const HASH_BITS: u32 = 13;
const NIL: usize = usize::MAX;
/// Positions between cancellation checks
const CANCEL_STRIDE: usize = 4096;

/// Worst-case encoded size for `len` input bytes
///
/// All literals: one mask byte per eight, plus up to three padding bytes.
pub const fn max_compressed_len(len: usize) -> usize {
    len + len.div_ceil(8) + 3
}

/// Compress `input` into a padded token stream
pub fn compress(input: &[u8]) -> Vec<u8> {
    // No limit and no cancel flag: encoding cannot fail
    encode(input, usize::MAX, None).unwrap_or_default()
}

/// Hash chains over 3-byte prefixes, most recent position first
struct MatchFinder {
    head: Vec<usize>,
    prev: Vec<usize>,
}

impl MatchFinder {
    fn new() -> Self {
        Self {
            head: vec![NIL; 1 << HASH_BITS],
            prev: vec![NIL; WINDOW_SIZE],
        }
    }

    fn hash(input: &[u8], pos: usize) -> usize {
        let key = u32::from(input[pos]) << 16
            | u32::from(input[pos + 1]) << 8
            | u32::from(input[pos + 2]);
        (key.wrapping_mul(0x9E37_79B1) >> (32 - HASH_BITS)) as usize
    }

    fn insert(&mut self, input: &[u8], pos: usize) {
        if pos + MIN_MATCH > input.len() {
            return;
        }
        let h = Self::hash(input, pos);
        self.prev[pos % WINDOW_SIZE] = self.head[h];
        self.head[h] = pos;
    }

    /// Longest match for `pos`, nearest offset winning ties
    fn longest(&self, input: &[u8], pos: usize) -> (usize, usize) {
        let max_len = MAX_MATCH.min(input.len() - pos);
        if max_len < MIN_MATCH {
            return (0, 0);
        }

        let mut best = (0, 0);
        let mut candidate = self.head[Self::hash(input, pos)];

        while candidate != NIL && candidate < pos && pos - candidate <= WINDOW_SIZE {
            let len = input[candidate..]
                .iter()
                .zip(&input[pos..pos + max_len])
                .take_while(|(a, b)| a == b)
                .count();

            if len > best.0 {
                best = (len, pos - candidate);
                if len == max_len {
                    break;
                }
            }

            let next = self.prev[candidate % WINDOW_SIZE];
            if next >= candidate {
                break;
            }
            candidate = next;
        }

        if best.0 >= MIN_MATCH {
            best
        } else {
            (0, 0)
        }
    }
}

/// Encode with an output limit and an optional cancellation flag
pub(crate) fn encode(
    input: &[u8],
    limit: usize,
    cancel: Option<&AtomicBool>,
) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(max_compressed_len(input.len()).min(limit));
    let mut finder = MatchFinder::new();
    let mut pos = 0;
    let mut mask_at = 0;
    let mut bit = 0u8;
    let mut next_check = CANCEL_STRIDE;

    while pos < input.len() {
        if pos >= next_check {
            next_check = pos + CANCEL_STRIDE;
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Err(CodecError::Cancelled);
            }
        }

        if bit == 0 {
            mask_at = out.len();
            out.push(0);
        }

        let (len, offset) = finder.longest(input, pos);
        if len > 0 {
            out[mask_at] |= 0x80 >> bit;
            let field = ((len - MIN_MATCH) << 12 | (offset - 1)) as u16;
            out.extend_from_slice(&field.to_be_bytes());
            for p in pos..pos + len {
                finder.insert(input, p);
            }
            pos += len;
        } else {
            out.push(input[pos]);
            finder.insert(input, pos);
            pos += 1;
        }

        if out.len() > limit {
            return Err(CodecError::Overrun { limit });
        }
        bit = (bit + 1) % 8;
    }

    while out.len() % 4 != 0 {
        out.push(0);
    }
    if out.len() > limit {
        return Err(CodecError::Overrun { limit });
    }

    Ok(out)
}

/// Decode a token stream into exactly `expected_len` bytes
///
/// Fails without returning partial output on a truncated stream or a
/// back-reference that points before the start of the output.
pub fn decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(expected_len);
    let mut i = 0;

    while out.len() < expected_len {
        let mask = *data.get(i).ok_or(CodecError::Truncated { offset: i })?;
        i += 1;

        for bit in 0..8 {
            if out.len() >= expected_len {
                break;
            }

            if mask & (0x80 >> bit) == 0 {
                let literal = *data.get(i).ok_or(CodecError::Truncated { offset: i })?;
                out.push(literal);
                i += 1;
                continue;
            }

            let token = data
                .get(i..i + 2)
                .ok_or(CodecError::Truncated { offset: i })?;
            let field = u16::from_be_bytes([token[0], token[1]]) as usize;
            let len = (field >> 12) + MIN_MATCH;
            let distance = (field & 0x0FFF) + 1;

            if distance > out.len() {
                return Err(CodecError::InvalidBackReference {
                    offset: i,
                    distance,
                    available: out.len(),
                });
            }
            if out.len() + len > expected_len {
                return Err(CodecError::LengthExceeded {
                    offset: i,
                    expected: expected_len,
                });
            }

            // Byte by byte: the source may overlap what is being written
            let start = out.len() - distance;
            for k in 0..len {
                let byte = out[start + k];
                out.push(byte);
            }
            i += 2;
        }
    }

    Ok(out)
}
