//! Additive 16-bit frame checksum

/// Wrapping sum of all bytes, truncated to 16 bits
pub fn checksum16(data: &[u8]) -> u16 {
    data.iter()
        .fold(0u16, |sum, &b| sum.wrapping_add(u16::from(b)))
}

/// Append the big-endian checksum of `frame[window_start..]` to `frame`
pub fn append_checksum(frame: &mut Vec<u8>, window_start: usize) {
    let sum = checksum16(&frame[window_start..]);
    frame.extend_from_slice(&sum.to_be_bytes());
}

/// Check the trailing checksum of `frame` against `frame[window_start..len - 2]`
///
/// Returns `(expected, actual)` on mismatch.
pub fn verify_checksum(frame: &[u8], window_start: usize) -> Result<(), (u16, u16)> {
    if frame.len() < window_start + 2 {
        return Err((0, 0));
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    let expected = u16::from_be_bytes([trailer[0], trailer[1]]);
    let actual = checksum16(&body[window_start..]);
    if expected == actual {
        Ok(())
    } else {
        Err((expected, actual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum16(&[]), 0);
        assert_eq!(checksum16(&[0x01, 0x02, 0x03]), 6);
        let big = vec![0xFF; 300];
        assert_eq!(checksum16(&big), (0xFFu32 * 300) as u16);
        let huge = vec![0xFF; 1000];
        assert_eq!(checksum16(&huge), ((0xFFu32 * 1000) & 0xFFFF) as u16);
    }

    #[test]
    fn test_append_and_verify() {
        let mut frame = vec![0x36, 0x00, 0x12, 0x34];
        append_checksum(&mut frame, 1);
        assert_eq!(&frame[4..], &(0x46u16).to_be_bytes());
        assert!(verify_checksum(&frame, 1).is_ok());

        frame[2] ^= 0x01;
        assert_eq!(verify_checksum(&frame, 1), Err((0x46, 0x47)));
    }
}
