//! Compressed write framing
//!
//! ```text
//! first:  SID 00   addr32 finalLen32 payload(<=243) ck16
//! next:   SID step payload(<=251)                   ck16
//! ```
//!
//! Frames are at most 255 bytes. The step counter runs 0, 1, .., 255, 1, ..
//! and never returns to 0 within a transfer. The checksum covers everything
//! after the SID.

use reflash_uds::checksum::append_checksum;

/// Payload bytes carried by the first frame
pub const FIRST_PAYLOAD: usize = 243;
/// Payload bytes carried by every later frame
pub const NEXT_PAYLOAD: usize = 251;

/// Step counter following `step`
pub const fn next_step(step: u8) -> u8 {
    if step == u8::MAX {
        1
    } else {
        step + 1
    }
}

/// One compressed write request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub step: u8,
    pub bytes: Vec<u8>,
}

/// Split a compressed chunk into write frames
pub fn build_frames(service_id: u8, address: u32, final_len: u32, payload: &[u8]) -> Vec<Frame> {
    let (head, mut rest) = payload.split_at(payload.len().min(FIRST_PAYLOAD));

    let mut first = Vec::with_capacity(12 + head.len());
    first.extend_from_slice(&[service_id, 0x00]);
    first.extend_from_slice(&address.to_be_bytes());
    first.extend_from_slice(&final_len.to_be_bytes());
    first.extend_from_slice(head);
    append_checksum(&mut first, 1);

    let mut frames = vec![Frame {
        step: 0,
        bytes: first,
    }];

    let mut step = 0;
    while !rest.is_empty() {
        step = next_step(step);
        let (body, tail) = rest.split_at(rest.len().min(NEXT_PAYLOAD));
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&[service_id, step]);
        frame.extend_from_slice(body);
        append_checksum(&mut frame, 1);
        frames.push(Frame { step, bytes: frame });
        rest = tail;
    }

    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use reflash_uds::checksum::verify_checksum;

    #[test]
    fn test_first_frame_layout() {
        let frames = build_frames(0xB0, 0x0006_0000, 0x0002_0000, &[1, 2, 3, 4]);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].bytes,
            vec![0xB0, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 1, 2, 3, 4, 0x00, 0x12]
        );
    }

    #[test]
    fn test_frames_fill_to_255_bytes() {
        let payload = vec![0x5Au8; FIRST_PAYLOAD + NEXT_PAYLOAD + 10];
        let frames = build_frames(0xB0, 0, payload.len() as u32, &payload);

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].bytes.len(), 255);
        assert_eq!(frames[1].bytes.len(), 255);
        assert_eq!(frames[2].bytes.len(), 14);
        for frame in &frames {
            assert!(verify_checksum(&frame.bytes, 1).is_ok());
        }
    }

    #[test]
    fn test_step_counter_wraps_to_one() {
        let payload = vec![0u8; FIRST_PAYLOAD + NEXT_PAYLOAD * 300];
        let frames = build_frames(0xB0, 0, 0, &payload);
        let steps: Vec<u8> = frames.iter().map(|f| f.step).collect();

        assert_eq!(steps.len(), 301);
        assert_eq!(steps[0], 0);
        assert_eq!(&steps[1..4], &[1, 2, 3]);
        assert_eq!(steps[255], 255);
        assert_eq!(steps[256], 1);
        assert_eq!(steps.iter().filter(|&&s| s == 0).count(), 1);
        for (frame, step) in frames.iter().zip(&steps) {
            assert_eq!(frame.bytes[1], *step);
        }
    }

    #[test]
    fn test_next_step() {
        assert_eq!(next_step(0), 1);
        assert_eq!(next_step(254), 255);
        assert_eq!(next_step(255), 1);
    }
}
