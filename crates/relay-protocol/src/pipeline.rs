use std::sync::atomic::Ordering;

use crate::{
    checksum::ChecksumService,
    opcodes::MARKER_1C_0B,
    rules::{on_recv, on_send_head},
    scanner::scan,
    state::ProtocolState,
};

/// What the RECV trampoline should do with a surfaced buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvDisposition {
    /// Hand the buffer to the caller unchanged.
    Surface,
    /// `C7 0B` head: discard this buffer and read the next one.
    DropAndReread,
}

/// Receive-side processing: run the scanner, apply the reset rules, and
/// report whether the buffer must be dropped.
pub fn process_recv(buf: &[u8], state: &ProtocolState) -> RecvDisposition {
    if buf.len() < 2 {
        return RecvDisposition::Surface;
    }

    let r = scan(buf);
    on_recv(&r, state);
    if r.head_c70b {
        return RecvDisposition::DropAndReread;
    }
    RecvDisposition::Surface
}

/// Send-side transform, in place.
///
/// Applies the head rules; once the marker has been observed, swaps the
/// trailing byte for the seed padding byte (counter 0) or the checksum byte
/// (counter > 0) and rolls the counter. A `1C 0B`-headed frame is computed
/// over exactly its two head bytes.
pub fn transform_send(svc: &ChecksumService, data: &mut Vec<u8>, state: &ProtocolState) {
    on_send_head(data, state);

    if !state.marker_found() || data.len() < 2 {
        return;
    }

    data.pop();

    if MARKER_1C_0B.matches(data) {
        data.truncate(2);
    }

    let counter = state.counter();
    let appended = if counter == 0 {
        svc.seed(data, state)
    } else {
        let low = state.seed_low.load(Ordering::Relaxed);
        let high = state.seed_high.load(Ordering::Relaxed);
        svc.checksum(data, counter, low, high)
    };

    data.push(appended);
    state.roll12();
}

#[cfg(test)]
mod test {
    use super::*;

    unsafe extern "system-unwind" fn sum_seed(data: *mut u8, len: u32) -> u64 {
        let s = unsafe { std::slice::from_raw_parts(data, len as usize) };
        let sum: u64 = s.iter().map(|&b| u64::from(b)).sum();
        (sum << 32) | 0x0000_00AA
    }

    unsafe extern "system-unwind" fn sum_checksum(
        data: *mut u8,
        len: u32,
        counter: u32,
        seed64: u64,
    ) -> u8 {
        let s = unsafe { std::slice::from_raw_parts(data, len as usize) };
        let sum: u32 = s.iter().map(|&b| u32::from(b)).sum();
        sum.wrapping_add(counter).wrapping_add(seed64 as u32) as u8
    }

    fn svc() -> ChecksumService {
        ChecksumService::new(sum_seed, sum_checksum)
    }

    #[test]
    fn first_marker_frame_gets_seed_padding() {
        let state = ProtocolState::new();
        let mut data = vec![0x1C, 0x0B, 0x00];

        transform_send(&svc(), &mut data, &state);

        // Marker rule fired, one byte dropped, one appended.
        assert!(state.marker_found());
        assert_eq!(data.len(), 3);
        assert_eq!(&data[..2], &[0x1C, 0x0B]);
        assert_eq!(state.counter(), 1);
        // Seed halves were populated from the leaf result over [1C 0B extra].
        let extra = data[2];
        let expect_high = 0x1C + 0x0B + u32::from(extra);
        assert_eq!(state.seed_high.load(Ordering::Relaxed), expect_high);
        assert_eq!(state.seed_low.load(Ordering::Relaxed), 0xAA);
    }

    #[test]
    fn subsequent_send_gets_checksum_byte() {
        let state = ProtocolState::new();
        state.found_marker.store(true, Ordering::Relaxed);
        state.counter.store(1, Ordering::Relaxed);
        state.store_seed(0x0000_0001_0000_0002);

        let mut data = vec![0xAA, 0xBB, 0xCC, 0xDD];
        transform_send(&svc(), &mut data, &state);

        assert_eq!(data.len(), 4);
        assert_eq!(&data[..3], &[0xAA, 0xBB, 0xCC]);
        let expect = (0xAAu32 + 0xBB + 0xCC).wrapping_add(1).wrapping_add(2) as u8;
        assert_eq!(data[3], expect);
        assert_eq!(state.counter(), 2);
    }

    #[test]
    fn length_preserved_while_marker_active() {
        let state = ProtocolState::new();
        state.found_marker.store(true, Ordering::Relaxed);
        state.counter.store(3, Ordering::Relaxed);

        for len in 2..16 {
            let mut data = vec![0x42u8; len];
            transform_send(&svc(), &mut data, &state);
            assert_eq!(data.len(), len);
        }
    }

    #[test]
    fn counter_strictly_increases_within_session() {
        let state = ProtocolState::new();

        let mut data = vec![0x1C, 0x0B, 0x00];
        transform_send(&svc(), &mut data, &state);

        for expect in 2..40u32 {
            let mut frame = vec![0x42, 0x43, 0x44, 0x45];
            transform_send(&svc(), &mut frame, &state);
            assert_eq!(state.counter(), expect);
        }
    }

    #[test]
    fn no_marker_means_pure_passthrough() {
        let state = ProtocolState::new();
        let mut data = vec![0x42, 0x43, 0x44];
        transform_send(&svc(), &mut data, &state);
        assert_eq!(data, vec![0x42, 0x43, 0x44]);
        assert_eq!(state.counter(), 0);
    }

    #[test]
    fn short_buffer_with_marker_passes_through() {
        let state = ProtocolState::new();
        state.found_marker.store(true, Ordering::Relaxed);
        let mut data = vec![0x42];
        transform_send(&svc(), &mut data, &state);
        assert_eq!(data, vec![0x42]);
        assert_eq!(state.counter(), 0);
    }

    #[test]
    fn reset_head_on_send_disables_transform() {
        let state = ProtocolState::new();
        state.found_marker.store(true, Ordering::Relaxed);
        state.counter.store(9, Ordering::Relaxed);

        let mut data = vec![0x26, 0x0C, 0x01, 0x02];
        transform_send(&svc(), &mut data, &state);

        // Rule cleared the marker before the transform could run.
        assert_eq!(data, vec![0x26, 0x0C, 0x01, 0x02]);
        assert_eq!(state.counter(), 0);
        assert!(!state.marker_found());
    }

    #[test]
    fn recv_c70b_signals_drop() {
        let state = ProtocolState::new();
        assert_eq!(process_recv(&[0xC7, 0x0B], &state), RecvDisposition::DropAndReread);
        assert_eq!(process_recv(&[0x11, 0x22], &state), RecvDisposition::Surface);
    }

    #[test]
    fn recv_reset_triggers() {
        let state = ProtocolState::new();
        state.counter.store(7, Ordering::Relaxed);
        state.found_marker.store(true, Ordering::Relaxed);
        state.store_seed(0x1234_5678_9ABC_DEF0);

        assert_eq!(process_recv(&[0xC7, 0x0A, 0x01], &state), RecvDisposition::Surface);
        assert_eq!(state.counter(), 0);
        assert!(!state.marker_found());
        assert_eq!(state.seed64(), 0);
    }

    #[test]
    fn recv_short_buffer_is_inert() {
        let state = ProtocolState::new();
        state.counter.store(5, Ordering::Relaxed);
        assert_eq!(process_recv(&[0xC7], &state), RecvDisposition::Surface);
        assert_eq!(state.counter(), 5);
    }
}
