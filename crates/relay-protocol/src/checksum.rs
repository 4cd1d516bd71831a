use std::{
    panic::{self, AssertUnwindSafe},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use tracing::warn;

use crate::state::ProtocolState;

/// Leaf seed routine: `u64 seed(data, len)`.
pub type SeedFn = unsafe extern "system-unwind" fn(*mut u8, u32) -> u64;
/// Leaf checksum routine: `u8 checksum(data, len, counter, seed64)`.
pub type ChecksumFn = unsafe extern "system-unwind" fn(*mut u8, u32, u32, u64) -> u8;

/// Process-wide PRNG for the padding byte, seeded exactly once from a mix of
/// the sub-second counter, a coarse tick and the process id.
static PRNG: Lazy<Mutex<SmallRng>> = Lazy::new(|| Mutex::new(SmallRng::seed_from_u64(mix_entropy())));

fn mix_entropy() -> u64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let fine = u64::from(now.subsec_nanos());
    let coarse = now.as_millis() as u64;
    let pid = u64::from(std::process::id());
    fine.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ coarse.rotate_left(21) ^ (pid << 17)
}

fn padding_byte() -> u8 {
    let r: i32 = PRNG.lock().unwrap().random_range(0..256);
    (r - 128) as u8
}

/// Service over the two opaque leaf routines.
///
/// `seed` returns the random padding byte the caller appends to the wire
/// payload, not the 64-bit seed itself; the seed lands in [`ProtocolState`].
/// Leaf faults are contained: a panic crossing the barrier yields a zero byte
/// and a diagnostic, and the caller proceeds.
#[derive(Clone, Copy)]
pub struct ChecksumService {
    seed_fn: SeedFn,
    checksum_fn: ChecksumFn,
}

impl ChecksumService {
    pub fn new(seed_fn: SeedFn, checksum_fn: ChecksumFn) -> Self {
        Self { seed_fn, checksum_fn }
    }

    /// Draw the padding byte, run the leaf seed routine over
    /// `data || padding`, store the split seed halves, return the padding.
    pub fn seed(&self, data: &[u8], state: &ProtocolState) -> u8 {
        let extra = padding_byte();

        let mut tmp = Vec::with_capacity(data.len() + 1);
        tmp.extend_from_slice(data);
        tmp.push(extra);

        let fp = self.seed_fn;
        let len = tmp.len() as u32;
        let seed64 = barrier("seed", move || unsafe { fp(tmp.as_mut_ptr(), len) });
        state.store_seed(seed64);

        extra
    }

    /// Recompose the 64-bit seed from its halves and run the leaf checksum
    /// routine over `data`.
    pub fn checksum(&self, data: &mut [u8], counter: u32, low: u32, high: u32) -> u8 {
        let seed64 = (u64::from(high) << 32) | u64::from(low);
        let fp = self.checksum_fn;
        let ptr = data.as_mut_ptr();
        let len = data.len() as u32;
        barrier("checksum", move || unsafe { fp(ptr, len, counter, seed64) })
    }
}

/// Fault barrier around a leaf invocation. A fault must not escape into the
/// host's call stack; it degrades to the zero value and a log line.
fn barrier<R: Default>(which: &str, f: impl FnOnce() -> R) -> R {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(_) => {
            warn!(leaf = which, "leaf routine faulted, substituting zero");
            R::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    unsafe extern "system-unwind" fn sum_seed(data: *mut u8, len: u32) -> u64 {
        let s = unsafe { std::slice::from_raw_parts(data, len as usize) };
        let sum: u64 = s.iter().map(|&b| u64::from(b)).sum();
        (sum << 32) | u64::from(len)
    }

    unsafe extern "system-unwind" fn sum_checksum(
        data: *mut u8,
        len: u32,
        counter: u32,
        seed64: u64,
    ) -> u8 {
        let s = unsafe { std::slice::from_raw_parts(data, len as usize) };
        let sum: u32 = s.iter().map(|&b| u32::from(b)).sum();
        (sum + counter + (seed64 as u32) + ((seed64 >> 32) as u32)) as u8
    }

    unsafe extern "system-unwind" fn bad_seed(_: *mut u8, _: u32) -> u64 {
        panic!("leaf blew up");
    }

    unsafe extern "system-unwind" fn bad_checksum(_: *mut u8, _: u32, _: u32, _: u64) -> u8 {
        panic!("leaf blew up");
    }

    #[test]
    fn seed_stores_halves_and_returns_padding() {
        let svc = ChecksumService::new(sum_seed, sum_checksum);
        let state = ProtocolState::new();

        let data = [0x1C, 0x0B];
        let extra = svc.seed(&data, &state);

        // The leaf saw data || extra, so the stored high half is the byte sum.
        let expect_high = 0x1C + 0x0B + u32::from(extra);
        assert_eq!(state.seed_high.load(std::sync::atomic::Ordering::Relaxed), expect_high);
        assert_eq!(state.seed_low.load(std::sync::atomic::Ordering::Relaxed), 3);
    }

    #[test]
    fn checksum_recomposes_seed() {
        let svc = ChecksumService::new(sum_seed, sum_checksum);
        let mut data = [0xAA, 0xBB, 0xCC];
        let got = svc.checksum(&mut data, 1, 0x10, 0x20);
        let expect = (0xAAu32 + 0xBB + 0xCC + 1 + 0x10 + 0x20) as u8;
        assert_eq!(got, expect);
    }

    #[test]
    fn faulting_leaves_degrade_to_zero() {
        let svc = ChecksumService::new(bad_seed, bad_checksum);
        let state = ProtocolState::new();

        let _padding = svc.seed(&[1, 2, 3], &state);
        assert_eq!(state.seed64(), 0);

        let mut data = [1, 2, 3];
        assert_eq!(svc.checksum(&mut data, 5, 1, 2), 0);
    }
}
