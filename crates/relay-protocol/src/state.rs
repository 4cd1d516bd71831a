use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Shared protocol state: the rolling 12-bit counter, the marker flag, and
/// the two halves of the 64-bit seed.
///
/// All fields are atomics with relaxed ordering; the SEND transform is
/// serialized by a mutex one level up, so the atomics only need to be
/// tear-free for concurrent RECV readers.
#[derive(Debug, Default)]
pub struct ProtocolState {
    pub counter: AtomicU32,
    pub found_marker: AtomicBool,
    pub seed_low: AtomicU32,
    pub seed_high: AtomicU32,
}

impl ProtocolState {
    pub const fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
            found_marker: AtomicBool::new(false),
            seed_low: AtomicU32::new(0),
            seed_high: AtomicU32::new(0),
        }
    }

    pub fn reset_all(&self) {
        self.counter.store(0, Ordering::Relaxed);
        self.found_marker.store(false, Ordering::Relaxed);
        self.seed_low.store(0, Ordering::Relaxed);
        self.seed_high.store(0, Ordering::Relaxed);
    }

    /// Counter wraps modulo 4096.
    #[inline]
    pub fn roll12(&self) {
        let c = self.counter.load(Ordering::Relaxed);
        self.counter.store((c + 1) & 0x0FFF, Ordering::Relaxed);
    }

    #[inline]
    pub fn counter(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn marker_found(&self) -> bool {
        self.found_marker.load(Ordering::Relaxed)
    }

    pub fn store_seed(&self, seed64: u64) {
        self.seed_high.store((seed64 >> 32) as u32, Ordering::Relaxed);
        self.seed_low.store(seed64 as u32, Ordering::Relaxed);
    }

    #[inline]
    pub fn seed64(&self) -> u64 {
        (u64::from(self.seed_high.load(Ordering::Relaxed)) << 32) |
            u64::from(self.seed_low.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roll_wraps_at_4096() {
        let s = ProtocolState::new();
        s.counter.store(4095, Ordering::Relaxed);
        s.roll12();
        assert_eq!(s.counter(), 0);
        s.roll12();
        assert_eq!(s.counter(), 1);
    }

    #[test]
    fn seed_split_recompose() {
        let s = ProtocolState::new();
        s.store_seed(0xDEAD_BEEF_0BAD_F00D);
        assert_eq!(s.seed_high.load(Ordering::Relaxed), 0xDEAD_BEEF);
        assert_eq!(s.seed_low.load(Ordering::Relaxed), 0x0BAD_F00D);
        assert_eq!(s.seed64(), 0xDEAD_BEEF_0BAD_F00D);
    }

    #[test]
    fn reset_clears_everything() {
        let s = ProtocolState::new();
        s.counter.store(7, Ordering::Relaxed);
        s.found_marker.store(true, Ordering::Relaxed);
        s.store_seed(u64::MAX);
        s.reset_all();
        assert_eq!(s.counter(), 0);
        assert!(!s.marker_found());
        assert_eq!(s.seed64(), 0);
    }
}
