use std::time::Duration;

use rand::{Rng, rngs::SmallRng};

/// Exponential backoff with jitter for the Kore link.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub backoff: f64,
    pub jitter_p: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_millis(30_000),
            backoff: 2.0,
            jitter_p: 0.2,
        }
    }
}

/// Attempt/delay bookkeeping across one connection's lifetime.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReconnectState {
    pub attempt: u32,
    pub current_delay: Duration,
}

impl ReconnectState {
    /// Successful connect: back to square one.
    pub fn on_connected(&mut self, policy: &ReconnectPolicy) {
        self.attempt = 0;
        self.current_delay = policy.initial;
    }

    /// Delay before the next attempt; first failure waits `initial`,
    /// subsequent failures scale by `backoff` up to `max`, then jitter by a
    /// uniform factor in `[1 - p, 1 + p]`.
    pub fn next_delay(&mut self, policy: &ReconnectPolicy, rng: &mut SmallRng) -> Duration {
        let base = if self.attempt == 0 {
            policy.initial
        } else {
            let scaled = (self.current_delay.as_millis() as f64 * policy.backoff).round() as u64;
            Duration::from_millis(scaled.min(policy.max.as_millis() as u64))
        };

        let next = if policy.jitter_p > 0.0 {
            let factor = rng.random_range((1.0 - policy.jitter_p)..=(1.0 + policy.jitter_p));
            base.mul_f64(factor)
        } else {
            base
        };

        self.current_delay = next;
        self.attempt += 1;
        next
    }
}

/// Round-robin cursor over the candidate ports: unique, non-zero, sorted.
#[derive(Clone, Debug)]
pub struct PortRing {
    ports: Vec<u16>,
    index: usize,
}

impl PortRing {
    pub fn new(candidates: &[u16]) -> Self {
        let mut ports: Vec<u16> = candidates.iter().copied().filter(|&p| p != 0).collect();
        ports.sort_unstable();
        ports.dedup();
        Self { ports, index: 0 }
    }

    /// Position the cursor on `port` if it is a candidate.
    pub fn start_at(&mut self, port: u16) {
        if let Some(i) = self.ports.iter().position(|&p| p == port) {
            self.index = i;
        }
    }

    pub fn current(&self) -> Option<u16> {
        self.ports.get(self.index).copied()
    }

    pub fn advance(&mut self) {
        if !self.ports.is_empty() {
            self.index = (self.index + 1) % self.ports.len();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}
