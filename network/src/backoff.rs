use rand::Rng;
use std::time::Duration;

/// Exponentially growing delay between reconnect attempts, with additive
/// random jitter so peers that lost the same node do not retry in lockstep.
///
/// The n-th delay is `min(initial * factor^n, maximum)` plus a uniform draw
/// from `[0, jitter]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    initial: Duration,
    maximum: Duration,
    factor: u32,
    jitter: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, maximum: Duration, factor: u32, jitter: Duration) -> Self {
        Self {
            initial,
            maximum: maximum.max(initial),
            factor: factor.max(1),
            jitter,
            current: initial,
        }
    }

    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(self.factor).min(self.maximum);

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            delay
        } else {
            delay + Duration::from_millis(rng.gen_range(0..=jitter_ms))
        }
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(100),
            Duration::from_secs(5),
            2,
            Duration::from_millis(100),
        )
    }
}
