use rand::Rng;
use tokio::time::Duration;

/// Capped exponential backoff with jitter.
///
/// The `n`th consecutive failure waits `min * 2^(n-1)`, capped at `max`, less a random fraction
/// of up to `jitter` of that delay so that many clients restarting together spread out.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            jitter: 0.25,
        }
    }

    pub fn with_jitter(self, jitter: f64) -> Self {
        Self {
            jitter: jitter.clamp(0.0, 1.0),
            ..self
        }
    }

    /// The delay before retrying after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        let capped = self
            .min
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max);
        if self.jitter == 0.0 {
            return capped;
        }
        let frac = rand::thread_rng().gen_range(0.0..=self.jitter);
        capped.mul_f64(1.0 - frac)
    }
}
