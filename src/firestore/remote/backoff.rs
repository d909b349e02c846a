use std::time::Duration;

use rand::Rng;

use crate::firestore::settings::RemoteSettings;

/// Jitter applied to every delay, as a fraction of the current base delay.
pub const RANDOM_FACTOR: f64 = 0.5;

/// Exponential backoff for stream reconnects.
///
/// The first attempt runs immediately; each later attempt waits the current base
/// delay (jittered by up to half of it) and grows the base by the configured factor,
/// clamped to `[initial, max]`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    offline_delay: Duration,
    current_base: Duration,
}

impl ExponentialBackoff {
    pub fn new(settings: &RemoteSettings) -> Self {
        Self {
            initial_delay: settings.initial_backoff_delay,
            backoff_factor: settings.backoff_factor,
            max_delay: settings.max_backoff_delay,
            offline_delay: settings.offline_retry_delay,
            current_base: Duration::ZERO,
        }
    }

    /// Next attempt goes out without waiting.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Next attempt waits the maximum delay, used after the backend reports exhaustion.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.max_delay;
    }

    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    /// Delay before the next attempt. While offline the delay is fixed and short so
    /// that connectivity returning is noticed quickly.
    pub fn next_delay(&mut self, offline: bool) -> Duration {
        if offline && !self.current_base.is_zero() {
            return self.offline_delay.min(self.current_base);
        }
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current_base.as_secs_f64();
        let jitter = RANDOM_FACTOR * base * rng.gen_range(-1.0..=1.0);
        let delay = Duration::from_secs_f64((base + jitter).max(0.0));

        let next = self.current_base.mul_f64(self.backoff_factor);
        self.current_base = next.clamp(self.initial_delay, self.max_delay);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(&RemoteSettings::default())
    }

    #[test]
    fn first_attempt_is_immediate_then_grows_to_the_cap() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut backoff = backoff();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
        assert_eq!(backoff.current_base(), Duration::from_secs(1));

        let delay = backoff.next_delay_with_rng(&mut rng);
        assert!(delay >= Duration::from_millis(500) && delay <= Duration::from_millis(1500));
        assert_eq!(backoff.current_base(), Duration::from_millis(1500));

        for _ in 0..30 {
            let delay = backoff.next_delay_with_rng(&mut rng);
            assert!(delay <= Duration::from_secs(90));
        }
        assert_eq!(backoff.current_base(), Duration::from_secs(60));
    }

    #[test]
    fn reset_and_reset_to_max() {
        let mut backoff = backoff();
        backoff.reset_to_max();
        assert_eq!(backoff.current_base(), Duration::from_secs(60));
        backoff.reset();
        assert_eq!(backoff.next_delay(false), Duration::ZERO);
    }

    #[test]
    fn offline_delay_is_fixed() {
        let mut backoff = backoff();
        backoff.reset_to_max();
        assert_eq!(backoff.next_delay(true), Duration::from_secs(1));
        assert_eq!(backoff.current_base(), Duration::from_secs(60));
    }
}
