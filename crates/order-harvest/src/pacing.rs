//! Randomized delays around outbound calls.
//!
//! The message gateway sits in front of a personal WhatsApp number, so every
//! fetch and every processed message is followed by a human-looking pause.
//! All waits go through `tokio::time::sleep`; tests run on a paused clock.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Closed interval of seconds to wait, sampled uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DelayRange {
    /// No wait at all.
    pub const ZERO: DelayRange = DelayRange {
        min_secs: 0.0,
        max_secs: 0.0,
    };

    pub const fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    /// A range that always yields `secs`.
    pub const fn fixed(secs: f64) -> Self {
        Self::new(secs, secs)
    }

    pub fn is_zero(&self) -> bool {
        self.max_secs <= 0.0 && self.min_secs <= 0.0
    }

    /// Draw a duration from the range using the given RNG.
    ///
    /// A degenerate or reversed range yields `min_secs`. Negative bounds are
    /// clamped to zero.
    pub fn sample_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let min = self.min_secs.max(0.0);
        let max = self.max_secs.max(0.0);
        let secs = if max > min {
            rng.random_range(min..=max)
        } else {
            min
        };
        Duration::from_secs_f64(secs)
    }

    /// Draw a duration using the thread-local RNG.
    pub fn sample(&self) -> Duration {
        self.sample_with(&mut rand::rng())
    }
}

impl Default for DelayRange {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Sleep for a random duration drawn from `range`.
pub async fn delay(range: DelayRange, reason: &str) {
    if range.is_zero() {
        return;
    }
    let wait = range.sample();
    debug!(reason, secs = format!("{:.1}", wait.as_secs_f64()), "pacing delay");
    tokio::time::sleep(wait).await;
}

/// Sleep for a fixed duration.
pub async fn pause(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

/// Serde adapter storing a `Duration` as fractional seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs_f64(f64::deserialize(d)?.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn samples_stay_within_bounds() {
        let range = DelayRange::new(15.0, 25.0);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let d = range.sample_with(&mut rng).as_secs_f64();
            assert!((15.0..=25.0).contains(&d), "{d} out of range");
        }
    }

    #[test]
    fn fixed_range_is_exact() {
        let mut rng = StdRng::seed_from_u64(1);
        let d = DelayRange::fixed(5.0).sample_with(&mut rng);
        assert_eq!(d, Duration::from_secs(5));
    }

    #[test]
    fn reversed_range_collapses_to_min() {
        let mut rng = StdRng::seed_from_u64(1);
        let d = DelayRange::new(8.0, 3.0).sample_with(&mut rng);
        assert_eq!(d, Duration::from_secs(8));
    }

    #[test]
    fn negative_bounds_clamp_to_zero() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            DelayRange::new(-2.0, -1.0).sample_with(&mut rng),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delay_waits_inside_the_window() {
        let start = tokio::time::Instant::now();
        delay(DelayRange::new(4.0, 8.0), "between messages").await;
        let waited = start.elapsed().as_secs_f64();
        assert!((4.0..=8.0 + 1e-3).contains(&waited), "waited {waited}");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_returns_immediately() {
        let start = tokio::time::Instant::now();
        delay(DelayRange::ZERO, "nothing").await;
        pause(Duration::ZERO).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
