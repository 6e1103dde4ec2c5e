//! Continuous-time exponentially weighted moving average.
//!
//! Each observation's weight halves every `halflife`, measured in wall time
//! rather than in number of samples, so a burst of responses does not wash
//! out the estimate any faster than a steady trickle would.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Averager {
    // halflife / ln(2), in seconds
    decay_constant: f64,
    weighted_sum: f64,
    normalizer: f64,
    last_updated: Instant,
}

impl Averager {
    /// `halflife` must be non-zero.
    pub fn new(initial_prediction: f64, halflife: Duration, now: Instant) -> Self {
        Self {
            decay_constant: halflife.as_secs_f64() / std::f64::consts::LN_2,
            weighted_sum: initial_prediction,
            normalizer: 1.0,
            last_updated: now,
        }
    }

    pub fn observe(&mut self, value: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_updated).as_secs_f64();
        let alpha = (-elapsed / self.decay_constant).exp();
        if now > self.last_updated {
            self.last_updated = now;
        }

        self.weighted_sum = self.weighted_sum * alpha + value;
        self.normalizer = self.normalizer * alpha + 1.0;
    }

    pub fn read(&self) -> f64 {
        self.weighted_sum / self.normalizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_prediction() {
        let avg = Averager::new(2.0, Duration::from_secs(10), Instant::now());
        assert_eq!(avg.read(), 2.0);
    }

    #[test]
    fn test_same_instant_is_plain_mean() {
        let now = Instant::now();
        let mut avg = Averager::new(0.0, Duration::from_secs(10), now);
        avg.observe(3.0, now);
        // (0 + 3) / 2
        assert!((avg.read() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_old_prediction_decays() {
        let start = Instant::now();
        let mut avg = Averager::new(0.0, Duration::from_secs(1), start);
        avg.observe(10.0, start + Duration::from_secs(1));
        // prior weight halved: (0*0.5 + 10) / (1*0.5 + 1)
        assert!((avg.read() - 10.0 / 1.5).abs() < 1e-9);

        avg.observe(10.0, start + Duration::from_secs(60));
        assert!((avg.read() - 10.0).abs() < 1e-6);
    }
}
