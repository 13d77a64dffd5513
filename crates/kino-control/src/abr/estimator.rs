//! Exponentially smoothed bandwidth estimate

use tracing::debug;

/// EMA over raw engine bandwidth samples
///
/// `ema = alpha * sample + (1 - alpha) * ema`. The first accepted sample seeds
/// the average; non-finite or non-positive samples are ignored without
/// disturbing it.
#[derive(Debug, Clone)]
pub struct BandwidthEstimator {
    alpha: f64,
    ema: Option<f64>,
    samples: u64,
}

impl BandwidthEstimator {
    pub const DEFAULT_ALPHA: f64 = 0.25;

    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha > 0.0 && alpha <= 1.0 {
            alpha
        } else {
            Self::DEFAULT_ALPHA
        };
        Self {
            alpha,
            ema: None,
            samples: 0,
        }
    }

    /// Feed one sample; returns the updated estimate if the sample was usable
    pub fn sample(&mut self, bps: Option<f64>) -> Option<f64> {
        let bps = bps.filter(|b| b.is_finite() && *b > 0.0)?;
        let next = match self.ema {
            None => bps,
            Some(prev) => self.alpha * bps + (1.0 - self.alpha) * prev,
        };
        self.ema = Some(next);
        self.samples += 1;
        debug!(sample_bps = bps, ema_bps = next, "Bandwidth sample");
        Some(next)
    }

    /// Smoothed estimate in bits per second
    pub fn estimate(&self) -> Option<f64> {
        self.ema
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ALPHA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_seeds() {
        let mut est = BandwidthEstimator::default();
        assert_eq!(est.estimate(), None);
        assert_eq!(est.sample(Some(2_000_000.0)), Some(2_000_000.0));
    }

    #[test]
    fn test_ema_update() {
        let mut est = BandwidthEstimator::new(0.25);
        est.sample(Some(1_000_000.0));
        let next = est.sample(Some(2_000_000.0)).unwrap();
        // 0.25 * 2M + 0.75 * 1M
        assert!((next - 1_250_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_bad_samples_are_skipped() {
        let mut est = BandwidthEstimator::new(0.5);
        est.sample(Some(800_000.0));
        assert_eq!(est.sample(None), None);
        assert_eq!(est.sample(Some(f64::NAN)), None);
        assert_eq!(est.sample(Some(f64::INFINITY)), None);
        assert_eq!(est.sample(Some(0.0)), None);
        assert_eq!(est.estimate(), Some(800_000.0));
        assert_eq!(est.sample_count(), 1);
    }

    #[test]
    fn test_invalid_alpha_falls_back() {
        assert_eq!(BandwidthEstimator::new(0.0).alpha(), 0.25);
        assert_eq!(BandwidthEstimator::new(1.0).alpha(), 1.0);
    }
}
