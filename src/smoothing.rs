use crate::types::SensorVec;

/// Single-pole low-pass filter over the four weighted sensor deltas.
/// `filtered = alpha * current + (1 - alpha) * previous`
pub struct LowPassFilter {
    alpha: f64,
    previous: Option<SensorVec>,
}

impl LowPassFilter {
    /// Create a filter; `alpha` is clamped into (0, 1]
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() {
            alpha.clamp(f64::EPSILON, 1.0)
        } else {
            1.0
        };
        LowPassFilter {
            alpha,
            previous: None,
        }
    }

    /// Filter one sample. The first sample passes through unchanged.
    pub fn apply(&mut self, current: SensorVec) -> SensorVec {
        let filtered = match self.previous {
            None => current,
            Some(prev) => current * self.alpha + prev * (1.0 - self.alpha),
        };
        self.previous = Some(filtered);
        filtered
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Whether a previous sample is held
    pub fn is_primed(&self) -> bool {
        self.previous.is_some()
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_first_sample_passes_through() {
        let mut filter = LowPassFilter::new(0.2);
        let out = filter.apply(SensorVec::new(20.0, 0.0, -5.0, 1.0));
        assert_eq!(out, SensorVec::new(20.0, 0.0, -5.0, 1.0));
        assert!(filter.is_primed());
    }

    #[test]
    fn test_exponential_blend() {
        let mut filter = LowPassFilter::new(0.2);
        filter.apply(SensorVec::zeros());
        let out = filter.apply(SensorVec::repeat(20.0));
        assert_relative_eq!(out[0], 4.0, epsilon = 1e-12);
        let out = filter.apply(SensorVec::repeat(20.0));
        // 0.2 * 20 + 0.8 * 4
        assert_relative_eq!(out[3], 7.2, epsilon = 1e-12);
    }

    #[test]
    fn test_alpha_one_is_identity() {
        let mut filter = LowPassFilter::new(1.0);
        filter.apply(SensorVec::repeat(3.0));
        assert_eq!(filter.apply(SensorVec::repeat(9.0)), SensorVec::repeat(9.0));
    }

    #[test]
    fn test_reset() {
        let mut filter = LowPassFilter::new(0.5);
        filter.apply(SensorVec::repeat(10.0));
        filter.reset();
        assert!(!filter.is_primed());
        assert_eq!(filter.apply(SensorVec::repeat(2.0)), SensorVec::repeat(2.0));
    }

    #[test]
    fn test_invalid_alpha_is_sanitized() {
        assert_eq!(LowPassFilter::new(f64::NAN).alpha(), 1.0);
        assert_eq!(LowPassFilter::new(3.0).alpha(), 1.0);
        assert!(LowPassFilter::new(-1.0).alpha() > 0.0);
    }
}
