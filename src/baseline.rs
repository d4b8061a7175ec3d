//! Reference (zero-load) sensor distances for one algorithm instance.

use crate::types::{SensorFrame, FAULT_DISTANCE, SENSOR_COUNT};

/// Captures the first fully usable frame as the reference and keeps it.
///
/// A baseline is never replaced by later frames, even when sensors glitch;
/// only [`reset`](Self::reset) clears it.
#[derive(Debug, Clone, Default)]
pub struct ReferenceBaselineTracker {
    distances: [u16; SENSOR_COUNT],
    set: bool,
}

impl ReferenceBaselineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt this frame's distances if no baseline exists and all four are usable.
    /// Returns true when the baseline was set by this call.
    pub fn observe(&mut self, frame: &SensorFrame) -> bool {
        if self.set {
            return false;
        }
        let distances = frame.distances();
        if distances.iter().any(|d| *d == 0 || *d == FAULT_DISTANCE) {
            return false;
        }
        self.distances = distances;
        self.set = true;
        log::debug!("[baseline] Reference set to {:?}", self.distances);
        true
    }

    /// Baseline distances in canonical order; all zeros until set.
    pub fn get(&self) -> [u16; SENSOR_COUNT] {
        self.distances
    }

    pub fn is_set(&self) -> bool {
        self.set
    }

    pub fn reset(&mut self) {
        self.distances = [0; SENSOR_COUNT];
        self.set = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SensorLocation;

    #[test]
    fn test_first_usable_frame_becomes_baseline() {
        let mut tracker = ReferenceBaselineTracker::new();
        assert_eq!(tracker.get(), [0; 4]);
        assert!(tracker.observe(&SensorFrame::from_distances(0.0, [500, 501, 502, 503])));
        assert!(tracker.is_set());
        assert_eq!(tracker.get(), [500, 501, 502, 503]);
    }

    #[test]
    fn test_baseline_is_immutable_once_set() {
        let mut tracker = ReferenceBaselineTracker::new();
        tracker.observe(&SensorFrame::from_distances(0.0, [500, 500, 500, 500]));
        assert!(!tracker.observe(&SensorFrame::from_distances(1.0, [480, 490, 470, 460])));
        assert_eq!(tracker.get(), [500, 500, 500, 500]);
    }

    #[test]
    fn test_fault_frame_leaves_baseline_unset() {
        let mut tracker = ReferenceBaselineTracker::new();
        tracker.observe(&SensorFrame::from_distances(0.0, [FAULT_DISTANCE; 4]));
        assert!(!tracker.is_set());
        assert_eq!(tracker.get(), [0, 0, 0, 0]);

        tracker.observe(&SensorFrame::from_distances(0.0, [500, 0, 500, 500]));
        assert!(!tracker.is_set());
    }

    #[test]
    fn test_baseline_is_stored_in_location_order() {
        let mut tracker = ReferenceBaselineTracker::new();
        let mut frame = SensorFrame::from_distances(0.0, [501, 502, 503, 504]);
        frame.readings.reverse();
        assert!(tracker.observe(&frame));
        assert_eq!(tracker.get(), [501, 502, 503, 504]);

        let mut missing = SensorFrame::from_distances(0.0, [500; 4]);
        missing.readings[3].location = SensorLocation::None;
        assert!(!ReferenceBaselineTracker::new().observe(&missing));
    }

    #[test]
    fn test_reset_allows_new_baseline() {
        let mut tracker = ReferenceBaselineTracker::new();
        tracker.observe(&SensorFrame::from_distances(0.0, [500, 500, 500, 500]));
        tracker.reset();
        assert!(!tracker.is_set());
        tracker.observe(&SensorFrame::from_distances(0.0, [400, 400, 400, 400]));
        assert_eq!(tracker.get(), [400, 400, 400, 400]);
    }
}
