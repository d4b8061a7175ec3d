//! Calibration constants for the COG estimators.
//!
//! Zone centers were measured by placing a 500 kg reference load on each
//! zone and averaging the resulting estimate, so `z` is the mean deflection
//! (mm) that corresponds to 500 kg at that zone.

use serde::{Deserialize, Serialize};

use crate::types::{CogPoint, PlanarPoint, SENSOR_COUNT, ZONE_COUNT};

/// Weight (kg) represented by a unit projection onto a zone center.
pub const REFERENCE_LOAD: f64 = 500.0;

// ===== Platform Geometry =====

/// Loading box dimensions and sensor mounting points, all in mm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxGeometry {
    pub width: f64,
    pub length: f64,
    /// (x, y) per sensor in canonical order TL, BL, TR, BR
    pub sensor_coords: [[f64; 2]; SENSOR_COUNT],
}

impl BoxGeometry {
    pub fn cargo_box() -> Self {
        Self {
            width: 1630.0,
            length: 2860.0,
            sensor_coords: [[323.1, 1.0], [201.0, 2516.9], [1306.9, 1.0], [1429.0, 2516.9]],
        }
    }

    pub fn center(&self) -> PlanarPoint {
        PlanarPoint::new(self.width / 2.0, self.length / 2.0)
    }

    /// Mean left/right sensor spacing, the roll normalizer.
    pub fn roll_span(&self) -> f64 {
        let sc = &self.sensor_coords;
        ((sc[3][0] - sc[1][0]) + (sc[2][0] - sc[0][0])) / 2.0
    }

    /// Mean front/rear sensor spacing, the pitch normalizer.
    pub fn pitch_span(&self) -> f64 {
        let sc = &self.sensor_coords;
        ((sc[3][1] - sc[2][1]) + (sc[1][1] - sc[0][1])) / 2.0
    }
}

// ===== Calibration Sets =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub geometry: BoxGeometry,
    pub sensor_weights: [f64; SENSOR_COUNT],
    pub x_centers: [f64; ZONE_COUNT],
    pub y_centers: [f64; ZONE_COUNT],
    pub z_centers: [f64; ZONE_COUNT],
    /// Unloaded COG; projection origin for the interpolation policy.
    pub origin: [f64; 3],
}

impl Calibration {
    /// Rear sensors damped to 0.45, first-generation zone centers.
    pub fn v2() -> Self {
        Self {
            geometry: BoxGeometry::cargo_box(),
            sensor_weights: [1.0, 0.45, 1.0, 0.45],
            x_centers: [
                794.3329811, 813.9314133, 833.8338401, 791.8779953, 812.5496202, 830.3194796,
                795.4399509, 814.2261959, 834.6214622,
            ],
            y_centers: [
                1416.042594, 1416.207189, 1415.538152, 1431.776203, 1429.261099, 1430.5897,
                1447.795189, 1446.468957, 1447.492051,
            ],
            z_centers: [
                13.9859375, 15.51666667, 14.2640625, 16.65625, 16.3, 15.884375, 15.31041667,
                17.61875, 15.29375,
            ],
            origin: [815.0, 1430.0, 0.0],
        }
    }

    /// Unweighted sensors, recalibrated zone centers.
    pub fn v3() -> Self {
        Self {
            geometry: BoxGeometry::cargo_box(),
            sensor_weights: [1.0; SENSOR_COUNT],
            x_centers: [
                787.0877792, 814.8771739, 839.9643955, 782.7581608, 811.1309793, 837.1086898,
                785.3743557, 812.6048919, 843.4710794,
            ],
            y_centers: [
                1426.94493, 1429.336884, 1426.518641, 1456.003617, 1451.456536, 1453.019595,
                1479.942102, 1481.01256, 1479.430555,
            ],
            z_centers: [
                18.78125, 21.29166667, 19.09375, 27.3125, 26.0625, 25.75, 29.45, 32.8125,
                29.34166667,
            ],
            origin: [815.0, 1430.0, 0.0],
        }
    }

    /// Planar center of zone index `i` (0-based).
    pub fn zone_center(&self, i: usize) -> PlanarPoint {
        PlanarPoint::new(self.x_centers[i], self.y_centers[i])
    }

    pub fn zone_center_3d(&self, i: usize) -> CogPoint {
        CogPoint::new(self.x_centers[i], self.y_centers[i], self.z_centers[i])
    }

    pub fn origin(&self) -> CogPoint {
        CogPoint::from(self.origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_geometry_spans() {
        let g = BoxGeometry::cargo_box();
        assert_relative_eq!(g.roll_span(), 1105.9, epsilon = 1e-9);
        assert_relative_eq!(g.pitch_span(), 2515.9, epsilon = 1e-9);
        assert_eq!(g.center(), PlanarPoint::new(815.0, 1430.0));
    }

    #[test]
    fn test_presets_differ_in_sensor_weights() {
        assert_eq!(Calibration::v2().sensor_weights, [1.0, 0.45, 1.0, 0.45]);
        assert_eq!(Calibration::v3().sensor_weights, [1.0; 4]);
        // middle zone sits closest to the box center in both sets
        let c = Calibration::v2().zone_center(4);
        assert!((c - BoxGeometry::cargo_box().center()).norm() < 3.0);
    }
}
