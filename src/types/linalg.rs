//! Linear algebra type aliases for platform geometry
//!
//! Keeps the sensor and center-of-gravity math dimension-checked at compile time.

use nalgebra::{SVector, Vector2, Vector3};

// ===== Dimensions =====
pub const SENSOR_COUNT: usize = 4;
pub const ZONE_COUNT: usize = 9;

// ===== Sensor Space =====
/// One value per sensor, canonical order TL, BL, TR, BR.
pub type SensorVec = SVector<f64, SENSOR_COUNT>;

// ===== Platform Space (mm) =====
pub type PlanarPoint = Vector2<f64>; // (x, y) on the loading surface
pub type CogPoint = Vector3<f64>; // (x, y, z) where z is mean deflection
