//! Center-of-gravity position and mass estimation.
//!
//! Sensor deltas (baseline minus current, positive when the bed sinks toward
//! a sensor) are turned into roll and pitch across the box, which shift the
//! COG away from the geometric center. The mean delta is the COG height.
//! A [`ZonePolicy`] then maps the COG onto one of the nine calibrated zones
//! and a weight.

use crate::error::EstimationError;
use crate::estimator::calibration::{Calibration, REFERENCE_LOAD};
use crate::estimator::{Estimate, Estimator};
use crate::smoothing::LowPassFilter;
use crate::types::{AlgorithmId, CogPoint, PlanarPoint, SensorFrame, SensorVec, SENSOR_COUNT, ZONE_COUNT};

/// How a COG estimate is turned into a zone and a weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZonePolicy {
    /// Closest zone center in the plane; weight scales with z over that zone's reference z.
    NearestCenter,
    /// Two closest zone centers; weights from projecting the 3D COG onto
    /// each center's direction from the origin, blended by inverse distance.
    TwoNearestInterpolation,
}

pub struct CogEstimator {
    id: AlgorithmId,
    calibration: Calibration,
    policy: ZonePolicy,
    filter: Option<LowPassFilter>,
    initialized: bool,
}

impl CogEstimator {
    pub fn new(
        id: AlgorithmId,
        calibration: Calibration,
        policy: ZonePolicy,
        smoothing_alpha: Option<f64>,
    ) -> Self {
        Self {
            id,
            calibration,
            policy,
            filter: smoothing_alpha.map(LowPassFilter::new),
            initialized: false,
        }
    }

    /// `COGPositionMassEstimation`: v2 calibration, no smoothing.
    pub fn nearest_center() -> Self {
        Self::new(
            AlgorithmId::CogPositionMass,
            Calibration::v2(),
            ZonePolicy::NearestCenter,
            None,
        )
    }

    /// `COGPositionMassEstimation_v3`: v3 calibration, low-pass filtered deltas.
    pub fn two_nearest(smoothing_alpha: f64) -> Self {
        Self::new(
            AlgorithmId::CogPositionMassV3,
            Calibration::v3(),
            ZonePolicy::TwoNearestInterpolation,
            Some(smoothing_alpha),
        )
    }

    pub fn policy(&self) -> ZonePolicy {
        self.policy
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    // ===== Pipeline Stages =====

    /// `(baseline - current) * sensor_weight` per sensor.
    pub fn weighted_deltas(
        &self,
        current: &[u16; SENSOR_COUNT],
        baseline: &[u16; SENSOR_COUNT],
    ) -> SensorVec {
        SensorVec::from_fn(|i, _| {
            (f64::from(baseline[i]) - f64::from(current[i])) * self.calibration.sensor_weights[i]
        })
    }

    /// COG from (filtered) deltas in canonical order TL, BL, TR, BR.
    pub fn center_of_gravity(&self, d: &SensorVec) -> CogPoint {
        let geometry = &self.calibration.geometry;
        let roll = ((d[0] - d[2]) + (d[1] - d[3])) / geometry.roll_span();
        let pitch = ((d[0] - d[1]) + (d[2] - d[3])) / geometry.pitch_span();
        let half_w = geometry.width / 2.0;
        let half_l = geometry.length / 2.0;
        CogPoint::new(half_w - roll * half_w, half_l - pitch * half_l, d.mean())
    }

    /// Map a COG onto a zone (1-based) and weight.
    pub fn resolve(&self, cog: &CogPoint) -> Result<(u8, f64), EstimationError> {
        match self.policy {
            ZonePolicy::NearestCenter => Ok(self.resolve_nearest(cog)),
            ZonePolicy::TwoNearestInterpolation => self.resolve_interpolated(cog),
        }
    }

    /// Zone indices (0-based) with planar distance, nearest first. Ties keep zone order.
    fn ranked_zones(&self, planar: &PlanarPoint) -> [(f64, usize); ZONE_COUNT] {
        let mut ranked: [(f64, usize); ZONE_COUNT] =
            std::array::from_fn(|i| ((self.calibration.zone_center(i) - planar).norm(), i));
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        ranked
    }

    fn resolve_nearest(&self, cog: &CogPoint) -> (u8, f64) {
        let (_, nearest) = self.ranked_zones(&cog.xy())[0];
        let ref_z = self.calibration.z_centers[nearest];
        // sign is kept: a bed rising above its baseline reports a negative load
        let weight = if ref_z == 0.0 {
            0.0
        } else {
            cog.z / ref_z * REFERENCE_LOAD
        };
        (nearest as u8 + 1, weight)
    }

    /// Load implied by projecting the COG onto zone `i`'s direction from the origin,
    /// or `None` when the projection is not positive.
    fn projected_load(&self, cog: &CogPoint, i: usize) -> Option<f64> {
        let origin = self.calibration.origin();
        let direction = self.calibration.zone_center_3d(i) - origin;
        let norm = direction.norm();
        if norm == 0.0 {
            return None;
        }
        let projection = (cog - origin).dot(&direction) / norm;
        (projection > 0.0).then(|| projection / norm * REFERENCE_LOAD)
    }

    fn resolve_interpolated(&self, cog: &CogPoint) -> Result<(u8, f64), EstimationError> {
        let ranked = self.ranked_zones(&cog.xy());
        let (d1, i1) = ranked[0];
        let (d2, i2) = ranked[1];
        let total = d1 + d2;
        let (ratio1, ratio2) = if total == 0.0 {
            (0.5, 0.5)
        } else {
            (d1 / total, d2 / total)
        };

        // the nearer zone gets the larger share
        let w1 = self.projected_load(cog, i1).map(|w| w * ratio2);
        let w2 = self.projected_load(cog, i2).map(|w| w * ratio1);
        if w1.is_none() && w2.is_none() {
            log::debug!(
                "[cog] No valid projection for ({:.2}, {:.2}, {:.2})",
                cog.x,
                cog.y,
                cog.z
            );
            return Err(EstimationError::Undetermined);
        }
        let weight = w1.unwrap_or(0.0) + w2.unwrap_or(0.0);
        Ok((i1 as u8 + 1, weight))
    }
}

impl Estimator for CogEstimator {
    fn id(&self) -> AlgorithmId {
        self.id
    }

    fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        log::info!(
            "[cog] Initialized {} ({:?}, smoothing: {})",
            self.id,
            self.policy,
            self.filter
                .as_ref()
                .map_or_else(|| "off".to_string(), |f| format!("alpha={}", f.alpha()))
        );
    }

    fn process_frame(
        &mut self,
        frame: &SensorFrame,
        baseline: &[u16; SENSOR_COUNT],
    ) -> Result<Estimate, EstimationError> {
        // checked before filtering so a faulty frame leaves filter state alone
        if let Some(location) = frame.faulty_location() {
            return Err(EstimationError::SensorFault { location });
        }
        let mut deltas = self.weighted_deltas(&frame.distances(), baseline);
        if let Some(filter) = self.filter.as_mut() {
            deltas = filter.apply(deltas);
        }
        let cog = self.center_of_gravity(&deltas);
        let (zone, weight) = self.resolve(&cog)?;
        Ok(Estimate { zone, weight, cog })
    }

    fn reset(&mut self) {
        if let Some(filter) = self.filter.as_mut() {
            filter.reset();
        }
    }
}
