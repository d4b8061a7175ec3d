//! Estimation algorithms and their compile-time registry.
//!
//! Each [`AlgorithmId`] with an implementation maps to a factory returning a
//! boxed [`Estimator`]. Identifiers without a factory (the ML predictors
//! found in recorded logs) are reported as unsupported.

pub mod calibration;
pub mod cog;

pub use calibration::{BoxGeometry, Calibration, REFERENCE_LOAD};
pub use cog::{CogEstimator, ZonePolicy};

use crate::error::EstimationError;
use crate::types::{
    reference_slots, AlgorithmId, CogPoint, ErrorCode, EstimationResult, SensorFrame, SENSOR_COUNT,
};

/// A resolved zone and weight for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    /// 1-based zone, row-major
    pub zone: u8,
    /// Estimated load in kg; may be negative
    pub weight: f64,
    pub cog: CogPoint,
}

impl Estimate {
    /// Wire form; the weight is truncated toward zero and must fit an i16.
    pub fn into_result(
        self,
        algorithm: AlgorithmId,
        baseline: [u16; SENSOR_COUNT],
    ) -> Result<EstimationResult, EstimationError> {
        let truncated = self.weight.trunc();
        if !(f64::from(i16::MIN)..=f64::from(i16::MAX)).contains(&truncated) {
            return Err(EstimationError::WeightOutOfRange(self.weight));
        }
        Ok(EstimationResult {
            algorithm: Some(algorithm),
            predicted_weight: truncated as i16,
            error_code: ErrorCode::OK,
            zone: i16::from(self.zone),
            reference: reference_slots(baseline),
        })
    }
}

/// One estimation algorithm instance. Owns its own filter state.
pub trait Estimator: Send {
    fn id(&self) -> AlgorithmId;

    /// One-time setup. Calling it again has no effect.
    fn initialize(&mut self);

    fn process_frame(
        &mut self,
        frame: &SensorFrame,
        baseline: &[u16; SENSOR_COUNT],
    ) -> Result<Estimate, EstimationError>;

    /// Drop accumulated state (filter history).
    fn reset(&mut self) {}
}

/// Tunables handed to factories.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorOptions {
    pub smoothing_alpha: f64,
}

impl Default for EstimatorOptions {
    fn default() -> Self {
        Self {
            smoothing_alpha: 0.2,
        }
    }
}

// ===== Registry =====

type Factory = fn(&EstimatorOptions) -> Box<dyn Estimator>;

const REGISTRY: &[(AlgorithmId, Factory)] = &[
    (AlgorithmId::CogPositionMass, cog_position_mass),
    (AlgorithmId::CogPositionMassV3, cog_position_mass_v3),
];

fn cog_position_mass(_: &EstimatorOptions) -> Box<dyn Estimator> {
    Box::new(CogEstimator::nearest_center())
}

fn cog_position_mass_v3(options: &EstimatorOptions) -> Box<dyn Estimator> {
    Box::new(CogEstimator::two_nearest(options.smoothing_alpha))
}

/// Instantiate the algorithm registered under `id`.
pub fn create(id: AlgorithmId, options: &EstimatorOptions) -> Result<Box<dyn Estimator>, EstimationError> {
    REGISTRY
        .iter()
        .find(|(registered, _)| *registered == id)
        .map(|(_, factory)| factory(options))
        .ok_or(EstimationError::Unsupported(id))
}

pub fn is_registered(id: AlgorithmId) -> bool {
    REGISTRY.iter().any(|(registered, _)| *registered == id)
}

pub fn registered() -> impl Iterator<Item = AlgorithmId> {
    REGISTRY.iter().map(|(id, _)| *id)
}
