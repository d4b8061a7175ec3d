use std::time::Duration;

use thiserror::Error;

use crate::types::{AlgorithmId, ErrorCode, SensorLocation, SENSOR_COUNT};

/// Failure to decode a fixed-layout binary record.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Truncated record: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Invalid sensor location code: {0}")]
    InvalidLocation(u8),

    #[error("Invalid scenario tag: {0}")]
    InvalidScenario(u16),

    #[error("Invalid algorithm id: {0}")]
    InvalidAlgorithm(u8),

    #[error("Frame readings must cover each sensor location once, got {0:?}")]
    InvalidReadingSet([SensorLocation; SENSOR_COUNT]),

    #[error("Port name is not valid UTF-8")]
    InvalidUtf8,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a single estimation that did not produce a zone/weight pair.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimationError {
    #[error("Reference baseline not established yet")]
    BaselineNotReady,

    #[error("Sensor fault reported at {location:?}")]
    SensorFault { location: SensorLocation },

    #[error("No zone could be resolved")]
    Undetermined,

    #[error("Algorithm {0:?} has no registered implementation")]
    Unsupported(AlgorithmId),

    #[error("Estimated weight {0} does not fit the result record")]
    WeightOutOfRange(f64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EstimationError {
    /// Status code written into the result record.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            EstimationError::BaselineNotReady => ErrorCode::BASELINE_PENDING,
            EstimationError::SensorFault { .. } => ErrorCode::SENSOR_FAULT,
            EstimationError::Undetermined => ErrorCode::UNDETERMINED,
            EstimationError::Unsupported(_) => ErrorCode::UNSUPPORTED,
            EstimationError::WeightOutOfRange(_) => ErrorCode::WEIGHT_OUT_OF_RANGE,
            EstimationError::Internal(_) => ErrorCode::PROCESSING_FAILED,
        }
    }
}

/// Orchestration-level failures (spawn, handshake, routing).
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Worker {algorithm:?} did not signal readiness within {waited:?}")]
    WorkerUnresponsive {
        algorithm: AlgorithmId,
        waited: Duration,
    },

    #[error("Failed to spawn worker {algorithm:?}: {source}")]
    Spawn {
        algorithm: AlgorithmId,
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake with worker {algorithm:?} failed: {reason}")]
    Handshake {
        algorithm: AlgorithmId,
        reason: String,
    },

    #[error("Worker {0:?} is no longer accepting frames")]
    WorkerGone(AlgorithmId),

    #[error("Algorithm {0:?} has no registered implementation")]
    Unsupported(AlgorithmId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("No workers registered")]
    NoWorkers,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
