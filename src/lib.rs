//! Cargo-platform load estimation from four laser distance sensors.
//!
//! Frames flow from a live capture or a recorded log into one worker per
//! estimation algorithm; each worker tracks its own reference baseline and
//! reports a loading zone and weight per frame.

pub mod baseline;
pub mod codec;
pub mod config;
pub mod error;
pub mod estimator;
pub mod history;
pub mod orchestrator;
pub mod replay;
pub mod session;
pub mod smoothing;
pub mod types;
pub mod worker;

pub use baseline::ReferenceBaselineTracker;
pub use codec::{FrameReader, FrameWriter, Record, FRAME_SIZE};
pub use config::PipelineConfig;
pub use error::{CodecError, EstimationError, PipelineError, PipelineResult};
pub use estimator::{Estimate, Estimator, EstimatorOptions};
pub use orchestrator::{Orchestrator, SpawnMode, WorkerHandle, WorkerSpawner};
pub use replay::{ReplayEvent, ReplayManager, ReplaySummary};
pub use session::ExperimentSession;
pub use types::{
    AlgorithmId, ErrorCode, EstimationResult, ExperimentLabel, Scenario, SensorFrame,
    SensorLocation, SensorReading,
};
pub use worker::Worker;
