pub mod linalg;

pub use linalg::*;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

// ===== Sensors =====

/// Mounting position of a distance sensor on the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum SensorLocation {
    TopLeft = 0,
    BottomLeft = 1,
    TopRight = 2,
    BottomRight = 3,
    None = 4,
}

impl SensorLocation {
    /// Order in which readings are stored inside a frame.
    pub const CANONICAL: [SensorLocation; SENSOR_COUNT] = [
        SensorLocation::TopLeft,
        SensorLocation::BottomLeft,
        SensorLocation::TopRight,
        SensorLocation::BottomRight,
    ];

    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            0 => Ok(SensorLocation::TopLeft),
            1 => Ok(SensorLocation::BottomLeft),
            2 => Ok(SensorLocation::TopRight),
            3 => Ok(SensorLocation::BottomRight),
            4 => Ok(SensorLocation::None),
            other => Err(CodecError::InvalidLocation(other)),
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Slot in the canonical order, `None` for an unassigned sensor.
    pub fn index(self) -> Option<usize> {
        match self {
            SensorLocation::None => None,
            other => Some(other as usize),
        }
    }

    /// Front sensors sit at the top edge of the platform.
    pub fn is_front(self) -> bool {
        matches!(self, SensorLocation::TopLeft | SensorLocation::TopRight)
    }
}

/// Distance value the firmware writes when a sensor fails to measure (-1 as u16).
pub const FAULT_DISTANCE: u16 = u16::MAX;

/// One sensor's measurement at one sampling tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub timestamp: f64,
    pub port: String, // at most 16 UTF-8 bytes survive encoding
    pub location: SensorLocation,
    pub distance: u16, // mm
    pub intensity: u16,
    pub temperature: u16,
}

impl SensorReading {
    pub fn new(
        timestamp: f64,
        port: &str,
        location: SensorLocation,
        distance: u16,
        intensity: u16,
        temperature: u16,
    ) -> Self {
        Self {
            timestamp,
            port: port.to_string(),
            location,
            distance,
            intensity,
            temperature,
        }
    }

    /// Reading carrying the fault sentinel.
    pub fn fault(timestamp: f64, location: SensorLocation) -> Self {
        Self::new(timestamp, "", location, FAULT_DISTANCE, 0, 0)
    }

    pub fn is_fault(&self) -> bool {
        self.distance == FAULT_DISTANCE
    }

    /// Usable as a reference value: neither zero nor the fault sentinel.
    pub fn is_usable(&self) -> bool {
        self.distance != 0 && !self.is_fault()
    }
}

// ===== Experiment Metadata =====

/// Ground-truth weight placed on each of the nine zones (row-major, zone 1 first).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentLabel {
    pub weights: [u16; ZONE_COUNT],
}

impl ExperimentLabel {
    pub fn new(weights: [u16; ZONE_COUNT]) -> Self {
        Self { weights }
    }

    pub fn total(&self) -> u32 {
        self.weights.iter().map(|w| u32::from(*w)).sum()
    }

    /// Zone (1-9) carrying the most weight, `None` for an empty platform.
    pub fn heaviest_zone(&self) -> Option<u8> {
        self.weights
            .iter()
            .enumerate()
            .filter(|(_, w)| **w > 0)
            .max_by_key(|(i, w)| (**w, std::cmp::Reverse(*i)))
            .map(|(i, _)| i as u8 + 1)
    }
}

/// Experiment scenario tag. Used for labeling only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scenario {
    Empty,
    Static,
    Loading,
    Unloading,
    Driving,
    None,
}

impl Scenario {
    pub const ALL: [Scenario; 6] = [
        Scenario::Empty,
        Scenario::Static,
        Scenario::Loading,
        Scenario::Unloading,
        Scenario::Driving,
        Scenario::None,
    ];

    pub fn from_tag(tag: u16) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Scenario::Empty),
            1 => Ok(Scenario::Static),
            2 => Ok(Scenario::Loading),
            3 => Ok(Scenario::Unloading),
            4 => Ok(Scenario::Driving),
            1000 => Ok(Scenario::None),
            other => Err(CodecError::InvalidScenario(other)),
        }
    }

    pub fn tag(self) -> u16 {
        match self {
            Scenario::Empty => 0,
            Scenario::Static => 1,
            Scenario::Loading => 2,
            Scenario::Unloading => 3,
            Scenario::Driving => 4,
            Scenario::None => 1000,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Scenario::Empty => "empty",
            Scenario::Static => "static",
            Scenario::Loading => "loading",
            Scenario::Unloading => "unloading",
            Scenario::Driving => "driving",
            Scenario::None => "none",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Scenario::Empty => "No cargo on the platform",
            Scenario::Static => "Cargo placed and left at rest",
            Scenario::Loading => "Cargo added one zone at a time",
            Scenario::Unloading => "Cargo removed one zone at a time",
            Scenario::Driving => "Platform in motion with cargo on board",
            Scenario::None => "No scenario selected",
        }
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(tag) = s.parse::<u16>() {
            return Scenario::from_tag(tag).map_err(|e| e.to_string());
        }
        Scenario::ALL
            .iter()
            .copied()
            .find(|sc| sc.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown scenario '{}'", s))
    }
}

// ===== Algorithms =====

/// Identifier of an estimation algorithm, as stored in result records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum AlgorithmId {
    /// Geometric COG estimate, nearest-center zone policy.
    CogPositionMass = 0,
    Mlp = 1,
    RandomForest = 2,
    /// Geometric COG estimate with smoothing, two-nearest interpolation policy.
    CogPositionMassV3 = 3,
}

/// Wire value for "no algorithm" (frames captured before any scoring).
pub const NO_ALGORITHM: u8 = 0xFF;

impl AlgorithmId {
    pub const ALL: [AlgorithmId; 4] = [
        AlgorithmId::CogPositionMass,
        AlgorithmId::Mlp,
        AlgorithmId::RandomForest,
        AlgorithmId::CogPositionMassV3,
    ];

    pub fn from_code(code: u8) -> Result<Option<Self>, CodecError> {
        match code {
            0 => Ok(Some(AlgorithmId::CogPositionMass)),
            1 => Ok(Some(AlgorithmId::Mlp)),
            2 => Ok(Some(AlgorithmId::RandomForest)),
            3 => Ok(Some(AlgorithmId::CogPositionMassV3)),
            NO_ALGORITHM => Ok(None),
            other => Err(CodecError::InvalidAlgorithm(other)),
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Display name, also the prefix of per-algorithm log files.
    pub fn name(self) -> &'static str {
        match self {
            AlgorithmId::CogPositionMass => "COGPositionMassEstimation",
            AlgorithmId::Mlp => "MLPPredictor",
            AlgorithmId::RandomForest => "RandomForestPredictor",
            AlgorithmId::CogPositionMassV3 => "COGPositionMassEstimation_v3",
        }
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AlgorithmId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(code) = s.parse::<u8>() {
            return match AlgorithmId::from_code(code) {
                Ok(Some(id)) => Ok(id),
                _ => Err(format!("unknown algorithm code {}", code)),
            };
        }
        let key = s.to_ascii_lowercase();
        match key.as_str() {
            "cog" | "cog-position-mass" => return Ok(AlgorithmId::CogPositionMass),
            "cog-v3" | "cog-position-mass-v3" => return Ok(AlgorithmId::CogPositionMassV3),
            "mlp" => return Ok(AlgorithmId::Mlp),
            "random-forest" | "rf" => return Ok(AlgorithmId::RandomForest),
            _ => {}
        }
        AlgorithmId::ALL
            .iter()
            .copied()
            .find(|id| id.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown algorithm '{}'", s))
    }
}

/// Result status code carried in every result record. Zero means success.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    pub const OK: ErrorCode = ErrorCode(0);
    pub const PROCESSING_FAILED: ErrorCode = ErrorCode(1);
    pub const BASELINE_PENDING: ErrorCode = ErrorCode(2);
    pub const SENSOR_FAULT: ErrorCode = ErrorCode(3);
    pub const UNDETERMINED: ErrorCode = ErrorCode(4);
    pub const UNSUPPORTED: ErrorCode = ErrorCode(5);
    pub const WEIGHT_OUT_OF_RANGE: ErrorCode = ErrorCode(6);

    pub fn is_ok(self) -> bool {
        self == ErrorCode::OK
    }

    pub fn label(self) -> &'static str {
        match self.0 {
            0 => "ok",
            1 => "processing_failed",
            2 => "baseline_pending",
            3 => "sensor_fault",
            4 => "undetermined",
            5 => "unsupported",
            6 => "weight_out_of_range",
            _ => "unknown",
        }
    }
}

/// Zone value meaning "no zone resolved".
pub const ZONE_UNDETERMINED: i16 = -1;

/// Output of one algorithm for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimationResult {
    pub algorithm: Option<AlgorithmId>,
    pub predicted_weight: i16,
    pub error_code: ErrorCode,
    pub zone: i16,
    /// Baseline distances used for the prediction; slots 4..9 are reserved.
    pub reference: [u16; ZONE_COUNT],
}

impl Default for EstimationResult {
    fn default() -> Self {
        Self {
            algorithm: None,
            predicted_weight: 0,
            error_code: ErrorCode::OK,
            zone: ZONE_UNDETERMINED,
            reference: [0; ZONE_COUNT],
        }
    }
}

impl EstimationResult {
    pub fn is_determined(&self) -> bool {
        (1..=ZONE_COUNT as i16).contains(&self.zone)
    }

    /// Zone -1, weight 0, with the reason in the error code.
    pub fn undetermined(algorithm: AlgorithmId, error_code: ErrorCode, baseline: [u16; SENSOR_COUNT]) -> Self {
        Self {
            algorithm: Some(algorithm),
            predicted_weight: 0,
            error_code,
            zone: ZONE_UNDETERMINED,
            reference: reference_slots(baseline),
        }
    }
}

/// Spread a 4-sensor baseline into the 9 reference slots of a result record.
pub fn reference_slots(baseline: [u16; SENSOR_COUNT]) -> [u16; ZONE_COUNT] {
    let mut slots = [0u16; ZONE_COUNT];
    slots[..SENSOR_COUNT].copy_from_slice(&baseline);
    slots
}

// ===== Frames =====

/// One synchronized snapshot of all four sensors plus experiment metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorFrame {
    pub timestamp: f64,
    pub readings: [SensorReading; SENSOR_COUNT],
    pub scenario: Scenario,
    pub experiment_counter: u16,
    pub started: bool,
    pub measured: bool,
    pub label: ExperimentLabel,
    pub result: EstimationResult,
    /// In-memory only; a persisted log ends at end of file.
    #[serde(default)]
    pub end_of_stream: bool,
}

impl SensorFrame {
    /// Build a frame, placing readings in canonical location order.
    pub fn new(timestamp: f64, mut readings: [SensorReading; SENSOR_COUNT]) -> Self {
        readings.sort_by_key(|r| r.location);
        Self {
            timestamp,
            readings,
            scenario: Scenario::None,
            experiment_counter: 0,
            started: false,
            measured: false,
            label: ExperimentLabel::default(),
            result: EstimationResult::default(),
            end_of_stream: false,
        }
    }

    /// Convenience constructor from four distances (TL, BL, TR, BR).
    pub fn from_distances(timestamp: f64, distances: [u16; SENSOR_COUNT]) -> Self {
        let readings = std::array::from_fn(|i| {
            SensorReading::new(timestamp, "", SensorLocation::CANONICAL[i], distances[i], 0, 0)
        });
        Self::new(timestamp, readings)
    }

    /// Marker telling a worker that no further frames follow.
    pub fn end_of_stream() -> Self {
        let mut frame = Self::from_distances(0.0, [0; SENSOR_COUNT]);
        frame.end_of_stream = true;
        frame
    }

    pub fn reading(&self, location: SensorLocation) -> Option<&SensorReading> {
        self.readings.iter().find(|r| r.location == location)
    }

    /// Raw distances in canonical order, looked up by location.
    /// A location with no reading reads as the fault sentinel.
    pub fn distances(&self) -> [u16; SENSOR_COUNT] {
        std::array::from_fn(|i| {
            self.reading(SensorLocation::CANONICAL[i])
                .map_or(FAULT_DISTANCE, |r| r.distance)
        })
    }

    /// First canonical location whose reading is missing or carries the fault sentinel.
    pub fn faulty_location(&self) -> Option<SensorLocation> {
        SensorLocation::CANONICAL
            .iter()
            .copied()
            .find(|loc| self.reading(*loc).map_or(true, SensorReading::is_fault))
    }

    /// Copy of this frame with `result` replaced.
    pub fn with_result(&self, result: EstimationResult) -> Self {
        let mut frame = self.clone();
        frame.result = result;
        frame
    }
}
