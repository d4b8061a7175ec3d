use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::codec::FrameWriter;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{AlgorithmId, ExperimentLabel, Scenario, SensorFrame};

/// Experiment session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No experiment running; archives may still be open
    Idle,
    /// Experiment started, cargo not yet confirmed on the platform
    Started,
    /// Cargo confirmed, frames count as measurements
    Measuring,
}

/// Metadata stamped onto every captured frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub label: String,
    pub scenario: Scenario,
    pub experiment_counter: u16,
    pub weights: ExperimentLabel,
    pub state: SessionState,
    pub file_suffix: Option<String>,
}

/// `_<label>_<scenario>_<YYYYMMDD>.bin`, label part omitted when empty
pub fn archive_suffix(label: &str, scenario: Scenario, date: NaiveDate) -> String {
    let day = date.format("%Y%m%d");
    if label.is_empty() {
        format!("_{}_{}.bin", scenario.name(), day)
    } else {
        format!("_{}_{}_{}.bin", label, scenario.name(), day)
    }
}

/// Per-algorithm archive file name: algorithm name followed by the session suffix
pub fn archive_file_name(algorithm: AlgorithmId, label: &str, scenario: Scenario, date: NaiveDate) -> String {
    format!("{}{}", algorithm.name(), archive_suffix(label, scenario, date))
}

/// Live experiment session: stamps frames and archives scored output per algorithm
pub struct ExperimentSession {
    output_dir: PathBuf,
    metadata: SessionMetadata,
    archives: BTreeMap<AlgorithmId, FrameWriter<BufWriter<File>>>,
}

impl ExperimentSession {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            metadata: SessionMetadata {
                label: String::new(),
                scenario: Scenario::None,
                experiment_counter: 0,
                weights: ExperimentLabel::default(),
                state: SessionState::Idle,
                file_suffix: None,
            },
            archives: BTreeMap::new(),
        }
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn state(&self) -> SessionState {
        self.metadata.state
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Begin the next experiment (Idle → Started). Opens one append-mode
    /// archive per algorithm; archives already open are kept.
    pub fn start_measure(
        &mut self,
        label: &str,
        scenario: Scenario,
        weights: ExperimentLabel,
        algorithms: &[AlgorithmId],
        date: NaiveDate,
    ) -> PipelineResult<String> {
        if self.metadata.state != SessionState::Idle {
            return Err(PipelineError::InvalidState("Experiment already running".to_string()));
        }
        fs::create_dir_all(&self.output_dir)?;

        let suffix = archive_suffix(label, scenario, date);
        for algorithm in algorithms {
            if self.archives.contains_key(algorithm) {
                continue;
            }
            let path = self.output_dir.join(format!("{}{}", algorithm.name(), suffix));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            log::info!("[session] Archiving {} to {}", algorithm, path.display());
            self.archives
                .insert(*algorithm, FrameWriter::new(BufWriter::new(file)));
        }

        self.metadata.experiment_counter = self.metadata.experiment_counter.wrapping_add(1);
        self.metadata.label = label.to_string();
        self.metadata.scenario = scenario;
        self.metadata.weights = weights;
        self.metadata.state = SessionState::Started;
        self.metadata.file_suffix = Some(suffix.clone());
        log::info!(
            "[session] Experiment {} started: label='{}' scenario={} total={}kg",
            self.metadata.experiment_counter,
            label,
            scenario.name(),
            weights.total()
        );
        Ok(suffix)
    }

    /// Cargo is on the platform (Started → Measuring)
    pub fn confirm_load(&mut self) -> PipelineResult<()> {
        match self.metadata.state {
            SessionState::Started => {
                self.metadata.state = SessionState::Measuring;
                Ok(())
            }
            SessionState::Measuring => Err(PipelineError::InvalidState("Already measuring".to_string())),
            SessionState::Idle => Err(PipelineError::InvalidState("No experiment started".to_string())),
        }
    }

    /// End the current experiment but keep archives open for the next one
    pub fn stop_experiment(&mut self) -> PipelineResult<()> {
        match self.metadata.state {
            SessionState::Started | SessionState::Measuring => {
                self.metadata.state = SessionState::Idle;
                self.flush()
            }
            SessionState::Idle => Err(PipelineError::InvalidState("No experiment started".to_string())),
        }
    }

    /// Close all archives and reset the counter
    pub fn finish(&mut self) -> PipelineResult<()> {
        self.flush()?;
        let closed = self.archives.len();
        self.archives.clear();
        self.metadata.experiment_counter = 0;
        self.metadata.state = SessionState::Idle;
        self.metadata.scenario = Scenario::None;
        self.metadata.file_suffix = None;
        log::info!("[session] Finished, {} archives closed", closed);
        Ok(())
    }

    /// Copy session metadata onto a freshly captured frame
    pub fn stamp(&self, frame: &mut SensorFrame) {
        let active = self.metadata.state != SessionState::Idle;
        frame.scenario = self.metadata.scenario;
        frame.experiment_counter = self.metadata.experiment_counter;
        frame.started = active;
        frame.measured = self.metadata.state == SessionState::Measuring;
        frame.label = if active {
            self.metadata.weights
        } else {
            ExperimentLabel::default()
        };
    }

    /// Append a scored frame to its algorithm's archive. Returns false when
    /// no archive is open for that algorithm.
    pub fn archive(&mut self, frame: &SensorFrame) -> PipelineResult<bool> {
        let writer = match frame.result.algorithm.and_then(|id| self.archives.get_mut(&id)) {
            Some(writer) => writer,
            None => return Ok(false),
        };
        writer.write_frame(frame)?;
        Ok(true)
    }

    pub fn flush(&mut self) -> PipelineResult<()> {
        for writer in self.archives.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Frames written per algorithm since the archive was opened
    pub fn archived_counts(&self) -> BTreeMap<AlgorithmId, u64> {
        self.archives
            .iter()
            .map(|(id, w)| (*id, w.frames_written()))
            .collect()
    }
}
