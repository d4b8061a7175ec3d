//! Offline re-scoring of recorded frame logs.
//!
//! A log is decoded in full, broadcast to one worker per algorithm, and each
//! worker's scored frames are written to a fresh per-algorithm log. Results
//! carry the replaying algorithm's id; labels and metadata are left as recorded.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{self, Receiver};
use serde::Serialize;

use crate::codec::{read_all, FrameWriter};
use crate::config::PipelineConfig;
use crate::error::{CodecError, PipelineError, PipelineResult};
use crate::orchestrator::{Orchestrator, SpawnMode};
use crate::types::{AlgorithmId, SensorFrame};

pub const LOG_EXTENSION: &str = "bin";

/// Decode a whole log file. Any truncated or malformed record aborts the load.
pub fn load_log(path: &Path) -> Result<Vec<SensorFrame>, CodecError> {
    let file = File::open(path)?;
    read_all(BufReader::new(file))
}

/// Output file name for `algorithm` replaying `source`.
///
/// A source named after an algorithm (`COGPositionMassEstimation_truck_static_20250314.bin`)
/// keeps its suffix behind the new algorithm's name; any other file is prefixed.
pub fn replay_output_name(algorithm: AlgorithmId, source: &Path) -> String {
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    // longest match first: the v3 name extends the v2 name
    let prefix = AlgorithmId::ALL
        .iter()
        .map(|id| id.name())
        .filter(|name| file_name.starts_with(name))
        .max_by_key(|name| name.len());
    match prefix {
        Some(name) => format!("{}{}", algorithm.name(), &file_name[name.len()..]),
        None => format!("{}_{}", algorithm.name(), file_name),
    }
}

/// `.bin` logs directly inside `dir`, sorted by name.
pub fn log_files_in(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().map_or(false, |e| e == LOG_EXTENSION))
        .collect();
    files.sort();
    Ok(files)
}

// ===== Progress & Summary =====

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReplayProgress {
    pub processed: usize,
    pub total: usize,
}

impl ReplayProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.processed as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlgorithmReplay {
    pub algorithm: AlgorithmId,
    pub output: PathBuf,
    pub frames_written: usize,
    /// Result count per error code label
    pub error_codes: BTreeMap<&'static str, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub source: PathBuf,
    pub frames_loaded: usize,
    pub algorithms: Vec<AlgorithmReplay>,
    pub cancelled: bool,
    pub elapsed_ms: u128,
}

impl ReplaySummary {
    /// Every algorithm wrote one result per loaded frame.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.algorithms.iter().all(|a| a.frames_written == self.frames_loaded)
    }
}

/// Messages from a background replay.
#[derive(Debug, Clone)]
pub enum ReplayEvent {
    Progress(ReplayProgress),
    Finished(ReplaySummary),
    Failed(String),
}

// ===== Manager =====

#[derive(Debug, Clone)]
pub struct ReplayManager {
    config: PipelineConfig,
    algorithms: Vec<AlgorithmId>,
    mode: SpawnMode,
    output_dir: Option<PathBuf>,
    cancel: Arc<AtomicBool>,
}

impl ReplayManager {
    pub fn new(config: PipelineConfig, mode: SpawnMode) -> Self {
        Self {
            config,
            algorithms: Vec::new(),
            mode,
            output_dir: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn add_algorithm(&mut self, algorithm: AlgorithmId) {
        if !self.algorithms.contains(&algorithm) {
            self.algorithms.push(algorithm);
        }
    }

    /// Write outputs here instead of a `replay/` directory next to the source.
    pub fn set_output_dir(&mut self, dir: impl Into<PathBuf>) {
        self.output_dir = Some(dir.into());
    }

    pub fn algorithms(&self) -> &[AlgorithmId] {
        &self.algorithms
    }

    pub fn output_dir_for(&self, source: &Path) -> PathBuf {
        match &self.output_dir {
            Some(dir) => dir.clone(),
            None => source
                .parent()
                .map_or_else(|| PathBuf::from("replay"), |p| p.join("replay")),
        }
    }

    pub fn output_path(&self, algorithm: AlgorithmId, source: &Path) -> PathBuf {
        self.output_dir_for(source)
            .join(replay_output_name(algorithm, source))
    }

    /// Replay one log on the calling thread.
    pub fn replay<F>(&self, source: &Path, mut on_progress: F) -> PipelineResult<ReplaySummary>
    where
        F: FnMut(ReplayProgress),
    {
        let started = Instant::now();
        if self.algorithms.is_empty() {
            return Err(PipelineError::NoWorkers);
        }
        let frames = load_log(source)?;
        log::info!(
            "[replay] Loaded {} frames from {}",
            frames.len(),
            source.display()
        );

        let out_dir = self.output_dir_for(source);
        fs::create_dir_all(&out_dir)?;
        let outputs: Vec<(AlgorithmId, PathBuf)> = self
            .algorithms
            .iter()
            .map(|id| (*id, out_dir.join(replay_output_name(*id, source))))
            .collect();
        for (_, path) in &outputs {
            if is_same_file(path, source) {
                return Err(PipelineError::Config(format!(
                    "replay output {} would overwrite its source",
                    path.display()
                )));
            }
        }

        let mut orchestrator = Orchestrator::from_mode(self.config.clone(), self.mode)?;
        for id in &self.algorithms {
            orchestrator.add_worker(*id);
        }
        orchestrator.start()?;

        for frame in &frames {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            orchestrator.dispatch(frame)?;
        }
        orchestrator.finish();

        let mut progress = ReplayProgress {
            processed: 0,
            total: frames.len() * outputs.len(),
        };
        let mut reports = Vec::with_capacity(outputs.len());
        for (algorithm, path) in outputs {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            let mut writer = FrameWriter::new(BufWriter::new(File::create(&path)?));
            let mut error_codes = BTreeMap::new();
            let cancel = &self.cancel;
            let written = orchestrator.drain_with(algorithm, |frame| {
                if cancel.load(Ordering::Relaxed) {
                    return Err(PipelineError::Internal("replay cancelled".to_string()));
                }
                writer.write_frame(&frame)?;
                *error_codes.entry(frame.result.error_code.label()).or_insert(0) += 1;
                progress.processed += 1;
                on_progress(progress);
                Ok(())
            });
            let written = match written {
                Ok(n) => n,
                Err(_) if cancel.load(Ordering::Relaxed) => writer.frames_written() as usize,
                Err(e) => return Err(e),
            };
            writer.flush()?;
            if written != frames.len() {
                log::warn!(
                    "[replay] {} produced {} of {} results",
                    algorithm,
                    written,
                    frames.len()
                );
            }
            log::info!("[replay] {} -> {}", algorithm, path.display());
            reports.push(AlgorithmReplay {
                algorithm,
                output: path,
                frames_written: written,
                error_codes,
            });
        }
        orchestrator.terminate_all();

        Ok(ReplaySummary {
            source: source.to_path_buf(),
            frames_loaded: frames.len(),
            algorithms: reports,
            cancelled: self.cancel.load(Ordering::Relaxed),
            elapsed_ms: started.elapsed().as_millis(),
        })
    }

    /// Run the replay on a coordination thread; progress and completion arrive as events.
    pub fn spawn(self, source: PathBuf) -> PipelineResult<ReplayHandle> {
        let (tx, events) = channel::unbounded();
        let cancel = Arc::clone(&self.cancel);
        let join = thread::Builder::new()
            .name("replay".to_string())
            .spawn(move || {
                let progress_tx = tx.clone();
                let outcome = self.replay(&source, |p| {
                    let _ = progress_tx.send(ReplayEvent::Progress(p));
                });
                let event = match &outcome {
                    Ok(summary) => ReplayEvent::Finished(summary.clone()),
                    Err(e) => ReplayEvent::Failed(e.to_string()),
                };
                let _ = tx.send(event);
                outcome
            })?;
        Ok(ReplayHandle { events, cancel, join })
    }
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Background replay in progress.
pub struct ReplayHandle {
    events: Receiver<ReplayEvent>,
    cancel: Arc<AtomicBool>,
    join: JoinHandle<PipelineResult<ReplaySummary>>,
}

impl ReplayHandle {
    pub fn events(&self) -> &Receiver<ReplayEvent> {
        &self.events
    }

    /// Stop dispatching and draining; workers are killed.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn wait(self) -> PipelineResult<ReplaySummary> {
        self.join
            .join()
            .map_err(|_| PipelineError::Internal("replay thread panicked".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorCode;

    fn write_log(path: &Path, frames: &[SensorFrame]) {
        let mut writer = FrameWriter::new(File::create(path).unwrap());
        for f in frames {
            writer.write_frame(f).unwrap();
        }
    }

    fn sample_frames() -> Vec<SensorFrame> {
        [[500, 500, 500, 500], [480, 500, 500, 500], [470, 495, 490, 500], [500, 500, 500, 480]]
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let mut f = SensorFrame::from_distances(i as f64 * 0.1, *d);
                f.result.algorithm = Some(AlgorithmId::Mlp);
                f.label.weights[0] = 500;
                f
            })
            .collect()
    }

    #[test]
    fn test_output_name_keeps_source_suffix() {
        let src = Path::new("/data/COGPositionMassEstimation_truck_static_20250314.bin");
        assert_eq!(
            replay_output_name(AlgorithmId::CogPositionMassV3, src),
            "COGPositionMassEstimation_v3_truck_static_20250314.bin"
        );
        let src = Path::new("COGPositionMassEstimation_v3_a_loading_20250101.bin");
        assert_eq!(
            replay_output_name(AlgorithmId::CogPositionMass, src),
            "COGPositionMassEstimation_a_loading_20250101.bin"
        );
        assert_eq!(
            replay_output_name(AlgorithmId::CogPositionMass, Path::new("capture.bin")),
            "COGPositionMassEstimation_capture.bin"
        );
    }

    #[test]
    fn test_load_log_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        let mut bytes = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut bytes);
            writer.write_frame(&sample_frames()[0]).unwrap();
        }
        bytes.truncate(bytes.len() - 1);
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(load_log(&path), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(ReplayProgress { processed: 0, total: 0 }.percent(), 100.0);
        assert_eq!(ReplayProgress { processed: 3, total: 12 }.percent(), 25.0);
    }

    #[test]
    fn test_replay_rescoring_and_tagging() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("capture.bin");
        let frames = sample_frames();
        write_log(&src, &frames);

        let mut manager = ReplayManager::new(PipelineConfig::default(), SpawnMode::Thread);
        manager.add_algorithm(AlgorithmId::CogPositionMass);
        manager.add_algorithm(AlgorithmId::CogPositionMassV3);
        let mut seen = Vec::new();
        let summary = manager.replay(&src, |p| seen.push(p.percent())).unwrap();

        assert!(summary.is_complete());
        assert_eq!(seen.len(), 8);
        assert_eq!(seen.last().copied(), Some(100.0));

        let out = load_log(&manager.output_path(AlgorithmId::CogPositionMass, &src)).unwrap();
        assert_eq!(out.len(), frames.len());
        for (orig, scored) in frames.iter().zip(&out) {
            assert_eq!(scored.result.algorithm, Some(AlgorithmId::CogPositionMass));
            assert_eq!(scored.label, orig.label);
            assert_eq!(scored.readings, orig.readings);
        }
        assert_eq!(out[1].result.zone, 1);
        assert_eq!(out[1].result.predicted_weight, 178);
        assert_eq!(summary.algorithms[1].error_codes.get(ErrorCode::UNDETERMINED.label()), Some(&1));
    }

    #[test]
    fn test_background_replay_reports_events() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("capture.bin");
        write_log(&src, &sample_frames());
        let mut manager = ReplayManager::new(PipelineConfig::default(), SpawnMode::Thread);
        manager.set_output_dir(dir.path().join("out"));
        manager.add_algorithm(AlgorithmId::CogPositionMass);

        let handle = manager.spawn(src).unwrap();
        let events: Vec<ReplayEvent> = handle.events().iter().take_while(|e| !matches!(e, ReplayEvent::Finished(_) | ReplayEvent::Failed(_))).collect();
        assert_eq!(events.len(), 4);
        let summary = handle.wait().unwrap();
        assert_eq!(summary.algorithms[0].frames_written, 4);
        assert!(summary.algorithms[0].output.starts_with(dir.path().join("out")));
    }

    #[test]
    fn test_replay_without_algorithms_fails() {
        let manager = ReplayManager::new(PipelineConfig::default(), SpawnMode::Thread);
        assert!(matches!(
            manager.replay(Path::new("missing.bin"), |_| {}),
            Err(PipelineError::NoWorkers)
        ));
    }
}
