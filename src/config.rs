//! Pipeline tunables. Loaded from an optional JSON file, then overridden by CLI flags.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::estimator::EstimatorOptions;

pub const WORKER_BIN: &str = "estimator_worker";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // ── Worker startup ──
    /// `None` waits for readiness forever.
    pub ready_timeout_ms: Option<u64>,
    /// Worker executable; defaults to the `estimator_worker` next to the running binary.
    pub worker_exe: Option<PathBuf>,

    // ── Channels ──
    pub channel_capacity: usize,
    pub poll_interval_ms: u64,
    /// How long a drain waits for the next result before giving up. `None` waits forever.
    pub drain_timeout_ms: Option<u64>,

    // ── Estimation ──
    pub smoothing_alpha: f64,
    pub history_capacity: usize,

    // ── Output ──
    pub output_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: Some(10_000),
            worker_exe: None,
            channel_capacity: 1000,
            poll_interval_ms: 50,
            drain_timeout_ms: Some(30_000),
            smoothing_alpha: 0.2,
            history_capacity: 256,
            output_dir: PathBuf::from("log"),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let file = File::open(path)?;
        let config: PipelineConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// File values if a path is given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> PipelineResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.channel_capacity == 0 {
            return Err(PipelineError::Config("channel_capacity must be at least 1".into()));
        }
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return Err(PipelineError::Config(format!(
                "smoothing_alpha must be in (0, 1], got {}",
                self.smoothing_alpha
            )));
        }
        Ok(())
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn estimator_options(&self) -> EstimatorOptions {
        EstimatorOptions {
            smoothing_alpha: self.smoothing_alpha,
        }
    }

    /// Configured worker binary, or the sibling of the current executable.
    pub fn resolve_worker_exe(&self) -> PipelineResult<PathBuf> {
        if let Some(exe) = &self.worker_exe {
            return Ok(exe.clone());
        }
        let current = std::env::current_exe()?;
        Ok(current.with_file_name(format!("{}{}", WORKER_BIN, std::env::consts::EXE_SUFFIX)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.ready_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.channel_capacity, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "ready_timeout_ms": null, "smoothing_alpha": 0.5 }}"#).unwrap();
        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.ready_timeout(), None);
        assert_eq!(config.smoothing_alpha, 0.5);
        assert_eq!(config.history_capacity, 256);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "smoothing_alpha": 0.0 }}"#).unwrap();
        assert!(matches!(
            PipelineConfig::load(file.path()),
            Err(PipelineError::Config(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            PipelineConfig::load(file.path()),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_explicit_worker_exe_wins() {
        let config = PipelineConfig {
            worker_exe: Some(PathBuf::from("/opt/bin/worker")),
            ..PipelineConfig::default()
        };
        assert_eq!(config.resolve_worker_exe().unwrap(), PathBuf::from("/opt/bin/worker"));
    }
}
