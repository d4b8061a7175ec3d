//! Per-algorithm worker: owns one estimator, its baseline and its filter state,
//! and turns a stream of frames into a stream of scored frames.
//!
//! The same loop runs inside the `estimator_worker` process (frames over
//! stdin/stdout) and inside an in-process thread (frames over channels).

use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender};

use crate::baseline::ReferenceBaselineTracker;
use crate::codec::{FrameReader, FrameWriter};
use crate::error::{EstimationError, PipelineError, PipelineResult};
use crate::estimator::{self, Estimator, EstimatorOptions};
use crate::history::{ExecutionHistory, ExecutionRecord};
use crate::types::{AlgorithmId, ErrorCode, EstimationResult, SensorFrame};

// ===== Readiness Handshake =====

/// Written by a worker process on stdout once it is initialized, before any frame.
pub const HANDSHAKE_MAGIC: [u8; 4] = *b"LEWK";
pub const HANDSHAKE_SIZE: usize = HANDSHAKE_MAGIC.len() + 1;

pub fn write_handshake<W: Write>(out: &mut W, algorithm: AlgorithmId) -> io::Result<()> {
    out.write_all(&HANDSHAKE_MAGIC)?;
    out.write_all(&[algorithm.code()])?;
    out.flush()
}

/// Read the readiness signal; the error string describes what arrived instead.
pub fn read_handshake<R: Read>(input: &mut R) -> Result<AlgorithmId, String> {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    input
        .read_exact(&mut buf)
        .map_err(|e| format!("worker closed its output before signaling readiness ({})", e))?;
    if buf[..HANDSHAKE_MAGIC.len()] != HANDSHAKE_MAGIC {
        return Err(format!("unexpected handshake bytes {:02x?}", buf));
    }
    match AlgorithmId::from_code(buf[HANDSHAKE_MAGIC.len()]) {
        Ok(Some(id)) => Ok(id),
        _ => Err(format!("handshake names unknown algorithm {}", buf[HANDSHAKE_MAGIC.len()])),
    }
}

// ===== Frame Transport =====

/// Where a worker pulls frames from. `Ok(None)` ends the run.
pub trait FrameSource {
    fn next_frame(&mut self) -> PipelineResult<Option<SensorFrame>>;
}

/// Where a worker pushes scored frames.
pub trait FrameSink {
    fn emit(&mut self, frame: SensorFrame) -> PipelineResult<()>;
}

impl<R: Read> FrameSource for FrameReader<R> {
    fn next_frame(&mut self) -> PipelineResult<Option<SensorFrame>> {
        Ok(self.read_frame()?)
    }
}

impl<W: Write> FrameSink for FrameWriter<W> {
    fn emit(&mut self, frame: SensorFrame) -> PipelineResult<()> {
        self.write_frame(&frame)?;
        // the orchestrator polls without blocking, so results cannot sit in a buffer
        self.flush()?;
        Ok(())
    }
}

impl FrameSource for Receiver<SensorFrame> {
    fn next_frame(&mut self) -> PipelineResult<Option<SensorFrame>> {
        // a dropped sender ends the stream like an explicit marker
        Ok(self.recv().ok().filter(|frame| !frame.end_of_stream))
    }
}

impl FrameSink for Sender<SensorFrame> {
    fn emit(&mut self, frame: SensorFrame) -> PipelineResult<()> {
        self.send(frame).map_err(|_| {
            PipelineError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "result channel closed",
            ))
        })
    }
}

// ===== Worker =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Initialized,
    Running,
    Terminated,
}

pub struct Worker {
    algorithm: AlgorithmId,
    estimator: Box<dyn Estimator>,
    baseline: ReferenceBaselineTracker,
    state: WorkerState,
    frames_processed: u64,
}

impl Worker {
    /// Build a worker around the registered implementation of `algorithm`.
    pub fn new(algorithm: AlgorithmId, options: &EstimatorOptions) -> Result<Self, EstimationError> {
        Ok(Self::with_estimator(estimator::create(algorithm, options)?))
    }

    pub fn with_estimator(estimator: Box<dyn Estimator>) -> Self {
        Self {
            algorithm: estimator.id(),
            estimator,
            baseline: ReferenceBaselineTracker::new(),
            state: WorkerState::Created,
            frames_processed: 0,
        }
    }

    pub fn algorithm(&self) -> AlgorithmId {
        self.algorithm
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn baseline(&self) -> &ReferenceBaselineTracker {
        &self.baseline
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn initialize(&mut self) {
        if self.state == WorkerState::Created {
            self.estimator.initialize();
            self.state = WorkerState::Initialized;
        }
    }

    /// Score one frame. Never fails: every problem becomes a result with a
    /// non-zero error code, including a panic inside the estimator.
    pub fn process(&mut self, frame: &SensorFrame) -> EstimationResult {
        self.frames_processed += 1;
        self.baseline.observe(frame);
        let baseline = self.baseline.get();
        if !self.baseline.is_set() {
            return EstimationResult::undetermined(self.algorithm, ErrorCode::BASELINE_PENDING, baseline);
        }

        let algorithm = self.algorithm;
        let estimator = &mut self.estimator;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            estimator
                .process_frame(frame, &baseline)
                .and_then(|estimate| estimate.into_result(algorithm, baseline))
        }));
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                log::debug!("[worker] {} frame {}: {}", self.algorithm, self.frames_processed, err);
                EstimationResult::undetermined(self.algorithm, err.error_code(), baseline)
            }
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::warn!(
                    "[worker] {} failed on frame {}: {}",
                    self.algorithm,
                    self.frames_processed,
                    reason
                );
                EstimationResult::undetermined(self.algorithm, ErrorCode::PROCESSING_FAILED, baseline)
            }
        }
    }

    /// Receive, process, emit until the source ends. Returns frames handled.
    pub fn run<S, K>(
        &mut self,
        source: &mut S,
        sink: &mut K,
        history: &mut ExecutionHistory,
    ) -> PipelineResult<u64>
    where
        S: FrameSource + ?Sized,
        K: FrameSink + ?Sized,
    {
        self.initialize();
        self.state = WorkerState::Running;
        log::info!("[worker] {} running", self.algorithm);

        let outcome = self.frame_loop(source, sink, history);
        self.state = WorkerState::Terminated;

        let summary = history.summary();
        log::info!(
            "[worker] {} terminated: {} frames, {} non-zero codes, mean {:.1}us, max {}us",
            self.algorithm,
            summary.frames,
            summary.failures,
            summary.mean_latency_us,
            summary.max_latency_us
        );
        outcome
    }

    fn frame_loop<S, K>(
        &mut self,
        source: &mut S,
        sink: &mut K,
        history: &mut ExecutionHistory,
    ) -> PipelineResult<u64>
    where
        S: FrameSource + ?Sized,
        K: FrameSink + ?Sized,
    {
        let mut handled = 0;
        while let Some(frame) = source.next_frame()? {
            if frame.end_of_stream {
                break;
            }
            let started = Instant::now();
            let result = self.process(&frame);
            history.record(ExecutionRecord {
                frame_index: handled,
                elapsed: started.elapsed(),
                error_code: result.error_code,
            });
            sink.emit(frame.with_result(result))?;
            handled += 1;
        }
        Ok(handled)
    }
}
