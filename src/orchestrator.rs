//! Fan-out of frames to one worker per algorithm, and fan-in of their results.
//!
//! Spawning a worker hands back a [`WorkerHandle`] holding both ends the
//! orchestrator needs: a bounded input sender and an output receiver.
//! Readiness is awaited inside the spawn call with a configurable timeout.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::codec::{FrameReader, FrameWriter};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::estimator;
use crate::history::ExecutionHistory;
use crate::types::{AlgorithmId, EstimationResult, SensorFrame};
use crate::worker::{read_handshake, Worker};

// ===== Worker Handles =====

enum Backend {
    Process(Child),
    Thread(Option<JoinHandle<()>>),
}

/// Live connection to one running worker.
pub struct WorkerHandle {
    algorithm: AlgorithmId,
    input: Option<Sender<SensorFrame>>,
    output: Receiver<SensorFrame>,
    backend: Backend,
}

impl WorkerHandle {
    pub fn algorithm(&self) -> AlgorithmId {
        self.algorithm
    }

    /// Queue a frame; blocks only while the input channel is full.
    pub fn send(&self, frame: SensorFrame) -> PipelineResult<()> {
        let input = self
            .input
            .as_ref()
            .ok_or(PipelineError::WorkerGone(self.algorithm))?;
        input
            .send(frame)
            .map_err(|_| PipelineError::WorkerGone(self.algorithm))
    }

    /// Next result if one is ready. Never blocks.
    pub fn try_recv(&self) -> Option<SensorFrame> {
        match self.output.try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Send the end-of-stream marker and close the input.
    pub fn finish(&mut self) {
        if let Some(input) = self.input.take() {
            let _ = input.send(SensorFrame::end_of_stream());
        }
    }

    /// Collect results until the worker closes its output, or until nothing
    /// arrives for `idle_timeout`.
    pub fn drain(&self, idle_timeout: Option<Duration>) -> Vec<SensorFrame> {
        let mut frames = Vec::new();
        let _ = self.drain_with(idle_timeout, |frame| {
            frames.push(frame);
            Ok(())
        });
        frames
    }

    /// Streaming form of [`drain`](Self::drain). Stops early if `on_frame` fails.
    /// Returns the number of frames handed over.
    pub fn drain_with<F>(&self, idle_timeout: Option<Duration>, mut on_frame: F) -> PipelineResult<usize>
    where
        F: FnMut(SensorFrame) -> PipelineResult<()>,
    {
        let mut count = 0;
        loop {
            let next = match idle_timeout {
                Some(t) => self.output.recv_timeout(t),
                None => self.output.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match next {
                Ok(frame) => {
                    on_frame(frame)?;
                    count += 1;
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "[orchestrator] {} idle for {:?} while draining, {} results kept",
                        self.algorithm,
                        idle_timeout.unwrap_or_default(),
                        count
                    );
                    break;
                }
            }
        }
        Ok(count)
    }

    /// Stop the worker now. In-flight frames are abandoned.
    pub fn terminate(mut self) {
        self.input = None;
        match &mut self.backend {
            Backend::Process(child) => {
                if let Err(e) = child.kill() {
                    log::debug!("[orchestrator] kill {}: {}", self.algorithm, e);
                }
                let _ = child.wait();
            }
            Backend::Thread(handle) => {
                // the thread stops on its own once both channels are dropped
                drop(handle.take());
            }
        }
        log::info!("[orchestrator] Terminated {}", self.algorithm);
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Backend::Process(child) = &mut self.backend {
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

// ===== Spawners =====

/// Starts a worker for one algorithm and waits for its readiness signal.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, algorithm: AlgorithmId, config: &PipelineConfig) -> PipelineResult<WorkerHandle>;

    fn name(&self) -> &'static str;
}

fn ensure_registered(algorithm: AlgorithmId) -> PipelineResult<()> {
    if estimator::is_registered(algorithm) {
        Ok(())
    } else {
        Err(PipelineError::Unsupported(algorithm))
    }
}

fn await_ready(
    algorithm: AlgorithmId,
    ready: &Receiver<Result<(), String>>,
    timeout: Option<Duration>,
) -> PipelineResult<()> {
    let signal = match timeout {
        Some(t) => ready.recv_timeout(t),
        None => ready.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };
    match signal {
        Ok(Ok(())) => Ok(()),
        Ok(Err(reason)) => Err(PipelineError::Handshake { algorithm, reason }),
        Err(RecvTimeoutError::Timeout) => Err(PipelineError::WorkerUnresponsive {
            algorithm,
            waited: timeout.unwrap_or_default(),
        }),
        Err(RecvTimeoutError::Disconnected) => Err(PipelineError::Handshake {
            algorithm,
            reason: "worker exited before signaling readiness".to_string(),
        }),
    }
}

/// One OS process per algorithm, frames over its stdin/stdout.
pub struct ProcessSpawner {
    exe: PathBuf,
}

impl ProcessSpawner {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }

    pub fn from_config(config: &PipelineConfig) -> PipelineResult<Self> {
        Ok(Self::new(config.resolve_worker_exe()?))
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, algorithm: AlgorithmId, config: &PipelineConfig) -> PipelineResult<WorkerHandle> {
        ensure_registered(algorithm)?;
        let mut child = Command::new(&self.exe)
            .arg("--algorithm")
            .arg(algorithm.code().to_string())
            .arg("--smoothing-alpha")
            .arg(config.smoothing_alpha.to_string())
            .arg("--history-capacity")
            .arg(config.history_capacity.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| PipelineError::Spawn { algorithm, source })?;
        log::info!(
            "[orchestrator] Spawned {} as pid {} ({})",
            algorithm,
            child.id(),
            self.exe.display()
        );

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PipelineError::Handshake {
                    algorithm,
                    reason: "worker pipes unavailable".to_string(),
                });
            }
        };

        // Reader: handshake first, then decoded result frames.
        let (ready_tx, ready_rx) = channel::bounded(1);
        let (out_tx, out_rx) = channel::unbounded();
        thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            match read_handshake(&mut reader) {
                Ok(id) if id == algorithm => {
                    let _ = ready_tx.send(Ok(()));
                }
                Ok(other) => {
                    let _ = ready_tx.send(Err(format!("worker announced {}", other)));
                    return;
                }
                Err(reason) => {
                    let _ = ready_tx.send(Err(reason));
                    return;
                }
            }
            let mut frames = FrameReader::new(reader);
            loop {
                match frames.read_frame() {
                    Ok(Some(frame)) => {
                        if out_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("[orchestrator] {} output stream corrupt: {}", algorithm, e);
                        break;
                    }
                }
            }
        });

        if let Err(e) = await_ready(algorithm, &ready_rx, config.ready_timeout()) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        // Writer: frames onto stdin; dropping the input sender closes the pipe.
        let (in_tx, in_rx) = channel::bounded::<SensorFrame>(config.channel_capacity);
        thread::spawn(move || {
            let mut writer = FrameWriter::new(BufWriter::new(stdin));
            for frame in in_rx.iter() {
                if frame.end_of_stream {
                    break;
                }
                if let Err(e) = writer.write_frame(&frame) {
                    log::debug!("[orchestrator] {} input closed: {}", algorithm, e);
                    return;
                }
                if in_rx.is_empty() && writer.flush().is_err() {
                    return;
                }
            }
            let _ = writer.flush();
        });

        Ok(WorkerHandle {
            algorithm,
            input: Some(in_tx),
            output: out_rx,
            backend: Backend::Process(child),
        })
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

/// Runs the worker loop on a thread inside this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl WorkerSpawner for ThreadSpawner {
    fn spawn(&self, algorithm: AlgorithmId, config: &PipelineConfig) -> PipelineResult<WorkerHandle> {
        ensure_registered(algorithm)?;
        let options = config.estimator_options();
        let history_capacity = config.history_capacity;

        let (ready_tx, ready_rx) = channel::bounded(1);
        let (in_tx, mut in_rx) = channel::bounded::<SensorFrame>(config.channel_capacity);
        let (mut out_tx, out_rx) = channel::unbounded::<SensorFrame>();

        let handle = thread::Builder::new()
            .name(format!("worker-{}", algorithm.code()))
            .spawn(move || {
                let mut worker = match Worker::new(algorithm, &options) {
                    Ok(worker) => worker,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                worker.initialize();
                let _ = ready_tx.send(Ok(()));
                let mut history = ExecutionHistory::new(history_capacity);
                if let Err(e) = worker.run(&mut in_rx, &mut out_tx, &mut history) {
                    log::debug!("[worker] {} stopped: {}", algorithm, e);
                }
            })
            .map_err(|source| PipelineError::Spawn { algorithm, source })?;

        await_ready(algorithm, &ready_rx, config.ready_timeout())?;
        Ok(WorkerHandle {
            algorithm,
            input: Some(in_tx),
            output: out_rx,
            backend: Backend::Thread(Some(handle)),
        })
    }

    fn name(&self) -> &'static str {
        "thread"
    }
}

/// Which back-end runs the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    Process,
    Thread,
}

// ===== Orchestrator =====

pub struct Orchestrator {
    config: PipelineConfig,
    spawner: Box<dyn WorkerSpawner>,
    registered: BTreeSet<AlgorithmId>,
    workers: BTreeMap<AlgorithmId, WorkerHandle>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, spawner: Box<dyn WorkerSpawner>) -> Self {
        Self {
            config,
            spawner,
            registered: BTreeSet::new(),
            workers: BTreeMap::new(),
        }
    }

    /// Orchestrator backed by `estimator_worker` processes.
    pub fn with_processes(config: PipelineConfig) -> PipelineResult<Self> {
        let spawner = ProcessSpawner::from_config(&config)?;
        Ok(Self::new(config, Box::new(spawner)))
    }

    /// Orchestrator backed by in-process worker threads.
    pub fn with_threads(config: PipelineConfig) -> Self {
        Self::new(config, Box::new(ThreadSpawner))
    }

    pub fn from_mode(config: PipelineConfig, mode: SpawnMode) -> PipelineResult<Self> {
        match mode {
            SpawnMode::Process => Self::with_processes(config),
            SpawnMode::Thread => Ok(Self::with_threads(config)),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Register a worker for the next `start()`. Returns false if already registered.
    pub fn add_worker(&mut self, algorithm: AlgorithmId) -> bool {
        self.registered.insert(algorithm)
    }

    /// Spawn every registered worker not yet running.
    /// On any failure the workers started by this call are terminated.
    pub fn start(&mut self) -> PipelineResult<()> {
        if self.registered.is_empty() {
            return Err(PipelineError::NoWorkers);
        }
        let pending: Vec<AlgorithmId> = self
            .registered
            .iter()
            .copied()
            .filter(|id| !self.workers.contains_key(id))
            .collect();

        let mut started = Vec::with_capacity(pending.len());
        for algorithm in pending {
            match self.spawner.spawn(algorithm, &self.config) {
                Ok(handle) => {
                    log::info!("[orchestrator] {} ready ({})", algorithm, self.spawner.name());
                    started.push(handle);
                }
                Err(e) => {
                    log::error!("[orchestrator] Failed to start {}: {}", algorithm, e);
                    for handle in started {
                        handle.terminate();
                    }
                    return Err(e);
                }
            }
        }
        for handle in started {
            self.workers.insert(handle.algorithm(), handle);
        }
        Ok(())
    }

    /// Broadcast a frame to every worker, in registration order.
    pub fn dispatch(&self, frame: &SensorFrame) -> PipelineResult<()> {
        if self.workers.is_empty() {
            return Err(PipelineError::NoWorkers);
        }
        let mut first_error = None;
        for handle in self.workers.values() {
            if let Err(e) = handle.send(frame.clone()) {
                log::warn!("[orchestrator] {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Live-session broadcast. A worker that refuses the frame is removed and
    /// terminated while the others keep receiving; results it had already
    /// emitted are returned so they can still be archived. Fails only once no
    /// worker is left. Not meant for use after [`finish`](Self::finish).
    pub fn dispatch_or_retire(&mut self, frame: &SensorFrame) -> PipelineResult<Vec<SensorFrame>> {
        if self.workers.is_empty() {
            return Err(PipelineError::NoWorkers);
        }
        let refused: Vec<AlgorithmId> = self
            .workers
            .iter()
            .filter_map(|(id, handle)| match handle.send(frame.clone()) {
                Ok(()) => None,
                Err(e) => {
                    log::error!("[orchestrator] {}, retiring it", e);
                    Some(*id)
                }
            })
            .collect();

        let mut leftovers = Vec::new();
        for id in refused {
            if let Some(handle) = self.workers.remove(&id) {
                leftovers.extend(std::iter::from_fn(|| handle.try_recv()));
                handle.terminate();
            }
        }
        if self.workers.is_empty() {
            return Err(PipelineError::NoWorkers);
        }
        Ok(leftovers)
    }

    /// At most one pending result per worker. Never blocks.
    pub fn collect(&self) -> BTreeMap<AlgorithmId, SensorFrame> {
        self.workers
            .iter()
            .filter_map(|(id, handle)| handle.try_recv().map(|frame| (*id, frame)))
            .collect()
    }

    /// Like [`collect`](Self::collect), reduced to the result records.
    pub fn collect_results(&self) -> BTreeMap<AlgorithmId, EstimationResult> {
        self.collect()
            .into_iter()
            .map(|(id, frame)| (id, frame.result))
            .collect()
    }

    /// Send end-of-stream to every worker.
    pub fn finish(&mut self) {
        for handle in self.workers.values_mut() {
            handle.finish();
        }
    }

    /// Block until `algorithm`'s worker has emitted everything (see [`WorkerHandle::drain`]).
    pub fn drain(&self, algorithm: AlgorithmId) -> PipelineResult<Vec<SensorFrame>> {
        Ok(self.handle(algorithm)?.drain(self.config.drain_timeout()))
    }

    pub fn drain_with<F>(&self, algorithm: AlgorithmId, on_frame: F) -> PipelineResult<usize>
    where
        F: FnMut(SensorFrame) -> PipelineResult<()>,
    {
        self.handle(algorithm)?
            .drain_with(self.config.drain_timeout(), on_frame)
    }

    fn handle(&self, algorithm: AlgorithmId) -> PipelineResult<&WorkerHandle> {
        self.workers
            .get(&algorithm)
            .ok_or(PipelineError::WorkerGone(algorithm))
    }

    /// Kill every worker immediately.
    pub fn terminate_all(&mut self) {
        for (_, handle) in std::mem::take(&mut self.workers) {
            handle.terminate();
        }
    }

    pub fn active(&self) -> impl Iterator<Item = AlgorithmId> + '_ {
        self.workers.keys().copied()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.terminate_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorCode;
    use std::time::Instant;

    fn orchestrator(ids: &[AlgorithmId]) -> Orchestrator {
        let mut orch = Orchestrator::with_threads(PipelineConfig::default());
        for id in ids {
            orch.add_worker(*id);
        }
        orch
    }

    fn wait_for(orch: &Orchestrator, n: usize) -> Vec<BTreeMap<AlgorithmId, SensorFrame>> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut rounds = Vec::new();
        let mut seen = 0;
        while seen < n && Instant::now() < deadline {
            let batch = orch.collect();
            seen += batch.len();
            if !batch.is_empty() {
                rounds.push(batch);
            }
            thread::sleep(Duration::from_millis(5));
        }
        rounds
    }

    #[test]
    fn test_start_without_workers_fails() {
        let mut orch = orchestrator(&[]);
        assert!(matches!(orch.start(), Err(PipelineError::NoWorkers)));
        assert!(matches!(
            orch.dispatch(&SensorFrame::from_distances(0.0, [1; 4])),
            Err(PipelineError::NoWorkers)
        ));
    }

    #[test]
    fn test_add_worker_deduplicates() {
        let mut orch = orchestrator(&[AlgorithmId::CogPositionMass]);
        assert!(!orch.add_worker(AlgorithmId::CogPositionMass));
        orch.start().unwrap();
        assert_eq!(orch.worker_count(), 1);
        orch.terminate_all();
    }

    #[test]
    fn test_unsupported_algorithm_fails_start() {
        let mut orch = orchestrator(&[AlgorithmId::CogPositionMass, AlgorithmId::Mlp]);
        assert!(matches!(orch.start(), Err(PipelineError::Unsupported(AlgorithmId::Mlp))));
        assert_eq!(orch.worker_count(), 0);
    }

    #[test]
    fn test_broadcast_reaches_every_worker() {
        let mut orch = orchestrator(&[AlgorithmId::CogPositionMass, AlgorithmId::CogPositionMassV3]);
        orch.start().unwrap();
        orch.dispatch(&SensorFrame::from_distances(0.0, [500; 4])).unwrap();

        let rounds = wait_for(&orch, 2);
        let mut got: Vec<AlgorithmId> = rounds.iter().flat_map(|r| r.keys().copied()).collect();
        got.sort();
        assert_eq!(got, vec![AlgorithmId::CogPositionMass, AlgorithmId::CogPositionMassV3]);
        for round in &rounds {
            for (id, frame) in round {
                assert_eq!(frame.result.algorithm, Some(*id));
            }
        }
        orch.terminate_all();
        assert_eq!(orch.worker_count(), 0);
    }

    #[test]
    fn test_silent_worker_times_out() {
        let (_tx, rx) = channel::bounded::<Result<(), String>>(1);
        let waited = Duration::from_millis(20);
        match await_ready(AlgorithmId::CogPositionMass, &rx, Some(waited)) {
            Err(PipelineError::WorkerUnresponsive { algorithm, waited: w }) => {
                assert_eq!(algorithm, AlgorithmId::CogPositionMass);
                assert_eq!(w, waited);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_worker_exiting_before_ready_is_handshake_error() {
        let (tx, rx) = channel::bounded::<Result<(), String>>(1);
        drop(tx);
        assert!(matches!(
            await_ready(AlgorithmId::CogPositionMassV3, &rx, None),
            Err(PipelineError::Handshake { .. })
        ));
    }

    /// Handle whose worker has already gone away, with `pending` results left behind.
    fn dead_handle(algorithm: AlgorithmId, pending: &[SensorFrame]) -> WorkerHandle {
        let (in_tx, in_rx) = channel::bounded(1);
        let (out_tx, out_rx) = channel::unbounded();
        drop(in_rx);
        for frame in pending {
            out_tx.send(frame.clone()).unwrap();
        }
        WorkerHandle {
            algorithm,
            input: Some(in_tx),
            output: out_rx,
            backend: Backend::Thread(None),
        }
    }

    #[test]
    fn test_dead_worker_is_retired_and_others_continue() {
        let mut orch = orchestrator(&[AlgorithmId::CogPositionMass]);
        orch.start().unwrap();
        let mut left_behind = SensorFrame::from_distances(0.5, [500; 4]);
        left_behind.result.algorithm = Some(AlgorithmId::CogPositionMassV3);
        orch.workers.insert(
            AlgorithmId::CogPositionMassV3,
            dead_handle(AlgorithmId::CogPositionMassV3, &[left_behind.clone()]),
        );

        assert!(matches!(
            orch.dispatch(&SensorFrame::from_distances(1.0, [500; 4])),
            Err(PipelineError::WorkerGone(AlgorithmId::CogPositionMassV3))
        ));
        let leftovers = orch
            .dispatch_or_retire(&SensorFrame::from_distances(2.0, [480, 500, 500, 500]))
            .unwrap();
        assert_eq!(leftovers, vec![left_behind]);
        assert_eq!(orch.active().collect::<Vec<_>>(), vec![AlgorithmId::CogPositionMass]);
        orch.dispatch_or_retire(&SensorFrame::from_distances(3.0, [500; 4])).unwrap();

        orch.finish();
        let stamps: Vec<f64> = orch
            .drain(AlgorithmId::CogPositionMass)
            .unwrap()
            .iter()
            .map(|f| f.timestamp)
            .collect();
        assert_eq!(stamps, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_retiring_the_last_worker_reports_no_workers() {
        let mut orch = orchestrator(&[]);
        orch.workers.insert(
            AlgorithmId::CogPositionMass,
            dead_handle(AlgorithmId::CogPositionMass, &[]),
        );
        assert!(matches!(
            orch.dispatch_or_retire(&SensorFrame::from_distances(0.0, [500; 4])),
            Err(PipelineError::NoWorkers)
        ));
        assert_eq!(orch.worker_count(), 0);
    }

    #[test]
    fn test_collect_is_non_blocking_when_idle() {
        let mut orch = orchestrator(&[AlgorithmId::CogPositionMass]);
        orch.start().unwrap();
        let t = Instant::now();
        assert!(orch.collect().is_empty());
        assert!(t.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_finish_then_drain_preserves_order() {
        let mut orch = orchestrator(&[AlgorithmId::CogPositionMass]);
        orch.start().unwrap();
        let inputs = [[500, 500, 500, 500], [480, 500, 500, 500], [500, 500, 500, 480]];
        for (i, d) in inputs.iter().enumerate() {
            orch.dispatch(&SensorFrame::from_distances(i as f64, *d)).unwrap();
        }
        orch.finish();
        let out = orch.drain(AlgorithmId::CogPositionMass).unwrap();
        let stamps: Vec<f64> = out.iter().map(|f| f.timestamp).collect();
        assert_eq!(stamps, vec![0.0, 1.0, 2.0]);
        assert_eq!(out[0].result.zone, 5);
        assert_eq!(out[1].result.zone, 1);
        assert!(out.iter().all(|f| f.result.error_code == ErrorCode::OK));
        assert!(matches!(
            orch.dispatch(&SensorFrame::from_distances(3.0, [500; 4])),
            Err(PipelineError::WorkerGone(_))
        ));
    }
}
