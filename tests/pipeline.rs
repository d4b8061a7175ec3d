//! End-to-end runs against the real `estimator_worker` binary.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use load_estimator::codec::FrameWriter;
use load_estimator::replay::ReplayManager;
use load_estimator::types::{SensorLocation, SensorReading};
use load_estimator::{
    AlgorithmId, ErrorCode, Orchestrator, PipelineConfig, PipelineError, SensorFrame, SpawnMode,
};

fn process_config() -> PipelineConfig {
    PipelineConfig {
        worker_exe: Some(PathBuf::from(env!("CARGO_BIN_EXE_estimator_worker"))),
        ..PipelineConfig::default()
    }
}

fn frames() -> Vec<SensorFrame> {
    vec![
        SensorFrame::from_distances(0.1, [500, 500, 500, 500]),
        SensorFrame::from_distances(0.2, [480, 500, 500, 500]),
        SensorFrame::from_distances(0.3, [520, 520, 520, 520]),
        SensorFrame::from_distances(0.4, [470, 495, 490, 500]),
    ]
}

fn write_log(path: &Path, frames: &[SensorFrame]) {
    let mut writer = FrameWriter::new(File::create(path).unwrap());
    for frame in frames {
        writer.write_frame(frame).unwrap();
    }
    writer.flush().unwrap();
}

#[test]
fn test_process_workers_score_in_order() {
    let mut orchestrator = Orchestrator::with_processes(process_config()).unwrap();
    orchestrator.add_worker(AlgorithmId::CogPositionMass);
    orchestrator.add_worker(AlgorithmId::CogPositionMassV3);
    orchestrator.start().unwrap();
    assert_eq!(orchestrator.worker_count(), 2);

    let input = frames();
    for frame in &input {
        orchestrator.dispatch(frame).unwrap();
    }
    orchestrator.finish();

    let v2 = orchestrator.drain(AlgorithmId::CogPositionMass).unwrap();
    let v3 = orchestrator.drain(AlgorithmId::CogPositionMassV3).unwrap();
    assert_eq!(v2.len(), input.len());
    assert_eq!(v3.len(), input.len());

    for (scored, original) in v2.iter().zip(&input) {
        assert_eq!(scored.timestamp, original.timestamp);
        assert_eq!(scored.readings, original.readings);
        assert_eq!(scored.result.algorithm, Some(AlgorithmId::CogPositionMass));
        assert_eq!(&scored.result.reference[..4], &[500, 500, 500, 500]);
    }
    let zones: Vec<(i16, i16)> = v2.iter().take(3).map(|f| (f.result.zone, f.result.predicted_weight)).collect();
    assert_eq!(zones, vec![(5, 0), (1, 178), (8, -411)]);

    // smoothed variant: zero deltas resolve nothing, the filtered step lands on zone 2
    assert_eq!(v3[0].result.error_code, ErrorCode::UNDETERMINED);
    assert_eq!(v3[0].result.zone, -1);
    assert_eq!(v3[1].result.error_code, ErrorCode::OK);
    assert_eq!((v3[1].result.zone, v3[1].result.predicted_weight), (2, 22));
    assert!(v3.iter().all(|f| f.result.algorithm == Some(AlgorithmId::CogPositionMassV3)));

    orchestrator.terminate_all();
    assert_eq!(orchestrator.worker_count(), 0);
}

#[test]
fn test_fault_before_baseline_reports_pending() {
    let mut orchestrator = Orchestrator::with_processes(process_config()).unwrap();
    orchestrator.add_worker(AlgorithmId::CogPositionMass);
    orchestrator.start().unwrap();

    let mut faulty = SensorFrame::from_distances(0.1, [500, 500, 500, 500]);
    faulty.readings[2] = SensorReading::fault(0.1, SensorLocation::TopRight);
    orchestrator.dispatch(&faulty).unwrap();
    orchestrator.dispatch(&SensorFrame::from_distances(0.2, [500; 4])).unwrap();
    let mut later = SensorFrame::from_distances(0.3, [500; 4]);
    later.readings[0] = SensorReading::fault(0.3, SensorLocation::TopLeft);
    orchestrator.dispatch(&later).unwrap();
    orchestrator.finish();

    let codes: Vec<ErrorCode> = orchestrator
        .drain(AlgorithmId::CogPositionMass)
        .unwrap()
        .iter()
        .map(|f| f.result.error_code)
        .collect();
    assert_eq!(
        codes,
        vec![ErrorCode::BASELINE_PENDING, ErrorCode::OK, ErrorCode::SENSOR_FAULT]
    );
}

#[test]
fn test_unsupported_algorithm_refused_at_start() {
    let mut orchestrator = Orchestrator::with_processes(process_config()).unwrap();
    orchestrator.add_worker(AlgorithmId::CogPositionMass);
    orchestrator.add_worker(AlgorithmId::Mlp);
    match orchestrator.start() {
        Err(PipelineError::Unsupported(id)) => assert_eq!(id, AlgorithmId::Mlp),
        other => panic!("expected Unsupported, got {:?}", other.map(|_| ())),
    }
    assert_eq!(orchestrator.worker_count(), 0);
}

#[test]
fn test_missing_worker_binary_fails_spawn() {
    let config = PipelineConfig {
        worker_exe: Some(PathBuf::from("/nonexistent/estimator_worker")),
        ..PipelineConfig::default()
    };
    let mut orchestrator = Orchestrator::with_processes(config).unwrap();
    orchestrator.add_worker(AlgorithmId::CogPositionMass);
    assert!(matches!(orchestrator.start(), Err(PipelineError::Spawn { .. })));
}

#[test]
fn test_replay_is_repeatable_across_backends() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("COGPositionMassEstimation_run_static_20250314.bin");
    write_log(&source, &frames());

    let run = |mode: SpawnMode, out: &str| -> PathBuf {
        let mut manager = ReplayManager::new(process_config(), mode);
        manager.add_algorithm(AlgorithmId::CogPositionMassV3);
        manager.set_output_dir(dir.path().join(out));
        let summary = manager.replay(&source, |_| {}).unwrap();
        assert!(summary.is_complete());
        assert_eq!(summary.frames_loaded, 4);
        summary.algorithms[0].output.clone()
    };

    let first = run(SpawnMode::Process, "a");
    let second = run(SpawnMode::Process, "b");
    let threaded = run(SpawnMode::Thread, "c");
    assert_eq!(
        first.file_name().unwrap(),
        "COGPositionMassEstimation_v3_run_static_20250314.bin"
    );

    let bytes = fs::read(&first).unwrap();
    assert_eq!(bytes.len(), 4 * load_estimator::FRAME_SIZE);
    assert_eq!(bytes, fs::read(&second).unwrap());
    assert_eq!(bytes, fs::read(&threaded).unwrap());
}

#[test]
fn test_replay_refuses_to_overwrite_source() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("COGPositionMassEstimation_run_static_20250314.bin");
    write_log(&source, &frames());

    let mut manager = ReplayManager::new(process_config(), SpawnMode::Thread);
    manager.add_algorithm(AlgorithmId::CogPositionMass);
    manager.set_output_dir(dir.path());
    assert!(matches!(
        manager.replay(&source, |_| {}),
        Err(PipelineError::Config(_))
    ));
    assert_eq!(fs::read(&source).unwrap().len(), 4 * load_estimator::FRAME_SIZE);
}
