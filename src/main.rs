use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use clap::Parser;
use crossbeam::channel::{self, RecvTimeoutError};
use serde_json::json;

use load_estimator::codec::FrameReader;
use load_estimator::{
    AlgorithmId, ExperimentLabel, ExperimentSession, Orchestrator, PipelineConfig, Scenario,
    SensorFrame, SpawnMode,
};

#[derive(Parser, Debug)]
#[command(name = "load_estimator")]
#[command(about = "Live load estimation over a sensor frame stream", long_about = None)]
struct Args {
    /// Frame stream to read (default: stdin)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Pipeline config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Algorithms to run (repeatable)
    #[arg(long = "algorithm", default_values = ["cog", "cog-v3"])]
    algorithms: Vec<AlgorithmId>,

    /// Experiment label used in archive names
    #[arg(long, default_value = "")]
    label: String,

    /// Scenario tag or name
    #[arg(long, default_value = "none")]
    scenario: Scenario,

    /// Ground-truth weight per zone, nine comma-separated values
    #[arg(long, value_delimiter = ',')]
    weights: Vec<u16>,

    /// Mark frames as measured from the start (cargo already loaded)
    #[arg(long, default_value_t = false)]
    measured: bool,

    /// Archive directory (overrides config)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Readiness timeout in ms, 0 waits forever (overrides config)
    #[arg(long)]
    ready_timeout_ms: Option<u64>,

    /// Run workers as threads instead of processes
    #[arg(long, default_value_t = false)]
    threads: bool,
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn parse_weights(values: &[u16]) -> Result<ExperimentLabel> {
    if values.is_empty() {
        return Ok(ExperimentLabel::default());
    }
    let weights: [u16; 9] = values
        .try_into()
        .map_err(|_| anyhow::anyhow!("--weights needs 9 values, got {}", values.len()))?;
    Ok(ExperimentLabel::new(weights))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = PipelineConfig::load_or_default(args.config.as_deref())?;
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(ms) = args.ready_timeout_ms {
        config.ready_timeout_ms = (ms > 0).then_some(ms);
    }
    let weights = parse_weights(&args.weights)?;

    println!("[{}] Load Estimator Starting", ts_now());
    println!("  Algorithms: {:?}", args.algorithms);
    println!("  Scenario: {} ({})", args.scenario.name(), args.scenario.description());
    println!("  Output Dir: {}", config.output_dir.display());

    let mode = if args.threads {
        SpawnMode::Thread
    } else {
        SpawnMode::Process
    };
    let poll = config.poll_interval();
    let mut orchestrator = Orchestrator::from_mode(config.clone(), mode)?;
    for id in &args.algorithms {
        orchestrator.add_worker(*id);
    }
    orchestrator.start().context("starting workers")?;

    let mut session = ExperimentSession::new(&config.output_dir);
    let suffix = session.start_measure(
        &args.label,
        args.scenario,
        weights,
        &args.algorithms,
        Local::now().date_naive(),
    )?;
    if args.measured {
        session.confirm_load()?;
    }
    println!("[{}] Archiving to <algorithm>{}", ts_now(), suffix);

    // Capture: decode frames on a separate thread so polling never waits on input
    let input: Box<dyn Read + Send> = match &args.input {
        Some(path) => Box::new(File::open(path).with_context(|| format!("open {}", path.display()))?),
        None => Box::new(io::stdin()),
    };
    let (frame_tx, frame_rx) = channel::bounded::<SensorFrame>(config.channel_capacity);
    let capture = thread::spawn(move || -> Result<u64> {
        let mut reader = FrameReader::new(BufReader::new(input));
        while let Some(frame) = reader.read_frame()? {
            if frame_tx.send(frame).is_err() {
                break;
            }
        }
        Ok(reader.frames_read())
    });

    let mut dispatched = 0u64;
    let mut input_closed = false;
    let mut last_results: BTreeMap<AlgorithmId, String> = BTreeMap::new();
    loop {
        match frame_rx.recv_timeout(poll) {
            Ok(mut frame) => {
                session.stamp(&mut frame);
                match orchestrator.dispatch_or_retire(&frame) {
                    Ok(leftovers) => {
                        for scored in leftovers {
                            session.archive(&scored)?;
                        }
                        dispatched += 1;
                    }
                    Err(e) => {
                        log::error!("[session] Stopping capture: {}", e);
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                input_closed = true;
                break;
            }
        }
        for (id, scored) in orchestrator.collect() {
            session.archive(&scored)?;
            last_results.insert(
                id,
                format!("zone={} weight={}kg", scored.result.zone, scored.result.predicted_weight),
            );
        }
    }

    // the capture thread may sit in a blocking read; only wait for it once input has ended
    drop(frame_rx);
    if input_closed {
        match capture.join() {
            Ok(Ok(n)) => log::info!("[session] Input closed after {} frames", n),
            Ok(Err(e)) => log::error!("[session] Input stream failed: {}", e),
            Err(_) => log::error!("[session] Capture thread panicked"),
        }
    }

    // Flush what is still in flight, then close archives
    orchestrator.finish();
    let survivors: Vec<AlgorithmId> = orchestrator.active().collect();
    for id in survivors {
        for scored in orchestrator.drain(id)? {
            session.archive(&scored)?;
        }
    }
    orchestrator.terminate_all();
    let archived = session.archived_counts();
    session.stop_experiment()?;
    session.finish()?;

    let summary = json!({
        "frames_dispatched": dispatched,
        "archived": archived
            .iter()
            .map(|(id, n)| (id.name().to_string(), json!(n)))
            .collect::<serde_json::Map<String, serde_json::Value>>(),
        "last_results": last_results
            .iter()
            .map(|(id, s)| (id.name().to_string(), json!(s)))
            .collect::<serde_json::Map<String, serde_json::Value>>(),
        "suffix": suffix,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
