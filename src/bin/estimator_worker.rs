//! Isolated worker process: frames on stdin, scored frames on stdout.
//!
//! stdout carries the readiness handshake followed by fixed-size frame
//! records and nothing else; all logging goes to stderr.

use std::io::{self, BufReader, BufWriter};

use anyhow::{Context, Result};
use clap::Parser;

use load_estimator::codec::{FrameReader, FrameWriter};
use load_estimator::estimator::EstimatorOptions;
use load_estimator::history::ExecutionHistory;
use load_estimator::worker::{write_handshake, Worker};
use load_estimator::AlgorithmId;

#[derive(Parser, Debug)]
#[command(name = "estimator_worker")]
#[command(about = "Runs one estimation algorithm over a frame stream", long_about = None)]
struct Args {
    /// Algorithm code or name (e.g. 0, cog, cog-v3)
    #[arg(long)]
    algorithm: AlgorithmId,

    /// Low-pass filter coefficient for smoothed variants
    #[arg(long, default_value = "0.2")]
    smoothing_alpha: f64,

    /// Execution history ring buffer size
    #[arg(long, default_value = "256")]
    history_capacity: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();
    let args = Args::parse();

    let options = EstimatorOptions {
        smoothing_alpha: args.smoothing_alpha,
    };
    let mut worker = Worker::new(args.algorithm, &options)
        .with_context(|| format!("cannot start worker for {}", args.algorithm))?;
    worker.initialize();

    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    let mut output = BufWriter::new(stdout);
    write_handshake(&mut output, worker.algorithm()).context("handshake")?;

    let mut source = FrameReader::new(BufReader::new(stdin));
    let mut sink = FrameWriter::new(output);
    let mut history = ExecutionHistory::new(args.history_capacity);
    let handled = worker
        .run(&mut source, &mut sink, &mut history)
        .context("worker loop")?;
    log::debug!("[worker] {} exiting after {} frames", worker.algorithm(), handled);
    Ok(())
}
