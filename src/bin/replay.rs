use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};

use load_estimator::estimator;
use load_estimator::replay::{load_log, log_files_in, ReplayManager};
use load_estimator::{AlgorithmId, PipelineConfig, SpawnMode};

#[derive(Parser, Debug)]
#[command(name = "replay")]
#[command(about = "Re-score recorded frame logs with the registered algorithms", long_about = None)]
struct Args {
    /// Path to a recorded .bin frame log
    #[arg(long, conflicts_with = "dir")]
    log: Option<PathBuf>,

    /// Directory of logs to batch replay (processes *.bin)
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Print the frames of each log as JSON lines instead of replaying
    #[arg(long, default_value_t = false)]
    inspect: bool,

    /// Where replayed logs go (default: replay/ next to each source)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Algorithms to replay with (repeatable, default: every registered one)
    #[arg(long = "algorithm")]
    algorithms: Vec<AlgorithmId>,

    /// Pipeline config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run workers as threads instead of processes
    #[arg(long, default_value_t = false)]
    threads: bool,
}

fn inspect(path: &Path) -> anyhow::Result<Value> {
    let frames = load_log(path).with_context(|| format!("load {}", path.display()))?;
    for frame in &frames {
        println!("{}", serde_json::to_string(frame)?);
    }
    Ok(json!({
        "source": path.display().to_string(),
        "frames": frames.len(),
    }))
}

fn run_once(path: &Path, args: &Args, config: &PipelineConfig) -> anyhow::Result<Value> {
    if args.inspect {
        return inspect(path);
    }

    let mode = if args.threads {
        SpawnMode::Thread
    } else {
        SpawnMode::Process
    };
    let mut manager = ReplayManager::new(config.clone(), mode);
    if args.algorithms.is_empty() {
        for id in estimator::registered() {
            manager.add_algorithm(id);
        }
    } else {
        for id in &args.algorithms {
            manager.add_algorithm(*id);
        }
    }
    if let Some(dir) = &args.output_dir {
        manager.set_output_dir(dir);
    }

    let mut last_decile = 0u32;
    let summary = manager.replay(path, |progress| {
        let decile = (progress.percent() / 10.0) as u32;
        if decile > last_decile {
            last_decile = decile;
            log::info!("[replay] {}: {:.0}%", path.display(), progress.percent());
        }
    })?;

    let mut value = serde_json::to_value(&summary)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("complete".to_string(), json!(summary.is_complete()));
    }
    Ok(value)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = PipelineConfig::load_or_default(args.config.as_deref())?;
    let mut results = Vec::new();

    if let Some(dir) = args.dir.as_ref() {
        for path in log_files_in(dir)? {
            match run_once(&path, &args, &config) {
                Ok(res) => results.push(res),
                Err(e) => eprintln!("Failed {}: {:#}", path.display(), e),
            }
        }
    } else if let Some(log) = args.log.as_ref() {
        results.push(run_once(log, &args, &config)?);
    } else {
        anyhow::bail!("Provide --log or --dir");
    }

    if !args.inspect {
        println!("{}", serde_json::to_string_pretty(&results)?);
    }
    Ok(())
}
