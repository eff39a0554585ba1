// isobench - Benchmarks a batch of kernel tasks in isolated worker processes
// Reads tasks as JSON, prints a ranking, and saves latencies plus pool stats

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use isobench::{BenchmarkTask, PoolConfig, WorkerPool};

#[derive(Parser, Debug, Serialize)]
#[command(
    author,
    version,
    about = "Benchmark kernels in crash-isolated worker processes"
)]
struct Args {
    /// JSON file holding an array of benchmark tasks
    #[arg(long)]
    tasks: PathBuf,

    /// Results file
    #[arg(long, default_value = "results/isobench.json")]
    out: PathBuf,

    /// One worker per device (overrides ISOBENCH_MULTI_DEVICE)
    #[arg(long)]
    multi_device: bool,

    /// Worker executable (overrides ISOBENCH_WORKER_BIN)
    #[arg(long)]
    worker_bin: Option<PathBuf>,

    /// Response poll interval in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    dump_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = build_config(&args)?;
    if args.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let tasks = load_tasks(&args.tasks)?;
    info!(
        "[ISOBENCH:INIT] {} task(s) from {:?}, worker {:?}",
        tasks.len(),
        args.tasks,
        config.worker.program
    );

    let pool = WorkerPool::new(config);
    let start_time = Instant::now();
    pool.initialize().context("Failed to start worker pool")?;
    info!("[ISOBENCH:INIT] Pool ready with {} worker(s)", pool.size());

    let latencies = pool.dispatch_many(&tasks)?;
    let stats = pool.stats();
    pool.terminate();

    let elapsed = start_time.elapsed();
    info!(
        "[ISOBENCH:DONE] Benchmarked {} task(s) in {:.2} ms ({} failed)",
        tasks.len(),
        elapsed.as_secs_f64() * 1000.0,
        stats.failed
    );

    report_ranking(&tasks, &latencies);
    save_results(&args, &tasks, &latencies, stats, elapsed)?;

    Ok(())
}

fn build_config(args: &Args) -> Result<PoolConfig> {
    let mut config = PoolConfig::from_env().context("Invalid environment configuration")?;
    if args.multi_device {
        config.multi_device = true;
    }
    if let Some(ref program) = args.worker_bin {
        config.worker.program = program.clone();
    }
    if let Some(ms) = args.poll_ms {
        anyhow::ensure!(ms > 0, "--poll-ms must be positive");
        config.worker.poll_interval = Duration::from_millis(ms);
    }
    if args.verbose {
        config.worker.args.push("--verbose".to_string());
    }
    Ok(config)
}

fn load_tasks(path: &PathBuf) -> Result<Vec<BenchmarkTask>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse tasks in {:?}", path))
}

fn report_ranking(tasks: &[BenchmarkTask], latencies: &[f64]) {
    let mut ranked: Vec<(&BenchmarkTask, f64)> =
        tasks.iter().zip(latencies.iter().copied()).collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

    for (rank, (task, latency)) in ranked.iter().enumerate() {
        if latency.is_finite() {
            info!("[ISOBENCH:RESULTS] #{} {} {:.4} ms", rank + 1, task, latency);
        } else {
            warn!("[ISOBENCH:RESULTS] #{} {} failed", rank + 1, task);
        }
    }
}

fn save_results(
    args: &Args,
    tasks: &[BenchmarkTask],
    latencies: &[f64],
    stats: isobench::PoolStats,
    elapsed: Duration,
) -> Result<()> {
    if let Some(dir) = args.out.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).context("Failed to create results directory")?;
        }
    }

    // JSON has no infinity; failed tasks are written as null.
    let results: Vec<_> = tasks
        .iter()
        .zip(latencies)
        .map(|(task, latency)| {
            json!({
                "task": task.to_string(),
                "latency_ms": latency.is_finite().then_some(*latency),
            })
        })
        .collect();

    let output = json!({
        "results": results,
        "stats": stats,
        "wall_time_ms": elapsed.as_secs_f64() * 1000.0,
        "args": args,
    });
    fs::write(&args.out, serde_json::to_string_pretty(&output)?)
        .with_context(|| format!("Failed to write results to {:?}", args.out))?;
    info!("[ISOBENCH:DONE] Saved results to {:?}", args.out);

    Ok(())
}
