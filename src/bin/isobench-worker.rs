//! # Worker Process
//!
//! The `isobench-worker` binary is the child side of a `Worker`. It reads
//! length-prefixed requests from stdin, benchmarks each task with the host
//! runtime, and writes responses to a private copy of stdout. Descriptor 1
//! itself is re-pointed at stderr before any kernel runs, so nothing a kernel
//! prints can corrupt the response stream.
//!
//! Any failure (a malformed request, a kernel error) ends the process with a
//! non-zero exit code; the parent treats that like a crash.

use std::io::{self, BufReader};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use isobench::child::{serve, take_stdout, Shutdown};
use isobench::timing::BenchTimer;
use isobench::Runtime;

#[derive(Parser, Debug)]
#[command(author, version, about = "Crash-isolated kernel benchmark worker")]
struct Args {
    /// Timer warm-up budget in milliseconds
    #[arg(long, default_value = "25")]
    timer_warmup_ms: u64,

    /// Timer repetition budget in milliseconds
    #[arg(long, default_value = "100")]
    timer_rep_ms: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Logs go to stderr; stdout carries protocol frames.
    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    match run(&args) {
        Ok(shutdown) => {
            info!("[WORKER:DONE] Exiting ({:?})", shutdown);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("[WORKER:FAULT] {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<Shutdown> {
    let mut responses = take_stdout().context("Failed to redirect stdout")?;
    let mut requests = BufReader::new(io::stdin().lock());

    let timer = BenchTimer::new(
        Duration::from_millis(args.timer_warmup_ms),
        Duration::from_millis(args.timer_rep_ms),
    );
    let runtime = Runtime::host().with_timer(Arc::new(timer));

    info!(
        "[WORKER:INIT] PID {} ready (CUDA_VISIBLE_DEVICES={:?})",
        std::process::id(),
        std::env::var("CUDA_VISIBLE_DEVICES").ok()
    );
    let start = Instant::now();
    let shutdown = serve(&mut requests, &mut responses, &runtime)?;
    info!(
        "[WORKER:DONE] Served for {:.2} ms",
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(shutdown)
}
