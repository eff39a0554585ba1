//! # Timing and Device Synchronization
//!
//! `Timer` turns a launch closure into one robust latency number;
//! `DeviceSync` blocks until all outstanding device work has finished so
//! asynchronous faults surface synchronously.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::kernel::KernelError;

/// Repeatedly invokes a callable and returns a latency estimate in
/// milliseconds.
pub trait Timer: Send + Sync {
    fn measure(
        &self,
        launch: &mut dyn FnMut() -> Result<(), KernelError>,
    ) -> Result<f64, KernelError>;
}

/// Blocks until the device is idle.
pub trait DeviceSync: Send + Sync {
    fn synchronize(&self) -> Result<(), KernelError>;
}

/// Wall-clock timer with warm-up and repetition budgets.
///
/// One launch estimates the per-call cost; the warm-up and repetition counts
/// are derived from the budgets (at least one of each, at most `max_iters`)
/// and the median of the timed repetitions is returned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BenchTimer {
    pub warmup: Duration,
    pub rep: Duration,
    pub max_iters: usize,
}

impl Default for BenchTimer {
    fn default() -> Self {
        Self {
            warmup: Duration::from_millis(25),
            rep: Duration::from_millis(100),
            max_iters: 1000,
        }
    }
}

impl BenchTimer {
    pub fn new(warmup: Duration, rep: Duration) -> Self {
        Self {
            warmup,
            rep,
            ..Self::default()
        }
    }

    fn iterations(&self, budget: Duration, estimate: Duration) -> usize {
        let estimate = estimate.max(Duration::from_nanos(1));
        let n = (budget.as_secs_f64() / estimate.as_secs_f64()) as usize;
        n.clamp(1, self.max_iters.max(1))
    }
}

impl Timer for BenchTimer {
    fn measure(
        &self,
        launch: &mut dyn FnMut() -> Result<(), KernelError>,
    ) -> Result<f64, KernelError> {
        let start = Instant::now();
        launch()?;
        let estimate = start.elapsed();

        for _ in 0..self.iterations(self.warmup, estimate) {
            launch()?;
        }

        let reps = self.iterations(self.rep, estimate);
        let mut samples = Vec::with_capacity(reps);
        for _ in 0..reps {
            let start = Instant::now();
            launch()?;
            samples.push(start.elapsed().as_secs_f64() * 1000.0);
        }
        Ok(median(&mut samples))
    }
}

fn median(samples: &mut [f64]) -> f64 {
    samples.sort_by(f64::total_cmp);
    let mid = samples.len() / 2;
    if samples.len() % 2 == 0 {
        (samples[mid - 1] + samples[mid]) / 2.0
    } else {
        samples[mid]
    }
}

/// Host execution is synchronous, so there is nothing to wait for.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostDevice;

impl DeviceSync for HostDevice {
    fn synchronize(&self) -> Result<(), KernelError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), 2.5);
    }

    #[test]
    fn test_iteration_counts() {
        let timer = BenchTimer::default();
        let est = Duration::from_millis(10);
        assert_eq!(timer.iterations(Duration::from_millis(25), est), 2);
        assert_eq!(timer.iterations(Duration::from_millis(100), est), 10);
        // Slow kernels still run once
        assert_eq!(timer.iterations(Duration::from_millis(25), Duration::from_secs(1)), 1);
        // Fast kernels are capped
        assert_eq!(timer.iterations(Duration::from_secs(1), Duration::ZERO), 1000);
    }

    #[test]
    fn test_measure_counts_calls_and_is_positive() {
        let timer = BenchTimer::new(Duration::from_millis(2), Duration::from_millis(4));
        let mut calls = 0;
        let latency = timer
            .measure(&mut || {
                calls += 1;
                std::thread::sleep(Duration::from_millis(1));
                Ok(())
            })
            .unwrap();
        assert!(latency >= 1.0);
        assert!(calls >= 3);
    }

    #[test]
    fn test_measure_propagates_errors() {
        let timer = BenchTimer::default();
        let result = timer.measure(&mut || {
            Err(KernelError::Launch {
                kernel: "k".into(),
                status: 9,
            })
        });
        assert!(matches!(result, Err(KernelError::Launch { status: 9, .. })));
    }
}
