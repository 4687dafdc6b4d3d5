//! Wall-clock timers for the solver phases and a serializable report.
//!
//! Timers are started and stopped from the serial sections surrounding the
//! parallel regions, so no synchronization is needed.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Accumulating wall-clock timer.
#[derive(Debug, Default, Clone)]
pub struct Timer {
    elapsed: Duration,
    count: u64,
    started: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        if let Some(start) = self.started.take() {
            self.elapsed += start.elapsed();
            self.count += 1;
        }
    }

    /// Accumulates an externally measured duration.
    pub fn record(&mut self, elapsed: Duration) {
        self.record_many(elapsed, 1);
    }

    /// Accumulates a duration covering `count` invocations.
    pub fn record_many(&mut self, elapsed: Duration, count: u64) {
        self.elapsed += elapsed;
        self.count += count;
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
        self.count = 0;
        self.started = None;
    }
}

/// Timers covering the phases of the linear solve and the consistent
/// initialization.
#[derive(Debug, Default, Clone)]
pub struct SolverTimers {
    pub factorize: Timer,
    pub linear_solve: Timer,
    pub gmres: Timer,
    pub mat_vec: Timer,
    pub consistent_init: Timer,
}

impl SolverTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.factorize.reset();
        self.linear_solve.reset();
        self.gmres.reset();
        self.mat_vec.reset();
        self.consistent_init.reset();
    }

    pub fn report(&self) -> TimingReport {
        TimingReport {
            factorize_seconds: self.factorize.elapsed_seconds(),
            factorize_count: self.factorize.count(),
            linear_solve_seconds: self.linear_solve.elapsed_seconds(),
            linear_solve_count: self.linear_solve.count(),
            gmres_seconds: self.gmres.elapsed_seconds(),
            gmres_count: self.gmres.count(),
            mat_vec_seconds: self.mat_vec.elapsed_seconds(),
            mat_vec_count: self.mat_vec.count(),
            consistent_init_seconds: self.consistent_init.elapsed_seconds(),
            consistent_init_count: self.consistent_init.count(),
        }
    }
}

/// Timing summary serialized into the JSON report of the command line wrapper.
#[derive(Debug, Clone, Serialize)]
pub struct TimingReport {
    pub factorize_seconds: f64,
    pub factorize_count: u64,
    pub linear_solve_seconds: f64,
    pub linear_solve_count: u64,
    pub gmres_seconds: f64,
    pub gmres_count: u64,
    pub mat_vec_seconds: f64,
    pub mat_vec_count: u64,
    pub consistent_init_seconds: f64,
    pub consistent_init_count: u64,
}

impl TimingReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
