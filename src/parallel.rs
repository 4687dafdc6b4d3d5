//! Helpers for the fork-join block parallelism of the solver.
//!
//! Parallel regions are expressed with rayon: independent bulk and particle
//! block loops are issued through `rayon::join` so that workers finishing one
//! loop steal work from the other, and per-block loops run over disjoint
//! mutable chunks of the state. The only shared write across a region is the
//! first observed error, recorded here.

use std::sync::Mutex;

/// First-error-wins slot shared across a parallel region.
///
/// Mirrors the critical section used in parallel factorization loops: every
/// failing block tries to record its error, only the first one is kept.
#[derive(Debug, Default)]
pub struct FirstError<E> {
    slot: Mutex<Option<E>>,
}

impl<E> FirstError<E> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Records `err` if no error has been recorded yet.
    pub fn record(&self, err: E) {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Runs `f` and records its error, if any.
    pub fn record_result<T>(&self, result: Result<T, E>) {
        if let Err(e) = result {
            self.record(e);
        }
    }

    pub fn take(self) -> Option<E> {
        self.slot.into_inner().unwrap()
    }
}

/// Number of workers in the current rayon pool.
pub fn num_threads() -> usize {
    rayon::current_num_threads()
}

/// Runs `f` on a dedicated pool with `n` workers.
///
/// Used by tests to compare single-threaded and multi-threaded results.
pub fn with_threads<T: Send>(n: usize, f: impl FnOnce() -> T + Send) -> T {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n)
        .build()
        .expect("failed to build thread pool")
        .install(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_first_error_wins() {
        let first = FirstError::new();
        (0..64usize).into_par_iter().for_each(|i| {
            if i % 2 == 0 {
                first.record(i);
            }
        });
        let got = first.take().unwrap();
        assert_eq!(got % 2, 0);
    }

    #[test]
    fn test_no_error_recorded() {
        let first: FirstError<usize> = FirstError::new();
        assert!(first.take().is_none());
    }

    #[test]
    fn test_record_result_keeps_only_failures() {
        let first: FirstError<&str> = FirstError::new();
        first.record_result(Ok(1));
        first.record_result(Err::<i32, _>("boom"));
        first.record_result(Err::<i32, _>("later"));
        assert_eq!(first.take(), Some("boom"));
    }

    #[test]
    fn test_with_threads_runs_on_pool() {
        let n = with_threads(2, num_threads);
        assert_eq!(n, 2);
    }
}
