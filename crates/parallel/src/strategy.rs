//! Worker pools for phase-parallel execution

use std::any::Any;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};

use flowtile_core::{Error, Result};
use tracing::debug;

/// Number of hardware threads
pub fn available_threads() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Clamp a requested thread count to the hardware; `0` means all cores
pub fn resolve_threads(requested: usize) -> usize {
    let available = available_threads();
    match requested {
        0 => available,
        n => n.min(available),
    }
}

/// Fixed set of worker threads for one phase of a run.
///
/// Every call to [`WorkerPool::broadcast`] builds a fresh rayon pool, runs the
/// job once on each of its threads and tears the pool down again, so phases
/// never share threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPool {
    threads: usize,
}

impl WorkerPool {
    /// Pool of `min(requested, available)` threads
    pub fn new(requested: usize) -> Self {
        Self {
            threads: resolve_threads(requested),
        }
    }

    /// Pool of exactly `threads` threads, regardless of the hardware
    pub fn exact(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `job(worker)` concurrently on every worker, `worker` in `0..threads`.
    ///
    /// All workers run at the same time, so jobs may rendezvous on a barrier.
    /// Results come back in worker order. If any worker fails, the returned
    /// error is the first one that is not [`Error::Interrupted`]; a panic
    /// becomes [`Error::WorkerPanicked`].
    pub fn broadcast<R, F>(&self, phase: &str, job: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(usize) -> Result<R> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name({
                let phase = phase.to_string();
                move |i| format!("{}-{}", phase, i)
            })
            .build()
            .map_err(|e| Error::Other(format!("failed to start worker threads: {}", e)))?;
        debug!("{}: {} workers", phase, self.threads);

        let outcomes: Vec<Result<R>> = pool.broadcast(|ctx| {
            let worker = ctx.index();
            panic::catch_unwind(AssertUnwindSafe(|| job(worker)))
                .unwrap_or_else(|payload| Err(Error::WorkerPanicked(panic_message(payload))))
        });

        let mut results = Vec::with_capacity(outcomes.len());
        let mut failure: Option<Error> = None;
        for outcome in outcomes {
            match outcome {
                Ok(r) => results.push(r),
                Err(e) => match &failure {
                    None => failure = Some(e),
                    Some(first) if first.is_interrupt() && !e.is_interrupt() => failure = Some(e),
                    Some(_) => {}
                },
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
