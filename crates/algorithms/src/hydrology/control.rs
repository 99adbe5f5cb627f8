//! Cooperative cancellation shared by the workers of one run

use std::sync::atomic::{AtomicBool, Ordering};

use flowtile_core::{Error, Result};
use flowtile_parallel::Barrier;
use tracing::warn;

/// Per-run interrupt flag and the barrier its workers meet at.
///
/// Workers poll the flag at the top of each per-cell loop and at every
/// barrier. A failing worker raises it so the others stop promptly.
#[derive(Debug, Default)]
pub struct RunControl {
    interrupted: AtomicBool,
    barrier: Barrier,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal every worker to stop
    pub fn interrupt(&self) {
        if !self.interrupted.swap(true, Ordering::AcqRel) {
            warn!("interrupting run");
        }
        self.barrier.wake_all();
    }

    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// `Err(Interrupted)` once the run has been interrupted
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_interrupted() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Wait for all `workers`; fails if the run was interrupted meanwhile
    pub fn rendezvous(&self, workers: usize) -> Result<()> {
        if self.barrier.wait(workers, || self.is_interrupted()).is_escaped() {
            return Err(Error::Interrupted);
        }
        self.check()
    }

    /// Run a worker body, raising the interrupt if it fails
    pub fn guard<R>(&self, body: impl FnOnce() -> Result<R>) -> Result<R> {
        let result = body();
        if let Err(e) = &result {
            if !e.is_interrupt() {
                self.interrupt();
            }
        }
        result
    }
}
