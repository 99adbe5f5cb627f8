//! Run progress shared with callers

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Stage of a flow routing run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Direction,
    Accumulation,
    Finished,
    Failed,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Phase::Direction,
            2 => Phase::Accumulation,
            3 => Phase::Finished,
            4 => Phase::Failed,
            _ => Phase::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Direction => 1,
            Phase::Accumulation => 2,
            Phase::Finished => 3,
            Phase::Failed => 4,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Direction => "flow direction",
            Phase::Accumulation => "flow accumulation",
            Phase::Finished => "finished",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Lock-free progress counter that another thread can poll.
///
/// The direction phase counts rows, the accumulation phase counts sources.
#[derive(Debug, Default)]
pub struct Progress {
    phase: AtomicU8,
    done: AtomicU64,
    total: AtomicU64,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a phase with `total` units of work
    pub fn start(&self, phase: Phase, total: u64) {
        self.done.store(0, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
        self.phase.store(phase.as_u8(), Ordering::Release);
    }

    #[inline]
    pub fn advance(&self, units: u64) {
        self.done.fetch_add(units, Ordering::Relaxed);
    }

    pub fn finish(&self) {
        self.phase.store(Phase::Finished.as_u8(), Ordering::Release);
    }

    pub fn fail(&self) {
        self.phase.store(Phase::Failed.as_u8(), Ordering::Release);
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Percentage of the current phase, `-1` after a failure
    pub fn percent(&self) -> i32 {
        match self.phase() {
            Phase::Idle => 0,
            Phase::Finished => 100,
            Phase::Failed => -1,
            Phase::Direction | Phase::Accumulation => {
                let total = self.total.load(Ordering::Relaxed);
                if total == 0 {
                    return 100;
                }
                let done = self.done.load(Ordering::Relaxed).min(total);
                (done * 100 / total) as i32
            }
        }
    }
}
