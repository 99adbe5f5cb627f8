//! Reusable rendezvous with an escape hatch

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

/// How often blocked waiters re-check their escape predicate
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a [`Barrier::wait`] call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWaitResult {
    /// Every participant arrived
    Completed,
    /// A participant's escape predicate fired and released everyone
    Escaped,
}

impl BarrierWaitResult {
    pub fn is_escaped(self) -> bool {
        self == BarrierWaitResult::Escaped
    }
}

#[derive(Debug, Default)]
struct State {
    /// Participants still expected in the current generation
    remaining: usize,
    generation: u64,
    /// Whether the last finished generation was escaped
    escaped: bool,
}

/// Reusable barrier for a known number of threads.
///
/// Unlike `std::sync::Barrier`, every waiter carries an escape predicate,
/// typically "has any worker failed". When the predicate of any blocked
/// waiter turns true, the whole generation is released with
/// [`BarrierWaitResult::Escaped`], so a worker that will never arrive cannot
/// leave the others blocked forever.
///
/// # Example
///
/// ```
/// use flowtile_parallel::{Barrier, BarrierWaitResult};
///
/// let barrier = Barrier::new();
/// let results: Vec<_> = std::thread::scope(|s| {
///     let handles: Vec<_> = (0..3)
///         .map(|_| s.spawn(|| barrier.wait(3, || false)))
///         .collect();
///     handles.into_iter().map(|h| h.join().unwrap()).collect()
/// });
/// assert!(results.iter().all(|&r| r == BarrierWaitResult::Completed));
/// ```
#[derive(Debug, Default)]
pub struct Barrier {
    state: Mutex<State>,
    cvar: Condvar,
}

impl Barrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `n` participants have called `wait` or `escape` returns true.
    ///
    /// The first caller of a generation fixes its participant count.
    pub fn wait<F>(&self, n: usize, escape: F) -> BarrierWaitResult
    where
        F: Fn() -> bool,
    {
        let mut state = self.lock();
        if state.remaining == 0 {
            state.remaining = n.max(1);
        }
        let generation = state.generation;
        state.remaining -= 1;
        if state.remaining == 0 {
            self.finish(&mut state, false);
            return BarrierWaitResult::Completed;
        }

        loop {
            if escape() {
                debug!("barrier generation {} escaped", generation);
                self.finish(&mut state, true);
                return BarrierWaitResult::Escaped;
            }
            state = self
                .cvar
                .wait_timeout(state, POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            if state.generation != generation {
                return if state.escaped {
                    BarrierWaitResult::Escaped
                } else {
                    BarrierWaitResult::Completed
                };
            }
        }
    }

    /// Wake blocked waiters so they re-check their escape predicates now
    pub fn wake_all(&self) {
        let _state = self.lock();
        self.cvar.notify_all();
    }

    fn finish(&self, state: &mut State, escaped: bool) {
        state.remaining = 0;
        state.generation = state.generation.wrapping_add(1);
        state.escaped = escaped;
        self.cvar.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn test_single_participant_passes() {
        let barrier = Barrier::new();
        assert_eq!(barrier.wait(1, || false), BarrierWaitResult::Completed);
        assert_eq!(barrier.wait(1, || true), BarrierWaitResult::Completed);
    }

    #[test]
    fn test_nobody_passes_early() {
        let barrier = Barrier::new();
        let arrived = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(barrier.wait(4, || false), BarrierWaitResult::Completed);
                    assert_eq!(arrived.load(Ordering::SeqCst), 4);
                });
            }
        });
    }

    #[test]
    fn test_reusable_across_generations() {
        let barrier = Barrier::new();
        let counter = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    for round in 1..=5 {
                        counter.fetch_add(1, Ordering::SeqCst);
                        barrier.wait(3, || false);
                        assert!(counter.load(Ordering::SeqCst) >= round * 3);
                        barrier.wait(3, || false);
                    }
                });
            }
        });
        assert_eq!(counter.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn test_escape_releases_all_waiters() {
        let barrier = Barrier::new();
        let failed = AtomicBool::new(false);
        let start = Instant::now();

        let results: Vec<_> = std::thread::scope(|s| {
            let waiters: Vec<_> = (0..3)
                .map(|_| s.spawn(|| barrier.wait(4, || failed.load(Ordering::SeqCst))))
                .collect();
            // The fourth participant fails instead of arriving
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                failed.store(true, Ordering::SeqCst);
                barrier.wake_all();
            });
            waiters.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results.iter().all(|r| r.is_escaped()));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_usable_after_escape() {
        let barrier = Barrier::new();
        std::thread::scope(|s| {
            s.spawn(|| assert!(barrier.wait(2, || true).is_escaped()));
        });
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| assert_eq!(barrier.wait(2, || false), BarrierWaitResult::Completed));
            }
        });
    }
}
