//! # flowtile parallel
//!
//! Thread synchronisation and work distribution for the flow engine.
//!
//! This crate provides:
//! - `WorkerPool`: a fresh set of worker threads per phase
//! - `Barrier`: reusable rendezvous with an escape predicate for cancellation
//! - `Spinlock`: busy-wait lock for tiny critical sections
//! - Row-stripe partitioning and a shared work queue

pub mod barrier;
pub mod queue;
pub mod spinlock;
pub mod strategy;
pub mod stripe;

pub use barrier::{Barrier, BarrierWaitResult};
pub use queue::WorkQueue;
pub use spinlock::{Spinlock, SpinlockGuard};
pub use strategy::{available_threads, resolve_threads, WorkerPool};
pub use stripe::{stripes, Stripe};
