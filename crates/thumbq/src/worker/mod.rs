//! Worker threads that lease tasks and turn them into finished jobs.
//!
//! `WorkerPool` owns the threads; `TaskProcessor` is what each of them runs
//! for a single delivery.

pub mod pool;
pub mod task;

pub use pool::WorkerPool;
pub use task::{TaskOutcome, TaskProcessor};
