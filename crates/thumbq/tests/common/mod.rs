//! Shared test utilities for thumbq integration tests.
//!
//! This module provides:
//! - `TestHarness`, a fully wired store, queue, relay and pipeline on a temp directory
//! - `FakeFrames`, a frame source that stands in for ffmpeg
//! - `FailingQueue`, a queue whose backend is down

pub mod doubles;
pub mod harness;

pub use doubles::{FailingQueue, FakeFrames};
pub use harness::{HarnessOptions, TestHarness};
