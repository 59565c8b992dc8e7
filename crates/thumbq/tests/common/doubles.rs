//! Stand-ins for the external pieces: ffmpeg and the queue backend.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use image::{ImageFormat, Rgb, RgbImage};

use thumbq::error::QueueError;
use thumbq::pipeline::{FrameSource, PipelineError};
use thumbq::queue::{
    Delivery, EnqueueOptions, FailureOutcome, QueueEvent, QueueEventBroadcaster, TaskId,
    TaskPayload, TaskQueue,
};

/// Reports a fixed duration and writes a solid JPEG for every extraction.
pub struct FakeFrames {
    duration: Option<Duration>,
    extract_delay: Duration,
    seeks: Mutex<Vec<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeFrames {
    fn build(duration: Option<Duration>, extract_delay: Duration) -> Self {
        Self {
            duration,
            extract_delay,
            seeks: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_duration(duration: Duration) -> Self {
        Self::build(Some(duration), Duration::ZERO)
    }

    /// Every extraction takes `extract_delay`, like a long decode.
    pub fn slow(duration: Duration, extract_delay: Duration) -> Self {
        Self::build(Some(duration), extract_delay)
    }

    /// Every probe fails as if ffmpeg printed no duration.
    pub fn unprobeable() -> Self {
        Self::build(None, Duration::ZERO)
    }

    pub fn seeks(&self) -> Vec<Duration> {
        self.seeks.lock().unwrap().clone()
    }

    /// Most extractions that were ever running at the same moment.
    pub fn max_concurrent_extracts(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl FrameSource for FakeFrames {
    fn probe_duration(&self, _source: &Path) -> Result<Duration, PipelineError> {
        self.duration.ok_or(PipelineError::DurationUnparsable {
            diagnostics: "Duration: N/A".to_string(),
        })
    }

    fn extract_frame(
        &self,
        _source: &Path,
        at: Duration,
        dest: &Path,
    ) -> Result<(), PipelineError> {
        self.seeks.lock().unwrap().push(at);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        std::thread::sleep(self.extract_delay);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        RgbImage::from_pixel(320, 180, Rgb([10, 120, 200]))
            .save_with_format(dest, ImageFormat::Jpeg)
            .map_err(|e| PipelineError::Encode(e.to_string()))
    }
}

/// A queue whose every enqueue is refused, like a backend that is down.
#[derive(Default)]
pub struct FailingQueue {
    events: QueueEventBroadcaster,
}

impl TaskQueue for FailingQueue {
    fn enqueue(
        &self,
        _payload: TaskPayload,
        _options: &EnqueueOptions,
    ) -> Result<TaskId, QueueError> {
        Err(QueueError::Unavailable("connection refused".to_string()))
    }

    fn dequeue(&self, _worker: &str) -> Result<Option<Delivery>, QueueError> {
        Ok(None)
    }

    fn lease_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn extend_lease(&self, delivery: &Delivery) -> Result<(), QueueError> {
        Err(QueueError::LeaseLost(delivery.task_id.clone()))
    }

    fn mark_active(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        Ok(())
    }

    fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        Err(QueueError::LeaseLost(delivery.task_id.clone()))
    }

    fn fail(
        &self,
        _delivery: &Delivery,
        _error: &str,
        _retryable: bool,
    ) -> Result<FailureOutcome, QueueError> {
        Ok(FailureOutcome::Exhausted)
    }

    fn reclaim_stalled(&self, _worker: &str) -> Result<Vec<Delivery>, QueueError> {
        Ok(Vec::new())
    }

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn wait_for_work(&self, timeout: Duration) {
        std::thread::sleep(timeout);
    }
}
