//! The host background-job system's contract. The executor only ever needs
//! to enqueue (now or after a delay) the same workflow entrypoint it was
//! itself invoked with; it never needs to dequeue or claim work, since
//! that side of the loop belongs to whatever job runner hosts this crate.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// One durable re-entry request: "run `job_class`'s perform with this key,
/// attempt, options, and kwargs again".
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_class: String,
    pub key: String,
    pub attempt: u32,
    pub options: Value,
    pub kwargs: Value,
}

#[async_trait]
pub trait JobSystem: Send + Sync {
    async fn enqueue_now(&self, request: JobRequest);

    async fn enqueue_after(&self, delay: Duration, request: JobRequest);
}

/// In-process `JobSystem` used in tests. Delayed jobs are recorded rather
/// than actually slept on; a test drives re-entry explicitly by calling the
/// executor again.
#[derive(Default)]
pub struct RecordingJobSystem {
    enqueued: parking_lot::Mutex<Vec<(Option<Duration>, JobRequest)>>,
}

impl RecordingJobSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<(Option<Duration>, JobRequest)> {
        std::mem::take(&mut self.enqueued.lock())
    }

    pub fn len(&self) -> usize {
        self.enqueued.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.enqueued.lock().is_empty()
    }
}

#[async_trait]
impl JobSystem for RecordingJobSystem {
    async fn enqueue_now(&self, request: JobRequest) {
        self.enqueued.lock().push((None, request));
    }

    async fn enqueue_after(&self, delay: Duration, request: JobRequest) {
        self.enqueued.lock().push((Some(delay), request));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> JobRequest {
        JobRequest {
            job_class: "demo".to_string(),
            key: "k1".to_string(),
            attempt: 0,
            options: serde_json::json!({}),
            kwargs: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn recording_job_system_captures_enqueues() {
        let jobs = RecordingJobSystem::new();
        jobs.enqueue_now(request()).await;
        jobs.enqueue_after(Duration::from_secs(5), request()).await;

        assert_eq!(jobs.len(), 2);
        let drained = jobs.drain();
        assert_eq!(drained.len(), 2);
        assert!(jobs.is_empty());
        assert!(drained[0].0.is_none());
        assert_eq!(drained[1].0, Some(Duration::from_secs(5)));
    }
}
