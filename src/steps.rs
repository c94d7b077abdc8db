//! Idempotent step primitives: `durably_execute`, `wait`, `wait_until`,
//! `continue_if`, `durably_repeat`. Each consults its own execution-log row
//! to decide whether to run, reschedule (halt), or fail.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::job::{JobRequest, JobSystem};
use crate::store::{ExecutionLogRow, StepState, StepUpdate, Store, StoreError};
use crate::tracker::ExecutionTracker;
use crate::workflow::WorkflowError;
use crate::Context;

/// What a step primitive raises when it cannot complete the current entry.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Normal suspension: the primitive has (usually) scheduled a future
    /// re-entry and the current attempt should stop without being treated
    /// as a failure.
    #[error("halt")]
    Halt,

    /// A primitive exhausted its own retry budget, or a condition timed
    /// out. The workflow transitions to `stalled`, not `failed`.
    #[error("step execution failed: {0}")]
    ExecutionFailed(WorkflowError),

    /// Arbitrary error from user-supplied closures that isn't a step
    /// exhaustion — surfaces to the Driver's generic retry/fail handling.
    #[error(transparent)]
    User(#[from] anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How `durably_repeat` treats a tick that exhausted its own retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    /// Skip the tick and keep the schedule moving (default).
    Continue,
    /// Raise `ExecutionFailed`, stalling the whole workflow.
    FailWorkflow,
}

fn to_std(d: ChronoDuration) -> StdDuration {
    d.to_std().unwrap_or(StdDuration::ZERO)
}

fn to_chrono(d: StdDuration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::zero())
}

/// `2^min(attempts, 5)` seconds, the per-step retry backoff used by
/// `durably_execute`, `wait_until`, and `durably_repeat`.
fn primitive_backoff(attempts: i32) -> StdDuration {
    StdDuration::from_secs(2u64.pow(attempts.clamp(0, 5) as u32))
}

fn metadata_timestamp(metadata: &Option<Value>, key: &str) -> Option<DateTime<Utc>> {
    metadata
        .as_ref()?
        .get(key)?
        .as_str()?
        .parse::<DateTime<Utc>>()
        .ok()
}

/// The per-entry handle a workflow body uses to run its step primitives
/// and to read/write its durable context.
pub struct StepContext {
    store: Arc<dyn Store>,
    jobs: Arc<dyn JobSystem>,
    tracker: ExecutionTracker,
    workflow_id: Uuid,
    job_class: String,
    key: String,
    attempt: u32,
    options: Value,
    kwargs: Value,
    pub context: Context,
}

impl StepContext {
    pub fn new(
        store: Arc<dyn Store>,
        jobs: Arc<dyn JobSystem>,
        workflow_id: Uuid,
        job_class: impl Into<String>,
        key: impl Into<String>,
        attempt: u32,
        options: Value,
        kwargs: Value,
        context: Context,
    ) -> Self {
        let tracker = ExecutionTracker::new(store.clone());
        Self {
            store,
            jobs,
            tracker,
            workflow_id,
            job_class: job_class.into(),
            key: key.into(),
            attempt,
            options,
            kwargs,
            context,
        }
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    fn reenqueue_request(&self) -> JobRequest {
        JobRequest {
            job_class: self.job_class.clone(),
            key: self.key.clone(),
            attempt: self.attempt,
            options: self.options.clone(),
            kwargs: self.kwargs.clone(),
        }
    }

    async fn halt_after(&self, delay: StdDuration) -> StepError {
        self.jobs.enqueue_after(delay, self.reenqueue_request()).await;
        StepError::Halt
    }

    /// Runs `f` at most once across all replays, with its own short
    /// exponential backoff on failure.
    pub async fn durably_execute<F, Fut>(
        &mut self,
        name: &str,
        max_attempts: u32,
        f: F,
    ) -> Result<(), StepError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send,
    {
        let step_name = format!("durably_execute${name}");
        let step = self.store.find_or_create_step(self.workflow_id, &step_name).await?;
        if step.is_completed() {
            return Ok(());
        }

        self.store
            .update_step(
                StepUpdate::new(self.workflow_id, &step_name)
                    .increment_attempts()
                    .with_last_executed_now(),
            )
            .await?;

        match f().await {
            Ok(()) => {
                self.store
                    .update_step(
                        StepUpdate::new(self.workflow_id, &step_name)
                            .with_state(StepState::Completed)
                            .with_completed_now(),
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                let attempts = step.attempts + 1;
                self.tracker.track(self.workflow_id, "Error", e.to_string(), &self.context).await;
                if attempts < max_attempts as i32 {
                    self.store
                        .update_step(
                            StepUpdate::new(self.workflow_id, &step_name)
                                .with_error("Error", e.to_string()),
                        )
                        .await?;
                    Err(self.halt_after(primitive_backoff(attempts)).await)
                } else {
                    self.store
                        .update_step(
                            StepUpdate::new(self.workflow_id, &step_name)
                                .with_state(StepState::Failed)
                                .with_error("Error", e.to_string()),
                        )
                        .await?;
                    Err(StepError::ExecutionFailed(WorkflowError::new(e.to_string())))
                }
            }
        }
    }

    /// A durable sleep: suspends until `duration` has elapsed since the
    /// step was first created.
    pub async fn wait(&mut self, duration: StdDuration, name: &str) -> Result<(), StepError> {
        let step_name = format!("wait${name}");
        let step = self.store.find_or_create_step(self.workflow_id, &step_name).await?;
        if step.is_completed() {
            return Ok(());
        }

        let wait_until = match metadata_timestamp(&step.metadata, "wait_until") {
            Some(t) => t,
            None => {
                let t = Utc::now() + to_chrono(duration);
                self.store
                    .update_step(
                        StepUpdate::new(self.workflow_id, &step_name)
                            .with_metadata(serde_json::json!({ "wait_until": t.to_rfc3339() })),
                    )
                    .await?;
                t
            }
        };

        let now = Utc::now();
        if now >= wait_until {
            self.store
                .update_step(
                    StepUpdate::new(self.workflow_id, &step_name)
                        .with_state(StepState::Completed)
                        .with_completed_now(),
                )
                .await?;
            Ok(())
        } else {
            Err(self.halt_after(to_std(wait_until - now)).await)
        }
    }

    /// Polls `condition` on a fixed interval until it is true or `timeout`
    /// elapses.
    pub async fn wait_until<F, Fut>(
        &mut self,
        name: &str,
        timeout: StdDuration,
        check_interval: StdDuration,
        retry_on: &[&str],
        condition: F,
    ) -> Result<bool, StepError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<bool, anyhow::Error>> + Send,
    {
        let step_name = format!("wait_until${name}");
        let step = self.store.find_or_create_step(self.workflow_id, &step_name).await?;
        if step.is_completed() {
            return Ok(true);
        }

        let timeout_at = match metadata_timestamp(&step.metadata, "timeout_at") {
            Some(t) => t,
            None => {
                let t = Utc::now() + to_chrono(timeout);
                self.store
                    .update_step(
                        StepUpdate::new(self.workflow_id, &step_name)
                            .with_metadata(serde_json::json!({ "timeout_at": t.to_rfc3339() })),
                    )
                    .await?;
                t
            }
        };

        self.store
            .update_step(
                StepUpdate::new(self.workflow_id, &step_name)
                    .increment_attempts()
                    .with_last_executed_now(),
            )
            .await?;

        match condition().await {
            Ok(true) => {
                self.store
                    .update_step(
                        StepUpdate::new(self.workflow_id, &step_name)
                            .with_state(StepState::Completed)
                            .with_completed_now()
                            .with_metadata(serde_json::json!({ "result": true })),
                    )
                    .await?;
                Ok(true)
            }
            Ok(false) => {
                let now = Utc::now();
                if now > timeout_at {
                    self.store
                        .update_step(
                            StepUpdate::new(self.workflow_id, &step_name)
                                .with_state(StepState::Failed)
                                .with_error("WaitConditionNotMet", "condition not met before timeout"),
                        )
                        .await?;
                    Err(StepError::ExecutionFailed(WorkflowError::new(
                        "wait_until condition was not met before timeout",
                    )))
                } else {
                    Err(self.halt_after(check_interval).await)
                }
            }
            Err(e) => {
                let class = e.to_string();
                self.tracker.track(self.workflow_id, "Error", class.clone(), &self.context).await;
                if retry_on.iter().any(|c| *c == class) {
                    self.store
                        .update_step(
                            StepUpdate::new(self.workflow_id, &step_name).with_error("Error", class.clone()),
                        )
                        .await?;
                    Err(self.halt_after(check_interval).await)
                } else {
                    self.store
                        .update_step(
                            StepUpdate::new(self.workflow_id, &step_name)
                                .with_state(StepState::Failed)
                                .with_error("Error", class.clone()),
                        )
                        .await?;
                    Err(StepError::ExecutionFailed(WorkflowError::new(class)))
                }
            }
        }
    }

    /// Event-driven wait: checks `condition` exactly once. If false, halts
    /// without scheduling any re-entry — some external actor must
    /// re-enqueue the workflow.
    pub async fn continue_if<F, Fut>(&mut self, name: &str, condition: F) -> Result<bool, StepError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<bool, anyhow::Error>> + Send,
    {
        let step_name = format!("continue_if${name}");
        let step = self.store.find_or_create_step(self.workflow_id, &step_name).await?;
        if step.is_completed() {
            return Ok(true);
        }

        self.store
            .update_step(
                StepUpdate::new(self.workflow_id, &step_name)
                    .increment_attempts()
                    .with_last_executed_now(),
            )
            .await?;

        match condition().await {
            Ok(true) => {
                self.store
                    .update_step(
                        StepUpdate::new(self.workflow_id, &step_name)
                            .with_state(StepState::Completed)
                            .with_completed_now()
                            .with_metadata(serde_json::json!({ "result": true })),
                    )
                    .await?;
                Ok(true)
            }
            Ok(false) => Err(StepError::Halt),
            Err(e) => {
                self.tracker.track(self.workflow_id, "Error", e.to_string(), &self.context).await;
                self.store
                    .update_step(
                        StepUpdate::new(self.workflow_id, &step_name)
                            .with_state(StepState::Failed)
                            .with_error("Error", e.to_string()),
                    )
                    .await?;
                Err(StepError::ExecutionFailed(WorkflowError::new(e.to_string())))
            }
        }
    }

    /// Periodic execution with catch-up: ticks that fall further behind
    /// than `timeout` are skipped (marked `TimeoutError`, not a failure)
    /// rather than fired late.
    #[allow(clippy::too_many_arguments)]
    pub async fn durably_repeat<F, Fut, T, Fut2>(
        &mut self,
        name: &str,
        every: StdDuration,
        start_at: Option<DateTime<Utc>>,
        max_attempts: u32,
        timeout: StdDuration,
        on_error: OnError,
        till: T,
        method: F,
    ) -> Result<(), StepError>
    where
        F: FnOnce(DateTime<Utc>) -> Fut + Send,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send,
        T: FnOnce() -> Fut2 + Send,
        Fut2: Future<Output = Result<bool, anyhow::Error>> + Send,
    {
        let coord_name = format!("durably_repeat${name}");
        let coord: ExecutionLogRow = self.store.find_or_create_step(self.workflow_id, &coord_name).await?;
        if coord.is_completed() {
            return Ok(());
        }

        match till().await {
            Ok(true) => {
                self.store
                    .update_step(
                        StepUpdate::new(self.workflow_id, &coord_name)
                            .with_state(StepState::Completed)
                            .with_completed_now(),
                    )
                    .await?;
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => return Err(StepError::ExecutionFailed(WorkflowError::new(e.to_string()))),
        }

        let next_at = match metadata_timestamp(&coord.metadata, "last_execution_at") {
            Some(last) => last + to_chrono(every),
            None => start_at.unwrap_or(coord.created_at + to_chrono(every)),
        };

        let tick_name = format!("{coord_name}${}", next_at.timestamp());
        let tick = self.store.find_or_create_step(self.workflow_id, &tick_name).await?;
        let timeout_at = next_at + to_chrono(timeout);
        let now = Utc::now();

        if now < next_at {
            return Err(self.halt_after(to_std(next_at - now)).await);
        }

        let advance_schedule = |next_execution_at: DateTime<Utc>| {
            serde_json::json!({ "last_execution_at": next_execution_at.to_rfc3339() })
        };

        if now > timeout_at {
            self.store
                .update_step(
                    StepUpdate::new(self.workflow_id, &tick_name)
                        .with_state(StepState::Failed)
                        .with_error("TimeoutError", "tick skipped: exceeded catch-up window"),
                )
                .await?;
            self.store
                .update_step(
                    StepUpdate::new(self.workflow_id, &coord_name).with_metadata(advance_schedule(next_at)),
                )
                .await?;
            let resume_at = next_at + to_chrono(every);
            return Err(self.halt_after(to_std(resume_at - Utc::now())).await);
        }

        self.store
            .update_step(
                StepUpdate::new(self.workflow_id, &tick_name)
                    .increment_attempts()
                    .with_last_executed_now(),
            )
            .await?;

        match method(next_at).await {
            Ok(()) => {
                self.store
                    .update_step(
                        StepUpdate::new(self.workflow_id, &tick_name)
                            .with_state(StepState::Completed)
                            .with_completed_now(),
                    )
                    .await?;
                self.store
                    .update_step(
                        StepUpdate::new(self.workflow_id, &coord_name)
                            .with_metadata(advance_schedule(next_at)),
                    )
                    .await?;
                let resume_at = next_at + to_chrono(every);
                Err(self.halt_after(to_std(resume_at - Utc::now())).await)
            }
            Err(e) => {
                let attempts = tick.attempts + 1;
                self.tracker.track(self.workflow_id, "Error", e.to_string(), &self.context).await;
                if attempts < max_attempts as i32 {
                    self.store
                        .update_step(
                            StepUpdate::new(self.workflow_id, &tick_name).with_error("Error", e.to_string()),
                        )
                        .await?;
                    Err(self.halt_after(primitive_backoff(attempts)).await)
                } else {
                    self.store
                        .update_step(
                            StepUpdate::new(self.workflow_id, &tick_name)
                                .with_state(StepState::Failed)
                                .with_error("Error", e.to_string()),
                        )
                        .await?;
                    match on_error {
                        OnError::FailWorkflow => {
                            Err(StepError::ExecutionFailed(WorkflowError::new(e.to_string())))
                        }
                        OnError::Continue => {
                            self.store
                                .update_step(
                                    StepUpdate::new(self.workflow_id, &coord_name)
                                        .with_metadata(advance_schedule(next_at)),
                                )
                                .await?;
                            let resume_at = next_at + to_chrono(every);
                            Err(self.halt_after(to_std(resume_at - Utc::now())).await)
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RecordingJobSystem;
    use crate::store::{InMemoryStore, WorkflowInit};

    async fn ctx() -> (StepContext, Arc<InMemoryStore>, Arc<RecordingJobSystem>, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let jobs = Arc::new(RecordingJobSystem::new());
        let wf = store
            .find_or_create_workflow(
                "demo",
                "k1",
                WorkflowInit {
                    kwargs: serde_json::json!({}),
                    options: serde_json::json!({}),
                },
            )
            .await
            .unwrap();
        let sc = StepContext::new(
            store.clone(),
            jobs.clone(),
            wf.id,
            "demo",
            "k1",
            0,
            serde_json::json!({}),
            serde_json::json!({}),
            Context::new(),
        );
        (sc, store, jobs, wf.id)
    }

    #[tokio::test]
    async fn durably_execute_runs_once_and_skips_on_replay() {
        let (mut sc, store, _jobs, wf) = ctx().await;
        let mut calls = 0;
        sc.durably_execute("send", 3, || async {
            calls += 1;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(calls, 1);

        // Replay: fresh StepContext, same step name, should short-circuit.
        let jobs2 = Arc::new(RecordingJobSystem::new());
        let mut sc2 = StepContext::new(
            store.clone(),
            jobs2,
            wf,
            "demo",
            "k1",
            0,
            serde_json::json!({}),
            serde_json::json!({}),
            Context::new(),
        );
        let mut calls2 = 0;
        sc2.durably_execute("send", 3, || async {
            calls2 += 1;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(calls2, 0);
    }

    #[tokio::test]
    async fn durably_execute_halts_and_reschedules_on_transient_failure() {
        let (mut sc, _store, jobs, _wf) = ctx().await;
        let result = sc
            .durably_execute("flaky", 3, || async { Err(anyhow::anyhow!("boom")) })
            .await;
        assert!(matches!(result, Err(StepError::Halt)));
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_is_tracked_even_though_the_step_halts() {
        let (mut sc, store, _jobs, wf) = ctx().await;
        let _ = sc
            .durably_execute("flaky", 3, || async { Err(anyhow::anyhow!("boom")) })
            .await;
        let logs = store.list_error_logs(wf).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].error_class.as_deref(), Some("Error"));
    }

    #[tokio::test]
    async fn durably_execute_fails_after_exhausting_attempts() {
        let (mut sc, store, _jobs, wf) = ctx().await;
        for _ in 0..2 {
            let _ = sc
                .durably_execute("flaky", 2, || async { Err(anyhow::anyhow!("boom")) })
                .await;
        }
        let step = store.get_step(wf, "durably_execute$flaky").await.unwrap();
        assert_eq!(step.attempts, 2);
    }

    #[tokio::test]
    async fn wait_completes_immediately_for_zero_duration() {
        let (mut sc, _store, _jobs, _wf) = ctx().await;
        sc.wait(StdDuration::from_secs(0), "cool").await.unwrap();
    }

    #[tokio::test]
    async fn wait_halts_when_duration_not_elapsed() {
        let (mut sc, _store, jobs, _wf) = ctx().await;
        let result = sc.wait(StdDuration::from_secs(3600), "cool").await;
        assert!(matches!(result, Err(StepError::Halt)));
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn continue_if_halts_without_enqueue_when_false() {
        let (mut sc, _store, jobs, _wf) = ctx().await;
        let result = sc.continue_if("ready", || async { Ok(false) }).await;
        assert!(matches!(result, Err(StepError::Halt)));
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn continue_if_completes_when_true() {
        let (mut sc, _store, _jobs, _wf) = ctx().await;
        let result = sc.continue_if("ready", || async { Ok(true) }).await.unwrap();
        assert!(result);
    }

    #[tokio::test]
    async fn wait_until_times_out_past_timeout_at() {
        let (mut sc, store, _jobs, wf) = ctx().await;
        // Seed metadata with a timeout already in the past.
        store.find_or_create_step(wf, "wait_until$ready").await.unwrap();
        store
            .update_step(
                StepUpdate::new(wf, "wait_until$ready")
                    .with_metadata(serde_json::json!({ "timeout_at": (Utc::now() - ChronoDuration::seconds(10)).to_rfc3339() })),
            )
            .await
            .unwrap();

        let result = sc
            .wait_until("ready", StdDuration::from_secs(0), StdDuration::from_secs(1), &[], || async {
                Ok(false)
            })
            .await;
        assert!(matches!(result, Err(StepError::ExecutionFailed(_))));
    }

    #[tokio::test]
    async fn durably_repeat_completes_when_till_is_true() {
        let (mut sc, _store, _jobs, _wf) = ctx().await;
        sc.durably_repeat(
            "tick",
            StdDuration::from_secs(2),
            None,
            3,
            StdDuration::from_secs(3600),
            OnError::Continue,
            || async { Ok(true) },
            |_at| async { Ok(()) },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn durably_repeat_fires_first_tick_immediately_without_start_at() {
        let (mut sc, _store, jobs, _wf) = ctx().await;
        let mut invoked = false;
        let result = sc
            .durably_repeat(
                "tick",
                StdDuration::from_secs(0),
                None,
                3,
                StdDuration::from_secs(3600),
                OnError::Continue,
                || async { Ok(false) },
                |_at| async {
                    invoked = true;
                    Ok(())
                },
            )
            .await;
        assert!(matches!(result, Err(StepError::Halt)));
        assert!(invoked);
        assert_eq!(jobs.len(), 1);
    }
}
