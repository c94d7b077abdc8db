//! The entrypoint the host job system calls: `perform(key, attempt, ...)`.
//! Composes lock acquisition, a single run of the workflow body, and
//! completion/failure/halt handling, always releasing the lock it took.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::Context;
use crate::job::JobSystem;
use crate::registry::{RegistryError, WorkflowRegistry};
use crate::retry::RetryPolicy;
use crate::steps::{StepContext, StepError};
use crate::store::{Store, StoreError, WorkflowInit, WorkflowState};
use crate::tracker::ExecutionTracker;
use crate::workflow::{Workflow, WorkflowError};

/// Tunables for a [`WorkflowExecutor`] instance.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Identity used to claim the workflow lock. Two executor instances
    /// racing for the same workflow must use different ids.
    pub executor_id: String,
    /// How long a lease is honored before another instance may take over.
    pub max_duration: chrono::Duration,
    /// Governs retries for workflow-body errors that aren't a step's own
    /// `ExecutionFailed`.
    pub retry_policy: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            executor_id: Uuid::now_v7().to_string(),
            max_duration: chrono::Duration::minutes(10),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_executor_id(mut self, id: impl Into<String>) -> Self {
        self.executor_id = id.into();
        self
    }

    pub fn with_max_duration(mut self, max_duration: chrono::Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("workflow {0} is not in a retryable state")]
    WorkflowNotRetryable(Uuid),
}

/// Outcome of a single `perform` call, useful for tests and for callers
/// that want to observe what happened without re-querying the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerformOutcome {
    Completed,
    Halted,
    Stalled,
    Failed,
    /// Attempt cap reached before this call; nothing happened.
    AttemptsExhausted,
    /// Another instance holds a non-stale lock.
    ConcurrentExecution,
}

/// Drives workflow bodies registered in a [`WorkflowRegistry`] against a
/// [`Store`] and a host [`JobSystem`].
pub struct WorkflowExecutor {
    store: Arc<dyn Store>,
    jobs: Arc<dyn JobSystem>,
    registry: WorkflowRegistry,
    config: ExecutorConfig,
    tracker: ExecutionTracker,
}

impl WorkflowExecutor {
    pub fn new(store: Arc<dyn Store>, jobs: Arc<dyn JobSystem>) -> Self {
        Self::with_config(store, jobs, ExecutorConfig::default())
    }

    pub fn with_config(store: Arc<dyn Store>, jobs: Arc<dyn JobSystem>, config: ExecutorConfig) -> Self {
        let tracker = ExecutionTracker::new(store.clone());
        Self {
            store,
            jobs,
            registry: WorkflowRegistry::new(),
            config,
            tracker,
        }
    }

    pub fn register<W: Workflow>(&mut self) {
        self.registry.register::<W>();
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Submit a new (or re-enter an existing idle) workflow instance via
    /// the job system, without running it inline.
    pub async fn submit(
        &self,
        job_class: &str,
        key: &str,
        kwargs: Value,
        options: Value,
    ) -> Result<(), ExecutorError> {
        self.store
            .find_or_create_workflow(job_class, key, WorkflowInit { kwargs: kwargs.clone(), options: options.clone() })
            .await?;
        self.jobs
            .enqueue_now(crate::job::JobRequest {
                job_class: job_class.to_string(),
                key: key.to_string(),
                attempt: 0,
                options,
                kwargs,
            })
            .await;
        Ok(())
    }

    /// Request that a stalled/failed workflow be retried immediately.
    pub async fn retry_now(&self, job_class: &str, key: &str) -> Result<PerformOutcome, ExecutorError> {
        self.perform_inner(job_class, key, 0, true).await
    }

    /// Request that a stalled/failed workflow be retried on its own
    /// schedule (via the job system), without running it inline here.
    pub async fn retry_later(&self, job_class: &str, key: &str) -> Result<(), ExecutorError> {
        let wf = self
            .store
            .find_or_create_workflow(job_class, key, WorkflowInit { kwargs: Value::Null, options: Value::Null })
            .await?;
        self.transition_for_retry(wf.id).await?;
        self.jobs
            .enqueue_now(crate::job::JobRequest {
                job_class: job_class.to_string(),
                key: key.to_string(),
                attempt: 0,
                options: Value::Null,
                kwargs: Value::Null,
            })
            .await;
        Ok(())
    }

    async fn transition_for_retry(&self, workflow_id: Uuid) -> Result<(), ExecutorError> {
        let wf = self.store.get_workflow(workflow_id).await?;
        if !wf.state.is_retryable() {
            return Err(ExecutorError::WorkflowNotRetryable(workflow_id));
        }

        let step_name = format!("$workflow_retry${}", Utc::now().timestamp());
        self.store.find_or_create_step(workflow_id, &step_name).await?;
        self.store
            .update_step(
                crate::store::StepUpdate::new(workflow_id, &step_name)
                    .with_state(crate::store::StepState::Completed)
                    .with_completed_now(),
            )
            .await?;

        // A stalled/failed workflow holds no lock, but a stale lock left
        // behind by a crashed executor must not block the retry.
        self.store.release_lock(workflow_id, &self.config.executor_id, true).await.ok();

        self.store
            .set_workflow_state(workflow_id, WorkflowState::Idle, None)
            .await?;
        Ok(())
    }

    /// The main entrypoint: `perform(key, attempt, retry_workflow, options, kwargs)`.
    #[instrument(skip(self, options, kwargs), fields(job_class, key, attempt))]
    #[allow(clippy::too_many_arguments)]
    pub async fn perform(
        &self,
        job_class: &str,
        key: &str,
        attempt: u32,
        retry_workflow: bool,
        options: Value,
        kwargs: Value,
    ) -> Result<PerformOutcome, ExecutorError> {
        if attempt >= self.config.retry_policy.max_attempts() {
            debug!(job_class, key, attempt, "attempt cap reached, dropping entry");
            return Ok(PerformOutcome::AttemptsExhausted);
        }

        let wf = self
            .store
            .find_or_create_workflow(job_class, key, WorkflowInit { kwargs: kwargs.clone(), options: options.clone() })
            .await?;

        if retry_workflow {
            self.transition_for_retry(wf.id).await?;
        }

        self.perform_inner(job_class, key, attempt, false).await
    }

    async fn perform_inner(
        &self,
        job_class: &str,
        key: &str,
        attempt: u32,
        retry_workflow: bool,
    ) -> Result<PerformOutcome, ExecutorError> {
        let wf = self
            .store
            .find_or_create_workflow(job_class, key, WorkflowInit { kwargs: Value::Null, options: Value::Null })
            .await?;

        if retry_workflow {
            self.transition_for_retry(wf.id).await?;
        }

        let locked = match self
            .store
            .acquire_lock(wf.id, &self.config.executor_id, self.config.max_duration)
            .await
        {
            Ok(row) => row,
            Err(_) => {
                warn!(workflow_id = %wf.id, "could not acquire lock, another instance is running");
                return Ok(PerformOutcome::ConcurrentExecution);
            }
        };

        let workflow = match self.registry.create(job_class, locked.kwargs.clone()) {
            Ok(w) => w,
            Err(e) => {
                self.store.release_lock(wf.id, &self.config.executor_id, true).await.ok();
                return Err(e.into());
            }
        };

        let mut context = Context::from_value(locked.context.clone());
        let mut steps = StepContext::new(
            self.store.clone(),
            self.jobs.clone(),
            locked.id,
            job_class,
            key,
            attempt,
            locked.options.clone(),
            locked.kwargs.clone(),
            context.clone(),
        );

        let outcome = workflow.run(&mut steps).await;
        context = steps.context;

        let result = match outcome {
            Ok(output) => {
                self.complete_workflow(locked.id, &output).await?;
                info!(workflow_id = %locked.id, "workflow completed");
                Ok(PerformOutcome::Completed)
            }
            Err(StepError::Halt) => {
                debug!(workflow_id = %locked.id, "workflow halted, will resume later");
                Ok(PerformOutcome::Halted)
            }
            Err(StepError::ExecutionFailed(err)) => {
                self.tracker.track(locked.id, "ExecutionFailed", &err.message, &context).await;
                self.store
                    .set_workflow_state(locked.id, WorkflowState::Stalled, None)
                    .await?;
                warn!(workflow_id = %locked.id, error = %err, "workflow stalled");
                Ok(PerformOutcome::Stalled)
            }
            Err(StepError::User(e)) => {
                // A workflow body that raises a `WorkflowError` directly gets its
                // `code`/`retryable` consulted; anything else falls back to the
                // policy's default classification (error_class = None, always retryable).
                let workflow_err = e.downcast_ref::<WorkflowError>();
                let error_class = workflow_err.and_then(|w| w.code.as_deref());
                let message = workflow_err.map(|w| w.message.clone()).unwrap_or_else(|| e.to_string());
                let retryable = workflow_err.map(|w| w.retryable).unwrap_or(true);

                self.tracker.track(locked.id, error_class.unwrap_or("Error"), message.clone(), &context).await;

                if retryable
                    && self.config.retry_policy.should_retry(error_class, attempt)
                    && self.config.retry_policy.has_attempts_remaining(attempt)
                {
                    let delay = self.config.retry_policy.delay_for_attempt(attempt);
                    self.jobs
                        .enqueue_after(
                            delay,
                            crate::job::JobRequest {
                                job_class: job_class.to_string(),
                                key: key.to_string(),
                                attempt: attempt + 1,
                                options: locked.options.clone(),
                                kwargs: locked.kwargs.clone(),
                            },
                        )
                        .await;
                    Ok(PerformOutcome::Halted)
                } else {
                    self.fail_workflow(locked.id, &message, &context).await?;
                    Ok(PerformOutcome::Failed)
                }
            }
            Err(StepError::Store(e)) => Err(e.into()),
        };

        self.store.save_context(locked.id, context.to_value()).await.ok();
        self.store.release_lock(locked.id, &self.config.executor_id, false).await.ok();

        result
    }

    async fn complete_workflow(&self, workflow_id: Uuid, output: &Value) -> Result<(), ExecutorError> {
        let step_name = "$workflow_completion$";
        let step = self.store.find_or_create_step(workflow_id, step_name).await?;
        if !step.is_completed() {
            self.store
                .update_step(
                    crate::store::StepUpdate::new(workflow_id, step_name)
                        .with_state(crate::store::StepState::Completed)
                        .with_completed_now()
                        .with_metadata(output.clone()),
                )
                .await?;
        }
        self.store
            .set_workflow_state(workflow_id, WorkflowState::Completed, Some(Utc::now()))
            .await?;
        Ok(())
    }

    async fn fail_workflow(
        &self,
        workflow_id: Uuid,
        message: &str,
        context: &Context,
    ) -> Result<(), ExecutorError> {
        let error_log = self
            .tracker
            .track(workflow_id, "WorkflowFailed", message, context)
            .await;
        let suffix = error_log.map(|e| e.id.to_string()).unwrap_or_else(|| Uuid::now_v7().to_string());
        let step_name = format!("$workflow_failure${suffix}");
        self.store.find_or_create_step(workflow_id, &step_name).await?;
        self.store
            .update_step(
                crate::store::StepUpdate::new(workflow_id, &step_name)
                    .with_state(crate::store::StepState::Completed)
                    .with_completed_now(),
            )
            .await?;
        self.store
            .set_workflow_state(workflow_id, WorkflowState::Failed, Some(Utc::now()))
            .await?;
        Ok(())
    }
}
