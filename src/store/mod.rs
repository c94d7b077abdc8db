//! Transactional persistence for workflows, execution logs, and error logs.

mod memory;
mod model;
mod postgres;

pub use memory::InMemoryStore;
pub use model::{
    ErrorLogInit, ErrorLogRow, ExecutionLogRow, StepState, StoreError, WorkflowInit, WorkflowRow,
    WorkflowState,
};
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Everything the executor needs from the database.
///
/// Every method that needs the workflow row lock owns its transaction
/// end-to-end: there is no generic "run this closure under a row lock"
/// primitive exposed here, since that shape does not compose well across
/// an object-safe async trait. See `DESIGN.md` for the rationale.
#[async_trait]
pub trait Store: Send + Sync {
    /// Atomically find or create the workflow identified by
    /// `(job_class, key)`. `init` is only applied on creation.
    async fn find_or_create_workflow(
        &self,
        job_class: &str,
        key: &str,
        init: WorkflowInit,
    ) -> Result<WorkflowRow, StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, StoreError>;

    /// Take the lock if it is free or stale. Sets `state = running`.
    async fn acquire_lock(
        &self,
        id: Uuid,
        executor_id: &str,
        max_duration: chrono::Duration,
    ) -> Result<WorkflowRow, StoreError>;

    /// Release the lock held by `executor_id`. `force` bypasses the
    /// ownership check (used by the retry transition).
    async fn release_lock(
        &self,
        id: Uuid,
        executor_id: &str,
        force: bool,
    ) -> Result<WorkflowRow, StoreError>;

    /// Mark `state = running -> idle` is handled inside `release_lock`;
    /// this sets any terminal/stalled state directly, independent of the
    /// lock.
    async fn set_workflow_state(
        &self,
        id: Uuid,
        state: WorkflowState,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<WorkflowRow, StoreError>;

    async fn save_context(&self, id: Uuid, context: Value) -> Result<(), StoreError>;

    /// Atomically find or create the execution log row for
    /// `(workflow_id, step_name)`.
    async fn find_or_create_step(
        &self,
        workflow_id: Uuid,
        step_name: &str,
    ) -> Result<ExecutionLogRow, StoreError>;

    async fn get_step(
        &self,
        workflow_id: Uuid,
        step_name: &str,
    ) -> Result<ExecutionLogRow, StoreError>;

    /// Apply a targeted update to a step row, keyed by its unique index.
    async fn update_step(&self, update: StepUpdate) -> Result<ExecutionLogRow, StoreError>;

    async fn insert_error_log(&self, init: ErrorLogInit) -> Result<ErrorLogRow, StoreError>;

    async fn list_error_logs(&self, workflow_id: Uuid) -> Result<Vec<ErrorLogRow>, StoreError>;

    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<ExecutionLogRow>, StoreError>;
}

/// Targeted, idempotent write to an [`ExecutionLogRow`]. All fields besides
/// the key are optional; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    pub workflow_id: Uuid,
    pub step_name: String,
    pub state: Option<StepState>,
    pub increment_attempts: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
}

impl StepUpdate {
    pub fn new(workflow_id: Uuid, step_name: impl Into<String>) -> Self {
        Self {
            workflow_id,
            step_name: step_name.into(),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: StepState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn increment_attempts(mut self) -> Self {
        self.increment_attempts = true;
        self
    }

    pub fn with_last_executed_now(mut self) -> Self {
        self.last_executed_at = Some(Utc::now());
        self
    }

    pub fn with_completed_now(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_error(mut self, class: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_class = Some(class.into());
        self.error_message = Some(message.into());
        self
    }
}
