//! Row types and state enums persisted by the [`Store`](super::Store).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::lock::LockError;

/// Lifecycle state of a [`WorkflowRow`].
///
/// Encoded as `SMALLINT` on the wire: idle=0, running=1, completed=2,
/// failed=3, stalled=4. The integer encoding is load-bearing — it is part
/// of the persisted schema, not an implementation detail — so this enum's
/// `Serialize`/`Deserialize` impls are hand-rolled rather than derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowState {
    Idle,
    Running,
    Completed,
    Failed,
    Stalled,
}

impl WorkflowState {
    pub fn as_i16(self) -> i16 {
        match self {
            WorkflowState::Idle => 0,
            WorkflowState::Running => 1,
            WorkflowState::Completed => 2,
            WorkflowState::Failed => 3,
            WorkflowState::Stalled => 4,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(WorkflowState::Idle),
            1 => Some(WorkflowState::Running),
            2 => Some(WorkflowState::Completed),
            3 => Some(WorkflowState::Failed),
            4 => Some(WorkflowState::Stalled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Failed)
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, WorkflowState::Stalled | WorkflowState::Failed)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowState::Idle => "idle",
            WorkflowState::Running => "running",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Stalled => "stalled",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of an [`ExecutionLogRow`]. Encoded as `SMALLINT`:
/// pending=0, completed=1, failed=2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepState {
    Pending,
    Completed,
    Failed,
}

impl StepState {
    pub fn as_i16(self) -> i16 {
        match self {
            StepState::Pending => 0,
            StepState::Completed => 1,
            StepState::Failed => 2,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(StepState::Pending),
            1 => Some(StepState::Completed),
            2 => Some(StepState::Failed),
            _ => None,
        }
    }
}

/// The root instance row. See SPEC_FULL.md §3/§6 for the invariants this
/// row must uphold (unique `(job_class, key)`, lock/state coupling, etc).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub key: String,
    pub job_class: String,
    pub kwargs: Value,
    pub options: Value,
    pub context: Value,
    #[serde(skip)]
    pub state: WorkflowState,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied on first creation of a workflow; ignored if the row
/// already exists (find-or-create semantics).
#[derive(Debug, Clone)]
pub struct WorkflowInit {
    pub kwargs: Value,
    pub options: Value,
}

/// One row per workflow step attempt-set. Unique on
/// `(workflow_id, step_name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_name: String,
    pub attempts: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
    #[serde(skip)]
    pub state: StepState,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionLogRow {
    pub fn is_completed(&self) -> bool {
        matches!(self.state, StepState::Completed)
    }
}

/// One row per observed exception, correlated to the workflow it occurred
/// in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub backtrace: Option<String>,
    pub context: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Fields to create an [`ErrorLogRow`].
#[derive(Debug, Clone)]
pub struct ErrorLogInit {
    pub workflow_id: Uuid,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub backtrace: Option<String>,
    pub context: Option<Value>,
}

/// Errors surfaced by any [`Store`](super::Store) implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("execution log not found: workflow {0} step {1}")]
    StepNotFound(Uuid, String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_state_round_trips_through_i16() {
        for s in [
            WorkflowState::Idle,
            WorkflowState::Running,
            WorkflowState::Completed,
            WorkflowState::Failed,
            WorkflowState::Stalled,
        ] {
            assert_eq!(WorkflowState::from_i16(s.as_i16()), Some(s));
        }
    }

    #[test]
    fn step_state_round_trips_through_i16() {
        for s in [StepState::Pending, StepState::Completed, StepState::Failed] {
            assert_eq!(StepState::from_i16(s.as_i16()), Some(s));
        }
    }

    #[test]
    fn terminal_and_retryable_classification() {
        assert!(WorkflowState::Completed.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(!WorkflowState::Running.is_terminal());

        assert!(WorkflowState::Stalled.is_retryable());
        assert!(WorkflowState::Failed.is_retryable());
        assert!(!WorkflowState::Idle.is_retryable());
        assert!(!WorkflowState::Completed.is_retryable());
    }
}
