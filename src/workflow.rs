//! The `Workflow` trait: the shape a durable workflow body takes.
//!
//! A workflow body is plain, synchronous-in-spirit code: every time the
//! executor enters it, `run` starts again from the top. Idempotence across
//! entries comes entirely from the step primitives on [`StepContext`]
//! short-circuiting already-completed steps — `run` itself holds no state
//! of its own beyond what was passed into `new`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::steps::{StepContext, StepError};

/// A workflow-body-raised error, distinct from the step-level
/// `ExecutionFailed` produced when a primitive exhausts its own retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    pub message: String,
    pub code: Option<String>,
    pub retryable: bool,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// A durable workflow body. `TYPE` is the `job_class` string the executor
/// dispatches on.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send + Clone;
    type Output: Serialize + DeserializeOwned + Send;

    fn new(input: Self::Input) -> Self;

    /// Run the body from the top. Step primitives called through `steps`
    /// short-circuit work already marked completed in a prior entry.
    async fn run(&self, steps: &mut StepContext) -> Result<Self::Output, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_error_display_uses_message() {
        let err = WorkflowError::new("boom");
        assert_eq!(err.to_string(), "boom");
        assert!(err.retryable);
    }

    #[test]
    fn non_retryable_constructor_sets_flag() {
        let err = WorkflowError::non_retryable("fatal").with_code("FATAL");
        assert!(!err.retryable);
        assert_eq!(err.code.as_deref(), Some("FATAL"));
    }
}
