//! A durable workflow executor.
//!
//! Workflow bodies are plain async code that is re-entered from the top on
//! every attempt. Idempotence across entries comes from the step
//! primitives on [`StepContext`] (`durably_execute`, `wait`, `wait_until`,
//! `continue_if`, `durably_repeat`), each of which consults its own row in
//! the execution log to decide whether to run, reschedule itself, or fail.
//!
//! ```text
//! JobSystem --perform(key, attempt)--> WorkflowExecutor --lock--> Workflow::run
//!                                            |                        |
//!                                            +--- Store (Postgres) <--+
//! ```
//!
//! ```ignore
//! use durably::prelude::*;
//!
//! struct SendWelcomeEmail { input: SendWelcomeEmailInput }
//!
//! #[async_trait::async_trait]
//! impl Workflow for SendWelcomeEmail {
//!     const TYPE: &'static str = "send_welcome_email";
//!     type Input = SendWelcomeEmailInput;
//!     type Output = ();
//!
//!     fn new(input: Self::Input) -> Self { Self { input } }
//!
//!     async fn run(&self, steps: &mut StepContext) -> Result<(), StepError> {
//!         steps.durably_execute("send", 3, || async {
//!             send_email(&self.input.address).await
//!         }).await
//!     }
//! }
//! ```

pub mod context;
pub mod executor;
pub mod job;
pub mod lock;
pub mod registry;
pub mod retry;
pub mod steps;
pub mod store;
pub mod tracker;
pub mod workflow;

pub use context::{Context, ContextError};
pub use executor::{ExecutorConfig, ExecutorError, PerformOutcome, WorkflowExecutor};
pub use job::{JobRequest, JobSystem, RecordingJobSystem};
pub use lock::LockError;
pub use registry::{AnyWorkflow, RegistryError, WorkflowRegistry};
pub use retry::RetryPolicy;
pub use steps::{OnError, StepContext, StepError};
pub use store::{InMemoryStore, PostgresStore, Store, StoreError};
pub use tracker::ExecutionTracker;
pub use workflow::{Workflow, WorkflowError};

pub mod prelude {
    pub use crate::context::Context;
    pub use crate::executor::{ExecutorConfig, PerformOutcome, WorkflowExecutor};
    pub use crate::job::{JobRequest, JobSystem};
    pub use crate::registry::WorkflowRegistry;
    pub use crate::retry::RetryPolicy;
    pub use crate::steps::{OnError, StepContext, StepError};
    pub use crate::store::{InMemoryStore, Store};
    pub use crate::workflow::{Workflow, WorkflowError};
    pub use async_trait::async_trait;
}
