//! Type-erased workflow dispatch: maps a `job_class` string to a factory
//! that builds the concrete workflow from JSON input.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::steps::{StepContext, StepError};
use crate::workflow::Workflow;

/// Object-safe counterpart of [`Workflow`]: everything is JSON in, JSON
/// out, so the executor can hold a registry of many workflow types without
/// knowing their concrete `Input`/`Output` types.
#[async_trait]
pub trait AnyWorkflow: Send + Sync {
    fn workflow_type(&self) -> &'static str;

    async fn run(&self, steps: &mut StepContext) -> Result<Value, StepError>;
}

struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

#[async_trait]
impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    async fn run(&self, steps: &mut StepContext) -> Result<Value, StepError> {
        let output = self.inner.run(steps).await?;
        serde_json::to_value(output).map_err(|e| StepError::User(e.into()))
    }
}

pub type WorkflowFactory =
    Box<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

#[derive(Default)]
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: Workflow>(&mut self) {
        let factory: WorkflowFactory = Box::new(|input: Value| {
            let typed_input: W::Input = serde_json::from_value(input)?;
            let workflow = W::new(typed_input);
            Ok(Box::new(WorkflowWrapper { inner: workflow }) as Box<dyn AnyWorkflow>)
        });
        self.factories.insert(W::TYPE.to_string(), factory);
    }

    pub fn contains(&self, job_class: &str) -> bool {
        self.factories.contains_key(job_class)
    }

    pub fn create(&self, job_class: &str, input: Value) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self
            .factories
            .get(job_class)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(job_class.to_string()))?;
        factory(input).map_err(RegistryError::Deserialization)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn job_classes(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("job_classes", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("failed to deserialize workflow input: {0}")]
    Deserialization(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct GreetInput {
        name: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct GreetOutput {
        greeting: String,
    }

    struct GreetWorkflow {
        input: GreetInput,
    }

    #[async_trait]
    impl Workflow for GreetWorkflow {
        const TYPE: &'static str = "greet_workflow";
        type Input = GreetInput;
        type Output = GreetOutput;

        fn new(input: Self::Input) -> Self {
            Self { input }
        }

        async fn run(&self, _steps: &mut StepContext) -> Result<Self::Output, StepError> {
            Ok(GreetOutput {
                greeting: format!("hello, {}", self.input.name),
            })
        }
    }

    #[test]
    fn register_and_create() {
        let mut registry = WorkflowRegistry::new();
        registry.register::<GreetWorkflow>();

        assert!(registry.contains("greet_workflow"));
        assert!(!registry.contains("unknown"));

        let workflow = registry
            .create("greet_workflow", serde_json::json!({ "name": "Ada" }))
            .unwrap();
        assert_eq!(workflow.workflow_type(), "greet_workflow");
    }

    #[test]
    fn unknown_workflow_type_errors() {
        let registry = WorkflowRegistry::new();
        let result = registry.create("unknown", serde_json::json!({}));
        assert!(matches!(result, Err(RegistryError::UnknownWorkflowType(_))));
    }

    #[test]
    fn invalid_input_errors() {
        let mut registry = WorkflowRegistry::new();
        registry.register::<GreetWorkflow>();
        let result = registry.create("greet_workflow", serde_json::json!({}));
        assert!(matches!(result, Err(RegistryError::Deserialization(_))));
    }

    #[test]
    fn debug_impl_lists_job_classes() {
        let mut registry = WorkflowRegistry::new();
        registry.register::<GreetWorkflow>();
        let debug_str = format!("{:?}", registry);
        assert!(debug_str.contains("greet_workflow"));
    }
}
