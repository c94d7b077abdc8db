//! In-memory [`Store`] used as the default test double.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::model::{
    ErrorLogInit, ErrorLogRow, ExecutionLogRow, StepState, StoreError, WorkflowInit, WorkflowRow,
    WorkflowState,
};
use super::{Store, StepUpdate};

#[derive(Default)]
pub struct InMemoryStore {
    workflows: RwLock<HashMap<Uuid, WorkflowRow>>,
    workflows_by_key: RwLock<HashMap<(String, String), Uuid>>,
    steps: RwLock<HashMap<Uuid, HashMap<String, ExecutionLogRow>>>,
    errors: RwLock<HashMap<Uuid, Vec<ErrorLogRow>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: number of workflow rows currently stored.
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// Test helper: directly seed a workflow row, bypassing find-or-create.
    /// Useful for simulating an externally-held stale/foreign lock.
    pub fn seed_workflow(&self, row: WorkflowRow) {
        self.workflows_by_key
            .write()
            .insert((row.job_class.clone(), row.key.clone()), row.id);
        self.workflows.write().insert(row.id, row);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn find_or_create_workflow(
        &self,
        job_class: &str,
        key: &str,
        init: WorkflowInit,
    ) -> Result<WorkflowRow, StoreError> {
        let map_key = (job_class.to_string(), key.to_string());
        if let Some(id) = self.workflows_by_key.read().get(&map_key).copied() {
            return self.get_workflow(id).await;
        }

        let mut by_key = self.workflows_by_key.write();
        let mut workflows = self.workflows.write();
        if let Some(id) = by_key.get(&map_key).copied() {
            return Ok(workflows.get(&id).cloned().expect("indexed row must exist"));
        }

        let now = Utc::now();
        let row = WorkflowRow {
            id: Uuid::now_v7(),
            key: key.to_string(),
            job_class: job_class.to_string(),
            kwargs: init.kwargs,
            options: init.options,
            context: Value::Object(Default::default()),
            state: WorkflowState::Idle,
            locked_by: None,
            locked_at: None,
            started_at: Some(now),
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        by_key.insert(map_key, row.id);
        workflows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, StoreError> {
        self.workflows
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    async fn acquire_lock(
        &self,
        id: Uuid,
        executor_id: &str,
        max_duration: chrono::Duration,
    ) -> Result<WorkflowRow, StoreError> {
        let mut workflows = self.workflows.write();
        let row = workflows.get_mut(&id).ok_or(StoreError::WorkflowNotFound(id))?;

        if let Some(locked_at) = row.locked_at {
            if locked_at > Utc::now() - max_duration {
                return Err(StoreError::Lock(crate::lock::LockError::ConcurrentExecution));
            }
        }

        let now = Utc::now();
        row.locked_by = Some(executor_id.to_string());
        row.locked_at = Some(now);
        row.state = WorkflowState::Running;
        row.updated_at = now;
        Ok(row.clone())
    }

    async fn release_lock(
        &self,
        id: Uuid,
        executor_id: &str,
        force: bool,
    ) -> Result<WorkflowRow, StoreError> {
        let mut workflows = self.workflows.write();
        let row = workflows.get_mut(&id).ok_or(StoreError::WorkflowNotFound(id))?;

        if !force && row.locked_by.as_deref() != Some(executor_id) {
            return Err(StoreError::Lock(crate::lock::LockError::LongRunningConcurrentExecution));
        }

        row.locked_by = None;
        row.locked_at = None;
        if force || matches!(row.state, WorkflowState::Running) {
            row.state = WorkflowState::Idle;
        }
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn set_workflow_state(
        &self,
        id: Uuid,
        state: WorkflowState,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<WorkflowRow, StoreError> {
        let mut workflows = self.workflows.write();
        let row = workflows.get_mut(&id).ok_or(StoreError::WorkflowNotFound(id))?;
        row.state = state;
        if completed_at.is_some() {
            row.completed_at = completed_at;
        }
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn save_context(&self, id: Uuid, context: Value) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let row = workflows.get_mut(&id).ok_or(StoreError::WorkflowNotFound(id))?;
        row.context = context;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn find_or_create_step(
        &self,
        workflow_id: Uuid,
        step_name: &str,
    ) -> Result<ExecutionLogRow, StoreError> {
        let mut steps = self.steps.write();
        let per_workflow = steps.entry(workflow_id).or_default();
        if let Some(row) = per_workflow.get(step_name) {
            return Ok(row.clone());
        }
        let now = Utc::now();
        let row = ExecutionLogRow {
            id: Uuid::now_v7(),
            workflow_id,
            step_name: step_name.to_string(),
            attempts: 0,
            started_at: Some(now),
            last_executed_at: None,
            completed_at: None,
            metadata: None,
            state: StepState::Pending,
            error_class: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        per_workflow.insert(step_name.to_string(), row.clone());
        Ok(row)
    }

    async fn get_step(
        &self,
        workflow_id: Uuid,
        step_name: &str,
    ) -> Result<ExecutionLogRow, StoreError> {
        self.steps
            .read()
            .get(&workflow_id)
            .and_then(|m| m.get(step_name))
            .cloned()
            .ok_or_else(|| StoreError::StepNotFound(workflow_id, step_name.to_string()))
    }

    async fn update_step(&self, update: StepUpdate) -> Result<ExecutionLogRow, StoreError> {
        let mut steps = self.steps.write();
        let row = steps
            .get_mut(&update.workflow_id)
            .and_then(|m| m.get_mut(&update.step_name))
            .ok_or_else(|| StoreError::StepNotFound(update.workflow_id, update.step_name.clone()))?;

        if update.increment_attempts {
            row.attempts += 1;
        }
        if let Some(state) = update.state {
            row.state = state;
        }
        if update.started_at.is_some() {
            row.started_at = update.started_at;
        }
        if update.last_executed_at.is_some() {
            row.last_executed_at = update.last_executed_at;
        }
        if update.completed_at.is_some() {
            row.completed_at = update.completed_at;
        }
        if update.metadata.is_some() {
            row.metadata = update.metadata;
        }
        if update.error_class.is_some() {
            row.error_class = update.error_class;
        }
        if update.error_message.is_some() {
            row.error_message = update.error_message;
        }
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn insert_error_log(&self, init: ErrorLogInit) -> Result<ErrorLogRow, StoreError> {
        let row = ErrorLogRow {
            id: Uuid::now_v7(),
            workflow_id: init.workflow_id,
            error_class: init.error_class,
            error_message: init.error_message,
            backtrace: init.backtrace,
            context: init.context,
            created_at: Utc::now(),
        };
        self.errors
            .write()
            .entry(init.workflow_id)
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn list_error_logs(&self, workflow_id: Uuid) -> Result<Vec<ErrorLogRow>, StoreError> {
        Ok(self.errors.read().get(&workflow_id).cloned().unwrap_or_default())
    }

    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<ExecutionLogRow>, StoreError> {
        Ok(self
            .steps
            .read()
            .get(&workflow_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() -> WorkflowInit {
        WorkflowInit {
            kwargs: serde_json::json!({}),
            options: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn find_or_create_is_idempotent_on_key() {
        let store = InMemoryStore::new();
        let a = store.find_or_create_workflow("demo", "k1", init()).await.unwrap();
        let b = store.find_or_create_workflow("demo", "k1", init()).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.workflow_count(), 1);
    }

    #[tokio::test]
    async fn acquire_then_release_returns_to_idle() {
        let store = InMemoryStore::new();
        let wf = store.find_or_create_workflow("demo", "k1", init()).await.unwrap();

        let locked = store
            .acquire_lock(wf.id, "exec-a", chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(locked.state, WorkflowState::Running);
        assert_eq!(locked.locked_by.as_deref(), Some("exec-a"));

        let released = store.release_lock(wf.id, "exec-a", false).await.unwrap();
        assert_eq!(released.state, WorkflowState::Idle);
        assert!(released.locked_by.is_none());
    }

    #[tokio::test]
    async fn acquire_rejects_fresh_foreign_lock() {
        let store = InMemoryStore::new();
        let wf = store.find_or_create_workflow("demo", "k1", init()).await.unwrap();
        store
            .acquire_lock(wf.id, "exec-a", chrono::Duration::minutes(10))
            .await
            .unwrap();

        let result = store
            .acquire_lock(wf.id, "exec-b", chrono::Duration::minutes(10))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn acquire_accepts_stale_foreign_lock() {
        let store = InMemoryStore::new();
        let mut wf = store.find_or_create_workflow("demo", "k1", init()).await.unwrap();
        wf.locked_by = Some("ghost".to_string());
        wf.locked_at = Some(Utc::now() - chrono::Duration::minutes(20));
        wf.state = WorkflowState::Running;
        store.seed_workflow(wf.clone());

        let locked = store
            .acquire_lock(wf.id, "exec-b", chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(locked.locked_by.as_deref(), Some("exec-b"));
    }

    #[tokio::test]
    async fn release_rejects_non_owner_without_force() {
        let store = InMemoryStore::new();
        let wf = store.find_or_create_workflow("demo", "k1", init()).await.unwrap();
        store
            .acquire_lock(wf.id, "exec-a", chrono::Duration::minutes(10))
            .await
            .unwrap();

        let result = store.release_lock(wf.id, "exec-b", false).await;
        assert!(result.is_err());

        let forced = store.release_lock(wf.id, "exec-b", true).await.unwrap();
        assert!(forced.locked_by.is_none());
    }

    #[tokio::test]
    async fn step_find_or_create_and_update() {
        let store = InMemoryStore::new();
        let wf = store.find_or_create_workflow("demo", "k1", init()).await.unwrap();
        let step = store.find_or_create_step(wf.id, "durably_execute$send").await.unwrap();
        assert_eq!(step.attempts, 0);

        let updated = store
            .update_step(
                StepUpdate::new(wf.id, "durably_execute$send")
                    .increment_attempts()
                    .with_state(StepState::Completed)
                    .with_completed_now(),
            )
            .await
            .unwrap();
        assert_eq!(updated.attempts, 1);
        assert!(updated.is_completed());

        let again = store.find_or_create_step(wf.id, "durably_execute$send").await.unwrap();
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn error_logs_accumulate_per_workflow() {
        let store = InMemoryStore::new();
        let wf = store.find_or_create_workflow("demo", "k1", init()).await.unwrap();
        store
            .insert_error_log(ErrorLogInit {
                workflow_id: wf.id,
                error_class: Some("Boom".into()),
                error_message: Some("kaboom".into()),
                backtrace: None,
                context: None,
            })
            .await
            .unwrap();

        let logs = store.list_error_logs(wf.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].error_class.as_deref(), Some("Boom"));
    }
}
