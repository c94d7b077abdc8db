//! PostgreSQL-backed [`Store`] implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{error, instrument};
use uuid::Uuid;

use super::model::{
    ErrorLogInit, ErrorLogRow, ExecutionLogRow, StepState, StoreError, WorkflowInit, WorkflowRow,
    WorkflowState,
};
use super::{Store, StepUpdate};

/// Connects to Postgres via a shared [`PgPool`]. Clone is cheap (the pool
/// is reference-counted internally).
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Run pending migrations embedded at compile time.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_workflow(row: &sqlx::postgres::PgRow) -> Result<WorkflowRow, StoreError> {
    let state_i16: i16 = row.try_get("state").map_err(|e| StoreError::Database(e.to_string()))?;
    let state = WorkflowState::from_i16(state_i16)
        .ok_or_else(|| StoreError::Database(format!("unknown workflow state {state_i16}")))?;
    Ok(WorkflowRow {
        id: row.try_get("id").map_err(|e| StoreError::Database(e.to_string()))?,
        key: row.try_get("key").map_err(|e| StoreError::Database(e.to_string()))?,
        job_class: row.try_get("job_class").map_err(|e| StoreError::Database(e.to_string()))?,
        kwargs: row.try_get("kwargs").map_err(|e| StoreError::Database(e.to_string()))?,
        options: row.try_get("options").map_err(|e| StoreError::Database(e.to_string()))?,
        context: row.try_get("context").map_err(|e| StoreError::Database(e.to_string()))?,
        state,
        locked_by: row.try_get("locked_by").map_err(|e| StoreError::Database(e.to_string()))?,
        locked_at: row.try_get("locked_at").map_err(|e| StoreError::Database(e.to_string()))?,
        started_at: row.try_get("started_at").map_err(|e| StoreError::Database(e.to_string()))?,
        completed_at: row.try_get("completed_at").map_err(|e| StoreError::Database(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(|e| StoreError::Database(e.to_string()))?,
        updated_at: row.try_get("updated_at").map_err(|e| StoreError::Database(e.to_string()))?,
    })
}

fn row_to_step(row: &sqlx::postgres::PgRow) -> Result<ExecutionLogRow, StoreError> {
    let state_i16: i16 = row.try_get("state").map_err(|e| StoreError::Database(e.to_string()))?;
    let state = StepState::from_i16(state_i16)
        .ok_or_else(|| StoreError::Database(format!("unknown step state {state_i16}")))?;
    Ok(ExecutionLogRow {
        id: row.try_get("id").map_err(|e| StoreError::Database(e.to_string()))?,
        workflow_id: row.try_get("workflow_id").map_err(|e| StoreError::Database(e.to_string()))?,
        step_name: row.try_get("step_name").map_err(|e| StoreError::Database(e.to_string()))?,
        attempts: row.try_get("attempts").map_err(|e| StoreError::Database(e.to_string()))?,
        started_at: row.try_get("started_at").map_err(|e| StoreError::Database(e.to_string()))?,
        last_executed_at: row
            .try_get("last_executed_at")
            .map_err(|e| StoreError::Database(e.to_string()))?,
        completed_at: row.try_get("completed_at").map_err(|e| StoreError::Database(e.to_string()))?,
        metadata: row.try_get("metadata").map_err(|e| StoreError::Database(e.to_string()))?,
        state,
        error_class: row.try_get("error_class").map_err(|e| StoreError::Database(e.to_string()))?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| StoreError::Database(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(|e| StoreError::Database(e.to_string()))?,
        updated_at: row.try_get("updated_at").map_err(|e| StoreError::Database(e.to_string()))?,
    })
}

fn row_to_error_log(row: &sqlx::postgres::PgRow) -> Result<ErrorLogRow, StoreError> {
    Ok(ErrorLogRow {
        id: row.try_get("id").map_err(|e| StoreError::Database(e.to_string()))?,
        workflow_id: row.try_get("workflow_id").map_err(|e| StoreError::Database(e.to_string()))?,
        error_class: row.try_get("error_class").map_err(|e| StoreError::Database(e.to_string()))?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| StoreError::Database(e.to_string()))?,
        backtrace: row.try_get("backtrace").map_err(|e| StoreError::Database(e.to_string()))?,
        context: row.try_get("context").map_err(|e| StoreError::Database(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(|e| StoreError::Database(e.to_string()))?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    #[instrument(skip(self, init))]
    async fn find_or_create_workflow(
        &self,
        job_class: &str,
        key: &str,
        init: WorkflowInit,
    ) -> Result<WorkflowRow, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let existing = sqlx::query("SELECT * FROM workflows WHERE job_class = $1 AND key = $2 FOR UPDATE")
            .bind(job_class)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if let Some(row) = existing {
            tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
            return row_to_workflow(&row);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO workflows (job_class, key, kwargs, options, started_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (job_class, key) DO UPDATE SET job_class = EXCLUDED.job_class
            RETURNING *
            "#,
        )
        .bind(job_class)
        .bind(key)
        .bind(&init.kwargs)
        .bind(&init.options)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            error!(error = %e, job_class, key, "failed to create workflow");
            StoreError::Database(e.to_string())
        })?;

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        row_to_workflow(&row)
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, StoreError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::WorkflowNotFound(id))?;
        row_to_workflow(&row)
    }

    #[instrument(skip(self))]
    async fn acquire_lock(
        &self,
        id: Uuid,
        executor_id: &str,
        max_duration: chrono::Duration,
    ) -> Result<WorkflowRow, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query("SELECT * FROM workflows WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::WorkflowNotFound(id))?;
        let current = row_to_workflow(&row)?;

        if let Some(locked_at) = current.locked_at {
            if locked_at > Utc::now() - max_duration {
                return Err(StoreError::Lock(crate::lock::LockError::ConcurrentExecution));
            }
        }

        let updated = sqlx::query(
            r#"
            UPDATE workflows
            SET locked_by = $2, locked_at = now(), state = $3, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(executor_id)
        .bind(WorkflowState::Running.as_i16())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        row_to_workflow(&updated)
    }

    #[instrument(skip(self))]
    async fn release_lock(
        &self,
        id: Uuid,
        executor_id: &str,
        force: bool,
    ) -> Result<WorkflowRow, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query("SELECT * FROM workflows WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::WorkflowNotFound(id))?;
        let current = row_to_workflow(&row)?;

        if !force && current.locked_by.as_deref() != Some(executor_id) {
            return Err(StoreError::Lock(crate::lock::LockError::LongRunningConcurrentExecution));
        }

        let next_state = if force || matches!(current.state, WorkflowState::Running) {
            WorkflowState::Idle.as_i16()
        } else {
            current.state.as_i16()
        };

        let updated = sqlx::query(
            r#"
            UPDATE workflows
            SET locked_by = NULL, locked_at = NULL, state = $2, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(next_state)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        row_to_workflow(&updated)
    }

    #[instrument(skip(self))]
    async fn set_workflow_state(
        &self,
        id: Uuid,
        state: WorkflowState,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<WorkflowRow, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflows
            SET state = $2, completed_at = COALESCE($3, completed_at), updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(state.as_i16())
        .bind(completed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::WorkflowNotFound(id))?;
        row_to_workflow(&row)
    }

    #[instrument(skip(self, context))]
    async fn save_context(&self, id: Uuid, context: Value) -> Result<(), StoreError> {
        sqlx::query("UPDATE workflows SET context = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(context)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_or_create_step(
        &self,
        workflow_id: Uuid,
        step_name: &str,
    ) -> Result<ExecutionLogRow, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let existing = sqlx::query(
            "SELECT * FROM execution_logs WHERE workflow_id = $1 AND step_name = $2 FOR UPDATE",
        )
        .bind(workflow_id)
        .bind(step_name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if let Some(row) = existing {
            tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
            return row_to_step(&row);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO execution_logs (workflow_id, step_name, started_at)
            VALUES ($1, $2, now())
            ON CONFLICT (workflow_id, step_name) DO UPDATE SET step_name = EXCLUDED.step_name
            RETURNING *
            "#,
        )
        .bind(workflow_id)
        .bind(step_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        row_to_step(&row)
    }

    #[instrument(skip(self))]
    async fn get_step(
        &self,
        workflow_id: Uuid,
        step_name: &str,
    ) -> Result<ExecutionLogRow, StoreError> {
        let row = sqlx::query("SELECT * FROM execution_logs WHERE workflow_id = $1 AND step_name = $2")
            .bind(workflow_id)
            .bind(step_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or_else(|| StoreError::StepNotFound(workflow_id, step_name.to_string()))?;
        row_to_step(&row)
    }

    #[instrument(skip(self, update))]
    async fn update_step(&self, update: StepUpdate) -> Result<ExecutionLogRow, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE execution_logs
            SET
                attempts = attempts + CASE WHEN $3 THEN 1 ELSE 0 END,
                state = COALESCE($4, state),
                started_at = COALESCE($5, started_at),
                last_executed_at = COALESCE($6, last_executed_at),
                completed_at = COALESCE($7, completed_at),
                metadata = COALESCE($8, metadata),
                error_class = COALESCE($9, error_class),
                error_message = COALESCE($10, error_message),
                updated_at = now()
            WHERE workflow_id = $1 AND step_name = $2
            RETURNING *
            "#,
        )
        .bind(update.workflow_id)
        .bind(&update.step_name)
        .bind(update.increment_attempts)
        .bind(update.state.map(|s| s.as_i16()))
        .bind(update.started_at)
        .bind(update.last_executed_at)
        .bind(update.completed_at)
        .bind(&update.metadata)
        .bind(&update.error_class)
        .bind(&update.error_message)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or_else(|| StoreError::StepNotFound(update.workflow_id, update.step_name.clone()))?;
        row_to_step(&row)
    }

    #[instrument(skip(self, init))]
    async fn insert_error_log(&self, init: ErrorLogInit) -> Result<ErrorLogRow, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO error_logs (workflow_id, error_class, error_message, backtrace, context)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(init.workflow_id)
        .bind(&init.error_class)
        .bind(&init.error_message)
        .bind(&init.backtrace)
        .bind(&init.context)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        row_to_error_log(&row)
    }

    #[instrument(skip(self))]
    async fn list_error_logs(&self, workflow_id: Uuid) -> Result<Vec<ErrorLogRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM error_logs WHERE workflow_id = $1 ORDER BY created_at ASC")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_error_log).collect()
    }

    #[instrument(skip(self))]
    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<ExecutionLogRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM execution_logs WHERE workflow_id = $1 ORDER BY created_at ASC")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_step).collect()
    }
}

// Integration tests require a live Postgres instance; see
// tests/postgres_integration_test.rs, run with DATABASE_URL set.
