//! Records observed exceptions against a workflow, without ever itself
//! becoming a source of failure for the caller.

use std::sync::Arc;

use tracing::error;
use uuid::Uuid;

use crate::context::Context;
use crate::store::{ErrorLogInit, ErrorLogRow, Store};

/// Thin wrapper around `Store::insert_error_log` that never propagates its
/// own failures: losing an error log is preferable to turning a recoverable
/// workflow failure into an unrecoverable tracker failure.
pub struct ExecutionTracker {
    store: Arc<dyn Store>,
}

impl ExecutionTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn track(
        &self,
        workflow_id: Uuid,
        error_class: impl Into<String>,
        error_message: impl Into<String>,
        context: &Context,
    ) -> Option<ErrorLogRow> {
        let init = ErrorLogInit {
            workflow_id,
            error_class: Some(error_class.into()),
            error_message: Some(error_message.into()),
            backtrace: None,
            context: Some(context.to_value()),
        };

        match self.store.insert_error_log(init).await {
            Ok(row) => Some(row),
            Err(e) => {
                error!(workflow_id = %workflow_id, error = %e, "failed to record error log");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, WorkflowInit};

    #[tokio::test]
    async fn track_inserts_a_row() {
        let store = Arc::new(InMemoryStore::new());
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

        let tracker = ExecutionTracker::new(store.clone());
        let ctx = Context::new();
        let row = tracker.track(wf.id, "Boom", "kaboom", &ctx).await.unwrap();
        assert_eq!(row.error_class.as_deref(), Some("Boom"));

        let logs = store.list_error_logs(wf.id).await.unwrap();
        assert_eq!(logs.len(), 1);
    }
}
