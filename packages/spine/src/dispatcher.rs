//! The layered dispatcher.
//!
//! One scope per request: the dispatcher begins it, the handler stages
//! writes into it, and the dispatcher alone commits on success or rolls
//! back on failure. Handlers cannot reach `commit`.

use std::sync::Arc;
use std::time::Duration;

use crate::registry::OperationRegistry;
use crate::state::AppState;
use crate::types::{codes, OperationContext, OperationRequest, OperationResult};

/// Root deadline applied to every request.
const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// Transport-agnostic request dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<AppState>,
    registry: Arc<OperationRegistry>,
    request_deadline: Duration,
}

impl Dispatcher {
    pub fn new(state: Arc<AppState>, registry: Arc<OperationRegistry>) -> Self {
        Self {
            state,
            registry,
            request_deadline: DEFAULT_REQUEST_DEADLINE,
        }
    }

    pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = deadline;
        self
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Dispatch one request start to finish.
    pub async fn dispatch(&self, request: OperationRequest) -> OperationResult {
        let Some(handler) = self.registry.get(&request.operation_name) else {
            return OperationResult::fail(
                codes::UNKNOWN_OPERATION,
                format!("Unknown operation: {}", request.operation_name),
            );
        };

        if handler.requires_session() && request.session_handle.is_none() {
            return OperationResult::fail(
                codes::SESSION_REQUIRED,
                format!("Operation {} requires a session", request.operation_name),
            );
        }

        let mut scope = self.state.store.begin().await;
        let mut ctx = OperationContext {
            tenant_id: request.tenant_id.clone(),
            params: request.params,
            scope: &mut scope,
            state: &self.state,
        };

        // Cancellation unwinds through the scope: a deadline hit rolls the
        // request back like any other failure.
        let result = match tokio::time::timeout(self.request_deadline, handler.execute(&mut ctx))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    operation = %request.operation_name,
                    tenant_id = %request.tenant_id,
                    deadline_ms = self.request_deadline.as_millis() as u64,
                    "request deadline exceeded"
                );
                OperationResult::fail(codes::SERVICE_ERROR, "Request deadline exceeded")
            }
        };

        if result.ok {
            if let Err(err) = scope.commit().await {
                tracing::error!(
                    operation = %request.operation_name,
                    tenant_id = %request.tenant_id,
                    error = %err,
                    "commit failed, rolling back"
                );
                let _ = scope.rollback().await;
                return OperationResult::fail(codes::SERVICE_ERROR, "Commit failed");
            }
        } else {
            if let Err(err) = scope.rollback().await {
                tracing::error!(
                    operation = %request.operation_name,
                    error = %err,
                    "rollback failed"
                );
            }
            tracing::debug!(
                operation = %request.operation_name,
                tenant_id = %request.tenant_id,
                code = result.code.as_deref().unwrap_or("-"),
                "operation failed, scope rolled back"
            );
        }

        result
    }
}
