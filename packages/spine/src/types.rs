//! Dispatch plane types.

use ledgergate_store::StoreScope;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// Wire-level error codes. The result `code` is the single machine-readable
/// classification; `message` is human-readable and scrubbed of secrets.
pub mod codes {
    pub const UNKNOWN_OPERATION: &str = "UNKNOWN_OPERATION";
    pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";
    pub const MISSING_PARAM: &str = "MISSING_PARAM";
    pub const SESSION_REQUIRED: &str = "SESSION_REQUIRED";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const ALREADY_RESOLVED: &str = "ALREADY_RESOLVED";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const BUDGET_EXCEEDED: &str = "BUDGET_EXCEEDED";
    pub const INTEGRATION_DISABLED: &str = "INTEGRATION_DISABLED";
    pub const CREDENTIALS_INVALID: &str = "CREDENTIALS_INVALID";
    pub const KILL_SWITCH_ACTIVE: &str = "KILL_SWITCH_ACTIVE";
    pub const CONFLICT: &str = "CONFLICT";
    pub const SERVICE_ERROR: &str = "SERVICE_ERROR";
}

/// Fixed layer alphabet a handler may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Orchestrator,
    Engine,
    Driver,
    Model,
}

/// A validated request as delivered by the transport surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub operation_name: String,
    pub tenant_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub session_handle: Option<String>,
}

/// The single return shape crossing the dispatch boundary. Never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OperationResult {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            code: None,
            message: None,
        }
    }

    pub fn fail(code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            code: Some(code.to_string()),
            message: Some(message.into()),
        }
    }
}

/// Everything a handler may touch during one request. The scope is the
/// dispatcher's; handlers stage writes but never commit.
pub struct OperationContext<'a> {
    pub tenant_id: String,
    pub params: serde_json::Value,
    pub scope: &'a mut StoreScope,
    pub state: &'a AppState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_shapes() {
        let ok = OperationResult::ok(serde_json::json!({ "n": 1 }));
        assert!(ok.ok);
        assert!(ok.code.is_none());

        let fail = OperationResult::fail(codes::NOT_FOUND, "no such incident");
        assert!(!fail.ok);
        assert!(fail.data.is_none());
        assert_eq!(fail.code.as_deref(), Some("NOT_FOUND"));
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: OperationRequest = serde_json::from_str(
            r#"{ "operation_name": "controls.query", "tenant_id": "t-1" }"#,
        )
        .unwrap();
        assert!(request.session_handle.is_none());
        assert!(request.params.is_null());
    }
}
