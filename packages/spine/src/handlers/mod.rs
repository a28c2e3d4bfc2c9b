//! Operation handlers.
//!
//! Handlers translate typed internal errors to wire codes and never commit;
//! the dispatcher owns the scope. Operations that sub-dispatch do so on
//! `params.method` with unknown methods returning `UNKNOWN_METHOD`.

pub mod activity;
pub mod analytics;
pub mod controls;
pub mod enforcement;
pub mod incidents;
pub mod integrations;

use ledgergate_store::StoreError;

use crate::params::ParamError;
use crate::registry::OperationRegistry;
use crate::types::{codes, OperationResult};

/// Register every built-in operation.
pub fn register_all(registry: &mut OperationRegistry) {
    registry.register(std::sync::Arc::new(activity::ActivityIngestHandler));
    registry.register(std::sync::Arc::new(activity::ActivityQueryHandler));
    registry.register(std::sync::Arc::new(analytics::AnalyticsSnapshotHandler));
    registry.register(std::sync::Arc::new(analytics::AnalyticsQueryHandler));
    registry.register(std::sync::Arc::new(controls::ControlsQueryHandler));
    registry.register(std::sync::Arc::new(controls::KillswitchReadHandler));
    registry.register(std::sync::Arc::new(controls::KillswitchWriteHandler));
    registry.register(std::sync::Arc::new(controls::EnvelopeWriteHandler));
    registry.register(std::sync::Arc::new(enforcement::EnforcementCheckHandler));
    registry.register(std::sync::Arc::new(incidents::IncidentsWriteHandler));
    registry.register(std::sync::Arc::new(incidents::IncidentsQueryHandler));
    registry.register(std::sync::Arc::new(integrations::IntegrationsWriteHandler));
    registry.register(std::sync::Arc::new(integrations::IntegrationsQueryHandler));
}

/// Map parameter failures onto wire codes.
pub(crate) fn param_fail(err: ParamError) -> OperationResult {
    match err {
        ParamError::Missing(_) => OperationResult::fail(codes::MISSING_PARAM, err.to_string()),
        ParamError::WrongType(..) => {
            OperationResult::fail(codes::VALIDATION_ERROR, err.to_string())
        }
    }
}

/// Map store failures onto wire codes. Transient or permanent, the request
/// fails and the dispatcher rolls back.
pub(crate) fn store_fail(err: StoreError) -> OperationResult {
    tracing::error!(error = %err, transient = err.is_transient(), "store failure in handler");
    OperationResult::fail(codes::SERVICE_ERROR, "Storage failure")
}

/// Unknown inner method on a sub-dispatching operation.
pub(crate) fn unknown_method(operation: &str, method: &str) -> OperationResult {
    OperationResult::fail(
        codes::UNKNOWN_METHOD,
        format!("Unknown {operation} method: {method}"),
    )
}
