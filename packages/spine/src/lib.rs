//! LedgerGate: Operation Registry & Dispatcher
//!
//! The spine routes validated requests to handlers and owns the transaction
//! boundary: the dispatcher begins the scope, the handler runs, and only the
//! dispatcher commits or rolls back. Handlers never throw across the
//! boundary; every outcome is an [`OperationResult`].
//!
//! Structural rules:
//! - Only the dispatcher calls `commit` / `rollback`
//! - Handlers reach engines through the state injected into their call frame
//! - Drivers never import spine types

pub mod dispatcher;
pub mod handlers;
pub mod params;
pub mod registry;
pub mod state;
pub mod types;

pub use dispatcher::Dispatcher;
pub use registry::{OperationHandler, OperationRegistry};
pub use state::AppState;
pub use types::{codes, Layer, OperationContext, OperationRequest, OperationResult};
