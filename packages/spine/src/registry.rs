//! Operation registry.
//!
//! A process-wide mapping `operation_name → handler`, populated at boot.
//! Each handler declares the layer it runs at and whether it needs a
//! session.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{Layer, OperationContext, OperationResult};

/// One dispatchable operation.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Hierarchical dotted operation name, e.g. `controls.query`.
    fn name(&self) -> &'static str;

    /// The layer this handler runs at.
    fn layer(&self) -> Layer {
        Layer::Orchestrator
    }

    /// Whether the request must carry a session handle.
    fn requires_session(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &mut OperationContext<'_>) -> OperationResult;
}

/// Name → handler mapping. Populated once at boot; read-only afterwards.
#[derive(Default)]
pub struct OperationRegistry {
    handlers: HashMap<&'static str, Arc<dyn OperationHandler>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn OperationHandler>) {
        let name = handler.name();
        if self.handlers.insert(name, handler).is_some() {
            tracing::warn!(operation = %name, "operation handler re-registered");
        } else {
            tracing::debug!(operation = %name, "operation handler registered");
        }
    }

    pub fn get(&self, operation_name: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(operation_name).cloned()
    }

    pub fn operation_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
