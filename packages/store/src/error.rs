//! Storage failure classification.
//!
//! Callers retry `Transient` failures; everything else surfaces as an
//! operation error.

/// Storage adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transient store failure: {reason}")]
    Transient { reason: String },

    #[error("permanent store failure: {reason}")]
    Permanent { reason: String },

    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("{entity} not found")]
    NotFound { entity: String },

    #[error("scope already finished ({state})")]
    ScopeFinished { state: String },
}

impl StoreError {
    /// Whether the caller may retry the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        StoreError::Transient {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        StoreError::Permanent {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::transient("timeout").is_transient());
        assert!(!StoreError::permanent("bad row").is_transient());
        assert!(!StoreError::UniqueViolation {
            constraint: "usage_records(tenant_id, call_id)".to_string(),
        }
        .is_transient());
    }
}
