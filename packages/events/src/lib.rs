//! LedgerGate: Audit / Event Emitter
//!
//! Every coordination decision, incident lifecycle step, quota block, and
//! maintenance outcome becomes a structured event. Events are validated
//! against the schema contract before emission; emission is log-structured
//! plus an outbox row for downstream delivery. Shipment itself is external.

use chrono::{DateTime, Utc};
use ledgergate_store::{OutboxRow, OutboxStatus, StoreError, StoreScope};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current event schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Malformed events are rejected before emission.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EventError {
    #[error("event field {0} must be non-empty")]
    EmptyField(&'static str),

    #[error("schema_version must be at least 1, got {0}")]
    InvalidSchemaVersion(u32),

    #[error("event_type must be a dotted lowercase identifier, got {0}")]
    InvalidEventType(String),
}

/// The validated event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub event_id: String,
    pub event_type: String,
    pub tenant_id: String,
    /// Who acted: `human`, `system`, or `worker`.
    pub actor_type: String,
    /// Which component owned the decision being reported.
    pub decision_owner: String,
    pub schema_version: u32,
    pub timestamp: DateTime<Utc>,
    pub context: serde_json::Value,
}

impl EventPayload {
    pub fn new(
        event_type: impl Into<String>,
        tenant_id: impl Into<String>,
        decision_owner: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            tenant_id: tenant_id.into(),
            actor_type: "system".to_string(),
            decision_owner: decision_owner.into(),
            schema_version: SCHEMA_VERSION,
            timestamp: Utc::now(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_actor(mut self, actor_type: impl Into<String>) -> Self {
        self.actor_type = actor_type.into();
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// Enforce the schema contract.
pub fn validate_event_payload(event: &EventPayload) -> Result<(), EventError> {
    if event.event_id.trim().is_empty() {
        return Err(EventError::EmptyField("event_id"));
    }
    if event.event_type.trim().is_empty() {
        return Err(EventError::EmptyField("event_type"));
    }
    if event.tenant_id.trim().is_empty() {
        return Err(EventError::EmptyField("tenant_id"));
    }
    if event.actor_type.trim().is_empty() {
        return Err(EventError::EmptyField("actor_type"));
    }
    if event.decision_owner.trim().is_empty() {
        return Err(EventError::EmptyField("decision_owner"));
    }
    if event.schema_version < 1 {
        return Err(EventError::InvalidSchemaVersion(event.schema_version));
    }
    let well_formed = event
        .event_type
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_');
    if !well_formed {
        return Err(EventError::InvalidEventType(event.event_type.clone()));
    }
    Ok(())
}

/// Validated structured event emission.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventEmitter;

impl EventEmitter {
    pub fn new() -> Self {
        Self
    }

    /// Validate, log, and enqueue the event for downstream delivery.
    pub async fn emit(
        &self,
        scope: &mut StoreScope,
        event: EventPayload,
    ) -> Result<(), EmitError> {
        validate_event_payload(&event)?;

        tracing::info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            tenant_id = %event.tenant_id,
            actor_type = %event.actor_type,
            decision_owner = %event.decision_owner,
            "event emitted"
        );

        let payload = serde_json::to_value(&event).map_err(|err| {
            EmitError::Store(StoreError::permanent(format!("event serialization: {err}")))
        })?;
        scope
            .enqueue_outbox(OutboxRow {
                id: event.event_id.clone(),
                tenant_id: event.tenant_id.clone(),
                event_type: event.event_type.clone(),
                payload,
                status: OutboxStatus::Pending,
                attempts: 0,
                enqueued_at: Utc::now(),
                delivered_at: None,
            })
            .await?;
        Ok(())
    }
}

/// Emission failures: malformed payloads or store trouble.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error(transparent)]
    Invalid(#[from] EventError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
