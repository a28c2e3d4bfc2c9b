//! Windowed incident aggregation.

use chrono::{DateTime, Duration, TimeZone, Utc};
use ledgergate_store::{
    IncidentEventRow, IncidentRow, IncidentSeverity, IncidentStatus, StoreError, StoreScope,
};
use uuid::Uuid;

use crate::severity::{generate_incident_title, IncidentSeverityEngine};

/// Aggregation and rate-limit configuration.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub aggregation_window_seconds: i64,
    pub max_incidents_per_tenant_per_hour: usize,
    /// A key whose incident resolved this recently is reopened instead of
    /// spawning a fresh incident.
    pub incident_cooldown_seconds: i64,
    pub auto_resolve_after_seconds: i64,
    pub max_related_call_ids: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            aggregation_window_seconds: 300,
            max_incidents_per_tenant_per_hour: 20,
            incident_cooldown_seconds: 60,
            auto_resolve_after_seconds: 900,
            max_related_call_ids: 1_000,
        }
    }
}

/// One failing call presented to the aggregator.
#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub tenant_id: String,
    pub trigger_type: String,
    pub trigger_value: String,
    pub call_id: String,
    pub cost_delta_cents: i64,
    pub occurred_at: DateTime<Utc>,
}

/// What the aggregator did with a failure event.
#[derive(Debug, Clone)]
pub enum IncidentOutcome {
    Created { incident: IncidentRow },
    Merged {
        incident: IncidentRow,
        escalated_to: Option<IncidentSeverity>,
    },
    Reopened { incident: IncidentRow },
    Overflow { incident: IncidentRow },
}

impl IncidentOutcome {
    pub fn incident(&self) -> &IncidentRow {
        match self {
            IncidentOutcome::Created { incident }
            | IncidentOutcome::Merged { incident, .. }
            | IncidentOutcome::Reopened { incident }
            | IncidentOutcome::Overflow { incident } => incident,
        }
    }
}

/// Groups failures into incidents under a window key.
#[derive(Debug, Clone, Default)]
pub struct IncidentAggregator {
    config: AggregatorConfig,
    severity: IncidentSeverityEngine,
}

impl IncidentAggregator {
    pub fn new(config: AggregatorConfig, severity: IncidentSeverityEngine) -> Self {
        Self { config, severity }
    }

    /// Bucket an event time to its aggregation window start.
    pub fn window_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let window = self.config.aggregation_window_seconds;
        let bucket = at.timestamp().div_euclid(window) * window;
        Utc.timestamp_opt(bucket, 0).single().unwrap_or(at)
    }

    /// Process one failure event: merge into the window's open incident,
    /// reopen a just-resolved one, create a new one, or route into the
    /// tenant-hour overflow incident.
    pub async fn record_failure(
        &self,
        scope: &mut StoreScope,
        event: FailureEvent,
    ) -> Result<IncidentOutcome, StoreError> {
        let window_start = self.window_start(event.occurred_at);

        if let Some(open) = scope
            .find_open_incident(&event.tenant_id, &event.trigger_type, window_start)
            .await?
        {
            return self.merge_into(scope, open, &event).await;
        }

        // A key whose incident just resolved reopens rather than spawning a
        // duplicate within the cooldown.
        if let Some(resolved) = self.recently_resolved(scope, &event).await? {
            return self.reopen(scope, resolved, &event).await;
        }

        let hour_ago = event.occurred_at - Duration::hours(1);
        let created_this_hour = scope
            .count_incidents_since(&event.tenant_id, hour_ago)
            .await?;
        if created_this_hour >= self.config.max_incidents_per_tenant_per_hour {
            return self.route_to_overflow(scope, &event).await;
        }

        let incident = self.create_incident(scope, &event, window_start).await?;
        Ok(IncidentOutcome::Created { incident })
    }

    /// Close open incidents with no activity since the auto-resolve cutoff.
    /// Returns the resolved incident ids.
    pub async fn auto_resolve_idle(
        &self,
        scope: &mut StoreScope,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let cutoff = now - Duration::seconds(self.config.auto_resolve_after_seconds);
        let idle = scope.list_open_incidents_idle_before(cutoff).await?;

        let mut resolved = Vec::with_capacity(idle.len());
        for mut incident in idle {
            incident.status = IncidentStatus::Resolved;
            incident.resolved_at = Some(now);
            incident.updated_at = now;
            incident.auto_action = Some("auto_resolved".to_string());
            scope.update_incident(incident.clone()).await?;
            self.timeline(
                scope,
                &incident.id,
                "auto_resolved",
                "Resolved automatically after idle timeout",
                serde_json::json!({ "idle_seconds": self.config.auto_resolve_after_seconds }),
            )
            .await?;
            tracing::info!(incident_id = %incident.id, "incident auto-resolved");
            resolved.push(incident.id);
        }
        Ok(resolved)
    }

    /// Acknowledge an open incident.
    pub async fn acknowledge(
        &self,
        scope: &mut StoreScope,
        tenant_id: &str,
        incident_id: &str,
    ) -> Result<Option<IncidentRow>, StoreError> {
        let Some(mut incident) = scope.get_incident(tenant_id, incident_id).await? else {
            return Ok(None);
        };
        if incident.status != IncidentStatus::Open {
            return Ok(Some(incident));
        }
        incident.status = IncidentStatus::Acknowledged;
        incident.updated_at = Utc::now();
        scope.update_incident(incident.clone()).await?;
        self.timeline(
            scope,
            incident_id,
            "acknowledged",
            "Incident acknowledged",
            serde_json::Value::Null,
        )
        .await?;
        Ok(Some(incident))
    }

    /// Resolve an incident.
    pub async fn resolve(
        &self,
        scope: &mut StoreScope,
        tenant_id: &str,
        incident_id: &str,
    ) -> Result<Option<IncidentRow>, StoreError> {
        let Some(mut incident) = scope.get_incident(tenant_id, incident_id).await? else {
            return Ok(None);
        };
        if incident.status == IncidentStatus::Resolved {
            return Ok(Some(incident));
        }
        let now = Utc::now();
        incident.status = IncidentStatus::Resolved;
        incident.resolved_at = Some(now);
        incident.updated_at = now;
        scope.update_incident(incident.clone()).await?;
        self.timeline(
            scope,
            incident_id,
            "resolved",
            "Incident resolved",
            serde_json::Value::Null,
        )
        .await?;
        Ok(Some(incident))
    }

    async fn merge_into(
        &self,
        scope: &mut StoreScope,
        mut incident: IncidentRow,
        event: &FailureEvent,
    ) -> Result<IncidentOutcome, StoreError> {
        incident.calls_affected += 1;
        incident.cost_delta_cents += event.cost_delta_cents;
        incident.updated_at = Utc::now();
        if incident.related_call_ids.len() < self.config.max_related_call_ids {
            incident.related_call_ids.push(event.call_id.clone());
        }

        let escalated_to = self
            .severity
            .escalation(incident.severity, incident.calls_affected);
        if let Some(next) = escalated_to {
            let previous = incident.severity;
            incident.severity = next;
            self.timeline(
                scope,
                &incident.id.clone(),
                "severity_escalated",
                format!("Severity escalated from {previous:?} to {next:?}").to_lowercase(),
                serde_json::json!({ "calls_affected": incident.calls_affected }),
            )
            .await?;
            tracing::warn!(
                incident_id = %incident.id,
                calls_affected = incident.calls_affected,
                severity = ?next,
                "incident severity escalated"
            );
        }

        scope.update_incident(incident.clone()).await?;
        Ok(IncidentOutcome::Merged {
            incident,
            escalated_to,
        })
    }

    async fn recently_resolved(
        &self,
        scope: &StoreScope,
        event: &FailureEvent,
    ) -> Result<Option<IncidentRow>, StoreError> {
        let cutoff = event.occurred_at - Duration::seconds(self.config.incident_cooldown_seconds);
        let incidents = scope.list_incidents(&event.tenant_id).await?;
        Ok(incidents.into_iter().find(|incident| {
            incident.trigger_type == event.trigger_type
                && incident.status == IncidentStatus::Resolved
                && incident.resolved_at.is_some_and(|at| at >= cutoff)
        }))
    }

    async fn reopen(
        &self,
        scope: &mut StoreScope,
        mut incident: IncidentRow,
        event: &FailureEvent,
    ) -> Result<IncidentOutcome, StoreError> {
        incident.status = IncidentStatus::Open;
        incident.resolved_at = None;
        incident.window_start = self.window_start(event.occurred_at);
        incident.calls_affected += 1;
        incident.cost_delta_cents += event.cost_delta_cents;
        incident.updated_at = Utc::now();
        if incident.related_call_ids.len() < self.config.max_related_call_ids {
            incident.related_call_ids.push(event.call_id.clone());
        }
        scope.update_incident(incident.clone()).await?;
        self.timeline(
            scope,
            &incident.id.clone(),
            "reopened",
            "Incident reopened within cooldown",
            serde_json::Value::Null,
        )
        .await?;
        tracing::info!(incident_id = %incident.id, "incident reopened within cooldown");
        Ok(IncidentOutcome::Reopened { incident })
    }

    async fn route_to_overflow(
        &self,
        scope: &mut StoreScope,
        event: &FailureEvent,
    ) -> Result<IncidentOutcome, StoreError> {
        // One synthetic overflow incident per tenant per hour.
        let hour_start = {
            let bucket = event.occurred_at.timestamp().div_euclid(3600) * 3600;
            Utc.timestamp_opt(bucket, 0).single().unwrap_or(event.occurred_at)
        };

        if let Some(open) = scope
            .find_open_incident(&event.tenant_id, "rate_limit_overflow", hour_start)
            .await?
        {
            let merged = self.merge_into(scope, open, event).await?;
            return Ok(IncidentOutcome::Overflow {
                incident: merged.incident().clone(),
            });
        }

        let now = Utc::now();
        let incident = IncidentRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: event.tenant_id.clone(),
            trigger_type: "rate_limit_overflow".to_string(),
            trigger_value: event.trigger_type.clone(),
            title: generate_incident_title("rate_limit_overflow", ""),
            severity: IncidentSeverity::Medium,
            status: IncidentStatus::Open,
            calls_affected: 1,
            cost_delta_cents: event.cost_delta_cents,
            window_start: hour_start,
            started_at: now,
            updated_at: now,
            resolved_at: None,
            related_call_ids: vec![event.call_id.clone()],
            auto_action: Some("rate_limited".to_string()),
        };
        scope.insert_incident(incident.clone()).await?;
        self.timeline(
            scope,
            &incident.id,
            "incident_created",
            "Overflow incident created: tenant-hour incident budget exhausted",
            serde_json::json!({ "suppressed_trigger": event.trigger_type }),
        )
        .await?;
        tracing::warn!(
            tenant_id = %event.tenant_id,
            "incident creation rate limit reached, routing to overflow incident"
        );
        Ok(IncidentOutcome::Overflow { incident })
    }

    async fn create_incident(
        &self,
        scope: &mut StoreScope,
        event: &FailureEvent,
        window_start: DateTime<Utc>,
    ) -> Result<IncidentRow, StoreError> {
        let now = Utc::now();
        let severity = self.severity.severity_for_calls(1);
        let incident = IncidentRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: event.tenant_id.clone(),
            trigger_type: event.trigger_type.clone(),
            trigger_value: event.trigger_value.clone(),
            title: generate_incident_title(&event.trigger_type, &event.trigger_value),
            severity,
            status: IncidentStatus::Open,
            calls_affected: 1,
            cost_delta_cents: event.cost_delta_cents,
            window_start,
            started_at: now,
            updated_at: now,
            resolved_at: None,
            related_call_ids: vec![event.call_id.clone()],
            auto_action: None,
        };
        scope.insert_incident(incident.clone()).await?;
        self.timeline(
            scope,
            &incident.id,
            "incident_created",
            format!("Incident created for trigger {}", event.trigger_type),
            serde_json::json!({ "trigger_value": event.trigger_value }),
        )
        .await?;
        tracing::info!(
            incident_id = %incident.id,
            tenant_id = %event.tenant_id,
            trigger_type = %event.trigger_type,
            "incident created"
        );
        Ok(incident)
    }

    async fn timeline(
        &self,
        scope: &mut StoreScope,
        incident_id: &str,
        event_type: &str,
        description: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), StoreError> {
        scope
            .insert_incident_event(IncidentEventRow {
                id: Uuid::new_v4().to_string(),
                incident_id: incident_id.to_string(),
                event_type: event_type.to_string(),
                description: description.into(),
                data,
                created_at: Utc::now(),
            })
            .await
    }
}
