//! Analytics operations: snapshots, baselines, anomalies.

use async_trait::async_trait;
use ledgergate_store::SnapshotType;

use crate::handlers::{param_fail, store_fail, unknown_method};
use crate::params::{i64_or, require_datetime, require_method, require_str};
use crate::registry::OperationHandler;
use crate::types::{codes, OperationContext, OperationResult};

fn parse_snapshot_type(raw: &str) -> Option<SnapshotType> {
    match raw {
        "daily" => Some(SnapshotType::Daily),
        "hourly" => Some(SnapshotType::Hourly),
        _ => None,
    }
}

/// `analytics.snapshot`: run snapshot computation or refresh baselines.
pub struct AnalyticsSnapshotHandler;

#[async_trait]
impl OperationHandler for AnalyticsSnapshotHandler {
    fn name(&self) -> &'static str {
        "analytics.snapshot"
    }

    fn requires_session(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut OperationContext<'_>) -> OperationResult {
        let method = match require_method(&ctx.params) {
            Ok(method) => method.to_string(),
            Err(err) => return param_fail(err),
        };

        match method.as_str() {
            "run" => {
                let raw_type = match require_str(&ctx.params, "snapshot_type") {
                    Ok(value) => value,
                    Err(err) => return param_fail(err),
                };
                let Some(snapshot_type) = parse_snapshot_type(raw_type) else {
                    return OperationResult::fail(
                        codes::VALIDATION_ERROR,
                        "snapshot_type must be 'daily' or 'hourly'",
                    );
                };
                let period_start = match require_datetime(&ctx.params, "period_start") {
                    Ok(value) => value,
                    Err(err) => return param_fail(err),
                };
                let period_end = match require_datetime(&ctx.params, "period_end") {
                    Ok(value) => value,
                    Err(err) => return param_fail(err),
                };

                let tenant_id = ctx.tenant_id.clone();
                match ctx
                    .state
                    .snapshots
                    .run_snapshot(ctx.scope, &tenant_id, snapshot_type, period_start, period_end)
                    .await
                {
                    Ok(outcome) => OperationResult::ok(serde_json::json!({
                        "snapshot": outcome.snapshot,
                        "aggregates": outcome.aggregates.len(),
                        "evaluations": outcome.evaluations.len(),
                        "anomalies": outcome.anomalies.len(),
                    })),
                    Err(err) => store_fail(err),
                }
            }
            "baselines" => {
                let window_days = i64_or(&ctx.params, "window_days", 7);
                if window_days != 7 && window_days != 30 {
                    return OperationResult::fail(
                        codes::VALIDATION_ERROR,
                        "window_days must be 7 or 30",
                    );
                }
                let tenant_id = ctx.tenant_id.clone();
                match ctx
                    .state
                    .snapshots
                    .compute_baselines(ctx.scope, &tenant_id, window_days as u32)
                    .await
                {
                    Ok(baselines) => OperationResult::ok(serde_json::json!({
                        "computed": baselines.len(),
                        "baselines": baselines,
                    })),
                    Err(err) => store_fail(err),
                }
            }
            other => unknown_method("analytics.snapshot", other),
        }
    }
}

/// `analytics.query`: read snapshots, aggregates, anomalies, evaluations.
pub struct AnalyticsQueryHandler;

#[async_trait]
impl OperationHandler for AnalyticsQueryHandler {
    fn name(&self) -> &'static str {
        "analytics.query"
    }

    async fn execute(&self, ctx: &mut OperationContext<'_>) -> OperationResult {
        let method = match require_method(&ctx.params) {
            Ok(method) => method.to_string(),
            Err(err) => return param_fail(err),
        };

        match method.as_str() {
            "snapshot" => {
                let raw_type = match require_str(&ctx.params, "snapshot_type") {
                    Ok(value) => value,
                    Err(err) => return param_fail(err),
                };
                let Some(snapshot_type) = parse_snapshot_type(raw_type) else {
                    return OperationResult::fail(
                        codes::VALIDATION_ERROR,
                        "snapshot_type must be 'daily' or 'hourly'",
                    );
                };
                let period_start = match require_datetime(&ctx.params, "period_start") {
                    Ok(value) => value,
                    Err(err) => return param_fail(err),
                };
                match ctx
                    .scope
                    .get_snapshot_by_key(&ctx.tenant_id, snapshot_type, period_start)
                    .await
                {
                    Ok(Some(snapshot)) => {
                        OperationResult::ok(serde_json::to_value(snapshot).unwrap_or_default())
                    }
                    Ok(None) => OperationResult::fail(codes::NOT_FOUND, "Snapshot not found"),
                    Err(err) => store_fail(err),
                }
            }
            "aggregates" | "evaluations" => {
                let snapshot_id = match require_str(&ctx.params, "snapshot_id") {
                    Ok(value) => value.to_string(),
                    Err(err) => return param_fail(err),
                };
                // Tenant isolation: the snapshot must belong to the caller.
                match ctx.scope.get_snapshot(&snapshot_id).await {
                    Ok(Some(snapshot)) if snapshot.tenant_id == ctx.tenant_id => {}
                    Ok(_) => return OperationResult::fail(codes::NOT_FOUND, "Snapshot not found"),
                    Err(err) => return store_fail(err),
                }
                if method == "aggregates" {
                    match ctx.scope.list_snapshot_aggregates(&snapshot_id).await {
                        Ok(rows) => {
                            OperationResult::ok(serde_json::to_value(rows).unwrap_or_default())
                        }
                        Err(err) => store_fail(err),
                    }
                } else {
                    match ctx.scope.list_anomaly_evaluations(&snapshot_id).await {
                        Ok(rows) => {
                            OperationResult::ok(serde_json::to_value(rows).unwrap_or_default())
                        }
                        Err(err) => store_fail(err),
                    }
                }
            }
            "anomalies" => match ctx.scope.list_anomalies(&ctx.tenant_id).await {
                Ok(rows) => OperationResult::ok(serde_json::to_value(rows).unwrap_or_default()),
                Err(err) => store_fail(err),
            },
            other => unknown_method("analytics.query", other),
        }
    }
}
