//! Integration configuration operations.

use async_trait::async_trait;
use chrono::Utc;
use ledgergate_enforcement::ScopeReads;
use ledgergate_store::{HealthState, IntegrationRow, IntegrationStatus};
use uuid::Uuid;

use crate::handlers::{param_fail, store_fail, unknown_method};
use crate::params::{i64_or, opt_str, require_method, require_str};
use crate::registry::OperationHandler;
use crate::types::{codes, OperationContext, OperationResult};

/// Only live vault references and locally sealed blobs are accepted.
fn credential_ref_valid(credential_ref: &str) -> bool {
    credential_ref.starts_with("cus-vault://") || credential_ref.starts_with("sealed://")
}

fn parse_status(raw: &str) -> Option<IntegrationStatus> {
    match raw {
        "active" => Some(IntegrationStatus::Active),
        "disabled" => Some(IntegrationStatus::Disabled),
        "error" => Some(IntegrationStatus::Error),
        _ => None,
    }
}

fn parse_health(raw: &str) -> Option<HealthState> {
    match raw {
        "healthy" => Some(HealthState::Healthy),
        "degraded" => Some(HealthState::Degraded),
        "failing" => Some(HealthState::Failing),
        _ => None,
    }
}

/// `integrations.write`: create, update, disable, soft-delete, seal.
pub struct IntegrationsWriteHandler;

#[async_trait]
impl OperationHandler for IntegrationsWriteHandler {
    fn name(&self) -> &'static str {
        "integrations.write"
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
            "create" => {
                let name = match require_str(&ctx.params, "name") {
                    Ok(value) => value.to_string(),
                    Err(err) => return param_fail(err),
                };
                let provider_type = match require_str(&ctx.params, "provider_type") {
                    Ok(value) => value.to_string(),
                    Err(err) => return param_fail(err),
                };
                let credential_ref = match require_str(&ctx.params, "credential_ref") {
                    Ok(value) => value.to_string(),
                    Err(err) => return param_fail(err),
                };
                if credential_ref.starts_with("vault://") {
                    return OperationResult::fail(
                        codes::CREDENTIALS_INVALID,
                        "Legacy vault:// references are not accepted",
                    );
                }
                if !credential_ref_valid(&credential_ref) {
                    return OperationResult::fail(
                        codes::CREDENTIALS_INVALID,
                        "credential_ref must be a cus-vault:// or sealed:// reference",
                    );
                }

                let id = opt_str(&ctx.params, "id")
                    .map(str::to_string)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                match ctx.scope.get_integration(&ctx.tenant_id, &id).await {
                    Ok(Some(_)) => {
                        return OperationResult::fail(
                            codes::CONFLICT,
                            format!("Integration {id} already exists"),
                        )
                    }
                    Ok(None) => {}
                    Err(err) => return store_fail(err),
                }

                let row = IntegrationRow {
                    id: id.clone(),
                    tenant_id: ctx.tenant_id.clone(),
                    provider_type,
                    name,
                    status: IntegrationStatus::Active,
                    health_state: HealthState::Healthy,
                    health_message: None,
                    budget_limit_cents: i64_or(&ctx.params, "budget_limit_cents", 0),
                    token_limit_month: i64_or(&ctx.params, "token_limit_month", 0),
                    rate_limit_rpm: i64_or(&ctx.params, "rate_limit_rpm", 0),
                    credential_ref,
                    created_at: Utc::now(),
                    deleted_at: None,
                };
                if let Err(err) = ctx.scope.upsert_integration(row.clone()).await {
                    return store_fail(err);
                }
                OperationResult::ok(serde_json::to_value(row).unwrap_or_default())
            }
            "update" | "disable" | "delete" => {
                let id = match require_str(&ctx.params, "integration_id") {
                    Ok(value) => value.to_string(),
                    Err(err) => return param_fail(err),
                };
                let mut row = match ctx.scope.get_integration(&ctx.tenant_id, &id).await {
                    Ok(Some(row)) => row,
                    Ok(None) => {
                        return OperationResult::fail(
                            codes::NOT_FOUND,
                            format!("Integration {id} not found"),
                        )
                    }
                    Err(err) => return store_fail(err),
                };

                match method.as_str() {
                    "disable" => {
                        row.status = IntegrationStatus::Disabled;
                    }
                    "delete" => {
                        // Tombstone, never hard-delete.
                        row.deleted_at = Some(Utc::now());
                    }
                    _ => {
                        if let Some(raw) = opt_str(&ctx.params, "status") {
                            let Some(status) = parse_status(raw) else {
                                return OperationResult::fail(
                                    codes::VALIDATION_ERROR,
                                    format!("Unknown status: {raw}"),
                                );
                            };
                            row.status = status;
                        }
                        if let Some(raw) = opt_str(&ctx.params, "health_state") {
                            let Some(health) = parse_health(raw) else {
                                return OperationResult::fail(
                                    codes::VALIDATION_ERROR,
                                    format!("Unknown health_state: {raw}"),
                                );
                            };
                            row.health_state = health;
                        }
                        if let Some(message) = opt_str(&ctx.params, "health_message") {
                            row.health_message = Some(message.to_string());
                        }
                        if let Some(limit) = ctx.params.get("budget_limit_cents").and_then(|v| v.as_i64()) {
                            row.budget_limit_cents = limit;
                        }
                        if let Some(limit) = ctx.params.get("token_limit_month").and_then(|v| v.as_i64()) {
                            row.token_limit_month = limit;
                        }
                        if let Some(limit) = ctx.params.get("rate_limit_rpm").and_then(|v| v.as_i64()) {
                            row.rate_limit_rpm = limit;
                        }
                    }
                }

                if let Err(err) = ctx.scope.upsert_integration(row.clone()).await {
                    return store_fail(err);
                }
                OperationResult::ok(serde_json::to_value(row).unwrap_or_default())
            }
            "seal_credential" => {
                let plaintext = match require_str(&ctx.params, "plaintext") {
                    Ok(value) => value,
                    Err(err) => return param_fail(err),
                };
                let context = opt_str(&ctx.params, "context").unwrap_or("integration");
                let sealed = ctx.state.credentials.seal(&ctx.tenant_id, plaintext, context);
                OperationResult::ok(serde_json::json!({ "credential_ref": sealed }))
            }
            other => unknown_method("integrations.write", other),
        }
    }
}

/// `integrations.query`: fetch, list, enforcement status.
pub struct IntegrationsQueryHandler;

#[async_trait]
impl OperationHandler for IntegrationsQueryHandler {
    fn name(&self) -> &'static str {
        "integrations.query"
    }

    async fn execute(&self, ctx: &mut OperationContext<'_>) -> OperationResult {
        let method = match require_method(&ctx.params) {
            Ok(method) => method.to_string(),
            Err(err) => return param_fail(err),
        };

        match method.as_str() {
            "get" => {
                let id = match require_str(&ctx.params, "integration_id") {
                    Ok(value) => value.to_string(),
                    Err(err) => return param_fail(err),
                };
                match ctx.scope.get_integration(&ctx.tenant_id, &id).await {
                    Ok(Some(row)) => {
                        OperationResult::ok(serde_json::to_value(row).unwrap_or_default())
                    }
                    Ok(None) => OperationResult::fail(
                        codes::NOT_FOUND,
                        format!("Integration {id} not found"),
                    ),
                    Err(err) => store_fail(err),
                }
            }
            "list" => match ctx.scope.list_integrations(&ctx.tenant_id).await {
                Ok(rows) => OperationResult::ok(serde_json::to_value(rows).unwrap_or_default()),
                Err(err) => store_fail(err),
            },
            "enforcement_status" => {
                let id = match require_str(&ctx.params, "integration_id") {
                    Ok(value) => value.to_string(),
                    Err(err) => return param_fail(err),
                };
                let reads = ScopeReads::new(ctx.scope);
                match ctx
                    .state
                    .enforcement
                    .enforcement_status(&reads, &ctx.tenant_id, &id)
                    .await
                {
                    Ok(Some(status)) => {
                        OperationResult::ok(serde_json::to_value(status).unwrap_or_default())
                    }
                    Ok(None) => OperationResult::fail(
                        codes::NOT_FOUND,
                        format!("Integration {id} not found"),
                    ),
                    Err(err) => store_fail(err),
                }
            }
            other => unknown_method("integrations.query", other),
        }
    }
}
