//! Data-access seam for the enforcement engine.
//!
//! The engine never talks to the store directly; it reads through this trait
//! so quota decisions stay testable against injected failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgergate_store::{IntegrationRow, StoreError, StoreScope};
use ledgergate_telemetry::TelemetryDriver;

/// Reads the enforcement engine needs. All calls are tenant-scoped.
#[async_trait]
pub trait EnforcementReads: Send + Sync {
    async fn fetch_integration(
        &self,
        tenant_id: &str,
        integration_id: &str,
    ) -> Result<Option<IntegrationRow>, StoreError>;

    /// Month-to-date spend in cents.
    async fn fetch_budget_usage(
        &self,
        tenant_id: &str,
        integration_id: &str,
        period_start: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Month-to-date token consumption.
    async fn fetch_token_usage(
        &self,
        tenant_id: &str,
        integration_id: &str,
        period_start: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Calls inside the rate window.
    async fn fetch_rate_count(
        &self,
        tenant_id: &str,
        integration_id: &str,
        window_start: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}

/// Store-backed reads over a request scope.
pub struct ScopeReads<'a> {
    scope: &'a StoreScope,
    driver: TelemetryDriver,
}

impl<'a> ScopeReads<'a> {
    pub fn new(scope: &'a StoreScope) -> Self {
        Self {
            scope,
            driver: TelemetryDriver::new(),
        }
    }
}

#[async_trait]
impl EnforcementReads for ScopeReads<'_> {
    async fn fetch_integration(
        &self,
        tenant_id: &str,
        integration_id: &str,
    ) -> Result<Option<IntegrationRow>, StoreError> {
        self.scope.get_integration(tenant_id, integration_id).await
    }

    async fn fetch_budget_usage(
        &self,
        tenant_id: &str,
        integration_id: &str,
        period_start: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.driver
            .fetch_budget_usage(self.scope, tenant_id, integration_id, period_start)
            .await
    }

    async fn fetch_token_usage(
        &self,
        tenant_id: &str,
        integration_id: &str,
        period_start: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.driver
            .fetch_token_usage(self.scope, tenant_id, integration_id, period_start)
            .await
    }

    async fn fetch_rate_count(
        &self,
        tenant_id: &str,
        integration_id: &str,
        window_start: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.driver
            .fetch_rate_count(self.scope, tenant_id, integration_id, window_start)
            .await
    }
}
