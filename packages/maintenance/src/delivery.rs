//! Downstream event delivery seam.
//!
//! Log shippers and webhook fanout are external adapters; the orchestrator
//! only needs a sink it can hand outbox entries to.

use async_trait::async_trait;
use ledgergate_store::OutboxRow;

/// Delivery failures. The failed entries stay pending and are retried on
/// the next run.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("downstream delivery failed: {0}")]
    Downstream(String),
}

/// Where outbox entries go.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, entry: &OutboxRow) -> Result<(), DeliveryError>;
}

/// In-tree sink: structured log emission, always succeeds. Real shipment is
/// an external adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDeliverySink;

#[async_trait]
impl DeliverySink for LogDeliverySink {
    async fn deliver(&self, entry: &OutboxRow) -> Result<(), DeliveryError> {
        tracing::info!(
            outbox_id = %entry.id,
            event_type = %entry.event_type,
            tenant_id = %entry.tenant_id,
            "outbox entry delivered"
        );
        Ok(())
    }
}
