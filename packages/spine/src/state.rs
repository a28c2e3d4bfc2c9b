//! Shared engine state injected into handler call frames.
//!
//! Handlers never import peer domain engines directly; the dispatcher wires
//! this bundle into every call.

use std::sync::Arc;

use ledgergate_credentials::CredentialService;
use ledgergate_enforcement::EnforcementEngine;
use ledgergate_envelopes::{Coordinator, CoordinatorLease, DriftObserver};
use ledgergate_events::EventEmitter;
use ledgergate_incidents::IncidentAggregator;
use ledgergate_locks::{worker_holder_id, DistributedLockService};
use ledgergate_snapshots::SnapshotEngine;
use ledgergate_store::MemoryStore;
use ledgergate_telemetry::TelemetryDriver;

/// How long one instance owns a tenant's coordination before the TTL
/// safety valve lets another take over. Reacquire extends.
const COORDINATION_LEASE_TTL_SECONDS: i64 = 120;

/// Every engine a handler may reach, behind one injection point.
#[derive(Clone)]
pub struct AppState {
    pub store: MemoryStore,
    pub locks: DistributedLockService,
    pub telemetry: TelemetryDriver,
    pub enforcement: EnforcementEngine,
    pub snapshots: SnapshotEngine,
    pub coordinator: Arc<Coordinator>,
    pub drift: Arc<DriftObserver>,
    pub aggregator: IncidentAggregator,
    pub emitter: EventEmitter,
    pub credentials: Arc<CredentialService>,
    /// This instance's identity in the coordination lock table.
    pub coordination_holder_id: String,
}

impl AppState {
    /// Wire the default engine set over one store.
    pub fn new(store: MemoryStore) -> Self {
        Self {
            locks: DistributedLockService::new(store.clone()),
            telemetry: TelemetryDriver::new(),
            enforcement: EnforcementEngine::default(),
            snapshots: SnapshotEngine::default(),
            coordinator: Arc::new(Coordinator::new()),
            drift: Arc::new(DriftObserver::default()),
            aggregator: IncidentAggregator::default(),
            emitter: EventEmitter::new(),
            credentials: Arc::new(CredentialService::with_dev_key()),
            coordination_holder_id: worker_holder_id(),
            store,
        }
    }

    /// Coordinator ownership is singleton per tenant: the instance that
    /// wins this named lock is the only one allowed to mutate envelope
    /// state for the tenant. Dual writers are prevented by the lock layer,
    /// not by optimistic CAS.
    pub fn coordination_lease(&self, tenant_id: &str) -> CoordinatorLease {
        CoordinatorLease::new(
            self.locks.clone(),
            tenant_id,
            self.coordination_holder_id.clone(),
            COORDINATION_LEASE_TTL_SECONDS,
        )
    }
}
