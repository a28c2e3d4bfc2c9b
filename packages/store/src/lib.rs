//! LedgerGate: Storage Adapter
//!
//! Typed row-level operations over the control-plane tables, plus the
//! transactional scope that the dispatcher owns.
//!
//! Features:
//! - Row types for every governed entity (tenants, integrations, usage,
//!   snapshots, baselines, anomalies, incidents, locks, outbox, audits)
//! - `StoreScope`: begin / flush / commit / rollback; the adapter never
//!   decides when to commit
//! - Transient vs permanent failure classification
//! - In-memory store with staged writes and compare-and-set lock rows
//!
//! # Example
//!
//! ```rust,ignore
//! use ledgergate_store::MemoryStore;
//!
//! let store = MemoryStore::new();
//! let mut scope = store.begin().await;
//! scope.upsert_tenant(tenant_row).await?;
//! scope.commit().await?;
//! ```

pub mod error;
pub mod memory;
pub mod rows;
pub mod scope;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use rows::*;
pub use scope::StoreScope;
