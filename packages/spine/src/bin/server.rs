//! LedgerGate Server
//!
//! Thin transport adapter: one POST endpoint delivering validated requests
//! into the transport-agnostic dispatcher.

use std::sync::Arc;

use axum::{extract::State, routing::get, routing::post, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledgergate_locks::worker_holder_id;
use ledgergate_maintenance::{LogDeliverySink, MaintenanceConfig, MaintenanceOrchestrator};
use ledgergate_spine::{
    handlers, AppState, Dispatcher, OperationRegistry, OperationRequest, OperationResult,
};
use ledgergate_store::MemoryStore;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    operations: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = Arc::new(AppState::new(MemoryStore::new()));
    let mut registry = OperationRegistry::new();
    handlers::register_all(&mut registry);
    let operations = registry.len();
    spawn_maintenance(&state);
    let dispatcher = Dispatcher::new(state, Arc::new(registry));

    let app = Router::new()
        .route("/health", get(move || health(operations)))
        .route("/v1/operations", post(dispatch))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3010".to_string());
    let addr = format!("0.0.0.0:{port}");

    tracing::info!(addr = %addr, operations, "LedgerGate server running");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn health(operations: usize) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        operations,
    })
}

async fn dispatch(
    State(dispatcher): State<Dispatcher>,
    Json(request): Json<OperationRequest>,
) -> Json<OperationResult> {
    Json(dispatcher.dispatch(request).await)
}

/// Background flow: wake periodically, run the ordered maintenance chain
/// under lock election, then the envelope-expiry and incident sweeps.
///
/// The envelope sweep needs no extra lock: every envelope in this process's
/// coordinator was admitted while this instance held the tenant's
/// coordination lease (see `AppState::coordination_lease`), so expiring them
/// locally cannot race another instance.
fn spawn_maintenance(state: &Arc<AppState>) {
    let orchestrator = MaintenanceOrchestrator::new(
        state.store.clone(),
        state.locks.clone(),
        Arc::new(LogDeliverySink),
        MaintenanceConfig::default(),
        worker_holder_id(),
    );
    let coordinator = Arc::clone(&state.coordinator);
    let aggregator = state.aggregator.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            ticker.tick().await;
            orchestrator.run_all().await;
            orchestrator.sweep_envelopes(&coordinator).await;
            orchestrator.sweep_incidents(&aggregator).await;
        }
    });
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("failed to install shutdown signal handler");
    }
}
