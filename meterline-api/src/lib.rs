//! HTTP layer: router assembly, handlers, and request/response DTOs.
//! Split from `main.rs` so the router can be exercised directly in
//! integration tests without binding a socket, the same separation
//! `aerolithdb_api` keeps between its library crate and the root binary.

pub mod dto;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/events", post(handlers::ingest_events).get(handlers::list_events))
        .route("/api/v1/usage", get(handlers::get_usage))
        .route("/internal/snapshots", post(handlers::build_snapshots))
        .route("/internal/invoices", post(handlers::build_invoice))
        .route("/api/v1/invoices/:id", get(handlers::get_invoice))
        .route("/webhooks/psp", post(handlers::psp_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
