//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_engine::{EnqueueGateway, StatusStore};

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<EnqueueGateway>,
    pub store: Arc<dyn StatusStore>,
    /// HS256 secret bearer tokens are verified against
    pub jwt_secret: Arc<str>,
}

impl AppState {
    pub fn new(gateway: Arc<EnqueueGateway>, jwt_secret: &str) -> Self {
        Self {
            store: gateway.store().clone(),
            gateway,
            jwt_secret: Arc::from(jwt_secret),
        }
    }
}
