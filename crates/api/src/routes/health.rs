//! Health check endpoint.
//!
//! Reports each backing dependency separately. Any failing check turns the
//! response into a 503 so load balancers stop routing enqueues here.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use herald_common::error::AppError;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

fn report(check: &Result<(), AppError>) -> Value {
    match check {
        Ok(()) => json!({"status": "up"}),
        Err(e) => json!({"status": "down", "error": e.to_string()}),
    }
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let (db, cache, broker) = tokio::join!(
        state.store.ping(),
        state.gateway.cache().ping(),
        state.gateway.broker().check(),
    );

    let healthy = db.is_ok() && cache.is_ok() && broker.is_ok();
    if !healthy {
        tracing::warn!(
            db = db.is_ok(),
            cache = cache.is_ok(),
            broker = broker.is_ok(),
            "Health check failed"
        );
    }

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "service": "herald-api",
            "version": env!("CARGO_PKG_VERSION"),
            "checks": {
                "db": report(&db),
                "cache": report(&cache),
                "broker": report(&broker),
            }
        })),
    )
}
