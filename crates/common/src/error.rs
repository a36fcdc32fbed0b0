use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy shared by the gateway, the broker layer and the delivery workers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(#[from] redis::RedisError),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    #[error("Downstream timeout: {0}")]
    DownstreamTimeout(String),

    #[error("Downstream error: {0}")]
    DownstreamTransient(String),

    #[error("Downstream rejected request: {0}")]
    DownstreamPermanent(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Machine-readable name of an [`AppError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    StoreUnavailable,
    CacheUnavailable,
    BrokerUnavailable,
    CircuitOpen,
    DownstreamTimeout,
    DownstreamTransient,
    DownstreamPermanent,
    RetriesExhausted,
    Config,
    Auth,
    NotFound,
    Validation,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::CacheUnavailable => "cache_unavailable",
            ErrorKind::BrokerUnavailable => "broker_unavailable",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::DownstreamTimeout => "downstream_timeout",
            ErrorKind::DownstreamTransient => "downstream_error",
            ErrorKind::DownstreamPermanent => "downstream_permanent",
            ErrorKind::RetriesExhausted => "retries_exhausted",
            ErrorKind::Config => "config",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            AppError::CacheUnavailable(_) => ErrorKind::CacheUnavailable,
            AppError::BrokerUnavailable(_) => ErrorKind::BrokerUnavailable,
            AppError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            AppError::DownstreamTimeout(_) => ErrorKind::DownstreamTimeout,
            AppError::DownstreamTransient(_) => ErrorKind::DownstreamTransient,
            AppError::DownstreamPermanent(_) => ErrorKind::DownstreamPermanent,
            AppError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            AppError::Config(_) => ErrorKind::Config,
            AppError::Auth(_) => ErrorKind::Auth,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a delivery attempt that failed with this error may be retried.
    ///
    /// Infrastructure outages and downstream timeouts/5xx are transient.
    /// Validation-class rejections, unknown templates and exhausted retries are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::StoreUnavailable(_)
                | AppError::CacheUnavailable(_)
                | AppError::BrokerUnavailable(_)
                | AppError::CircuitOpen(_)
                | AppError::DownstreamTimeout(_)
                | AppError::DownstreamTransient(_)
        )
    }

    /// Whether this error should count against a circuit breaker's failure budget.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            AppError::DownstreamTimeout(_) | AppError::DownstreamTransient(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::StoreUnavailable
            | ErrorKind::CacheUnavailable
            | ErrorKind::BrokerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::CircuitOpen
            | ErrorKind::DownstreamTimeout
            | ErrorKind::DownstreamTransient
            | ErrorKind::DownstreamPermanent => StatusCode::BAD_GATEWAY,
            ErrorKind::RetriesExhausted | ErrorKind::Config | ErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = json!({ "error": self.to_string(), "kind": self.kind().as_str() });
        (status, Json(body)).into_response()
    }
}
