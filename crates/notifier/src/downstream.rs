//! Mapping of HTTP outcomes onto the delivery error taxonomy.
//!
//! Timeouts and 5xx/429 responses are transient; other 4xx responses are
//! permanent rejections; 404 is reported as not-found.

use reqwest::StatusCode;

use herald_common::error::AppError;

/// Classify a transport-level failure from `service`.
pub fn transport_error(service: &str, e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::DownstreamTimeout(format!("{} request timed out: {}", service, e))
    } else {
        AppError::DownstreamTransient(format!("{} request failed: {}", service, e))
    }
}

/// Classify a non-success HTTP status returned by `service`.
pub fn status_error(service: &str, status: StatusCode, body: &str) -> AppError {
    let detail = format!("{} returned {}: {}", service, status, body.trim());
    if status == StatusCode::NOT_FOUND {
        AppError::NotFound(detail)
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        AppError::DownstreamTransient(detail)
    } else {
        AppError::DownstreamPermanent(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let kind = |code: u16| {
            status_error("resend", StatusCode::from_u16(code).unwrap(), "")
                .kind()
                .as_str()
        };
        assert_eq!(kind(500), "downstream_error");
        assert_eq!(kind(503), "downstream_error");
        assert_eq!(kind(429), "downstream_error");
        assert_eq!(kind(422), "downstream_permanent");
        assert_eq!(kind(400), "downstream_permanent");
        assert_eq!(kind(404), "not_found");
    }
}
