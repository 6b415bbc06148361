//! Classification of completion-engine failures and OpenAI-style error envelopes
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// The closed set of failure classes the proxy distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authentication,
    PermissionDenied,
    NotFound,
    RateLimited,
    Connection,
    Unavailable,
    Timeout,
    Unclassified,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Connection => StatusCode::BAD_GATEWAY,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Unclassified => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the engine's retry policy may try again.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::Connection
                | ErrorKind::Unavailable
                | ErrorKind::Timeout
        )
    }

    pub fn error_type(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::NotFound => "invalid_request_error",
            ErrorKind::RateLimited => "rate_limit_error",
            ErrorKind::Connection => "connection_error",
            ErrorKind::Unavailable => "service_unavailable",
            ErrorKind::Timeout => "timeout_error",
            ErrorKind::Unclassified => "api_error",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "invalid_api_key",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::NotFound => "model_not_found",
            ErrorKind::RateLimited => "rate_limit_exceeded",
            ErrorKind::Connection => "connection_error",
            ErrorKind::Unavailable => "service_unavailable",
            ErrorKind::Timeout => "request_timeout",
            ErrorKind::Unclassified => "internal_error",
        }
    }

    /// Short name used as the prefix of persisted error messages.
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::PermissionDenied => "PermissionDeniedError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::RateLimited => "RateLimitError",
            ErrorKind::Connection => "APIConnectionError",
            ErrorKind::Unavailable => "ProviderError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Unclassified => "UnexpectedError",
        }
    }

    /// Classify an upstream HTTP status.
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            401 => ErrorKind::Authentication,
            403 => ErrorKind::PermissionDenied,
            404 => ErrorKind::NotFound,
            408 | 504 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimited,
            500 | 502 | 503 | 529 => ErrorKind::Unavailable,
            _ => ErrorKind::Unclassified,
        }
    }
}

/// A classified failure from the completion engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}: {message}", .kind.label())]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope::new(self.kind.error_type(), &self.message, self.kind.code())
    }

    /// The message persisted in the audit log, e.g. `RateLimitError: slow down`.
    pub fn record_message(&self) -> String {
        self.to_string()
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        (self.kind.status(), Json(self.envelope())).into_response()
    }
}

/// `{"error": {"message", "type", "code"}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(error_type: &str, message: &str, code: &str) -> Self {
        Self {
            error: ErrorBody {
                message: message.to_string(),
                error_type: error_type.to_string(),
                code: Some(code.to_string()),
            },
        }
    }

    /// Render as a single SSE `data:` event.
    pub fn to_sse(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"error":{"message":"internal error","type":"api_error","code":"internal_error"}}"#
                .to_string()
        });
        format!("data: {json}\n\n")
    }
}

/// Error response for requests that never reached the engine.
pub fn error_response(status: StatusCode, error_type: &str, message: &str, code: &str) -> Response {
    (status, Json(ErrorEnvelope::new(error_type, message, code))).into_response()
}

/// Custom rejection handler for malformed chat completion bodies
pub fn json_rejection_response(err: axum::extract::rejection::JsonRejection) -> Response {
    use axum::extract::rejection::JsonRejection;

    let (status, message) = match err {
        JsonRejection::JsonDataError(e) => {
            tracing::warn!(error = %e, "Invalid JSON data");
            (StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e.body_text()))
        }
        JsonRejection::JsonSyntaxError(e) => {
            tracing::warn!(error = %e, "JSON syntax error");
            (StatusCode::BAD_REQUEST, format!("JSON syntax error: {e}"))
        }
        JsonRejection::MissingJsonContentType(e) => {
            tracing::warn!(error = %e, "Missing content type");
            (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Content-Type must be application/json".to_string(),
            )
        }
        JsonRejection::BytesRejection(e) => {
            tracing::warn!(error = %e, "Failed to read request body");
            (
                StatusCode::BAD_REQUEST,
                "Failed to read request body".to_string(),
            )
        }
        _ => (StatusCode::BAD_REQUEST, "Invalid request".to_string()),
    };

    error_response(status, "invalid_request_error", &message, "invalid_request")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_statuses_and_retryability() {
        let table = [
            (ErrorKind::Authentication, 401, false),
            (ErrorKind::PermissionDenied, 403, false),
            (ErrorKind::NotFound, 404, false),
            (ErrorKind::RateLimited, 429, true),
            (ErrorKind::Connection, 502, true),
            (ErrorKind::Unavailable, 503, true),
            (ErrorKind::Timeout, 504, true),
            (ErrorKind::Unclassified, 500, false),
        ];
        for (kind, status, retryable) in table {
            assert_eq!(kind.status().as_u16(), status, "{kind:?}");
            assert_eq!(kind.is_retryable(), retryable, "{kind:?}");
        }
    }

    #[test]
    fn test_upstream_status_classification() {
        assert_eq!(
            ErrorKind::from_status(StatusCode::UNAUTHORIZED),
            ErrorKind::Authentication
        );
        assert_eq!(
            ErrorKind::from_status(StatusCode::TOO_MANY_REQUESTS),
            ErrorKind::RateLimited
        );
        assert_eq!(
            ErrorKind::from_status(StatusCode::SERVICE_UNAVAILABLE),
            ErrorKind::Unavailable
        );
        assert_eq!(
            ErrorKind::from_status(StatusCode::REQUEST_TIMEOUT),
            ErrorKind::Timeout
        );
        assert_eq!(
            ErrorKind::from_status(StatusCode::BAD_REQUEST),
            ErrorKind::Unclassified
        );
    }

    #[test]
    fn test_envelope_shape() {
        let err = EngineError::new(ErrorKind::RateLimited, "slow down");
        let value = serde_json::to_value(err.envelope()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "error": {
                    "message": "slow down",
                    "type": "rate_limit_error",
                    "code": "rate_limit_exceeded"
                }
            })
        );
        assert_eq!(err.record_message(), "RateLimitError: slow down");
    }

    #[test]
    fn test_envelope_as_sse_event() {
        let sse = EngineError::new(ErrorKind::Timeout, "too slow")
            .envelope()
            .to_sse();
        assert!(sse.starts_with("data: {\"error\":"));
        assert!(sse.ends_with("\n\n"));
    }

    #[test]
    fn test_engine_error_into_response() {
        let response = EngineError::new(ErrorKind::Authentication, "bad key").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
