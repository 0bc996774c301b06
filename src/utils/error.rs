use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::server::middleware::rate_limit::RateLimitResult;

/// Stable error codes shared by every frontend.
///
/// The code is what crosses protocol boundaries: gRPC statuses, HTTP statuses and
/// WebSocket close codes are all derived from it, so a gateway sees the same class of
/// failure regardless of the protocol it speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unauthenticated,
    PermissionDenied,
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Unavailable,
    ResourceExhausted,
    Aborted,
    Corruption,
    Unimplemented,
    Canceled,
    Internal,
}

/// Represents the errors that can occur in the Gateway Server frontends.
#[derive(Error, Debug, Clone)]
pub enum GsError {
    /// Credentials are missing from the request.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Credentials are present but invalid, or lack the required right.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed identifiers, unknown auth schemes or malformed wire payloads.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown gateway, connection or cached entry.
    #[error("not found: {0}")]
    NotFound(String),

    /// The server is not configured for the requested operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A cluster peer is missing or could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The caller has been rate limited.
    ///
    /// The attached result carries the limit and the retry delay so that frontends
    /// can surface them as headers or metadata.
    #[error("resource exhausted: rate limit of {} exceeded", .0.limit)]
    ResourceExhausted(RateLimitResult),

    /// Downlink scheduling was rejected, with one sub-error per attempted window.
    #[error("aborted: {message}")]
    Aborted { message: String, details: Vec<String> },

    /// A protocol peer sent a frame that cannot be interpreted.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The endpoint is disabled by configuration.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// The operation was canceled because its connection went away.
    #[error("canceled")]
    Canceled,

    /// Represents a transport level failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Represents an error in the server configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An invariant of the server itself was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GsError {
    /// Returns the stable code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            GsError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            GsError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            GsError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            GsError::NotFound(_) => ErrorCode::NotFound,
            GsError::FailedPrecondition(_) | GsError::Configuration(_) => {
                ErrorCode::FailedPrecondition
            }
            GsError::Unavailable(_) | GsError::Connection(_) => ErrorCode::Unavailable,
            GsError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            GsError::Aborted { .. } => ErrorCode::Aborted,
            GsError::Corruption(_) => ErrorCode::Corruption,
            GsError::Unimplemented(_) => ErrorCode::Unimplemented,
            GsError::Canceled => ErrorCode::Canceled,
            GsError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Builds an `aborted` error from the per-window failures of a scheduling attempt.
    pub fn aborted(message: impl Into<String>, details: Vec<String>) -> Self {
        GsError::Aborted {
            message: message.into(),
            details,
        }
    }

    /// Maps the error to the HTTP status returned at the outer boundary.
    pub fn http_status(&self) -> StatusCode {
        match self.code() {
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorCode::InvalidArgument | ErrorCode::Corruption => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Aborted => StatusCode::CONFLICT,
            ErrorCode::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            ErrorCode::Canceled => StatusCode::REQUEST_TIMEOUT,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Maps the error to a WebSocket close code (RFC 6455 section 7.4.1).
    pub fn close_code(&self) -> u16 {
        match self.code() {
            ErrorCode::Unauthenticated | ErrorCode::PermissionDenied => 1008,
            ErrorCode::InvalidArgument | ErrorCode::Corruption => 1007,
            ErrorCode::ResourceExhausted | ErrorCode::Unavailable => 1013,
            ErrorCode::Canceled => 1001,
            _ => 1011,
        }
    }
}

impl From<GsError> for tonic::Status {
    fn from(err: GsError) -> Self {
        use tonic::Code;

        let code = match err.code() {
            ErrorCode::Unauthenticated => Code::Unauthenticated,
            ErrorCode::PermissionDenied => Code::PermissionDenied,
            ErrorCode::InvalidArgument => Code::InvalidArgument,
            ErrorCode::NotFound => Code::NotFound,
            ErrorCode::FailedPrecondition => Code::FailedPrecondition,
            ErrorCode::Unavailable => Code::Unavailable,
            ErrorCode::ResourceExhausted => Code::ResourceExhausted,
            ErrorCode::Aborted => Code::Aborted,
            ErrorCode::Corruption => Code::DataLoss,
            ErrorCode::Unimplemented => Code::Unimplemented,
            ErrorCode::Canceled => Code::Cancelled,
            ErrorCode::Internal => Code::Internal,
        };
        let mut status = tonic::Status::new(code, err.to_string());
        if let GsError::ResourceExhausted(result) = &err {
            result.apply_to_metadata(status.metadata_mut());
        }
        status
    }
}

impl IntoResponse for GsError {
    fn into_response(self) -> Response {
        let mut response = (
            self.http_status(),
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response();
        if let GsError::ResourceExhausted(result) = &self {
            result.apply_to_headers(response.headers_mut());
        }
        response
    }
}

impl From<serde_json::Error> for GsError {
    fn from(err: serde_json::Error) -> Self {
        GsError::InvalidArgument(format!("malformed JSON: {}", err))
    }
}

impl From<prost::DecodeError> for GsError {
    fn from(err: prost::DecodeError) -> Self {
        GsError::InvalidArgument(format!("malformed protobuf: {}", err))
    }
}

impl From<std::io::Error> for GsError {
    fn from(err: std::io::Error) -> Self {
        GsError::Connection(err.to_string())
    }
}

impl From<tungstenite::Error> for GsError {
    fn from(err: tungstenite::Error) -> Self {
        GsError::Connection(err.to_string())
    }
}

impl From<axum::Error> for GsError {
    fn from(err: axum::Error) -> Self {
        GsError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn resource_exhausted_carries_rate_limit_metadata() {
        let result = RateLimitResult {
            limited: true,
            limit: 3,
            remaining: 0,
            reset_after: Duration::from_secs(60),
            retry_after: Duration::from_secs(20),
        };
        let status: tonic::Status = GsError::ResourceExhausted(result).into();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
        assert_eq!(
            status.metadata().get("x-rate-limit-limit").unwrap().to_str().unwrap(),
            "3"
        );
        assert_eq!(
            status.metadata().get("x-rate-limit-retry").unwrap().to_str().unwrap(),
            "20"
        );
    }

    #[test]
    fn codes_map_uniformly() {
        let err = GsError::PermissionDenied("key".into());
        assert_eq!(err.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(err.close_code(), 1008);
        assert_eq!(tonic::Status::from(err).code(), tonic::Code::PermissionDenied);

        let err = GsError::Corruption("text frame".into());
        assert_eq!(err.code(), ErrorCode::Corruption);
        assert_eq!(err.close_code(), 1007);
    }

    #[test]
    fn http_responses_carry_rate_limit_headers() {
        let result = RateLimitResult {
            limited: true,
            limit: 3,
            remaining: 0,
            reset_after: Duration::from_secs(60),
            retry_after: Duration::from_millis(1500),
        };
        let response = GsError::ResourceExhausted(result).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-rate-limit-retry"], "2");
    }

    #[test]
    fn aborted_keeps_window_details() {
        let err = GsError::aborted(
            "no downlink path",
            vec!["rx1: too late".into(), "rx2: too late".into()],
        );
        match err {
            GsError::Aborted { details, .. } => assert_eq!(details.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }
}
