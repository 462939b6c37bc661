//! Connect error codes and error bodies

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde::Serialize;
use tonic::{Code, Status};

#[derive(Debug, Serialize)]
pub struct ConnectError {
    pub code: &'static str,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl From<&Status> for ConnectError {
    fn from(status: &Status) -> Self {
        Self {
            code: connect_code(status.code()),
            message: status.message().to_string(),
        }
    }
}

pub const fn connect_code(code: Code) -> &'static str {
    match code {
        Code::Cancelled => "canceled",
        Code::InvalidArgument => "invalid_argument",
        Code::DeadlineExceeded => "deadline_exceeded",
        Code::NotFound => "not_found",
        Code::AlreadyExists => "already_exists",
        Code::PermissionDenied => "permission_denied",
        Code::ResourceExhausted => "resource_exhausted",
        Code::FailedPrecondition => "failed_precondition",
        Code::Aborted => "aborted",
        Code::OutOfRange => "out_of_range",
        Code::Unimplemented => "unimplemented",
        Code::Internal => "internal",
        Code::Unavailable => "unavailable",
        Code::DataLoss => "data_loss",
        Code::Unauthenticated => "unauthenticated",
        Code::Ok | Code::Unknown => "unknown",
    }
}

pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT),
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::Ok | Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Unary error response
pub fn error_response(status: &Status) -> Response {
    (http_status(status.code()), Json(ConnectError::from(status))).into_response()
}

#[derive(Serialize)]
struct EndOfStream {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ConnectError>,
}

/// JSON payload of the end-of-stream envelope
pub fn end_of_stream_payload(result: &Result<(), Status>) -> Vec<u8> {
    let eos = EndOfStream {
        error: result.as_ref().err().map(ConnectError::from),
    };
    serde_json::to_vec(&eos).unwrap_or_else(|_| b"{}".to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(connect_code(Code::Cancelled), "canceled");
        assert_eq!(http_status(Code::Cancelled).as_u16(), 499);
        assert_eq!(http_status(Code::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(http_status(Code::InvalidArgument), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_end_of_stream_payload() {
        assert_eq!(end_of_stream_payload(&Ok(())), b"{}");

        let payload = end_of_stream_payload(&Err(Status::deadline_exceeded("too slow")));
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["error"]["code"], "deadline_exceeded");
        assert_eq!(value["error"]["message"], "too slow");
    }
}
