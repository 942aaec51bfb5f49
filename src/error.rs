//! JSON error responses for the worker HTTP surface

use crate::session::Rejection;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Response header naming the error code
pub const ERROR_HEADER: &str = "X-Frontgate-Error";

/// Body type of every response the worker produces
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Wrap bytes as a response body
pub fn full_body(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No app is mounted at the request path
    UnknownApp,
    /// The request carries no valid session
    Unauthenticated,
    /// The identity service refused the request with its own status
    UpstreamStatus,
    /// The identity service could not be reached or answered garbage
    IdentityServiceFailed,
    /// The client went away before the response was ready
    ClientClosedRequest,
    InternalError,
}

impl ErrorCode {
    /// Default HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::UnknownApp => StatusCode::NOT_FOUND,
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::UpstreamStatus => StatusCode::BAD_GATEWAY,
            ErrorCode::IdentityServiceFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::ClientClosedRequest => client_closed_request(),
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::UnknownApp => "UNKNOWN_APP",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::UpstreamStatus => "UPSTREAM_STATUS",
            ErrorCode::IdentityServiceFailed => "IDENTITY_SERVICE_FAILED",
            ErrorCode::ClientClosedRequest => "CLIENT_CLOSED_REQUEST",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Non-standard 499, used for aborted sessions
fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: status.as_u16(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with the error header and the code's default status
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<ResponseBody> {
    json_error_response_with_status(code, code.status_code(), message)
}

pub fn json_error_response_with_status(
    code: ErrorCode,
    status: StatusCode,
    message: impl Into<String>,
) -> Response<ResponseBody> {
    let body = ErrorResponse::new(code, status, message).to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header(ERROR_HEADER, code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode and static headers")
}

/// Error response for a session that was rejected without a redirect
pub fn rejection_response(reason: &Rejection) -> Response<ResponseBody> {
    match reason {
        Rejection::NoUserWorkspace | Rejection::Unauthenticated(_) => {
            json_error_response(ErrorCode::Unauthenticated, "Authentication required")
        }
        Rejection::HttpStatus { status, .. } | Rejection::Status(status) => {
            if *status == 401 {
                return json_error_response(ErrorCode::Unauthenticated, "Authentication required");
            }
            let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
            json_error_response_with_status(
                ErrorCode::UpstreamStatus,
                status,
                "Identity service rejected the request",
            )
        }
        // Detail stays in the logs
        Rejection::Error(_) => {
            json_error_response(ErrorCode::IdentityServiceFailed, "Identity service unavailable")
        }
        Rejection::LoginAction { .. } => {
            json_error_response(ErrorCode::InternalError, "Unresolved login action")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ErrorCode::UnknownApp.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::Unauthenticated.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::IdentityServiceFailed.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(ErrorCode::ClientClosedRequest.status_code().as_u16(), 499);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ErrorCode::UnknownApp, StatusCode::NOT_FOUND, "No app at /nope/");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_APP\""));
        assert!(json.contains("\"message\":\"No app at /nope/\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(ErrorCode::ClientClosedRequest, "Client closed request");
        assert_eq!(response.status().as_u16(), 499);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "application/json");
        assert_eq!(response.headers().get(ERROR_HEADER).unwrap(), "CLIENT_CLOSED_REQUEST");
    }

    #[test]
    fn test_rejection_status_passthrough() {
        let response = rejection_response(&Rejection::Status(403));
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers().get(ERROR_HEADER).unwrap(), "UPSTREAM_STATUS");

        let response = rejection_response(&Rejection::HttpStatus {
            status: 401,
            body: String::new(),
        });
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = rejection_response(&Rejection::NoUserWorkspace);
        assert_eq!(response.headers().get(ERROR_HEADER).unwrap(), "UNAUTHENTICATED");
    }

    #[test]
    fn test_plain_error_is_bad_gateway() {
        let response = rejection_response(&Rejection::from(anyhow::anyhow!("connection refused")));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get(ERROR_HEADER).unwrap(),
            "IDENTITY_SERVICE_FAILED"
        );
    }
}
