//! Error taxonomy for the dev server core and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failures while launching the dev server or waiting for it to become ready
#[derive(Debug, Error)]
pub enum StartupError {
    /// Missing working directory or script name
    #[error("Invalid dev server configuration: {0}")]
    InvalidConfiguration(String),

    /// The package manager could not be executed
    #[error(
        "Failed to start '{program}'. To resolve this:\n\n\
         [1] Ensure that '{program}' is installed and can be found in one of the PATH directories.\n    \
         Current PATH environment variable is: {path}\n    \
         Make sure the executable is in one of those directories, or update your PATH.\n\n\
         [2] See the cause below for further details.\n\n\
         Cause: {source}"
    )]
    LaunchFailure {
        program: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// No local port could be reserved for the dev server
    #[error("Could not find an available local port for the dev server: {0}")]
    PortUnavailable(#[source] std::io::Error),

    /// The marker never appeared, but the process kept running
    #[error(
        "The script '{script}' did not indicate readiness within {} seconds.\n\
         Output on stderr so far:\n{stderr}",
        .timeout.as_secs()
    )]
    ReadinessTimeout {
        script: String,
        timeout: Duration,
        stderr: String,
    },

    /// stdout closed before the marker appeared
    #[error(
        "The script '{script}' exited without indicating that the dev server was listening for requests.\n\
         The error output was: {stderr}"
    )]
    ProcessExitedEarly { script: String, stderr: String },

    /// The startup task panicked or was cancelled
    #[error("Dev server startup was aborted: {0}")]
    Aborted(String),
}

/// Failures of a single readiness wait on an output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("timed out after {} ms waiting for a match", .0.as_millis())]
    Timeout(Duration),
    #[error("stream ended before a match was found")]
    EndOfStream,
    #[error("another match is already pending on this stream")]
    AlreadyWaiting,
}

/// Failures observed by a single gated request
#[derive(Debug, Clone, Error)]
pub enum GateError {
    #[error(
        "The dev server did not start listening for requests within the timeout period of {} seconds. \
         Check the log output for error information.",
        .timeout.as_secs()
    )]
    RequestTimeout { timeout: Duration },

    #[error("{0}")]
    Startup(Arc<StartupError>),
}

impl GateError {
    /// The error code to report for this failure
    pub fn code(&self) -> GateErrorCode {
        match self {
            GateError::RequestTimeout { .. } => GateErrorCode::RequestTimeout,
            GateError::Startup(_) => GateErrorCode::DevServerStartFailed,
        }
    }
}

/// Error codes for gate and proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateErrorCode {
    /// Request timed out waiting for the dev server to start
    RequestTimeout,
    /// The dev server failed to start
    DevServerStartFailed,
    /// Failed to connect to the dev server
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl GateErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GateErrorCode::DevServerStartFailed => StatusCode::BAD_GATEWAY,
            GateErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            GateErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Devgate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GateErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GateErrorCode::DevServerStartFailed => "DEV_SERVER_START_FAILED",
            GateErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            GateErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GateErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GateErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
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

/// Create a JSON error response with X-Devgate-Error header
pub fn json_error_response(
    code: GateErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Devgate-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            GateErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GateErrorCode::DevServerStartFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GateErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(GateErrorCode::RequestTimeout, "too slow");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"REQUEST_TIMEOUT\""));
        assert!(json.contains("\"message\":\"too slow\""));
        assert!(json.contains("\"status\":504"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(GateErrorCode::DevServerStartFailed, "boom");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Devgate-Error").unwrap(),
            "DEV_SERVER_START_FAILED"
        );
    }

    #[test]
    fn test_exited_early_message_contains_stderr() {
        let err = StartupError::ProcessExitedEarly {
            script: "start".to_string(),
            stderr: "npm ERR! missing script: start\n".to_string(),
        };
        let message = err.to_string();

        assert!(message.contains("'start'"));
        assert!(message.contains("exited without indicating"));
        assert!(message.contains("npm ERR! missing script: start\n"));
    }

    #[test]
    fn test_request_timeout_message_points_at_logs() {
        let err = GateError::RequestTimeout {
            timeout: Duration::from_secs(30),
        };

        assert_eq!(err.code(), GateErrorCode::RequestTimeout);
        let message = err.to_string();
        assert!(message.contains("30 seconds"));
        assert!(message.contains("log output"));
    }

    #[test]
    fn test_launch_failure_has_remediation_and_cause() {
        let err = StartupError::LaunchFailure {
            program: "npm".to_string(),
            path: "/usr/bin".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file"),
        };
        let message = err.to_string();

        assert!(message.contains("Ensure that 'npm' is installed"));
        assert!(message.contains("/usr/bin"));
        assert!(message.contains("No such file"));
    }
}
