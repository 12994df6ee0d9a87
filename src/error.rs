//! Error handling.

use axum::{
    extract::rejection::JsonRejection,
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use ndarray::ShapeError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;
use tokio::sync::AcquireError;
use tracing::{event, Level};
use uuid::Uuid;

/// Cubeflow error type
///
/// This type encapsulates the various errors that may occur while planning, dispatching and
/// recombining chunked requests. Each variant may result in a different API error response.
#[derive(Debug, Error)]
pub enum CubeflowError {
    /// A worker reported a failure for one chunk
    #[error("processing of chunk {chunk} failed: {message}")]
    ChunkProcessing { chunk: String, message: String },

    /// The dispatch queue has been shut down
    #[error("dispatch queue is closed")]
    DispatchQueueClosed,

    /// A request with the same identity has already been inserted
    #[error("request with identity {identity} already exists")]
    DuplicateRequest { identity: String },

    /// Non-positive chunk, window or bin size, or otherwise unusable argument
    #[error("invalid {name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// Malformed or inverted coordinate or time range
    #[error("invalid range: {reason}")]
    InvalidRange { reason: String },

    /// Error reading or writing a result artifact
    #[error("failed to access result artifact")]
    Io(#[from] std::io::Error),

    /// Operation of the abstract request contract that was not specialised
    #[error("{operation} is not implemented for request kind {kind}")]
    NotImplemented {
        operation: &'static str,
        kind: String,
    },

    /// Error deserialising request data
    #[error("request data is not valid")]
    RequestDataJsonRejection(#[from] JsonRejection),

    /// Error validating request data
    #[error("request data is not valid")]
    RequestDataValidation(#[from] validator::ValidationErrors),

    /// No request record with the given id
    #[error("request {id} not found")]
    RequestNotFound { id: Uuid },

    /// Error acquiring a semaphore
    #[error("error acquiring resources")]
    SemaphoreAcquireError(#[from] AcquireError),

    /// Error (de)serialising a record or artifact
    #[error("failed to serialise data")]
    Serialization(#[from] serde_json::Error),

    /// Error creating an ndarray array from a shape
    #[error("failed to create array from shape")]
    ShapeInvalid(#[from] ShapeError),

    /// Chunk outputs that cannot be recombined
    #[error("chunk outputs cannot be recombined: {reason}")]
    ShapeMismatch { reason: String },

    /// Error in the request store
    #[error("error accessing request store")]
    Storage(#[from] sled::Error),

    /// A spawned chunk worker panicked or was aborted
    #[error("chunk worker task failed")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),

    /// No application registered under the given id
    #[error("unknown application {application}")]
    UnknownApplication { application: String },
}

impl CubeflowError {
    /// Convenience constructor for [CubeflowError::InvalidArgument].
    pub fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [CubeflowError::InvalidRange].
    pub fn invalid_range(reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [CubeflowError::ShapeMismatch].
    pub fn shape_mismatch(reason: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            reason: reason.into(),
        }
    }
}

impl IntoResponse for CubeflowError {
    /// Convert from a `CubeflowError` into an [axum::response::Response].
    fn into_response(self) -> Response {
        ErrorResponse::from(self).into_response()
    }
}

/// Body of error response
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorBody {
    /// Main error message
    message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    caused_by: Option<Vec<String>>,
}

impl ErrorBody {
    /// Return a new ErrorBody, walking the chain of error sources.
    fn new<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        let message = error.to_string();
        let mut causes = Vec::new();
        let mut current = error.source();
        while let Some(source) = current {
            causes.push(source.to_string());
            current = source.source();
        }
        causes.dedup();
        let caused_by = (!causes.is_empty()).then_some(causes);
        ErrorBody { message, caused_by }
    }
}

/// A response to send in error cases
#[derive(Deserialize, Serialize)]
struct ErrorResponse {
    /// HTTP status of the response
    #[serde(skip)]
    status: StatusCode,

    /// Response body
    error: ErrorBody,
}

impl ErrorResponse {
    fn new<E>(status: StatusCode, error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        ErrorResponse {
            status,
            error: ErrorBody::new(error),
        }
    }
}

impl From<CubeflowError> for ErrorResponse {
    /// Convert from a `CubeflowError` into an `ErrorResponse`.
    fn from(error: CubeflowError) -> Self {
        let status = match &error {
            CubeflowError::InvalidArgument { .. }
            | CubeflowError::InvalidRange { .. }
            | CubeflowError::RequestDataJsonRejection(_)
            | CubeflowError::RequestDataValidation(_)
            | CubeflowError::ShapeInvalid(_)
            | CubeflowError::ShapeMismatch { .. } => StatusCode::BAD_REQUEST,

            CubeflowError::RequestNotFound { .. } | CubeflowError::UnknownApplication { .. } => {
                StatusCode::NOT_FOUND
            }

            // Identity conflicts are resolved inside get_or_create; seeing one here is a bug.
            CubeflowError::DuplicateRequest { .. } => StatusCode::CONFLICT,

            CubeflowError::ChunkProcessing { .. }
            | CubeflowError::DispatchQueueClosed
            | CubeflowError::Io(_)
            | CubeflowError::NotImplemented { .. }
            | CubeflowError::SemaphoreAcquireError(_)
            | CubeflowError::Serialization(_)
            | CubeflowError::Storage(_)
            | CubeflowError::TaskJoin(_)
            | CubeflowError::TryFromInt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let response = Self::new(status, &error);

        // Log server errors.
        if response.status.is_server_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        response
    }
}

impl IntoResponse for ErrorResponse {
    /// Convert from an `ErrorResponse` into an `axum::response::Response`.
    ///
    /// Renders the response as JSON.
    fn into_response(self) -> Response {
        match serde_json::to_string_pretty(&self) {
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialise error response: {}", err),
            )
                .into_response(),
            Ok(json_body) => (
                self.status,
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                json_body,
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use hyper::HeaderMap;

    // Jump through the hoops to get the body as a string.
    async fn body_string(response: Response) -> String {
        String::from_utf8(
            hyper::body::to_bytes(response.into_body())
                .await
                .unwrap()
                .to_vec(),
        )
        .unwrap()
    }

    async fn test_cubeflow_error(
        error: CubeflowError,
        status: StatusCode,
        message: &str,
        caused_by: Option<Vec<&'static str>>,
    ) {
        let response = error.into_response();
        assert_eq!(status, response.status());
        let mut headers = HeaderMap::new();
        headers.insert(&header::CONTENT_TYPE, "application/json".parse().unwrap());
        assert_eq!(headers, *response.headers());
        let error_response: ErrorResponse =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(message.to_string(), error_response.error.message);
        let caused_by = caused_by.map(|cb| cb.iter().map(|s| s.to_string()).collect());
        assert_eq!(caused_by, error_response.error.caused_by);
    }

    #[tokio::test]
    async fn invalid_range() {
        let error = CubeflowError::invalid_range("minimum 1 is not less than maximum -1");
        let message = "invalid range: minimum 1 is not less than maximum -1";
        test_cubeflow_error(error, StatusCode::BAD_REQUEST, message, None).await;
    }

    #[tokio::test]
    async fn invalid_argument() {
        let error = CubeflowError::invalid_argument("window length", "must be greater than 0");
        let message = "invalid window length: must be greater than 0";
        test_cubeflow_error(error, StatusCode::BAD_REQUEST, message, None).await;
    }

    #[tokio::test]
    async fn shape_mismatch() {
        let error = CubeflowError::shape_mismatch("longitude axes differ");
        let message = "chunk outputs cannot be recombined: longitude axes differ";
        test_cubeflow_error(error, StatusCode::BAD_REQUEST, message, None).await;
    }

    #[tokio::test]
    async fn shape_invalid() {
        let error =
            CubeflowError::ShapeInvalid(ShapeError::from_kind(ndarray::ErrorKind::OutOfBounds));
        let message = "failed to create array from shape";
        let caused_by = Some(vec!["ShapeError/OutOfBounds: out of bounds indexing"]);
        test_cubeflow_error(error, StatusCode::BAD_REQUEST, message, caused_by).await;
    }

    #[tokio::test]
    async fn request_not_found() {
        let id = Uuid::nil();
        let error = CubeflowError::RequestNotFound { id };
        let message = "request 00000000-0000-0000-0000-000000000000 not found";
        test_cubeflow_error(error, StatusCode::NOT_FOUND, message, None).await;
    }

    #[tokio::test]
    async fn unknown_application() {
        let error = CubeflowError::UnknownApplication {
            application: "slip".to_string(),
        };
        let message = "unknown application slip";
        test_cubeflow_error(error, StatusCode::NOT_FOUND, message, None).await;
    }

    #[tokio::test]
    async fn request_data_validation() {
        let mut validation_errors = validator::ValidationErrors::new();
        let validation_error = validator::ValidationError::new("foo");
        validation_errors.add("bar", validation_error);
        let error = CubeflowError::RequestDataValidation(validation_errors);
        let message = "request data is not valid";
        let caused_by = Some(vec!["bar: Validation error: foo [{}]"]);
        test_cubeflow_error(error, StatusCode::BAD_REQUEST, message, caused_by).await;
    }

    #[tokio::test]
    async fn not_implemented() {
        let error = CubeflowError::NotImplemented {
            operation: "derive_product",
            kind: "base".to_string(),
        };
        let message = "derive_product is not implemented for request kind base";
        test_cubeflow_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, None).await;
    }

    #[tokio::test]
    async fn io_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read only");
        let error = CubeflowError::Io(io_error);
        let message = "failed to access result artifact";
        let caused_by = Some(vec!["read only"]);
        test_cubeflow_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, caused_by).await;
    }

    #[tokio::test]
    async fn semaphore_acquire_error() {
        let sem = tokio::sync::Semaphore::new(1);
        sem.close();
        let error = CubeflowError::SemaphoreAcquireError(sem.acquire().await.unwrap_err());
        let message = "error acquiring resources";
        let caused_by = Some(vec!["semaphore closed"]);
        test_cubeflow_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, caused_by).await;
    }

    #[tokio::test]
    async fn try_from_int_error() {
        let error = CubeflowError::TryFromInt(u8::try_from(-1_i8).unwrap_err());
        let message = "out of range integral type conversion attempted";
        test_cubeflow_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, None).await;
    }
}
