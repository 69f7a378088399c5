use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::actions::json_error;

/// Failure kinds surfaced by the booking components.
///
/// Every component returns this type so callers must decide what to do with
/// each kind; `Internal` is reserved for faults nobody can act on.
#[derive(Debug, Error)]
pub enum BookingError {
    #[error("{0}")]
    Validation(String),
    /// Webhook metadata that failed the fail-closed checks
    #[error("unprocessable event: {0}")]
    UnprocessableEvent(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Forbidden(String),
    /// No seat left for the course slot
    #[error("course is fully booked")]
    CourseFull,
    #[error("{0}")]
    Conflict(String),
    #[error("invalid webhook signature: {0}")]
    Unauthorized(String),
    #[error("payment gateway error: {0}")]
    ExternalService(String),
    #[error("store unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BookingError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BookingError::Validation(_) => StatusCode::BAD_REQUEST,
            BookingError::UnprocessableEvent(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BookingError::NotFound(_) => StatusCode::NOT_FOUND,
            BookingError::Forbidden(_) => StatusCode::FORBIDDEN,
            BookingError::CourseFull | BookingError::Conflict(_) => StatusCode::CONFLICT,
            BookingError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            BookingError::ExternalService(_) => StatusCode::BAD_GATEWAY,
            BookingError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BookingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the gateway should redeliver a webhook that failed with this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BookingError::ServiceUnavailable(_) | BookingError::Internal(_)
        )
    }
}

impl From<diesel::result::Error> for BookingError {
    fn from(err: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};

        match err {
            Error::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
                BookingError::ServiceUnavailable(info.message().to_string())
            }
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                BookingError::Conflict(info.message().to_string())
            }
            Error::NotFound => BookingError::NotFound("record"),
            other => BookingError::Internal(other.to_string()),
        }
    }
}

impl From<r2d2::Error> for BookingError {
    fn from(err: r2d2::Error) -> Self {
        BookingError::ServiceUnavailable(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BookingError {
    fn from(err: tokio::task::JoinError) -> Self {
        BookingError::Internal(err.to_string())
    }
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal details stay in the logs
        let message = match &self {
            BookingError::Internal(_) => "Internal server error".to_string(),
            BookingError::ServiceUnavailable(_) => "Service temporarily unavailable".to_string(),
            other => other.to_string(),
        };
        json_error(status, &message).into_response()
    }
}
