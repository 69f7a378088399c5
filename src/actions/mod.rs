use axum::{Json, http::StatusCode};
use serde::Serialize;

pub mod bookings;
pub mod checkout;
pub mod courses;
pub mod webhooks;

pub use bookings::*;
pub use checkout::*;
pub use courses::*;
pub use webhooks::*;

/// Envelope for single-item responses
#[derive(Debug, Serialize)]
pub struct DataResponse<T: Serialize> {
    pub data: T,
}

/// Envelope for collection responses
#[derive(Debug, Serialize)]
pub struct DataListResponse<T: Serialize> {
    pub data: Vec<T>,
}

/// Error body shared by every handler: `{"errors": "<message>"}`
pub fn json_error(status: StatusCode, message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "errors": message })))
}
