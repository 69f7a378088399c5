use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

use crate::error::BookingError;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("gateway rejected the request: {0}")]
    Rejected(String),
    #[error("gateway unreachable: {0}")]
    Unreachable(String),
}

impl From<GatewayError> for BookingError {
    fn from(err: GatewayError) -> Self {
        BookingError::ExternalService(err.to_string())
    }
}

/// Everything the gateway needs to open a hosted checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub product_name: String,
    pub metadata: HashMap<String, String>,
    pub success_url: String,
    pub cancel_url: String,
    pub expires_at: DateTime<Utc>,
    pub client_reference_id: String,
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionHandle {
    pub session_id: String,
    pub redirect_url: String,
}

/// External payment provider. Sessions live with the provider; nothing is
/// persisted locally when one is opened.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSessionHandle, GatewayError>;
}
