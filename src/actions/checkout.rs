use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::auth::AuthUser;
use crate::checkout::{CheckoutRequest, CheckoutSessionRef};
use crate::web::AppState;

use super::{DataResponse, json_error};

/// Response for checkout session creation
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub session_id: String,
    pub checkout_url: String,
    pub amount_cents: i32,
    pub currency: String,
    pub expires_at: String,
}

impl From<CheckoutSessionRef> for CheckoutResponse {
    fn from(session: CheckoutSessionRef) -> Self {
        Self {
            session_id: session.session_id,
            checkout_url: session.redirect_url,
            amount_cents: session.amount_cents,
            currency: session.currency,
            expires_at: session.expires_at.to_rfc3339(),
        }
    }
}

/// POST /checkout
/// Open a payment session for a course slot. The client redirects to the
/// returned URL; the booking is created when the payment webhook arrives.
pub async fn create_checkout(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> impl IntoResponse {
    let Some(checkout) = &state.checkout else {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "Stripe is not configured")
            .into_response();
    };

    match checkout.initiate(&user, request, Utc::now()).await {
        Ok(session) => (
            StatusCode::CREATED,
            Json(DataResponse {
                data: CheckoutResponse::from(session),
            }),
        )
            .into_response(),
        Err(e) => {
            warn!(user_id = %user.id, error = %e, "Checkout refused");
            e.into_response()
        }
    }
}
