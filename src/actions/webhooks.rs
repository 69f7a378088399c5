use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::reconciler::ReconcileOutcome;
use crate::web::AppState;

use super::json_error;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Acknowledgement body. Any 2xx stops the gateway from retrying.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<String>,
}

impl From<&ReconcileOutcome> for WebhookAck {
    fn from(outcome: &ReconcileOutcome) -> Self {
        let booking_id = match outcome {
            ReconcileOutcome::Confirmed(booking) | ReconcileOutcome::Promoted(booking) => {
                Some(booking.id.to_string())
            }
            ReconcileOutcome::Duplicate { booking_id } => Some(booking_id.to_string()),
            _ => None,
        };
        Self {
            received: true,
            outcome: outcome.label(),
            booking_id,
        }
    }
}

/// POST /stripe/webhooks
/// The body is taken as raw bytes: the signature covers the exact payload.
pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(reconciler) = &state.reconciler else {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "Stripe is not configured")
            .into_response();
    };

    metrics::counter!("bookings.webhook.received").increment(1);
    let start = std::time::Instant::now();

    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        warn!("Webhook without a readable Stripe-Signature header");
        metrics::counter!("bookings.webhook.signature_invalid").increment(1);
        return json_error(StatusCode::UNAUTHORIZED, "Missing Stripe-Signature header")
            .into_response();
    };

    let result = reconciler.handle(&body, signature, Utc::now()).await;

    metrics::histogram!("bookings.webhook.processing_ms")
        .record(start.elapsed().as_millis() as f64);

    match result {
        Ok(outcome) => {
            info!(outcome = outcome.label(), "Webhook processed");
            (StatusCode::OK, Json(WebhookAck::from(&outcome))).into_response()
        }
        Err(e) => {
            metrics::counter!("bookings.webhook.failed").increment(1);
            if e.is_transient() {
                error!(error = %e, "Webhook processing failed, gateway will retry");
            } else {
                warn!(error = %e, "Webhook rejected");
            }
            e.into_response()
        }
    }
}
