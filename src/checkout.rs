use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::availability::AvailabilityChecker;
use crate::booking_store::BookingStore;
use crate::bookings::normalize_slot;
use crate::error::BookingError;
use crate::payment_gateway::{CheckoutSessionRequest, PaymentGateway};
use crate::stripe_events::BookingMetadata;
use crate::users::User;

pub const DEFAULT_SESSION_TTL_MINUTES: i64 = 30;

#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    /// Public site URL used for the gateway's success/cancel redirects
    pub base_url: String,
    pub session_ttl: Duration,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            session_ttl: Duration::minutes(DEFAULT_SESSION_TTL_MINUTES),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub course_id: Uuid,
    pub slot_at: DateTime<Utc>,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSessionRef {
    pub session_id: String,
    pub redirect_url: String,
    pub amount_cents: i32,
    pub currency: String,
    pub expires_at: DateTime<Utc>,
}

/// Opens a payment session for a course slot. Writes nothing locally: the
/// booking only exists once the gateway reports the payment.
#[derive(Clone)]
pub struct CheckoutInitiator {
    store: Arc<dyn BookingStore>,
    gateway: Arc<dyn PaymentGateway>,
    availability: AvailabilityChecker,
    settings: CheckoutSettings,
}

impl CheckoutInitiator {
    pub fn new(
        store: Arc<dyn BookingStore>,
        gateway: Arc<dyn PaymentGateway>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            availability: AvailabilityChecker::new(store.clone()),
            store,
            gateway,
            settings,
        }
    }

    pub async fn initiate(
        &self,
        caller: &User,
        request: CheckoutRequest,
        now: DateTime<Utc>,
    ) -> Result<CheckoutSessionRef, BookingError> {
        if caller.id != request.user_id {
            return Err(BookingError::Forbidden(
                "You can only book for yourself".to_string(),
            ));
        }

        let course = self
            .store
            .get_course(request.course_id)
            .await?
            .ok_or(BookingError::NotFound("course"))?;

        let slot_at = normalize_slot(request.slot_at);
        let availability = self.availability.check_course(&course, slot_at, now).await?;
        if !availability.has_capacity {
            info!(
                course_id = %course.id,
                slot_at = %slot_at,
                confirmed = availability.confirmed,
                "Checkout refused, course full"
            );
            return Err(BookingError::CourseFull);
        }

        let metadata = BookingMetadata {
            course_id: course.id,
            slot_at,
            user_id: caller.id,
        };
        let expires_at = now + self.settings.session_ttl;
        let base_url = self.settings.base_url.trim_end_matches('/');

        let session_request = CheckoutSessionRequest {
            // Always the catalog price, whatever the client believes it is
            amount_cents: i64::from(course.price_cents),
            currency: course.currency.clone(),
            product_name: format!("{} ({})", course.title, slot_at.format("%Y-%m-%d %H:%M UTC")),
            metadata: metadata.to_map(),
            success_url: format!("{}/bookings/success?session_id={{CHECKOUT_SESSION_ID}}", base_url),
            cancel_url: format!("{}/courses/{}?checkout=cancelled", base_url, course.id),
            expires_at,
            client_reference_id: caller.id.to_string(),
            customer_email: Some(caller.email.clone()),
        };

        let handle = self
            .gateway
            .create_checkout_session(session_request)
            .await
            .map_err(|e| {
                error!(course_id = %course.id, error = %e, "Failed to open checkout session");
                BookingError::from(e)
            })?;

        metrics::counter!("bookings.checkout.created").increment(1);
        info!(
            session_id = %handle.session_id,
            course_id = %course.id,
            user_id = %caller.id,
            slot_at = %slot_at,
            "Opened checkout session"
        );

        Ok(CheckoutSessionRef {
            session_id: handle.session_id,
            redirect_url: handle.redirect_url,
            amount_cents: course.price_cents,
            currency: course.currency,
            expires_at,
        })
    }
}
