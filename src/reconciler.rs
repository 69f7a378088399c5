use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::booking_store::BookingStore;
use crate::bookings::{Booking, BookingStatus, ConfirmOutcome, NewBooking, PaymentStatus};
use crate::error::BookingError;
use crate::stripe_events::{
    BookingMetadata, CheckoutSessionObject, DEFAULT_TOLERANCE_SECS, EventKind, GatewayEvent,
    verify_signature,
};
use crate::webhook_events::NewWebhookEvent;

#[derive(Clone)]
pub struct ReconcilerSettings {
    pub webhook_secret: String,
    pub tolerance_secs: i64,
}

impl ReconcilerSettings {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }
}

impl std::fmt::Debug for ReconcilerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcilerSettings")
            .field("webhook_secret", &"[REDACTED]")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Confirmed(Booking),
    /// A pending booking for the same user and slot became confirmed
    Promoted(Booking),
    /// The user already holds a confirmed booking for the slot
    Duplicate { booking_id: Uuid },
    /// The event id was handled before
    AlreadyProcessed,
    /// Paid, but the slot filled up first. Needs a manual refund.
    CapacityExceeded {
        course_id: Uuid,
        slot_at: DateTime<Utc>,
    },
    Ignored { event_type: String },
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Confirmed(_) => "confirmed",
            ReconcileOutcome::Promoted(_) => "promoted",
            ReconcileOutcome::Duplicate { .. } => "duplicate",
            ReconcileOutcome::AlreadyProcessed => "already_processed",
            ReconcileOutcome::CapacityExceeded { .. } => "capacity_exceeded",
            ReconcileOutcome::Ignored { .. } => "ignored",
        }
    }
}

/// Turns signed gateway events into confirmed bookings.
#[derive(Clone)]
pub struct WebhookReconciler {
    store: Arc<dyn BookingStore>,
    settings: ReconcilerSettings,
}

impl WebhookReconciler {
    pub fn new(store: Arc<dyn BookingStore>, settings: ReconcilerSettings) -> Self {
        Self { store, settings }
    }

    /// Verify and process one delivery. The signature is checked over the
    /// exact bytes before the store is touched.
    pub async fn handle(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, BookingError> {
        if let Err(e) = verify_signature(
            payload,
            signature_header,
            &self.settings.webhook_secret,
            now.timestamp(),
            self.settings.tolerance_secs,
        ) {
            warn!(error = %e, "Invalid webhook signature");
            metrics::counter!("bookings.webhook.signature_invalid").increment(1);
            return Err(e.into());
        }

        let event = GatewayEvent::parse(payload)?;
        let raw_payload = serde_json::from_slice(payload).unwrap_or(serde_json::Value::Null);
        self.reconcile(event, raw_payload).await
    }

    async fn reconcile(
        &self,
        event: GatewayEvent,
        raw_payload: serde_json::Value,
    ) -> Result<ReconcileOutcome, BookingError> {
        if self.store.is_event_processed(&event.id).await? {
            info!(event_id = %event.id, "Webhook event already processed");
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }

        let first_delivery = self
            .store
            .record_event(NewWebhookEvent {
                gateway_event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                payload: raw_payload,
            })
            .await?;
        if !first_delivery {
            info!(event_id = %event.id, "Redelivery of an unfinished webhook event");
        }

        let result = self.dispatch(&event).await;

        // Ledger bookkeeping never changes the response: a redelivery after a
        // lost update is caught by the booking check anyway
        let ledger = match &result {
            Ok(ReconcileOutcome::CapacityExceeded { .. }) => {
                self.store
                    .mark_event_failed(
                        &event.id,
                        "course full at confirmation; payment captured, manual refund required",
                    )
                    .await
            }
            Ok(_) => self.store.mark_event_processed(&event.id).await,
            Err(e) if !e.is_transient() => {
                self.store.mark_event_failed(&event.id, &e.to_string()).await
            }
            // Left unprocessed so the gateway's retry runs it again
            Err(_) => Ok(()),
        };
        if let Err(e) = ledger {
            error!(event_id = %event.id, error = %e, "Failed to update webhook ledger");
        }

        result
    }

    async fn dispatch(&self, event: &GatewayEvent) -> Result<ReconcileOutcome, BookingError> {
        let ignored = || ReconcileOutcome::Ignored {
            event_type: event.event_type.clone(),
        };

        match event.kind() {
            EventKind::CheckoutSessionCompleted => {
                let session = event.checkout_session()?;
                if !session.is_paid() {
                    // Delayed payment methods finish with async_payment_succeeded
                    info!(
                        session_id = %session.id,
                        payment_status = ?session.payment_status,
                        "Checkout completed without payment yet"
                    );
                    return Ok(ignored());
                }
                self.confirm(&session).await
            }
            EventKind::CheckoutSessionAsyncPaymentSucceeded => {
                let session = event.checkout_session()?;
                self.confirm(&session).await
            }
            EventKind::CheckoutSessionExpired | EventKind::CheckoutSessionAsyncPaymentFailed => {
                let session_id = event.checkout_session().map(|s| s.id).unwrap_or_default();
                info!(
                    event_type = %event.event_type,
                    session_id = %session_id,
                    "Checkout session ended without payment"
                );
                Ok(ignored())
            }
            EventKind::PaymentIntentFailed => {
                metrics::counter!("bookings.payments.failed").increment(1);
                warn!(event_id = %event.id, "Payment failed");
                Ok(ignored())
            }
            EventKind::Other(event_type) => {
                info!(event_type = %event_type, "Unhandled webhook event type");
                Ok(ignored())
            }
        }
    }

    /// Create the paid booking for a checkout session.
    ///
    /// An existing CONFIRMED booking for the same user, course and slot makes
    /// the delivery a `Duplicate`. An existing PENDING one is not treated as
    /// already processed: it is promoted to CONFIRMED with the session's
    /// payment details, since the customer has now paid for that seat.
    ///
    /// Amount and currency are taken from the session as charged, never from
    /// the current course price.
    async fn confirm(
        &self,
        session: &CheckoutSessionObject,
    ) -> Result<ReconcileOutcome, BookingError> {
        let metadata = BookingMetadata::from_map(&session.metadata).inspect_err(|e| {
            error!(session_id = %session.id, error = %e, "Rejecting checkout session metadata");
        })?;

        let amount_cents = session
            .amount_total
            .and_then(|amount| i32::try_from(amount).ok())
            .ok_or_else(|| {
                BookingError::UnprocessableEvent("session amount_total missing or invalid".into())
            })?;
        let currency = session
            .currency
            .clone()
            .ok_or_else(|| BookingError::UnprocessableEvent("session currency missing".into()))?;

        if let Some(existing) = self
            .store
            .find_active_booking(metadata.user_id, metadata.course_id, metadata.slot_at)
            .await?
            && existing.status == BookingStatus::Confirmed
        {
            info!(
                booking_id = %existing.id,
                session_id = %session.id,
                "Booking already confirmed, ignoring duplicate delivery"
            );
            return Ok(ReconcileOutcome::Duplicate {
                booking_id: existing.id,
            });
        }

        let course = self
            .store
            .get_course(metadata.course_id)
            .await?
            .ok_or_else(|| {
                BookingError::UnprocessableEvent(format!(
                    "course {} does not exist",
                    metadata.course_id
                ))
            })?;
        if self.store.get_user(metadata.user_id).await?.is_none() {
            return Err(BookingError::UnprocessableEvent(format!(
                "user {} does not exist",
                metadata.user_id
            )));
        }
        if course.price_cents != amount_cents || course.currency != currency {
            warn!(
                course_id = %course.id,
                session_id = %session.id,
                charged = amount_cents,
                price = course.price_cents,
                "Charged amount differs from the current course price"
            );
        }

        let new_booking = NewBooking {
            course_id: metadata.course_id,
            user_id: metadata.user_id,
            slot_at: metadata.slot_at,
            status: BookingStatus::Confirmed,
            payment_status: PaymentStatus::Paid,
            payment_reference: Some(session.payment_reference()),
            amount_cents,
            currency,
        };

        match self.store.confirm_booking(new_booking).await {
            Ok(ConfirmOutcome::Created(booking)) => {
                metrics::counter!("bookings.confirmed").increment(1);
                info!(
                    booking_id = %booking.id,
                    course_id = %booking.course_id,
                    user_id = %booking.user_id,
                    slot_at = %booking.slot_at,
                    "Booking confirmed"
                );
                Ok(ReconcileOutcome::Confirmed(booking))
            }
            Ok(ConfirmOutcome::Promoted(booking)) => {
                metrics::counter!("bookings.confirmed").increment(1);
                info!(booking_id = %booking.id, "Pending booking confirmed");
                Ok(ReconcileOutcome::Promoted(booking))
            }
            Ok(ConfirmOutcome::AlreadyConfirmed(booking)) => Ok(ReconcileOutcome::Duplicate {
                booking_id: booking.id,
            }),
            Err(BookingError::CourseFull) => {
                alert_capacity_exceeded(&metadata, session);
                Ok(ReconcileOutcome::CapacityExceeded {
                    course_id: metadata.course_id,
                    slot_at: metadata.slot_at,
                })
            }
            // A concurrent write for the same user and slot won the unique
            // index. Nothing was booked; a redelivery re-reads the new row.
            Err(BookingError::Conflict(reason)) => {
                warn!(
                    course_id = %metadata.course_id,
                    user_id = %metadata.user_id,
                    session_id = %session.id,
                    reason = %reason,
                    "Booking write conflicted, leaving event for redelivery"
                );
                Err(BookingError::Internal(format!(
                    "conflicting booking write: {}",
                    reason
                )))
            }
            Err(e) => Err(e),
        }
    }
}

/// The customer has paid for a seat that no longer exists. Someone has to
/// refund by hand.
fn alert_capacity_exceeded(metadata: &BookingMetadata, session: &CheckoutSessionObject) {
    metrics::counter!("bookings.capacity_exceeded").increment(1);
    error!(
        course_id = %metadata.course_id,
        user_id = %metadata.user_id,
        slot_at = %metadata.slot_at,
        session_id = %session.id,
        payment_reference = %session.payment_reference(),
        "Course full after payment, manual refund required"
    );
    sentry::capture_message(
        &format!(
            "Course {} full at {} after payment {} by user {}; refund required",
            metadata.course_id,
            metadata.slot_at,
            session.payment_reference(),
            metadata.user_id
        ),
        sentry::Level::Error,
    );
}
