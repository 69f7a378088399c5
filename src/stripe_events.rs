//! Stripe webhook payloads: signature verification and the slice of the event
//! schema the booking flow reads.
//!
//! Verification is done by hand over the raw body rather than through
//! `stripe::Webhook::construct_event`, whose typed `Event` rejects payloads
//! from API versions newer than the crate. Only the fields below are parsed.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::bookings::parse_slot;
use crate::error::BookingError;

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance between the signed timestamp and our clock
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Marker stored in session metadata so unrelated sessions are never booked
pub const BOOKING_TYPE_COURSE: &str = "course_booking";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is malformed")]
    MalformedHeader,
    #[error("signature header has no timestamp")]
    MissingTimestamp,
    #[error("signature header has no v1 signatures")]
    NoSignatures,
    #[error("timestamp is outside the tolerance window")]
    TimestampOutsideTolerance,
    #[error("no signature matches the payload")]
    Mismatch,
}

impl From<SignatureError> for BookingError {
    fn from(err: SignatureError) -> Self {
        BookingError::Unauthorized(err.to_string())
    }
}

/// Verify a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=<hex>...]`)
/// against the exact request bytes.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now_unix: i64,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        let (key, value) = part
            .trim()
            .split_once('=')
            .ok_or(SignatureError::MalformedHeader)?;
        match key {
            "t" => {
                timestamp = Some(value.parse().map_err(|_| SignatureError::MalformedHeader)?);
            }
            // Undecodable v1 entries can never match, skip them
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
    if signatures.is_empty() {
        return Err(SignatureError::NoSignatures);
    }
    // `t` is attacker-controlled until the MAC checks out
    if now_unix.abs_diff(timestamp) > tolerance_secs.unsigned_abs() {
        return Err(SignatureError::TimestampOutsideTolerance);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::MalformedHeader)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    // verify_slice compares in constant time
    let matched = signatures
        .iter()
        .any(|candidate| mac.clone().verify_slice(candidate).is_ok());
    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Compute the header value Stripe would send for `payload`
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> Result<String, BookingError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BookingError::Internal(format!("invalid webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let signature = hex::encode(mac.finalize().into_bytes());
    Ok(format!("t={},v1={}", timestamp, signature))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    CheckoutSessionCompleted,
    CheckoutSessionAsyncPaymentSucceeded,
    CheckoutSessionAsyncPaymentFailed,
    CheckoutSessionExpired,
    PaymentIntentFailed,
    Other(String),
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => EventKind::CheckoutSessionCompleted,
            "checkout.session.async_payment_succeeded" => {
                EventKind::CheckoutSessionAsyncPaymentSucceeded
            }
            "checkout.session.async_payment_failed" => EventKind::CheckoutSessionAsyncPaymentFailed,
            "checkout.session.expired" => EventKind::CheckoutSessionExpired,
            "payment_intent.payment_failed" => EventKind::PaymentIntentFailed,
            other => EventKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: GatewayEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEventData {
    pub object: serde_json::Value,
}

impl GatewayEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, BookingError> {
        serde_json::from_slice(payload)
            .map_err(|e| BookingError::UnprocessableEvent(format!("malformed event body: {}", e)))
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    pub fn checkout_session(&self) -> Result<CheckoutSessionObject, BookingError> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BookingError::UnprocessableEvent(format!("malformed checkout session: {}", e))
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    /// A payment intent id, or the expanded object
    #[serde(default)]
    pub payment_intent: Option<serde_json::Value>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSessionObject {
    pub fn is_paid(&self) -> bool {
        self.payment_status.as_deref() == Some("paid")
    }

    pub fn payment_intent_id(&self) -> Option<String> {
        match self.payment_intent.as_ref()? {
            serde_json::Value::String(id) => Some(id.clone()),
            serde_json::Value::Object(obj) => obj.get("id")?.as_str().map(str::to_string),
            _ => None,
        }
    }

    /// Reference stored on the booking: the payment intent, else the session
    pub fn payment_reference(&self) -> String {
        self.payment_intent_id().unwrap_or_else(|| self.id.clone())
    }
}

/// Booking details carried through the checkout session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingMetadata {
    pub course_id: Uuid,
    pub slot_at: DateTime<Utc>,
    pub user_id: Uuid,
}

impl BookingMetadata {
    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("course_id".to_string(), self.course_id.to_string()),
            ("slot_at".to_string(), self.slot_at.to_rfc3339()),
            ("user_id".to_string(), self.user_id.to_string()),
            ("booking_type".to_string(), BOOKING_TYPE_COURSE.to_string()),
        ])
    }

    /// Every field must be present and well-typed; anything else fails closed.
    pub fn from_map(metadata: &HashMap<String, String>) -> Result<Self, BookingError> {
        let field = |key: &str| {
            metadata
                .get(key)
                .map(String::as_str)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| BookingError::UnprocessableEvent(format!("metadata missing {}", key)))
        };

        let booking_type = field("booking_type")?;
        if booking_type != BOOKING_TYPE_COURSE {
            return Err(BookingError::UnprocessableEvent(format!(
                "unexpected booking_type '{}'",
                booking_type
            )));
        }

        let course_id = field("course_id")?
            .parse::<Uuid>()
            .map_err(|_| BookingError::UnprocessableEvent("course_id is not a UUID".into()))?;
        let user_id = field("user_id")?
            .parse::<Uuid>()
            .map_err(|_| BookingError::UnprocessableEvent("user_id is not a UUID".into()))?;
        let slot_at = parse_slot(field("slot_at")?)
            .map_err(|_| BookingError::UnprocessableEvent("slot_at is not RFC 3339".into()))?;

        Ok(Self {
            course_id,
            slot_at,
            user_id,
        })
    }
}
