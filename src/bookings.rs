use chrono::{DateTime, SubsecRound, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BookingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::BookingStatus")]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    #[db_enum(rename = "pending")]
    Pending,
    #[db_enum(rename = "confirmed")]
    Confirmed,
    #[db_enum(rename = "cancelled")]
    Cancelled,
    #[db_enum(rename = "completed")]
    Completed,
}

/// Statuses that occupy a seat when the capacity is re-checked in a transaction.
pub const SEAT_HOLDING_STATUSES: [BookingStatus; 2] =
    [BookingStatus::Confirmed, BookingStatus::Pending];

impl BookingStatus {
    /// Bookings only move forward; cancelled and completed are terminal.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
        )
    }

    pub fn holds_seat(self) -> bool {
        SEAT_HOLDING_STATUSES.contains(&self)
    }
}

impl std::str::FromStr for BookingStatus {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            other => Err(BookingError::Validation(format!(
                "Invalid booking status '{}'. Must be: pending, confirmed, cancelled, or completed",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::PaymentStatus")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[db_enum(rename = "pending")]
    Pending,
    #[db_enum(rename = "paid")]
    Paid,
    #[db_enum(rename = "failed")]
    Failed,
    #[db_enum(rename = "refunded")]
    Refunded,
}

impl std::str::FromStr for PaymentStatus {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(BookingError::Validation(format!(
                "Invalid payment status '{}'. Must be: pending, paid, failed, or refunded",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::bookings)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Booking {
    pub id: Uuid,
    pub course_id: Uuid,
    pub user_id: Uuid,
    pub slot_at: DateTime<Utc>,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub payment_reference: Option<String>,
    pub amount_cents: i32,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::bookings)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewBooking {
    pub course_id: Uuid,
    pub user_id: Uuid,
    pub slot_at: DateTime<Utc>,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub payment_reference: Option<String>,
    pub amount_cents: i32,
    pub currency: String,
}

/// Result of a capacity-checked confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Created(Booking),
    /// An existing pending booking for the same user and slot was confirmed
    Promoted(Booking),
    /// The user already holds a confirmed booking for this slot
    AlreadyConfirmed(Booking),
}

impl ConfirmOutcome {
    pub fn booking(&self) -> &Booking {
        match self {
            ConfirmOutcome::Created(b)
            | ConfirmOutcome::Promoted(b)
            | ConfirmOutcome::AlreadyConfirmed(b) => b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmPlan {
    Insert,
    Promote(Uuid),
    AlreadyConfirmed(Booking),
}

/// Decide what a confirmation does once the course row is locked.
///
/// `existing` is the user's seat-holding booking for the slot, if any, and
/// `occupied` counts every seat-holding booking for the slot including it.
pub fn plan_confirmation(
    existing: Option<&Booking>,
    occupied: i64,
    capacity: i32,
) -> Result<ConfirmPlan, BookingError> {
    let capacity = i64::from(capacity);
    match existing {
        Some(booking) if booking.status == BookingStatus::Confirmed => {
            Ok(ConfirmPlan::AlreadyConfirmed(booking.clone()))
        }
        Some(booking) => {
            if occupied - 1 >= capacity {
                return Err(BookingError::CourseFull);
            }
            Ok(ConfirmPlan::Promote(booking.id))
        }
        None => {
            if occupied >= capacity {
                return Err(BookingError::CourseFull);
            }
            Ok(ConfirmPlan::Insert)
        }
    }
}

/// Slots are compared exactly, so drop sub-second precision everywhere.
pub fn normalize_slot(slot_at: DateTime<Utc>) -> DateTime<Utc> {
    slot_at.trunc_subsecs(0)
}

pub fn parse_slot(raw: &str) -> Result<DateTime<Utc>, BookingError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| normalize_slot(dt.with_timezone(&Utc)))
        .map_err(|e| BookingError::Validation(format!("Invalid slot timestamp '{}': {}", raw, e)))
}
