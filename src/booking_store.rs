use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::bookings::{Booking, BookingStatus, ConfirmOutcome, NewBooking};
use crate::courses::{Course, NewCourse};
use crate::error::BookingError;
use crate::users::{NewUser, User};
use crate::webhook_events::NewWebhookEvent;

/// Relational store used by the booking flow.
///
/// Implementations are constructed once at start-up and shared behind an
/// `Arc`; nothing reaches for a global connection.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, BookingError>;

    async fn create_user(&self, new_user: NewUser) -> Result<User, BookingError>;

    async fn get_course(&self, course_id: Uuid) -> Result<Option<Course>, BookingError>;

    async fn list_courses(&self) -> Result<Vec<Course>, BookingError>;

    async fn create_course(&self, new_course: NewCourse) -> Result<Course, BookingError>;

    /// Count CONFIRMED bookings for one course slot (no locking)
    async fn count_confirmed(
        &self,
        course_id: Uuid,
        slot_at: DateTime<Utc>,
    ) -> Result<i64, BookingError>;

    /// The user's PENDING or CONFIRMED booking for a course slot, if any
    async fn find_active_booking(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        slot_at: DateTime<Utc>,
    ) -> Result<Option<Booking>, BookingError>;

    async fn get_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, BookingError>;

    async fn list_bookings_for_user(&self, user_id: Uuid) -> Result<Vec<Booking>, BookingError>;

    async fn list_bookings_for_course(
        &self,
        course_id: Uuid,
        slot_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<Booking>, BookingError>;

    /// Insert a booking without a capacity check. Only for non-confirmed rows.
    async fn insert_booking(&self, new_booking: NewBooking) -> Result<Booking, BookingError>;

    /// Atomically re-check capacity and create (or promote) a confirmed booking.
    ///
    /// Fails with `CourseFull` when the slot is full; nothing is written then.
    async fn confirm_booking(&self, new_booking: NewBooking)
    -> Result<ConfirmOutcome, BookingError>;

    /// Apply a forward-only status transition. Moving to CONFIRMED re-checks
    /// capacity under the same lock as `confirm_booking`.
    async fn update_booking_status(
        &self,
        booking_id: Uuid,
        status: BookingStatus,
    ) -> Result<Booking, BookingError>;

    /// Whether a gateway event was already handled to completion
    async fn is_event_processed(&self, gateway_event_id: &str) -> Result<bool, BookingError>;

    /// Record a gateway event. Returns false when it was already recorded.
    async fn record_event(&self, new_event: NewWebhookEvent) -> Result<bool, BookingError>;

    async fn mark_event_processed(&self, gateway_event_id: &str) -> Result<(), BookingError>;

    /// Mark an event as handled with a terminal error
    async fn mark_event_failed(
        &self,
        gateway_event_id: &str,
        error: &str,
    ) -> Result<(), BookingError>;
}
