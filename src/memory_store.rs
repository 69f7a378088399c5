//! In-process store for tests and `serve --in-memory` development runs.
//!
//! A single async mutex guards all tables, and `confirm_booking` holds it from
//! the capacity count through the insert, which gives the same serialisation
//! per course that the Postgres row lock provides.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::booking_store::BookingStore;
use crate::bookings::{
    Booking, BookingStatus, ConfirmOutcome, ConfirmPlan, NewBooking, plan_confirmation,
};
use crate::courses::{Course, NewCourse};
use crate::error::BookingError;
use crate::users::{NewUser, User};
use crate::webhook_events::{NewWebhookEvent, WebhookEventRecord};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    courses: HashMap<Uuid, Course>,
    bookings: Vec<Booking>,
    events: HashMap<String, WebhookEventRecord>,
}

impl Tables {
    fn active_booking(&self, user_id: Uuid, course_id: Uuid, slot_at: DateTime<Utc>) -> Option<&Booking> {
        self.bookings.iter().find(|b| {
            b.user_id == user_id
                && b.course_id == course_id
                && b.slot_at == slot_at
                && b.status.holds_seat()
        })
    }

    fn count_with_status(
        &self,
        course_id: Uuid,
        slot_at: DateTime<Utc>,
        matches: impl Fn(BookingStatus) -> bool,
    ) -> i64 {
        self.bookings
            .iter()
            .filter(|b| b.course_id == course_id && b.slot_at == slot_at && matches(b.status))
            .count() as i64
    }

    fn capacity(&self, course_id: Uuid) -> Result<i32, BookingError> {
        self.courses
            .get(&course_id)
            .map(|c| c.capacity)
            .ok_or(BookingError::NotFound("course"))
    }

    fn booking_mut(&mut self, booking_id: Uuid) -> Result<&mut Booking, BookingError> {
        self.bookings
            .iter_mut()
            .find(|b| b.id == booking_id)
            .ok_or(BookingError::NotFound("booking"))
    }
}

#[derive(Default)]
pub struct MemoryBookingStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the database going away (or coming back)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), BookingError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BookingError::ServiceUnavailable(
                "in-memory store marked unavailable".into(),
            ));
        }
        Ok(())
    }

    /// All bookings, in insertion order
    pub async fn all_bookings(&self) -> Vec<Booking> {
        self.tables.lock().await.bookings.clone()
    }

    pub async fn event(&self, gateway_event_id: &str) -> Option<WebhookEventRecord> {
        self.tables.lock().await.events.get(gateway_event_id).cloned()
    }

    fn build_booking(new_booking: NewBooking) -> Booking {
        let now = Utc::now();
        Booking {
            id: Uuid::new_v4(),
            course_id: new_booking.course_id,
            user_id: new_booking.user_id,
            slot_at: new_booking.slot_at,
            status: new_booking.status,
            payment_status: new_booking.payment_status,
            payment_reference: new_booking.payment_reference,
            amount_cents: new_booking.amount_cents,
            currency: new_booking.currency,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
impl BookingStore for MemoryBookingStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, BookingError> {
        self.ensure_available()?;
        Ok(self.tables.lock().await.users.get(&user_id).cloned())
    }

    async fn create_user(&self, new_user: NewUser) -> Result<User, BookingError> {
        self.ensure_available()?;
        let mut tables = self.tables.lock().await;
        if tables.users.values().any(|u| u.email == new_user.email) {
            return Err(BookingError::Conflict(format!(
                "user {} already exists",
                new_user.email
            )));
        }
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: new_user.email,
            role: new_user.role,
            created_at: now,
            updated_at: now,
        };
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_course(&self, course_id: Uuid) -> Result<Option<Course>, BookingError> {
        self.ensure_available()?;
        Ok(self.tables.lock().await.courses.get(&course_id).cloned())
    }

    async fn list_courses(&self) -> Result<Vec<Course>, BookingError> {
        self.ensure_available()?;
        let mut courses: Vec<Course> = self.tables.lock().await.courses.values().cloned().collect();
        courses.sort_by(|a, b| a.title.cmp(&b.title));
        Ok(courses)
    }

    async fn create_course(&self, new_course: NewCourse) -> Result<Course, BookingError> {
        self.ensure_available()?;
        let now = Utc::now();
        let course = Course {
            id: Uuid::new_v4(),
            title: new_course.title,
            description: new_course.description,
            price_cents: new_course.price_cents,
            currency: new_course.currency,
            duration_minutes: new_course.duration_minutes,
            capacity: new_course.capacity,
            created_at: now,
            updated_at: now,
        };
        self.tables
            .lock()
            .await
            .courses
            .insert(course.id, course.clone());
        Ok(course)
    }

    async fn count_confirmed(
        &self,
        course_id: Uuid,
        slot_at: DateTime<Utc>,
    ) -> Result<i64, BookingError> {
        self.ensure_available()?;
        let tables = self.tables.lock().await;
        Ok(tables.count_with_status(course_id, slot_at, |s| s == BookingStatus::Confirmed))
    }

    async fn find_active_booking(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        slot_at: DateTime<Utc>,
    ) -> Result<Option<Booking>, BookingError> {
        self.ensure_available()?;
        let tables = self.tables.lock().await;
        Ok(tables.active_booking(user_id, course_id, slot_at).cloned())
    }

    async fn get_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, BookingError> {
        self.ensure_available()?;
        let tables = self.tables.lock().await;
        Ok(tables.bookings.iter().find(|b| b.id == booking_id).cloned())
    }

    async fn list_bookings_for_user(&self, user_id: Uuid) -> Result<Vec<Booking>, BookingError> {
        self.ensure_available()?;
        let tables = self.tables.lock().await;
        let mut bookings: Vec<Booking> = tables
            .bookings
            .iter()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        bookings.sort_by(|a, b| b.slot_at.cmp(&a.slot_at));
        Ok(bookings)
    }

    async fn list_bookings_for_course(
        &self,
        course_id: Uuid,
        slot_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<Booking>, BookingError> {
        self.ensure_available()?;
        let tables = self.tables.lock().await;
        let mut bookings: Vec<Booking> = tables
            .bookings
            .iter()
            .filter(|b| b.course_id == course_id && slot_at.is_none_or(|s| b.slot_at == s))
            .cloned()
            .collect();
        bookings.sort_by(|a, b| {
            a.slot_at
                .cmp(&b.slot_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(bookings)
    }

    async fn insert_booking(&self, new_booking: NewBooking) -> Result<Booking, BookingError> {
        self.ensure_available()?;
        if new_booking.status == BookingStatus::Confirmed {
            return Err(BookingError::Internal(
                "confirmed bookings must go through confirm_booking".into(),
            ));
        }
        let mut tables = self.tables.lock().await;
        if !tables.courses.contains_key(&new_booking.course_id) {
            return Err(BookingError::NotFound("course"));
        }
        if new_booking.status.holds_seat()
            && tables
                .active_booking(new_booking.user_id, new_booking.course_id, new_booking.slot_at)
                .is_some()
        {
            return Err(BookingError::Conflict(
                "user already holds a booking for this slot".into(),
            ));
        }
        let booking = Self::build_booking(new_booking);
        tables.bookings.push(booking.clone());
        Ok(booking)
    }

    async fn confirm_booking(
        &self,
        new_booking: NewBooking,
    ) -> Result<ConfirmOutcome, BookingError> {
        self.ensure_available()?;
        let mut tables = self.tables.lock().await;

        let capacity = tables.capacity(new_booking.course_id)?;
        let existing = tables
            .active_booking(new_booking.user_id, new_booking.course_id, new_booking.slot_at)
            .cloned();
        let occupied =
            tables.count_with_status(new_booking.course_id, new_booking.slot_at, |s| s.holds_seat());

        match plan_confirmation(existing.as_ref(), occupied, capacity)? {
            ConfirmPlan::AlreadyConfirmed(booking) => Ok(ConfirmOutcome::AlreadyConfirmed(booking)),
            ConfirmPlan::Promote(booking_id) => {
                let booking = tables.booking_mut(booking_id)?;
                booking.status = BookingStatus::Confirmed;
                booking.payment_status = new_booking.payment_status;
                booking.payment_reference = new_booking.payment_reference;
                booking.amount_cents = new_booking.amount_cents;
                booking.currency = new_booking.currency;
                booking.updated_at = Utc::now();
                Ok(ConfirmOutcome::Promoted(booking.clone()))
            }
            ConfirmPlan::Insert => {
                let booking = Self::build_booking(NewBooking {
                    status: BookingStatus::Confirmed,
                    ..new_booking
                });
                tables.bookings.push(booking.clone());
                Ok(ConfirmOutcome::Created(booking))
            }
        }
    }

    async fn update_booking_status(
        &self,
        booking_id: Uuid,
        status: BookingStatus,
    ) -> Result<Booking, BookingError> {
        self.ensure_available()?;
        let mut tables = self.tables.lock().await;

        let current = tables.booking_mut(booking_id)?.clone();
        if !current.status.can_transition_to(status) {
            return Err(BookingError::Validation(format!(
                "Cannot move booking from {:?} to {:?}",
                current.status, status
            )));
        }
        if status == BookingStatus::Confirmed {
            let capacity = tables.capacity(current.course_id)?;
            let occupied =
                tables.count_with_status(current.course_id, current.slot_at, |s| s.holds_seat());
            plan_confirmation(Some(&current), occupied, capacity)?;
        }

        let booking = tables.booking_mut(booking_id)?;
        booking.status = status;
        booking.updated_at = Utc::now();
        Ok(booking.clone())
    }

    async fn is_event_processed(&self, gateway_event_id: &str) -> Result<bool, BookingError> {
        self.ensure_available()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .events
            .get(gateway_event_id)
            .is_some_and(|e| e.processed))
    }

    async fn record_event(&self, new_event: NewWebhookEvent) -> Result<bool, BookingError> {
        self.ensure_available()?;
        let mut tables = self.tables.lock().await;
        if tables.events.contains_key(&new_event.gateway_event_id) {
            return Ok(false);
        }
        let record = WebhookEventRecord {
            id: Uuid::new_v4(),
            gateway_event_id: new_event.gateway_event_id.clone(),
            event_type: new_event.event_type,
            processed: false,
            processing_error: None,
            payload: new_event.payload,
            created_at: Utc::now(),
        };
        tables.events.insert(new_event.gateway_event_id, record);
        Ok(true)
    }

    async fn mark_event_processed(&self, gateway_event_id: &str) -> Result<(), BookingError> {
        self.ensure_available()?;
        if let Some(event) = self.tables.lock().await.events.get_mut(gateway_event_id) {
            event.processed = true;
        }
        Ok(())
    }

    async fn mark_event_failed(
        &self,
        gateway_event_id: &str,
        error: &str,
    ) -> Result<(), BookingError> {
        self.ensure_available()?;
        if let Some(event) = self.tables.lock().await.events.get_mut(gateway_event_id) {
            event.processed = true;
            event.processing_error = Some(error.to_string());
        }
        Ok(())
    }
}
