use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::booking_store::BookingStore;
use crate::bookings::normalize_slot;
use crate::courses::Course;
use crate::error::BookingError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub course_id: Uuid,
    pub slot_at: DateTime<Utc>,
    pub capacity: i32,
    pub confirmed: i64,
    pub has_capacity: bool,
}

impl Availability {
    pub fn remaining(&self) -> i64 {
        (i64::from(self.capacity) - self.confirmed).max(0)
    }
}

/// Soft capacity check. Advisory only: the reconciler's transaction is what
/// actually enforces capacity.
#[derive(Clone)]
pub struct AvailabilityChecker {
    store: Arc<dyn BookingStore>,
}

impl AvailabilityChecker {
    pub fn new(store: Arc<dyn BookingStore>) -> Self {
        Self { store }
    }

    pub async fn check(
        &self,
        course_id: Uuid,
        slot_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Availability, BookingError> {
        let course = self
            .store
            .get_course(course_id)
            .await?
            .ok_or(BookingError::NotFound("course"))?;
        self.check_course(&course, slot_at, now).await
    }

    /// Same as `check` for a course the caller already loaded
    pub async fn check_course(
        &self,
        course: &Course,
        slot_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Availability, BookingError> {
        let slot_at = normalize_slot(slot_at);
        if slot_at <= now {
            return Err(BookingError::Validation(
                "Slot must be in the future".to_string(),
            ));
        }

        let confirmed = self.store.count_confirmed(course.id, slot_at).await?;
        let availability = Availability {
            course_id: course.id,
            slot_at,
            capacity: course.capacity,
            confirmed,
            has_capacity: confirmed < i64::from(course.capacity),
        };

        debug!(
            course_id = %course.id,
            slot_at = %slot_at,
            confirmed,
            capacity = course.capacity,
            "Checked availability"
        );

        Ok(availability)
    }
}
