use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BookingError;

/// Currency for courses created without one; matches the column default
pub const DEFAULT_CURRENCY: &str = "eur";

/// A bookable course. `capacity` caps confirmed attendees per date/time slot.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::courses)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub price_cents: i32,
    pub currency: String,
    pub duration_minutes: i32,
    pub capacity: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::courses)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewCourse {
    pub title: String,
    pub description: Option<String>,
    pub price_cents: i32,
    pub currency: String,
    pub duration_minutes: i32,
    pub capacity: i32,
}

impl NewCourse {
    pub fn validate(&self) -> Result<(), BookingError> {
        if self.title.trim().is_empty() {
            return Err(BookingError::Validation("Title must not be empty".into()));
        }
        if self.price_cents <= 0 {
            return Err(BookingError::Validation(
                "Price must be greater than 0".into(),
            ));
        }
        if self.duration_minutes <= 0 {
            return Err(BookingError::Validation(
                "Duration must be greater than 0".into(),
            ));
        }
        if self.capacity < 1 {
            return Err(BookingError::Validation(
                "Capacity must be at least 1".into(),
            ));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_lowercase()) {
            return Err(BookingError::Validation(
                "Currency must be a three-letter lowercase ISO code".into(),
            ));
        }
        Ok(())
    }
}
