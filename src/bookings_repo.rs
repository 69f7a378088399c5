use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::booking_store::BookingStore;
use crate::bookings::{
    Booking, BookingStatus, ConfirmOutcome, ConfirmPlan, NewBooking, plan_confirmation,
};
use crate::courses::{Course, NewCourse};
use crate::database::PgPool;
use crate::error::BookingError;
use crate::users::{NewUser, User};
use crate::webhook_events::NewWebhookEvent;

/// Postgres-backed store. Diesel is synchronous, so every call runs on the
/// blocking pool with its own pooled connection.
#[derive(Clone)]
pub struct PgBookingStore {
    pool: PgPool,
}

impl PgBookingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, BookingError>
    where
        F: FnOnce(&mut PgConnection) -> Result<T, BookingError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

/// Lock the course row and return its capacity. Every confirmation for a
/// course queues on this lock, so the count that follows cannot go stale.
fn lock_course_capacity(conn: &mut PgConnection, course_id: Uuid) -> Result<i32, BookingError> {
    use crate::schema::courses;

    courses::table
        .find(course_id)
        .select(courses::capacity)
        .for_update()
        .first::<i32>(conn)
        .optional()?
        .ok_or(BookingError::NotFound("course"))
}

fn active_booking(
    conn: &mut PgConnection,
    user_id: Uuid,
    course_id: Uuid,
    slot_at: DateTime<Utc>,
) -> Result<Option<Booking>, BookingError> {
    use crate::schema::bookings::dsl;

    let booking = dsl::bookings
        .filter(dsl::user_id.eq(user_id))
        .filter(dsl::course_id.eq(course_id))
        .filter(dsl::slot_at.eq(slot_at))
        .filter(
            dsl::status
                .eq(BookingStatus::Confirmed)
                .or(dsl::status.eq(BookingStatus::Pending)),
        )
        .select(Booking::as_select())
        .first(conn)
        .optional()?;

    Ok(booking)
}

fn count_seat_holders(
    conn: &mut PgConnection,
    course_id: Uuid,
    slot_at: DateTime<Utc>,
) -> Result<i64, BookingError> {
    use crate::schema::bookings::dsl;

    let count = dsl::bookings
        .filter(dsl::course_id.eq(course_id))
        .filter(dsl::slot_at.eq(slot_at))
        .filter(
            dsl::status
                .eq(BookingStatus::Confirmed)
                .or(dsl::status.eq(BookingStatus::Pending)),
        )
        .count()
        .get_result::<i64>(conn)?;

    Ok(count)
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, BookingError> {
        use crate::schema::users::dsl;

        self.run(move |conn| {
            let user = dsl::users
                .find(user_id)
                .select(User::as_select())
                .first(conn)
                .optional()?;
            Ok(user)
        })
        .await
    }

    async fn create_user(&self, new_user: NewUser) -> Result<User, BookingError> {
        use crate::schema::users::dsl;

        self.run(move |conn| {
            let user = diesel::insert_into(dsl::users)
                .values(&new_user)
                .returning(User::as_returning())
                .get_result(conn)?;
            Ok(user)
        })
        .await
    }

    async fn get_course(&self, course_id: Uuid) -> Result<Option<Course>, BookingError> {
        use crate::schema::courses::dsl;

        self.run(move |conn| {
            let course = dsl::courses
                .find(course_id)
                .select(Course::as_select())
                .first(conn)
                .optional()?;
            Ok(course)
        })
        .await
    }

    async fn list_courses(&self) -> Result<Vec<Course>, BookingError> {
        use crate::schema::courses::dsl;

        self.run(move |conn| {
            let courses = dsl::courses
                .order_by(dsl::title.asc())
                .select(Course::as_select())
                .load(conn)?;
            Ok(courses)
        })
        .await
    }

    async fn create_course(&self, new_course: NewCourse) -> Result<Course, BookingError> {
        use crate::schema::courses::dsl;

        self.run(move |conn| {
            let course = diesel::insert_into(dsl::courses)
                .values(&new_course)
                .returning(Course::as_returning())
                .get_result(conn)?;
            Ok(course)
        })
        .await
    }

    async fn count_confirmed(
        &self,
        course_id: Uuid,
        slot_at: DateTime<Utc>,
    ) -> Result<i64, BookingError> {
        use crate::schema::bookings::dsl;

        self.run(move |conn| {
            let count = dsl::bookings
                .filter(dsl::course_id.eq(course_id))
                .filter(dsl::slot_at.eq(slot_at))
                .filter(dsl::status.eq(BookingStatus::Confirmed))
                .count()
                .get_result::<i64>(conn)?;
            Ok(count)
        })
        .await
    }

    async fn find_active_booking(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        slot_at: DateTime<Utc>,
    ) -> Result<Option<Booking>, BookingError> {
        self.run(move |conn| active_booking(conn, user_id, course_id, slot_at))
            .await
    }

    async fn get_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, BookingError> {
        use crate::schema::bookings::dsl;

        self.run(move |conn| {
            let booking = dsl::bookings
                .find(booking_id)
                .select(Booking::as_select())
                .first(conn)
                .optional()?;
            Ok(booking)
        })
        .await
    }

    async fn list_bookings_for_user(&self, user_id: Uuid) -> Result<Vec<Booking>, BookingError> {
        use crate::schema::bookings::dsl;

        self.run(move |conn| {
            let bookings = dsl::bookings
                .filter(dsl::user_id.eq(user_id))
                .order_by(dsl::slot_at.desc())
                .select(Booking::as_select())
                .load(conn)?;
            Ok(bookings)
        })
        .await
    }

    async fn list_bookings_for_course(
        &self,
        course_id: Uuid,
        slot_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<Booking>, BookingError> {
        use crate::schema::bookings::dsl;

        self.run(move |conn| {
            let mut query = dsl::bookings
                .select(Booking::as_select())
                .filter(dsl::course_id.eq(course_id))
                .into_boxed();
            if let Some(slot_at) = slot_at {
                query = query.filter(dsl::slot_at.eq(slot_at));
            }
            let bookings = query
                .order_by(dsl::slot_at.asc())
                .then_order_by(dsl::created_at.asc())
                .load(conn)?;
            Ok(bookings)
        })
        .await
    }

    async fn insert_booking(&self, new_booking: NewBooking) -> Result<Booking, BookingError> {
        use crate::schema::bookings::dsl;

        if new_booking.status == BookingStatus::Confirmed {
            return Err(BookingError::Internal(
                "confirmed bookings must go through confirm_booking".into(),
            ));
        }

        self.run(move |conn| {
            let booking = diesel::insert_into(dsl::bookings)
                .values(&new_booking)
                .returning(Booking::as_returning())
                .get_result(conn)?;
            Ok(booking)
        })
        .await
    }

    async fn confirm_booking(
        &self,
        new_booking: NewBooking,
    ) -> Result<ConfirmOutcome, BookingError> {
        use crate::schema::bookings::dsl;

        self.run(move |conn| {
            conn.transaction::<_, BookingError, _>(|conn| {
                let capacity = lock_course_capacity(conn, new_booking.course_id)?;
                let existing = active_booking(
                    conn,
                    new_booking.user_id,
                    new_booking.course_id,
                    new_booking.slot_at,
                )?;
                let occupied =
                    count_seat_holders(conn, new_booking.course_id, new_booking.slot_at)?;

                match plan_confirmation(existing.as_ref(), occupied, capacity)? {
                    ConfirmPlan::AlreadyConfirmed(booking) => {
                        Ok(ConfirmOutcome::AlreadyConfirmed(booking))
                    }
                    ConfirmPlan::Promote(booking_id) => {
                        let booking = diesel::update(dsl::bookings.find(booking_id))
                            .set((
                                dsl::status.eq(BookingStatus::Confirmed),
                                dsl::payment_status.eq(new_booking.payment_status),
                                dsl::payment_reference.eq(new_booking.payment_reference.clone()),
                                dsl::amount_cents.eq(new_booking.amount_cents),
                                dsl::currency.eq(new_booking.currency.clone()),
                                dsl::updated_at.eq(diesel::dsl::now),
                            ))
                            .returning(Booking::as_returning())
                            .get_result(conn)?;
                        Ok(ConfirmOutcome::Promoted(booking))
                    }
                    ConfirmPlan::Insert => {
                        let booking = diesel::insert_into(dsl::bookings)
                            .values(&NewBooking {
                                status: BookingStatus::Confirmed,
                                ..new_booking.clone()
                            })
                            .returning(Booking::as_returning())
                            .get_result(conn)?;
                        Ok(ConfirmOutcome::Created(booking))
                    }
                }
            })
        })
        .await
    }

    async fn update_booking_status(
        &self,
        booking_id: Uuid,
        status: BookingStatus,
    ) -> Result<Booking, BookingError> {
        use crate::schema::bookings::dsl;

        self.run(move |conn| {
            conn.transaction::<_, BookingError, _>(|conn| {
                let course_id: Uuid = dsl::bookings
                    .find(booking_id)
                    .select(dsl::course_id)
                    .first(conn)
                    .optional()?
                    .ok_or(BookingError::NotFound("booking"))?;

                // Course before booking, the same order confirm_booking locks in
                let capacity = lock_course_capacity(conn, course_id)?;
                let booking: Booking = dsl::bookings
                    .find(booking_id)
                    .select(Booking::as_select())
                    .for_update()
                    .first(conn)?;

                if !booking.status.can_transition_to(status) {
                    return Err(BookingError::Validation(format!(
                        "Cannot move booking from {:?} to {:?}",
                        booking.status, status
                    )));
                }

                if status == BookingStatus::Confirmed {
                    let occupied = count_seat_holders(conn, booking.course_id, booking.slot_at)?;
                    plan_confirmation(Some(&booking), occupied, capacity)?;
                }

                let updated = diesel::update(dsl::bookings.find(booking_id))
                    .set((dsl::status.eq(status), dsl::updated_at.eq(diesel::dsl::now)))
                    .returning(Booking::as_returning())
                    .get_result(conn)?;
                Ok(updated)
            })
        })
        .await
    }

    async fn is_event_processed(&self, gateway_event_id: &str) -> Result<bool, BookingError> {
        use crate::schema::webhook_events::dsl;

        let gateway_event_id = gateway_event_id.to_string();
        self.run(move |conn| {
            let exists: bool = diesel::select(diesel::dsl::exists(
                dsl::webhook_events
                    .filter(dsl::gateway_event_id.eq(&gateway_event_id))
                    .filter(dsl::processed.eq(true)),
            ))
            .get_result(conn)?;
            Ok(exists)
        })
        .await
    }

    async fn record_event(&self, new_event: NewWebhookEvent) -> Result<bool, BookingError> {
        use crate::schema::webhook_events::dsl;

        self.run(move |conn| {
            let inserted = diesel::insert_into(dsl::webhook_events)
                .values(&new_event)
                .on_conflict(dsl::gateway_event_id)
                .do_nothing()
                .execute(conn)?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn mark_event_processed(&self, gateway_event_id: &str) -> Result<(), BookingError> {
        use crate::schema::webhook_events::dsl;

        let gateway_event_id = gateway_event_id.to_string();
        self.run(move |conn| {
            diesel::update(dsl::webhook_events)
                .filter(dsl::gateway_event_id.eq(&gateway_event_id))
                .set(dsl::processed.eq(true))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn mark_event_failed(
        &self,
        gateway_event_id: &str,
        error: &str,
    ) -> Result<(), BookingError> {
        use crate::schema::webhook_events::dsl;

        let gateway_event_id = gateway_event_id.to_string();
        let error = error.to_string();
        self.run(move |conn| {
            diesel::update(dsl::webhook_events)
                .filter(dsl::gateway_event_id.eq(&gateway_event_id))
                .set((
                    dsl::processed.eq(true),
                    dsl::processing_error.eq(Some(&error)),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}
