//! Shared helpers for the integration tests
//!
//! - `FakeGateway`: records checkout session requests, can be told to fail
//! - `Fixture`: an in-memory store seeded with a course and two clients
//! - `paid_event` and `sign`: webhook bodies and valid `Stripe-Signature` headers
//! - `TestDatabase`: an isolated Postgres database cloned from the
//!   `studio_test_template` template, dropped again when it goes out of scope
#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::MigrationHarness;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use studio::booking_store::BookingStore;
use studio::bookings::{Booking, BookingStatus, ConfirmOutcome, NewBooking};
use studio::courses::{Course, NewCourse};
use studio::error::BookingError;
use studio::database::MIGRATIONS;
use studio::memory_store::MemoryBookingStore;
use studio::payment_gateway::{
    CheckoutSessionHandle, CheckoutSessionRequest, GatewayError, PaymentGateway,
};
use studio::stripe_events::{BookingMetadata, sign_payload};
use studio::users::{NewUser, User, UserRole};
use studio::webhook_events::NewWebhookEvent;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_3f9a1c";

/// Fixed clock for the booking tests
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 10, 9, 0, 0).unwrap()
}

/// 2025-01-15T10:00:00Z, five days after `now()`
pub fn slot() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap()
}

#[derive(Default)]
pub struct FakeGateway {
    requests: Mutex<Vec<CheckoutSessionRequest>>,
    failure: Mutex<Option<GatewayError>>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_with(&self, error: GatewayError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn requests(&self) -> Vec<CheckoutSessionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSessionHandle, GatewayError> {
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        let mut requests = self.requests.lock().unwrap();
        requests.push(request);
        let session_id = format!("cs_test_{}", requests.len());
        Ok(CheckoutSessionHandle {
            redirect_url: format!("https://checkout.stripe.test/pay/{}", session_id),
            session_id,
        })
    }
}

/// Wraps the in-memory store and makes the next `confirm_booking` calls fail
/// the way Postgres does when the active-booking unique index refuses a
/// concurrent insert for the same user and slot.
pub struct ConflictingStore {
    pub inner: Arc<MemoryBookingStore>,
    conflicts_left: AtomicUsize,
}

impl ConflictingStore {
    pub fn new(inner: Arc<MemoryBookingStore>, conflicts: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            conflicts_left: AtomicUsize::new(conflicts),
        })
    }
}

#[async_trait]
impl BookingStore for ConflictingStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, BookingError> {
        self.inner.get_user(user_id).await
    }

    async fn create_user(&self, new_user: NewUser) -> Result<User, BookingError> {
        self.inner.create_user(new_user).await
    }

    async fn get_course(&self, course_id: Uuid) -> Result<Option<Course>, BookingError> {
        self.inner.get_course(course_id).await
    }

    async fn list_courses(&self) -> Result<Vec<Course>, BookingError> {
        self.inner.list_courses().await
    }

    async fn create_course(&self, new_course: NewCourse) -> Result<Course, BookingError> {
        self.inner.create_course(new_course).await
    }

    async fn count_confirmed(
        &self,
        course_id: Uuid,
        slot_at: DateTime<Utc>,
    ) -> Result<i64, BookingError> {
        self.inner.count_confirmed(course_id, slot_at).await
    }

    async fn find_active_booking(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        slot_at: DateTime<Utc>,
    ) -> Result<Option<Booking>, BookingError> {
        self.inner
            .find_active_booking(user_id, course_id, slot_at)
            .await
    }

    async fn get_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, BookingError> {
        self.inner.get_booking(booking_id).await
    }

    async fn list_bookings_for_user(&self, user_id: Uuid) -> Result<Vec<Booking>, BookingError> {
        self.inner.list_bookings_for_user(user_id).await
    }

    async fn list_bookings_for_course(
        &self,
        course_id: Uuid,
        slot_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<Booking>, BookingError> {
        self.inner.list_bookings_for_course(course_id, slot_at).await
    }

    async fn insert_booking(&self, new_booking: NewBooking) -> Result<Booking, BookingError> {
        self.inner.insert_booking(new_booking).await
    }

    async fn confirm_booking(
        &self,
        new_booking: NewBooking,
    ) -> Result<ConfirmOutcome, BookingError> {
        let conflicted = self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if conflicted {
            return Err(BookingError::Conflict(
                "duplicate key value violates unique constraint \"idx_bookings_active_triple\""
                    .into(),
            ));
        }
        self.inner.confirm_booking(new_booking).await
    }

    async fn update_booking_status(
        &self,
        booking_id: Uuid,
        status: BookingStatus,
    ) -> Result<Booking, BookingError> {
        self.inner.update_booking_status(booking_id, status).await
    }

    async fn is_event_processed(&self, gateway_event_id: &str) -> Result<bool, BookingError> {
        self.inner.is_event_processed(gateway_event_id).await
    }

    async fn record_event(&self, new_event: NewWebhookEvent) -> Result<bool, BookingError> {
        self.inner.record_event(new_event).await
    }

    async fn mark_event_processed(&self, gateway_event_id: &str) -> Result<(), BookingError> {
        self.inner.mark_event_processed(gateway_event_id).await
    }

    async fn mark_event_failed(
        &self,
        gateway_event_id: &str,
        error: &str,
    ) -> Result<(), BookingError> {
        self.inner.mark_event_failed(gateway_event_id, error).await
    }
}

pub struct Fixture {
    pub store: Arc<MemoryBookingStore>,
    pub course: Course,
    pub alice: User,
    pub bob: User,
    pub admin: User,
}

impl Fixture {
    pub async fn new(capacity: i32) -> Self {
        let store = Arc::new(MemoryBookingStore::new());
        Self::seed(store, capacity).await
    }

    pub async fn seed(store: Arc<MemoryBookingStore>, capacity: i32) -> Self {
        let course = store
            .create_course(hatha_course(capacity))
            .await
            .expect("seed course");
        let alice = client(&*store, "alice@example.com").await;
        let bob = client(&*store, "bob@example.com").await;
        let admin = store
            .create_user(NewUser {
                email: "admin@example.com".into(),
                role: UserRole::Admin,
            })
            .await
            .expect("seed admin");
        Self {
            store,
            course,
            alice,
            bob,
            admin,
        }
    }

    pub fn dyn_store(&self) -> Arc<dyn BookingStore> {
        self.store.clone()
    }

    pub fn metadata(&self, user: &User) -> BookingMetadata {
        BookingMetadata {
            course_id: self.course.id,
            slot_at: slot(),
            user_id: user.id,
        }
    }
}

pub fn hatha_course(capacity: i32) -> NewCourse {
    NewCourse {
        title: "Hatha Flow".into(),
        description: Some("Slow-paced hatha for all levels".into()),
        price_cents: 2500,
        currency: "eur".into(),
        duration_minutes: 60,
        capacity,
    }
}

pub async fn client(store: &dyn BookingStore, email: &str) -> User {
    store
        .create_user(NewUser {
            email: email.into(),
            role: UserRole::Client,
        })
        .await
        .expect("seed client")
}

/// JSON body of a `checkout.session.*` event charged in euros
pub fn session_event(
    event_id: &str,
    event_type: &str,
    payment_status: &str,
    metadata: &BookingMetadata,
    amount_total: i64,
) -> Vec<u8> {
    session_event_in(event_id, event_type, payment_status, metadata, amount_total, "eur")
}

pub fn session_event_in(
    event_id: &str,
    event_type: &str,
    payment_status: &str,
    metadata: &BookingMetadata,
    amount_total: i64,
    currency: &str,
) -> Vec<u8> {
    let session_suffix = Uuid::new_v4().simple().to_string();
    serde_json::to_vec(&serde_json::json!({
        "id": event_id,
        "object": "event",
        "api_version": "2025-01-27.acacia",
        "type": event_type,
        "data": {
            "object": {
                "id": format!("cs_test_{}", session_suffix),
                "object": "checkout.session",
                "payment_intent": format!("pi_test_{}", &session_suffix[..12]),
                "payment_status": payment_status,
                "amount_total": amount_total,
                "currency": currency,
                "metadata": metadata.to_map(),
            }
        }
    }))
    .unwrap()
}

/// A paid `checkout.session.completed` body
pub fn paid_event(event_id: &str, metadata: &BookingMetadata) -> Vec<u8> {
    session_event(
        event_id,
        "checkout.session.completed",
        "paid",
        metadata,
        2500,
    )
}

/// Signature header valid at `now()`
pub fn sign(payload: &[u8]) -> String {
    sign_payload(payload, WEBHOOK_SECRET, now().timestamp()).unwrap()
}

type PgPool = Pool<ConnectionManager<PgConnection>>;

static TEMPLATE_READY: Once = Once::new();

/// Create the template database once per test run and bring it up to the
/// latest migration.
fn ensure_template_migrated(base_url: &str) {
    TEMPLATE_READY.call_once(|| {
        let admin_url = admin_url(base_url);
        let template_url = base_url.replace("/studio_test", "/studio_test_template");

        if let Ok(mut admin_conn) = PgConnection::establish(&admin_url) {
            let exists = diesel::sql_query(
                "SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = 'studio_test_template')",
            )
            .get_result::<TemplateExists>(&mut admin_conn)
            .map(|r| r.exists);

            if exists != Ok(true) {
                let _ = diesel::sql_query("CREATE DATABASE studio_test_template")
                    .execute(&mut admin_conn);
            }
            // Allow connections while migrating
            let _ = diesel::sql_query(
                "UPDATE pg_database SET datistemplate = FALSE, datallowconn = TRUE \
                 WHERE datname = 'studio_test_template'",
            )
            .execute(&mut admin_conn);
        }

        if let Ok(mut template_conn) = PgConnection::establish(&template_url) {
            if let Err(e) = template_conn.run_pending_migrations(MIGRATIONS) {
                eprintln!("Warning: Failed to run migrations on template: {}", e);
            }
        }

        if let Ok(mut admin_conn) = PgConnection::establish(&admin_url) {
            let _ = diesel::sql_query(
                "UPDATE pg_database SET datistemplate = TRUE, datallowconn = FALSE \
                 WHERE datname = 'studio_test_template'",
            )
            .execute(&mut admin_conn);
        }
    });
}

#[derive(QueryableByName)]
struct TemplateExists {
    #[diesel(sql_type = diesel::sql_types::Bool)]
    exists: bool,
}

fn admin_url(base_url: &str) -> String {
    base_url.replace("/studio_test", "/postgres")
}

/// An isolated database cloned from `studio_test_template`.
///
/// Requires PostgreSQL 13+ (`DROP DATABASE ... WITH (FORCE)`).
pub struct TestDatabase {
    db_name: String,
    pool: PgPool,
    admin_url: String,
}

impl TestDatabase {
    pub async fn new() -> Result<Self> {
        dotenvy::dotenv().ok();
        let base_url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/studio_test".to_string());

        let setup_url = base_url.clone();
        tokio::task::spawn_blocking(move || ensure_template_migrated(&setup_url))
            .await
            .context("Template setup panicked")?;

        let db_name = format!("studio_test_{}", Uuid::new_v4().simple());
        let admin_url = admin_url(&base_url);

        let create_admin_url = admin_url.clone();
        let create_db_name = db_name.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = PgConnection::establish(&create_admin_url)
                .context("Failed to connect to PostgreSQL. Is it running?")?;
            // db_name is a generated identifier, safe to interpolate
            diesel::sql_query(format!(
                "CREATE DATABASE \"{}\" TEMPLATE studio_test_template",
                create_db_name
            ))
            .execute(&mut conn)
            .with_context(|| format!("Failed to create database '{}'", create_db_name))?;
            Ok::<(), anyhow::Error>(())
        })
        .await
        .context("Database creation task panicked")??;

        let test_db_url = base_url.replace("/studio_test", &format!("/{}", db_name));
        let pool = Pool::builder()
            .max_size(10)
            .build(ConnectionManager::<PgConnection>::new(&test_db_url))
            .with_context(|| format!("Failed to create connection pool for {}", db_name))?;

        Ok(Self {
            db_name,
            pool,
            admin_url,
        })
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        if let Ok(mut conn) = PgConnection::establish(&self.admin_url) {
            let drop_sql = format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.db_name);
            if diesel::sql_query(&drop_sql).execute(&mut conn).is_err() {
                eprintln!("Warning: Failed to drop test database '{}'", self.db_name);
            }
        }
    }
}
