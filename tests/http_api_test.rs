mod common;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use common::{FakeGateway, Fixture, WEBHOOK_SECRET};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use studio::auth::JwtService;
use studio::booking_store::BookingStore;
use studio::bookings::{BookingStatus, NewBooking, PaymentStatus};
use studio::checkout::{CheckoutInitiator, CheckoutSettings};
use studio::reconciler::{ReconcilerSettings, WebhookReconciler};
use studio::stripe_events::{BookingMetadata, sign_payload};
use studio::users::User;
use studio::web::{AppState, build_router};
use tower::ServiceExt;

const JWT_SECRET: &str = "http-test-secret";

struct TestApp {
    fx: Fixture,
    gateway: std::sync::Arc<FakeGateway>,
    router: Router,
}

impl TestApp {
    async fn new(capacity: i32) -> Self {
        let fx = Fixture::new(capacity).await;
        let gateway = FakeGateway::new();
        let state = AppState::new(fx.dyn_store(), JwtService::new(JWT_SECRET))
            .with_checkout(CheckoutInitiator::new(
                fx.dyn_store(),
                gateway.clone(),
                CheckoutSettings::default(),
            ))
            .with_reconciler(WebhookReconciler::new(
                fx.dyn_store(),
                ReconcilerSettings::new(WEBHOOK_SECRET),
            ));
        Self {
            router: build_router(state),
            fx,
            gateway,
        }
    }

    fn token(user: &User) -> String {
        JwtService::new(JWT_SECRET).generate_token(user).unwrap()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    async fn get(&self, uri: &str, user: Option<&User>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(user) = user {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", Self::token(user)));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    async fn send_json(
        &self,
        method: &str,
        uri: &str,
        user: Option<&User>,
        body: Value,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(user) = user {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", Self::token(user)));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    async fn webhook(&self, payload: Vec<u8>, signature: Option<String>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/data/stripe/webhooks")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            builder = builder.header("Stripe-Signature", signature);
        }
        self.send(builder.body(Body::from(payload)).unwrap()).await
    }
}

fn future_slot() -> DateTime<Utc> {
    (Utc::now() + Duration::days(7)).trunc_subsecs(0)
}

fn rfc3339(slot: DateTime<Utc>) -> String {
    slot.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn signed_now(payload: &[u8]) -> String {
    sign_payload(payload, WEBHOOK_SECRET, Utc::now().timestamp()).unwrap()
}

fn paid_session(event_id: &str, metadata: &BookingMetadata) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": format!("cs_{}", event_id),
            "payment_intent": format!("pi_{}", event_id),
            "payment_status": "paid",
            "amount_total": 2500,
            "currency": "eur",
            "metadata": metadata.to_map(),
        }}
    }))
    .unwrap()
}

#[tokio::test]
async fn test_health_and_catalog_are_public() {
    let app = TestApp::new(5).await;

    let (status, body) = app.get("/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = app.get("/data/courses", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["title"], "Hatha Flow");
    assert_eq!(body["data"][0]["priceCents"], 2500);

    let (status, body) = app
        .get(&format!("/data/courses/{}", uuid::Uuid::new_v4()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["errors"], "Course not found");
}

#[tokio::test]
async fn test_availability_endpoint() {
    let app = TestApp::new(5).await;
    let slot = future_slot();

    let (status, body) = app
        .get(
            &format!(
                "/data/courses/{}/availability?slot={}",
                app.fx.course.id,
                rfc3339(slot)
            ),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["hasCapacity"], true);
    assert_eq!(body["data"]["remaining"], 5);

    let (status, _) = app
        .get(
            &format!("/data/courses/{}/availability?slot=tomorrow", app.fx.course.id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_checkout_requires_authentication() {
    let app = TestApp::new(5).await;
    let (status, _) = app
        .send_json(
            "POST",
            "/data/checkout",
            None,
            json!({
                "courseId": app.fx.course.id,
                "slotAt": rfc3339(future_slot()),
                "userId": app.fx.alice.id,
            }),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_checkout_endpoint() {
    let app = TestApp::new(5).await;
    let request = |user_id| {
        json!({
            "courseId": app.fx.course.id,
            "slotAt": rfc3339(future_slot()),
            "userId": user_id,
        })
    };

    let (status, body) = app
        .send_json(
            "POST",
            "/data/checkout",
            Some(&app.fx.alice),
            request(app.fx.bob.id),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["errors"].is_string());

    let (status, body) = app
        .send_json(
            "POST",
            "/data/checkout",
            Some(&app.fx.alice),
            request(app.fx.alice.id),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["amountCents"], 2500);
    assert_eq!(
        body["data"]["checkoutUrl"],
        "https://checkout.stripe.test/pay/cs_test_1"
    );
    assert_eq!(app.gateway.requests().len(), 1);
}

#[tokio::test]
async fn test_webhook_endpoint_status_codes() {
    let app = TestApp::new(5).await;
    let metadata = BookingMetadata {
        course_id: app.fx.course.id,
        slot_at: future_slot(),
        user_id: app.fx.alice.id,
    };
    let payload = paid_session("evt_http_1", &metadata);

    let (status, _) = app.webhook(payload.clone(), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let forged = sign_payload(&payload, "whsec_wrong", Utc::now().timestamp()).unwrap();
    let (status, _) = app.webhook(payload.clone(), Some(forged)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let signature = signed_now(&payload);
    let (status, body) = app.webhook(payload.clone(), Some(signature.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "confirmed");
    assert!(body["bookingId"].is_string());

    let (status, body) = app.webhook(payload, Some(signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "already_processed");

    let (status, body) = app.get("/data/bookings/mine", Some(&app.fx.alice)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["data"][0]["status"], "confirmed");
    assert_eq!(body["data"][0]["paymentStatus"], "paid");
}

#[tokio::test]
async fn test_webhook_with_bad_metadata_is_unprocessable() {
    let app = TestApp::new(5).await;
    let payload = serde_json::to_vec(&json!({
        "id": "evt_http_bad",
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": "cs_bad",
            "payment_status": "paid",
            "amount_total": 2500,
            "currency": "eur",
            "metadata": { "booking_type": "course_booking", "course_id": app.fx.course.id.to_string() },
        }}
    }))
    .unwrap();

    let (status, _) = app.webhook(payload.clone(), Some(signed_now(&payload))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_webhook_store_outage_asks_for_retry() {
    let app = TestApp::new(5).await;
    let metadata = BookingMetadata {
        course_id: app.fx.course.id,
        slot_at: future_slot(),
        user_id: app.fx.alice.id,
    };
    let payload = paid_session("evt_http_outage", &metadata);

    app.fx.store.set_unavailable(true);
    let (status, body) = app.webhook(payload.clone(), Some(signed_now(&payload))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["errors"], "Service temporarily unavailable");
}

#[tokio::test]
async fn test_stripe_routes_without_configuration() {
    let fx = Fixture::new(5).await;
    let router = build_router(AppState::new(fx.dyn_store(), JwtService::new(JWT_SECRET)));

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/data/stripe/webhooks")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_admin_booking_management() {
    let app = TestApp::new(1).await;
    let slot = future_slot();

    let booking = app
        .fx
        .store
        .confirm_booking(NewBooking {
            course_id: app.fx.course.id,
            user_id: app.fx.alice.id,
            slot_at: slot,
            status: BookingStatus::Confirmed,
            payment_status: PaymentStatus::Paid,
            payment_reference: Some("pi_admin_test".into()),
            amount_cents: 2500,
            currency: "eur".into(),
        })
        .await
        .unwrap()
        .booking()
        .clone();
    let status_uri = format!("/data/bookings/{}/status", booking.id);

    // Clients cannot manage bookings
    let (status, _) = app
        .send_json("PUT", &status_uri, Some(&app.fx.alice), json!({ "status": "cancelled" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // The only seat is taken
    let (status, _) = app
        .send_json(
            "POST",
            "/data/bookings",
            Some(&app.fx.admin),
            json!({
                "courseId": app.fx.course.id,
                "userId": app.fx.bob.id,
                "slotAt": rfc3339(slot),
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = app
        .send_json("PUT", &status_uri, Some(&app.fx.admin), json!({ "status": "cancelled" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");

    // Cancelled is terminal
    let (status, _) = app
        .send_json("PUT", &status_uri, Some(&app.fx.admin), json!({ "status": "confirmed" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // The freed seat can be booked again
    let (status, body) = app
        .send_json(
            "POST",
            "/data/bookings",
            Some(&app.fx.admin),
            json!({
                "courseId": app.fx.course.id,
                "userId": app.fx.bob.id,
                "slotAt": rfc3339(slot),
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "confirmed");

    let (status, body) = app
        .get(
            &format!(
                "/data/courses/{}/bookings?slot={}",
                app.fx.course.id,
                rfc3339(slot)
            ),
            Some(&app.fx.admin),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_admin_creates_course() {
    let app = TestApp::new(5).await;
    let course = json!({
        "title": "Yin Evening",
        "priceCents": 1800,
        "durationMinutes": 75,
        "capacity": 12,
    });

    let (status, _) = app
        .send_json("POST", "/data/courses", Some(&app.fx.bob), course.clone())
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .send_json("POST", "/data/courses", Some(&app.fx.admin), course)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["capacity"], 12);
    assert_eq!(body["data"]["currency"], "eur");

    let (status, _) = app
        .send_json(
            "POST",
            "/data/courses",
            Some(&app.fx.admin),
            json!({ "title": "Free", "priceCents": 0, "durationMinutes": 60, "capacity": 5 }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(app.fx.store.list_courses().await.unwrap().len(), 2);
}
