use anyhow::Result;
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::actions;
use crate::auth::JwtService;
use crate::availability::AvailabilityChecker;
use crate::booking_store::BookingStore;
use crate::checkout::CheckoutInitiator;
use crate::reconciler::WebhookReconciler;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BookingStore>,
    pub availability: AvailabilityChecker,
    /// None when Stripe is not configured
    pub checkout: Option<CheckoutInitiator>,
    pub reconciler: Option<WebhookReconciler>,
    pub jwt: Arc<JwtService>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(store: Arc<dyn BookingStore>, jwt: JwtService) -> Self {
        Self {
            availability: AvailabilityChecker::new(store.clone()),
            store,
            checkout: None,
            reconciler: None,
            jwt: Arc::new(jwt),
            metrics_handle: None,
        }
    }

    pub fn with_checkout(mut self, checkout: CheckoutInitiator) -> Self {
        self.checkout = Some(checkout);
        self
    }

    pub fn with_reconciler(mut self, reconciler: WebhookReconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

/// Logs each request with a short correlation id and records its latency
async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let request_id = Uuid::new_v4().simple().to_string();
    let request_id = &request_id[..8];
    let started = Instant::now();

    debug!(%method, %path, request_id, "Request started");
    let response = next.run(request).await;

    let elapsed = started.elapsed();
    let status = response.status().as_u16();
    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .record(elapsed.as_secs_f64());
    info!(
        %method,
        %path,
        request_id,
        status,
        elapsed_ms = elapsed.as_millis() as u64,
        "Request completed"
    );

    response
}

/// Reports 5xx responses to Sentry. 503s from a store outage are expected
/// during failover and only logged.
async fn sentry_error_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    let response = next.run(request).await;
    let status = response.status();
    if !status.is_server_error() {
        return response;
    }

    error!(%method, %path, status = status.as_u16(), "Request failed");
    if status != StatusCode::SERVICE_UNAVAILABLE {
        sentry::with_scope(
            |scope| {
                scope.set_tag("http.method", method.as_str());
                scope.set_tag("http.path", &path);
                scope.set_tag("http.status_code", status.as_u16());
            },
            || {
                sentry::capture_message(
                    &format!("{} {} returned {}", method, path, status),
                    sentry::Level::Error,
                )
            },
        );
    }

    response
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "Metrics are not enabled").into_response(),
    }
}

/// Build the application router. Split from the server so tests can drive it
/// directly.
pub fn build_router(state: AppState) -> Router {
    let api_router = Router::new()
        // Catalog
        .route(
            "/courses",
            get(actions::list_courses).post(actions::create_course),
        )
        .route("/courses/{id}", get(actions::get_course))
        .route(
            "/courses/{id}/availability",
            get(actions::get_course_availability),
        )
        .route("/courses/{id}/bookings", get(actions::list_course_bookings))
        // Booking flow
        .route("/checkout", post(actions::create_checkout))
        .route("/bookings", post(actions::create_booking))
        .route("/bookings/mine", get(actions::list_my_bookings))
        .route("/bookings/{id}/status", put(actions::update_booking_status))
        .route("/stripe/webhooks", post(actions::handle_stripe_webhook));

    Router::new()
        .nest("/data", api_router)
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .with_state(state)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(middleware::from_fn(sentry_error_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub async fn start_web_server(interface: String, port: u16, state: AppState) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "web-server");
    });
    info!("Starting web server on {}:{}", interface, port);

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", interface, port)).await?;
    info!("Web server listening on http://{}:{}", interface, port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Web server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining connections");
}
