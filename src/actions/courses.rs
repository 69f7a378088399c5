use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::AdminUser;
use crate::availability::Availability;
use crate::bookings::parse_slot;
use crate::courses::{Course, DEFAULT_CURRENCY, NewCourse};
use crate::web::AppState;

use super::{DataListResponse, DataResponse, json_error};
use super::bookings::BookingView;

/// View model for courses (API response)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseView {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub price_cents: i32,
    pub currency: String,
    pub duration_minutes: i32,
    pub capacity: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Course> for CourseView {
    fn from(c: Course) -> Self {
        Self {
            id: c.id.to_string(),
            title: c.title,
            description: c.description,
            price_cents: c.price_cents,
            currency: c.currency,
            duration_minutes: c.duration_minutes,
            capacity: c.capacity,
            created_at: c.created_at.to_rfc3339(),
            updated_at: c.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityView {
    pub course_id: String,
    pub slot_at: String,
    pub capacity: i32,
    pub confirmed: i64,
    pub remaining: i64,
    pub has_capacity: bool,
}

impl From<Availability> for AvailabilityView {
    fn from(a: Availability) -> Self {
        Self {
            remaining: a.remaining(),
            course_id: a.course_id.to_string(),
            slot_at: a.slot_at.to_rfc3339(),
            capacity: a.capacity,
            confirmed: a.confirmed,
            has_capacity: a.has_capacity,
        }
    }
}

/// Request body for creating a course
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCourseRequest {
    pub title: String,
    pub description: Option<String>,
    pub price_cents: i32,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub duration_minutes: i32,
    pub capacity: i32,
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityParams {
    pub slot: String,
}

#[derive(Debug, Deserialize)]
pub struct CourseBookingsParams {
    pub slot: Option<String>,
}

/// GET /courses
pub async fn list_courses(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_courses().await {
        Ok(courses) => {
            let views: Vec<CourseView> = courses.into_iter().map(CourseView::from).collect();
            Json(DataListResponse { data: views }).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to list courses");
            e.into_response()
        }
    }
}

/// GET /courses/{id}
pub async fn get_course(
    State(state): State<AppState>,
    Path(course_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.store.get_course(course_id).await {
        Ok(Some(course)) => Json(DataResponse {
            data: CourseView::from(course),
        })
        .into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Course not found").into_response(),
        Err(e) => {
            error!(course_id = %course_id, error = %e, "Failed to get course");
            e.into_response()
        }
    }
}

/// POST /courses
/// Admin adds a course to the catalog
pub async fn create_course(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Json(request): Json<CreateCourseRequest>,
) -> impl IntoResponse {
    let new_course = NewCourse {
        title: request.title.trim().to_string(),
        description: request.description,
        price_cents: request.price_cents,
        currency: request.currency.to_lowercase(),
        duration_minutes: request.duration_minutes,
        capacity: request.capacity,
    };
    if let Err(e) = new_course.validate() {
        return e.into_response();
    }

    match state.store.create_course(new_course).await {
        Ok(course) => {
            info!(course_id = %course.id, admin_id = %admin.id, "Created course");
            (
                StatusCode::CREATED,
                Json(DataResponse {
                    data: CourseView::from(course),
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to create course");
            e.into_response()
        }
    }
}

/// GET /courses/{id}/availability?slot=<rfc3339>
/// Advisory seat count; the webhook transaction has the final say
pub async fn get_course_availability(
    State(state): State<AppState>,
    Path(course_id): Path<Uuid>,
    Query(params): Query<AvailabilityParams>,
) -> impl IntoResponse {
    let slot_at = match parse_slot(&params.slot) {
        Ok(slot_at) => slot_at,
        Err(e) => return e.into_response(),
    };

    match state.availability.check(course_id, slot_at, Utc::now()).await {
        Ok(availability) => Json(DataResponse {
            data: AvailabilityView::from(availability),
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /courses/{id}/bookings[?slot=<rfc3339>]
/// Admin roster for a course, optionally for one slot
pub async fn list_course_bookings(
    AdminUser(_admin): AdminUser,
    State(state): State<AppState>,
    Path(course_id): Path<Uuid>,
    Query(params): Query<CourseBookingsParams>,
) -> impl IntoResponse {
    let slot_at = match params.slot.as_deref().map(parse_slot).transpose() {
        Ok(slot_at) => slot_at,
        Err(e) => return e.into_response(),
    };

    match state.store.get_course(course_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Course not found").into_response(),
        Err(e) => return e.into_response(),
    }

    match state.store.list_bookings_for_course(course_id, slot_at).await {
        Ok(bookings) => {
            let views: Vec<BookingView> = bookings.into_iter().map(BookingView::from).collect();
            Json(DataListResponse { data: views }).into_response()
        }
        Err(e) => {
            error!(course_id = %course_id, error = %e, "Failed to list course bookings");
            e.into_response()
        }
    }
}
