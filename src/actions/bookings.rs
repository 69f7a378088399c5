use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::{AdminUser, AuthUser};
use crate::bookings::{Booking, BookingStatus, ConfirmOutcome, NewBooking, PaymentStatus};
use crate::error::BookingError;
use crate::web::AppState;

use super::{DataListResponse, DataResponse, json_error};

/// View model for bookings (API response)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingView {
    pub id: String,
    pub course_id: String,
    pub user_id: String,
    pub slot_at: String,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub payment_reference: Option<String>,
    pub amount_cents: i32,
    pub currency: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Booking> for BookingView {
    fn from(b: Booking) -> Self {
        Self {
            id: b.id.to_string(),
            course_id: b.course_id.to_string(),
            user_id: b.user_id.to_string(),
            slot_at: b.slot_at.to_rfc3339(),
            status: b.status,
            payment_status: b.payment_status,
            payment_reference: b.payment_reference,
            amount_cents: b.amount_cents,
            currency: b.currency,
            created_at: b.created_at.to_rfc3339(),
            updated_at: b.updated_at.to_rfc3339(),
        }
    }
}

/// Request body for an admin-created booking (cash payments, comps)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBookingRequest {
    pub course_id: Uuid,
    pub user_id: Uuid,
    pub slot_at: String,
    pub status: Option<String>,
    pub payment_status: Option<String>,
    pub payment_reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateBookingStatusRequest {
    pub status: String,
}

/// GET /bookings/mine
pub async fn list_my_bookings(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.store.list_bookings_for_user(user.id).await {
        Ok(bookings) => {
            let views: Vec<BookingView> = bookings.into_iter().map(BookingView::from).collect();
            Json(DataListResponse { data: views }).into_response()
        }
        Err(e) => {
            error!(user_id = %user.id, error = %e, "Failed to list user bookings");
            e.into_response()
        }
    }
}

/// POST /bookings
/// Admin books a seat directly. Confirmed bookings go through the same
/// capacity-checked transaction as paid ones.
pub async fn create_booking(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Json(request): Json<CreateBookingRequest>,
) -> impl IntoResponse {
    match create_booking_inner(&state, request).await {
        Ok((status, booking)) => {
            info!(booking_id = %booking.id, admin_id = %admin.id, "Admin created booking");
            (
                status,
                Json(DataResponse {
                    data: BookingView::from(booking),
                }),
            )
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn create_booking_inner(
    state: &AppState,
    request: CreateBookingRequest,
) -> Result<(StatusCode, Booking), BookingError> {
    let slot_at = crate::bookings::parse_slot(&request.slot_at)?;
    if slot_at <= Utc::now() {
        return Err(BookingError::Validation(
            "Slot must be in the future".to_string(),
        ));
    }
    let status = match request.status.as_deref() {
        Some(raw) => raw.parse::<BookingStatus>()?,
        None => BookingStatus::Confirmed,
    };
    if !status.holds_seat() {
        return Err(BookingError::Validation(
            "New bookings must be pending or confirmed".to_string(),
        ));
    }
    let payment_status = match request.payment_status.as_deref() {
        Some(raw) => raw.parse::<PaymentStatus>()?,
        None => PaymentStatus::Pending,
    };

    let course = state
        .store
        .get_course(request.course_id)
        .await?
        .ok_or(BookingError::NotFound("course"))?;
    state
        .store
        .get_user(request.user_id)
        .await?
        .ok_or(BookingError::NotFound("user"))?;

    let new_booking = NewBooking {
        course_id: course.id,
        user_id: request.user_id,
        slot_at,
        status,
        payment_status,
        payment_reference: request.payment_reference,
        amount_cents: course.price_cents,
        currency: course.currency,
    };

    if status == BookingStatus::Confirmed {
        return match state.store.confirm_booking(new_booking).await? {
            ConfirmOutcome::Created(booking) => {
                metrics::counter!("bookings.confirmed").increment(1);
                Ok((StatusCode::CREATED, booking))
            }
            ConfirmOutcome::Promoted(booking) => {
                metrics::counter!("bookings.confirmed").increment(1);
                Ok((StatusCode::OK, booking))
            }
            ConfirmOutcome::AlreadyConfirmed(booking) => Ok((StatusCode::OK, booking)),
        };
    }

    let booking = state.store.insert_booking(new_booking).await?;
    Ok((StatusCode::CREATED, booking))
}

/// PUT /bookings/{id}/status
/// Forward-only transitions; confirming re-checks capacity
pub async fn update_booking_status(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Json(request): Json<UpdateBookingStatusRequest>,
) -> impl IntoResponse {
    let status = match request.status.parse::<BookingStatus>() {
        Ok(status) => status,
        Err(e) => return e.into_response(),
    };

    match state.store.update_booking_status(booking_id, status).await {
        Ok(booking) => {
            if status == BookingStatus::Confirmed {
                metrics::counter!("bookings.confirmed").increment(1);
            }
            info!(
                booking_id = %booking.id,
                status = ?booking.status,
                admin_id = %admin.id,
                "Updated booking status"
            );
            Json(DataResponse {
                data: BookingView::from(booking),
            })
            .into_response()
        }
        Err(BookingError::NotFound(_)) => {
            json_error(StatusCode::NOT_FOUND, "Booking not found").into_response()
        }
        Err(e) => e.into_response(),
    }
}
