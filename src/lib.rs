//! Studio bookings: course catalog, Stripe checkout and webhook-driven
//! booking confirmation for a yoga studio.

pub mod actions;
pub mod auth;
pub mod availability;
pub mod booking_store;
pub mod bookings;
pub mod bookings_repo;
pub mod checkout;
pub mod commands;
pub mod config;
pub mod courses;
pub mod database;
pub mod error;
pub mod memory_store;
pub mod metrics;
pub mod payment_gateway;
pub mod reconciler;
pub mod schema;
pub mod stripe_client;
pub mod stripe_events;
pub mod users;
pub mod web;
pub mod webhook_events;

pub use booking_store::BookingStore;
pub use error::BookingError;
