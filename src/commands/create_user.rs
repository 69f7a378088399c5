use anyhow::{Context, Result};
use tracing::info;

use crate::booking_store::BookingStore;
use crate::bookings_repo::PgBookingStore;
use crate::config::AppConfig;
use crate::database::create_pool;
use crate::users::{NewUser, UserRole};

/// Register a user identity (credentials stay with the identity provider)
pub async fn handle_create_user(config: &AppConfig, email: String, role: UserRole) -> Result<()> {
    let email = email.trim().to_lowercase();
    if !email.contains('@') {
        anyhow::bail!("'{}' is not an email address", email);
    }

    let pool = create_pool(config.database_url()?, 1)?;
    let store = PgBookingStore::new(pool);

    let user = store
        .create_user(NewUser { email, role })
        .await
        .context("Failed to create user")?;

    info!(user_id = %user.id, role = ?user.role, "Created user");
    println!("{}", user.id);
    Ok(())
}
