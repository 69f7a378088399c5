use anyhow::{Context, Result};
use uuid::Uuid;

use crate::auth::JwtService;
use crate::booking_store::BookingStore;
use crate::bookings_repo::PgBookingStore;
use crate::config::AppConfig;
use crate::database::create_pool;

/// Print a bearer token for an existing user. Used for operations and local
/// testing when the identity provider is not in the loop.
pub async fn handle_issue_token(config: &AppConfig, user_id: Uuid) -> Result<()> {
    let pool = create_pool(config.database_url()?, 1)?;
    let store = PgBookingStore::new(pool);

    let user = store
        .get_user(user_id)
        .await
        .context("Failed to load user")?
        .with_context(|| format!("User {} not found", user_id))?;

    let token = JwtService::new(config.jwt_secret()?).generate_token(&user)?;
    println!("{}", token);
    Ok(())
}
