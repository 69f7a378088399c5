use anyhow::{Context, Result};
use chrono::Duration;

use crate::checkout::{CheckoutSettings, DEFAULT_SESSION_TTL_MINUTES};
use crate::stripe_events::DEFAULT_TOLERANCE_SECS;

const DEFAULT_BASE_URL: &str = "http://localhost:3000";

/// Process configuration read from the environment (and `.env`)
#[derive(Clone)]
pub struct AppConfig {
    /// Absent only when serving from the in-memory store
    pub database_url: Option<String>,
    pub jwt_secret: Option<String>,
    pub base_url: String,
    pub checkout_session_ttl_minutes: i64,
    pub webhook_tolerance_secs: i64,
    pub environment: String,
    pub db_pool_size: u32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let checkout_session_ttl_minutes =
            parse_var("CHECKOUT_SESSION_TTL_MINUTES", DEFAULT_SESSION_TTL_MINUTES)?;
        if checkout_session_ttl_minutes < 30 {
            // Stripe refuses sessions that expire in under 30 minutes
            anyhow::bail!("CHECKOUT_SESSION_TTL_MINUTES must be at least 30");
        }

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            jwt_secret: std::env::var("JWT_SECRET").ok().filter(|s| !s.is_empty()),
            base_url: std::env::var("BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            checkout_session_ttl_minutes,
            webhook_tolerance_secs: parse_var(
                "STRIPE_WEBHOOK_TOLERANCE_SECS",
                DEFAULT_TOLERANCE_SECS,
            )?,
            environment: std::env::var("STUDIO_ENV").unwrap_or_else(|_| "development".to_string()),
            db_pool_size: parse_var("DATABASE_POOL_SIZE", 10)?,
        })
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set")
    }

    pub fn jwt_secret(&self) -> Result<&str> {
        self.jwt_secret.as_deref().context("JWT_SECRET must be set")
    }

    pub fn checkout_settings(&self) -> CheckoutSettings {
        CheckoutSettings {
            base_url: self.base_url.clone(),
            session_ttl: Duration::minutes(self.checkout_session_ttl_minutes),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "[REDACTED]"))
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("checkout_session_ttl_minutes", &self.checkout_session_ttl_minutes)
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .field("environment", &self.environment)
            .field("db_pool_size", &self.db_pool_size)
            .finish()
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}
