//! Bearer-token identity for the booking API.
//!
//! Tokens only carry the user id; the role is re-read from the store on every
//! request so demoting an admin takes effect immediately.
use anyhow::Context;
use axum::{
    RequestPartsExt,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::actions::json_error;
use crate::users::User;
use crate::web::AppState;

pub const TOKEN_ISSUER: &str = "studio";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and checks HS256 access tokens
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl: Duration::days(7),
        }
    }

    pub fn generate_token(&self, user: &User) -> anyhow::Result<String> {
        self.generate_token_at(user, Utc::now())
    }

    fn generate_token_at(&self, user: &User, issued_at: DateTime<Utc>) -> anyhow::Result<String> {
        let claims = Claims {
            sub: user.id,
            iss: TOKEN_ISSUER.to_string(),
            iat: issued_at.timestamp(),
            exp: (issued_at + self.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .with_context(|| format!("Failed to sign token for user {}", user.id))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding_key, &self.validation).map(|data| data.claims)
    }
}

/// Any signed-in user, loaded from the store
#[derive(Debug)]
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| AuthError::MissingToken)?;

        let claims = state.jwt.verify_token(bearer.token()).map_err(|e| {
            debug!(error = %e, "Rejected bearer token");
            AuthError::InvalidToken
        })?;

        match state.store.get_user(claims.sub).await {
            Ok(Some(user)) => Ok(AuthUser(user)),
            Ok(None) => Err(AuthError::UnknownUser),
            Err(e) => {
                warn!(user_id = %claims.sub, error = %e, "Failed to load user for token");
                Err(AuthError::StoreUnavailable)
            }
        }
    }
}

/// A signed-in user whose stored role is admin
#[derive(Debug)]
pub struct AdminUser(pub User);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(user) = AuthUser::from_request_parts(parts, state).await?;
        if user.is_admin() {
            Ok(AdminUser(user))
        } else {
            Err(AuthError::AdminRequired)
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authorization token")]
    MissingToken,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Unknown user")]
    UnknownUser,
    #[error("Admin access required")]
    AdminRequired,
    #[error("Service temporarily unavailable")]
    StoreUnavailable,
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken | AuthError::UnknownUser => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::AdminRequired => StatusCode::FORBIDDEN,
            AuthError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        json_error(self.status_code(), &self.to_string()).into_response()
    }
}
