use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::{config::AppConfig, error::AppError};

pub const ADMINISTRATOR: &str = "Administrator";
pub const USER: &str = "User";
pub const ROLES: [&str; 2] = [ADMINISTRATOR, USER];

// ── JWT Claims ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64, // user id
    pub name: String,
    pub email: String,
    pub roles: Vec<String>,
    pub exp: usize, // expiry (unix timestamp)
}

impl Claims {
    pub fn new(user_id: i64, name: &str, email: &str, roles: Vec<String>, ttl_minutes: i64) -> Self {
        let exp = (Utc::now() + chrono::Duration::minutes(ttl_minutes)).timestamp();
        Self {
            sub: user_id,
            name: name.to_string(),
            email: email.to_string(),
            roles,
            exp: exp.max(0) as usize,
        }
    }
}

pub fn sign(claims: &Claims, secret: &str) -> Result<String, AppError> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(anyhow::Error::new(e).context("signing access token")))
}

/// Verifies the signature of `token`. Expiry is only enforced when
/// `check_expiry` is set; token refresh accepts expired access tokens.
pub fn verify(token: &str, secret: &str, check_expiry: bool) -> Option<Claims> {
    let mut validation = Validation::default();
    validation.validate_exp = check_expiry;
    if !check_expiry {
        validation.required_spec_claims.clear();
    }
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .ok()
    .map(|data| data.claims)
}

// ── Passwords ──

pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("hashing password: {e}")))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

// ── Request identity ──

/// The authenticated caller, passed explicitly to every operation that needs it.
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub roles: Vec<String>,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == ADMINISTRATOR)
    }

    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }

    /// Owners and administrators may mutate a resource.
    pub fn require_owner(&self, owner: Option<i64>) -> Result<(), AppError> {
        if self.is_admin() || owner == Some(self.id) {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }
}

impl From<Claims> for Actor {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.sub,
            name: claims.name,
            email: claims.email,
            roles: claims.roles,
        }
    }
}

/// Identity for routes that also serve anonymous callers. A token that is
/// present but invalid is still rejected.
#[derive(Debug, Clone)]
pub struct MaybeActor(pub Option<Actor>);

fn bearer(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn actor_from(token: &str, config: &AppConfig) -> Result<Actor, AppError> {
    verify(token, &config.jwt_secret, true)
        .map(Actor::from)
        .ok_or(AppError::Unauthorized("Invalid or expired token"))
}

impl<S> FromRequestParts<S> for Actor
where
    Arc<AppConfig>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = Arc::<AppConfig>::from_ref(state);
        let token = bearer(parts).ok_or(AppError::Unauthorized("Authentication required"))?;
        actor_from(token, &config)
    }
}

impl<S> FromRequestParts<S> for MaybeActor
where
    Arc<AppConfig>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = Arc::<AppConfig>::from_ref(state);
        match bearer(parts) {
            None => Ok(MaybeActor(None)),
            Some(token) => actor_from(token, &config).map(|actor| MaybeActor(Some(actor))),
        }
    }
}
