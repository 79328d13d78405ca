//! Caller identity at the HTTP boundary
//!
//! Tokens are HS256 JWTs issued by the external identity service. The
//! middleware turns a valid `Authorization: Bearer` token into a [`Caller`]
//! request extension; handlers never see the raw token.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::Response,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::core_types::UserId;

use super::state::AppState;
use super::types::ApiError;

pub const ROLE_USER: &str = "user";
pub const ROLE_ADMIN: &str = "admin";

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    pub role: String,
    pub exp: usize,
    pub iat: usize,
}

/// Authenticated caller, injected by [`jwt_auth_middleware`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub is_admin: bool,
}

pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Issue a token; used by tooling and tests
    pub fn issue(
        &self,
        user_id: &UserId,
        role: &str,
        ttl: Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            role: role.to_string(),
            exp: (now + ttl).timestamp().max(0) as usize,
            iat: now.timestamp().max(0) as usize,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let validation = Validation::new(Algorithm::HS256);
        let token_data = decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(token_data.claims)
    }
}

pub async fn jwt_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(ApiError::missing_auth)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("Invalid token format"))?;

    let claims = state.jwt.verify(token).map_err(|e| {
        tracing::debug!(error = %e, "Rejected caller token");
        ApiError::unauthorized("Invalid or expired token")
    })?;
    if claims.sub.trim().is_empty() {
        return Err(ApiError::unauthorized("Invalid user ID in token"));
    }

    request.extensions_mut().insert(Caller {
        user_id: UserId::new(claims.sub),
        is_admin: claims.role == ROLE_ADMIN,
    });
    Ok(next.run(request).await)
}

/// Must be layered inside [`jwt_auth_middleware`]
pub async fn require_admin(request: Request<Body>, next: Next) -> Result<Response, ApiError> {
    match request.extensions().get::<Caller>() {
        Some(caller) if caller.is_admin => Ok(next.run(request).await),
        Some(caller) => {
            tracing::warn!(user_id = %caller.user_id, "Non-admin caller on admin route");
            Err(ApiError::forbidden("Admin role required"))
        }
        None => Err(ApiError::missing_auth()),
    }
}
