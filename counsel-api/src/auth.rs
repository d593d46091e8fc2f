use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, StatusCode},
    response::Response,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing;
use uuid::Uuid;

use crate::state::AppState;

/// JWT claims issued by the hosted auth provider.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: usize,
}

/// Session identity attached to every authenticated request.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

fn extract_token(auth_header: Option<&str>) -> Option<String> {
    auth_header?
        .strip_prefix("Bearer ")
        .map(|s| s.trim().to_string())
}

/// Signs a token for `user_id`, valid for `expires_in_days`.
pub fn generate_token(
    user_id: Uuid,
    email: Option<&str>,
    secret: &str,
    expires_in_days: u64,
) -> Result<String, StatusCode> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .as_secs() as usize;

    let claims = Claims {
        sub: user_id.to_string(),
        email: email.map(str::to_string),
        exp: now + (expires_in_days * 24 * 60 * 60) as usize,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_ref())).map_err(|e| {
        tracing::error!("Failed to generate JWT token: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

pub fn verify_token(token: &str, secret: &str) -> Result<AuthenticatedUser, StatusCode> {
    let decoding_key = DecodingKey::from_secret(secret.as_ref());
    let claims = match decode::<Claims>(token, &decoding_key, &Validation::default()) {
        Ok(token_data) => token_data.claims,
        Err(e) => {
            tracing::debug!("JWT verification failed: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };
    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| {
        tracing::debug!("JWT subject is not a user id: {}", claims.sub);
        StatusCode::UNAUTHORIZED
    })?;
    Ok(AuthenticatedUser {
        user_id,
        email: claims.email,
    })
}

/// Rejects requests without a valid bearer token. `/health` is public and
/// `/ws` authenticates through its `token` query parameter.
pub async fn auth_middleware(mut req: Request, next: axum::middleware::Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();
    if path == "/health" || path.starts_with("/ws") {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match extract_token(auth_header) {
        Some(t) => t,
        None => {
            tracing::debug!("Missing Authorization header");
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    let state = req
        .extensions()
        .get::<AppState>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    let user = verify_token(&token, &state.config.server.jwt_secret)?;
    tracing::debug!(user_id = %user.user_id, "Authenticated request");
    req.extensions_mut().insert(user);

    Ok(next.run(req).await)
}
