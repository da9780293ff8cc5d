//! JWT authentication module.
//!
//! Handles token generation and validation, and the middleware that turns a
//! bearer token into a caller identity.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

pub const ACCESS_TOKEN: &str = "access";
pub const OPERATOR_TOKEN: &str = "operator";

/// JWT claims structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,

    /// Device the token was issued to. Empty for operator tokens.
    #[serde(default)]
    pub device_id: String,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration (Unix timestamp)
    pub exp: i64,

    /// JWT ID (unique identifier for this token)
    pub jti: String,

    /// Token type ("access" or "operator")
    pub token_type: String,
}

/// A device acting for a user, from an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCaller {
    pub user_id: String,
    pub device_id: String,
}

/// An operator, from an operator token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorCaller {
    pub user_id: String,
}

/// JWT token manager.
pub struct JwtManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_lifetime_secs: i64,
}

impl JwtManager {
    /// Create a new JWT manager.
    pub fn new(secret: &str, access_lifetime_secs: i64) -> Self {
        JwtManager {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_lifetime_secs,
        }
    }

    /// Generate an access token for a user's device.
    pub fn generate_access_token(&self, user_id: &str, device_id: &str) -> Result<String, ApiError> {
        self.generate(user_id, device_id, ACCESS_TOKEN)
    }

    /// Generate an operator token.
    pub fn generate_operator_token(&self, user_id: &str) -> Result<String, ApiError> {
        self.generate(user_id, "", OPERATOR_TOKEN)
    }

    fn generate(&self, user_id: &str, device_id: &str, token_type: &str) -> Result<String, ApiError> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.access_lifetime_secs);

        let claims = Claims {
            sub: user_id.to_string(),
            device_id: device_id.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            jti: Uuid::new_v4().to_string(),
            token_type: token_type.to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ApiError::Internal(format!("Failed to generate token: {e}")))
    }

    /// Validate and decode a token.
    pub fn validate_token(&self, token: &str) -> Result<Claims, ApiError> {
        let token_data: TokenData<Claims> = decode(token, &self.decoding, &Validation::default())
            .map_err(|e| {
                tracing::debug!(error = %e, "Rejected bearer token");
                ApiError::Unauthenticated
            })?;

        Ok(token_data.claims)
    }

    /// Validate a device access token.
    pub fn validate_access_token(&self, token: &str) -> Result<DeviceCaller, ApiError> {
        let claims = self.validate_token(token)?;

        if claims.token_type != ACCESS_TOKEN || claims.device_id.is_empty() {
            return Err(ApiError::Unauthenticated);
        }

        Ok(DeviceCaller {
            user_id: claims.sub,
            device_id: claims.device_id,
        })
    }

    /// Validate an operator token.
    pub fn validate_operator_token(&self, token: &str) -> Result<OperatorCaller, ApiError> {
        let claims = self.validate_token(token)?;

        if claims.token_type != OPERATOR_TOKEN {
            return Err(ApiError::Forbidden);
        }

        Ok(OperatorCaller { user_id: claims.sub })
    }
}

/// Extract bearer token from the authorization header.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthenticated)?;

    let (scheme, token) = header.split_once(' ').ok_or(ApiError::Unauthenticated)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(ApiError::Unauthenticated);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(ApiError::Unauthenticated);
    }
    Ok(token)
}

/// Middleware for device routes.
pub async fn require_device(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers())?;
    let caller = state.jwt.validate_access_token(token)?;
    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

/// Middleware for operator routes.
pub async fn require_operator(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers())?;
    let caller = state.jwt.validate_operator_token(token)?;
    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

/// Compares two secrets in constant time.
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}
