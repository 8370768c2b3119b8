//! JWT validation and token extraction

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AuthError;

/// Raw claims as minted by the auth service. `user_id` predates `sub`;
/// either is accepted.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    email: String,
    #[serde(default)]
    roles: Vec<String>,
    exp: i64,
    #[serde(default)]
    iat: i64,
}

/// Identity attached to an authenticated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub user_id: i64,
    pub email: String,
    pub roles: Vec<String>,
}

/// Validates HS256 tokens against the shared secret.
#[derive(Clone)]
pub struct TokenValidator {
    decoding_key: DecodingKey,
}

impl TokenValidator {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Decode and validate a token. Expiration is mandatory.
    pub fn validate(&self, token: &str) -> Result<TokenPayload, AuthError> {
        let validation = Validation::new(Algorithm::HS256);

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            debug!("Token rejected: {}", e);
            AuthError::InvalidToken
        })?;

        let claims = data.claims;
        let user_id = claims
            .user_id
            .or_else(|| claims.sub.as_deref().and_then(|s| s.parse().ok()))
            .unwrap_or(0);

        Ok(TokenPayload {
            user_id,
            email: claims.email,
            roles: claims.roles,
        })
    }
}

/// Extract a JWT from an Authorization header.
///
/// `Bearer <jwt>` carries the token directly. `Basic <base64>` decodes to
/// `user:jwt`; the password field is the token.
pub fn extract_token(auth_header: &str) -> Option<String> {
    let (scheme, value) = auth_header.trim().split_once(' ')?;
    let value = value.trim();

    if scheme.eq_ignore_ascii_case("bearer") {
        return Some(value.to_string());
    }

    if scheme.eq_ignore_ascii_case("basic") {
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(value)
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (_, password) = decoded.split_once(':')?;
        return Some(password.to_string());
    }

    None
}
