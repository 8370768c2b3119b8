//! Authorization middleware for the registry and chart surfaces
//!
//! Three modes, decided by configuration:
//! - auth disabled: everything passes,
//! - anonymous pull: GET/HEAD pass without a token, writes need one,
//! - strict: every operation needs a valid token.

use axum::{
    extract::{Request, State},
    http::{Method, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::debug;

use crate::error::AuthError;
use crate::jwt::{TokenValidator, extract_token};

/// Authorization mode switches.
#[derive(Debug, Clone, Copy)]
pub struct AuthSettings {
    /// Master switch for token validation.
    pub enabled: bool,
    /// Permit GET/HEAD without a token.
    pub anonymous_pull: bool,
}

/// Shared state for the middleware layer.
pub struct AuthContext {
    pub settings: AuthSettings,
    pub validator: TokenValidator,
}

impl AuthContext {
    pub fn new(settings: AuthSettings, validator: TokenValidator) -> Self {
        Self {
            settings,
            validator,
        }
    }
}

fn is_write(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Middleware enforcing the configured authorization mode.
///
/// On success the validated [`crate::TokenPayload`] is attached to request
/// extensions for handlers that care about identity.
pub async fn require_auth(
    State(ctx): State<Arc<AuthContext>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if !ctx.settings.enabled {
        return Ok(next.run(request).await);
    }

    if !is_write(request.method()) && ctx.settings.anonymous_pull {
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(extract_token)
        .ok_or(AuthError::MissingToken)?;

    let payload = ctx.validator.validate(&token)?;
    debug!("Authenticated user {} ({})", payload.user_id, payload.email);
    request.extensions_mut().insert(payload);

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::{get, put};
    use axum::{Router, middleware};
    use jsonwebtoken::{EncodingKey, Header, encode};
    use tower::ServiceExt;

    fn app(enabled: bool, anonymous_pull: bool) -> Router {
        let ctx = Arc::new(AuthContext::new(
            AuthSettings {
                enabled,
                anonymous_pull,
            },
            TokenValidator::new("secret"),
        ));
        Router::new()
            .route("/v2/{*path}", get(|| async { "ok" }))
            .route("/v2/{*path}", put(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(ctx, require_auth))
    }

    fn bearer() -> String {
        #[derive(serde::Serialize)]
        struct Claims {
            user_id: i64,
            email: String,
            roles: Vec<String>,
            exp: i64,
            iat: i64,
        }
        let now = chrono::Utc::now().timestamp();
        let token = encode(
            &Header::default(),
            &Claims {
                user_id: 1,
                email: "t@example.com".to_string(),
                roles: vec![],
                exp: now + 600,
                iat: now,
            },
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        format!("Bearer {}", token)
    }

    #[tokio::test]
    async fn anonymous_pull_allows_reads_only() {
        let app = app(true, true);

        let read = HttpRequest::get("/v2/ns/img/manifests/latest")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.clone().oneshot(read).await.unwrap().status(), StatusCode::OK);

        let write = HttpRequest::put("/v2/ns/img/manifests/v1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(write).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response
                .headers()
                .get("www-authenticate")
                .and_then(|h| h.to_str().ok()),
            Some("Bearer realm=\"repo-worker\",service=\"repo-worker\"")
        );
    }

    #[tokio::test]
    async fn strict_mode_requires_token_for_reads() {
        let app = app(true, false);
        let read = HttpRequest::get("/v2/ns/img/manifests/latest")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            app.oneshot(read).await.unwrap().status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn valid_token_permits_writes() {
        let app = app(true, true);
        let write = HttpRequest::put("/v2/ns/img/manifests/v1")
            .header("authorization", bearer())
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.oneshot(write).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn disabled_auth_passes_everything() {
        let app = app(false, false);
        let write = HttpRequest::put("/v2/ns/img/manifests/v1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.oneshot(write).await.unwrap().status(), StatusCode::OK);
    }
}
