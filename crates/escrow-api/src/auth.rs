//! # Authentication Middleware
//!
//! Resolves the calling actor for every API request.
//!
//! ```text
//! Authorization: Bearer {token}    : required when a token is configured
//! X-Actor-Id: {user_id}            : the resolved actor identity
//! ```
//!
//! The bearer token authenticates the caller (the upstream identity
//! gateway); `X-Actor-Id` names the user it resolved. The engine only
//! checks membership and roles of that identity, never credentials.
//!
//! Commands extract [`Actor`]; a request without a resolved identity is
//! rejected with 401 before reaching the engine. Queries do not require an
//! actor.

use axum::extract::Request;
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use escrow_core::ActorId;
use subtle::ConstantTimeEq;

use crate::error::{AppError, ErrorBody, ErrorDetail};

/// Header carrying the resolved actor identity.
pub const ACTOR_HEADER: &str = "x-actor-id";

/// The actor resolved for the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor(pub ActorId);

impl<S: Send + Sync> axum::extract::FromRequestParts<S> for Actor {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Actor>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized(format!("missing {ACTOR_HEADER} header")))
    }
}

/// Auth configuration injected into request extensions.
///
/// Custom `Debug` redacts the token value to prevent credential leakage in logs.
#[derive(Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Constant-time token comparison.
fn token_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Verify the bearer token (when configured) and resolve `X-Actor-Id`.
pub async fn auth_middleware(mut request: Request, next: Next) -> Response {
    let expected = request
        .extensions()
        .get::<AuthConfig>()
        .and_then(|c| c.token.clone());

    if let Some(expected) = expected {
        let auth_header = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        match auth_header {
            Some(value) if value.starts_with("Bearer ") => {
                if !token_matches(&value[7..], &expected) {
                    tracing::warn!("authentication failed: invalid bearer token");
                    return unauthorized_response("invalid bearer token");
                }
            }
            Some(_) => {
                tracing::warn!("authentication failed: non-Bearer authorization scheme");
                return unauthorized_response("authorization header must use Bearer scheme");
            }
            None => {
                tracing::warn!("authentication failed: missing authorization header");
                return unauthorized_response("missing authorization header");
            }
        }
    }

    let actor = match request.headers().get(ACTOR_HEADER) {
        None => None,
        Some(raw) => {
            let parsed = raw
                .to_str()
                .map_err(|_| "actor identity is not valid UTF-8".to_string())
                .and_then(|s| ActorId::new(s.trim()).map_err(|e| e.to_string()));
            match parsed {
                Ok(id) if id.is_system() => {
                    tracing::warn!("authentication failed: reserved actor identity");
                    return unauthorized_response("actor identity is reserved");
                }
                Ok(id) => Some(id),
                Err(msg) => {
                    tracing::warn!(reason = %msg, "authentication failed: invalid actor identity");
                    return unauthorized_response(&msg);
                }
            }
        }
    };
    if let Some(id) = actor {
        request.extensions_mut().insert(Actor(id));
    }
    next.run(request).await
}

fn unauthorized_response(message: &str) -> Response {
    let body = ErrorBody {
        error: ErrorDetail {
            code: "UNAUTHORIZED".to_string(),
            message: message.to_string(),
            details: None,
        },
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}
