//! Request middleware: bearer-token authentication and per-route rate
//! limiting keyed by the authenticated identity.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, warn};

use conveyor_auth::{AuthError, TokenService, TokenType};
use conveyor_core::ServiceError;
use conveyor_infra::rate_limit::{RateLimiter, RateLimiterConfig};

use crate::errors::ApiError;

/// The authenticated identity, set by [`auth_middleware`] from the access
/// token claim. Handlers never accept an owner from the request itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub i64);

#[derive(Clone)]
pub struct AuthState {
    pub tokens: Arc<TokenService>,
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer(req.headers()).ok_or(ApiError(ServiceError::InvalidToken))?;

    let claims = state.tokens.validate(token, TokenType::Access).map_err(|e| {
        if e == AuthError::Expired {
            debug!("rejected expired access token");
        }
        ApiError(ServiceError::InvalidToken)
    })?;

    req.extensions_mut().insert(CurrentUser(claims.user_id));
    Ok(next.run(req).await)
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

#[derive(Clone)]
pub struct RateLimitState {
    /// `None` disables limiting (tests, single-box development).
    pub limiter: Option<RateLimiter>,
    pub config: RateLimiterConfig,
}

/// Token-bucket check for the authenticated identity. Fails open when the
/// bucket store is unreachable.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(limiter) = &state.limiter else {
        return Ok(next.run(req).await);
    };

    // Runs inside the auth layer, so the identity is always present.
    let Some(user) = req.extensions().get::<CurrentUser>().copied() else {
        return Err(ApiError(ServiceError::InvalidToken));
    };

    match limiter.check(user.0, &state.config).await {
        Ok(true) => Ok(next.run(req).await),
        Ok(false) => Err(ApiError(ServiceError::RateLimited)),
        Err(e) => {
            warn!(user_id = user.0, error = %e, "rate limiter unreachable, failing open");
            Ok(next.run(req).await)
        }
    }
}
