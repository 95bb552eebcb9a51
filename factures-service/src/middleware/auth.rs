//! Bearer authentication.
//!
//! Resolves `Authorization: Bearer <token>` to an active user through the
//! `UserDirectory`. Missing or invalid credentials are 401, inactive
//! accounts 403.

use crate::models::User;
use crate::startup::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use service_core::error::AppError;

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!(
                    "Missing or invalid Authorization header"
                ))
            })?;

        let user = state.users.authenticate(token).await?;

        let span = tracing::Span::current();
        span.record("tenant_id", tracing::field::display(user.tenant_id));
        span.record("user_id", tracing::field::display(user.id));

        Ok(AuthUser(user))
    }
}
