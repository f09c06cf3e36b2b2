use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use serde::Deserialize;

use crate::errors::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Deserialize)]
struct IdentityQuery {
    user_id: Option<String>,
}

/// The authenticated caller. Read from the `X-User-Id` header set by the
/// fronting gateway, or from `?user_id=` for `EventSource` requests, which
/// cannot carry custom headers.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub String);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let from_header = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let user_id = match from_header {
            Some(id) => Some(id),
            None => Query::<IdentityQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(q)| q.user_id)
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
        };

        user_id.map(CurrentUser).ok_or(AppError::Unauthenticated)
    }
}
