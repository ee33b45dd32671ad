use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

/// Stand-in for the real auth collaborator: reads an already-authenticated
/// user id out of the `X-User-Id` header. Not a real auth system — the
/// actual identity layer is a deployment-time concern that sits in front
/// of this service.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser {
    pub id: i64,
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts.headers.get("x-user-id").ok_or_else(unauthenticated)?;
        let id: i64 = header
            .to_str()
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(unauthenticated)?;
        Ok(CurrentUser { id })
    }
}

fn unauthenticated() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"status": "error", "message": "missing or invalid X-User-Id header"})),
    )
}
