use crate::auth::CurrentUser;
use crate::events;
use crate::manager::EventManager;
use crate::models::Priority;
use crate::provider::NotificationProvider;
use crate::store::MarkReadOutcome;
use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<NotificationProvider>,
    pub heartbeat_interval: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sse/{event_type}", get(sse_handler))
        .route("/mark_event_read/{event_id}", post(mark_event_read))
        .route("/mark_events_read", post(mark_events_read))
        .route("/generate_notification", post(generate_notification))
        .route("/api/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// Drops the registered stream exactly once, whether the client disconnects
/// cleanly or the stream future is cancelled mid-poll.
struct StreamGuard {
    manager: Arc<EventManager>,
    user_id: i64,
    stream_id: Uuid,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.manager.unregister_user_stream(self.user_id, self.stream_id);
    }
}

async fn sse_handler(
    State(state): State<AppState>,
    Path(event_type): Path<String>,
    user: CurrentUser,
) -> Result<Response, Response> {
    let manager = state.provider.manager().clone();
    let registered = manager
        .register_user_stream(user.id, &event_type)
        .await
        .map_err(|e| e.into_response())?;

    let Some((stream_id, mailbox)) = registered else {
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            "Max connections reached.",
        )
            .into_response());
    };

    let guard = StreamGuard {
        manager: manager.clone(),
        user_id: user.id,
        stream_id,
    };
    let heartbeat_interval = state.heartbeat_interval;

    let stream = stream::unfold((mailbox, guard), move |(mailbox, guard)| async move {
        let frame = match mailbox.pop_wait(heartbeat_interval).await {
            Some(event) => {
                let wire = event.to_wire();
                SseEvent::default()
                    .event(event.event_type.clone())
                    .json_data(wire)
                    .unwrap_or_else(|_| SseEvent::default().event("error").data("{}"))
            }
            None => SseEvent::default()
                .event("heartbeat")
                .data(r#"{"status":"heartbeat"}"#),
        };
        Some((Ok::<SseEvent, Infallible>(frame), (mailbox, guard)))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}

async fn mark_event_read(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(event_id): Path<i64>,
) -> Response {
    match state.provider.manager().mark_read(event_id, user.id).await {
        Ok(MarkReadOutcome::Ok) => (StatusCode::OK, Json(json!({"status": "success"}))).into_response(),
        Ok(MarkReadOutcome::AlreadyRead) => (
            StatusCode::OK,
            Json(json!({"status": "warning", "message": "Already read"})),
        )
            .into_response(),
        Ok(MarkReadOutcome::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "error", "message": "Not found or access denied"})),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct MarkEventsReadBody {
    event_ids: Vec<i64>,
}

async fn mark_events_read(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<MarkEventsReadBody>,
) -> Response {
    if body.event_ids.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "message": "event_ids must not be empty"})),
        )
            .into_response();
    }

    match state.provider.dismiss_items(&body.event_ids, user.id).await {
        Ok(n) => (
            StatusCode::OK,
            Json(json!({"status": "success", "message": format!("{n} events marked as read")})),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct GenerateNotificationForm {
    title: String,
    message: String,
    target_userid: Option<i64>,
    priority: Option<String>,
    expire_after: Option<i64>,
}

async fn generate_notification(
    State(state): State<AppState>,
    user: CurrentUser,
    Form(form): Form<GenerateNotificationForm>,
) -> Response {
    let target = form.target_userid.unwrap_or(user.id);
    let priority = form
        .priority
        .as_deref()
        .and_then(Priority::from_str_name)
        .unwrap_or_default();
    let expire_after = Some(form.expire_after.unwrap_or(5));
    let payload = json!({"title": form.title, "message": form.message});

    match state
        .provider
        .send_user_notification(events::SYSTEM_NOTIFICATION, target, priority, expire_after, payload)
        .await
    {
        Ok(Some(event)) => (
            StatusCode::CREATED,
            Json(json!({
                "status": "success",
                "event_id": event.id,
                "event_type": event.event_type,
                "created_at": event.created_at.to_rfc3339(),
            })),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "message": "internal error"})),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}
