//! WebSocket upgrade endpoint.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use serde::Deserialize;
use tracing::info;

use crate::realtime::run_session;

use super::error::ApiError;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// `GET /ws` — authenticate, bound frame size, hand off to the session
/// pumps.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if state.hub.is_shutting_down() {
        return Err(ApiError::unavailable("hub is shutting down"));
    }

    let token = params
        .token
        .or_else(|| bearer_token(&headers))
        .ok_or_else(ApiError::unauthorized)?;
    let subject = state
        .authenticator
        .authenticate(&token)
        .await
        .map_err(|_| ApiError::unauthorized())?;

    info!(subject = %subject, "WebSocket connection request");
    let hub = state.hub.clone();
    let max_frame = hub.config().max_message_bytes;
    Ok(ws
        .max_message_size(max_frame)
        .on_upgrade(move |socket| run_session(socket, hub, subject)))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok-1"),
        );
        assert_eq!(bearer_token(&headers), Some("tok-1".to_string()));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic x"));
        assert_eq!(bearer_token(&headers), None);
    }
}
