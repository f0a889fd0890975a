//! Entity read and ingest handlers.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::application::ingress::SubmitRequest;
use crate::cache::CacheStatus;

use super::error::ApiError;
use super::AppState;

/// Header reporting where the response body came from.
pub const CACHE_STATUS_HEADER: &str = "Cache-Status";
/// Header carrying the client's dedup key for ingest.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

const DEFAULT_PAGE_LIMIT: u32 = 20;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u64>,
}

fn etag_for(body: &[u8]) -> String {
    use std::fmt::Write;

    let digest = Sha256::digest(body);
    let mut hex = String::with_capacity(2 + digest.len() * 2);
    hex.push('"');
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex.push('"');
    hex
}

fn cache_status_value(status: CacheStatus) -> HeaderValue {
    HeaderValue::from_static(status.as_str())
}

/// `GET /v1/entities/{id}` — cache-first single read.
pub async fn get_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let fetched = state.reads.get(&id).await.map_err(ApiError::from)?;

    match fetched.value {
        Some(body) => {
            let etag = etag_for(&body);
            let unchanged = headers
                .get(header::IF_NONE_MATCH)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|candidate| candidate == etag);

            let mut response = if unchanged {
                StatusCode::NOT_MODIFIED.into_response()
            } else {
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/json")],
                    body,
                )
                    .into_response()
            };
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&etag) {
                headers.insert(header::ETAG, value);
            }
            headers.insert(CACHE_STATUS_HEADER, cache_status_value(fetched.status));
            Ok(response)
        }
        None => {
            // Known absent: 404 still reports whether the negative entry
            // or the loader said so.
            let mut response = ApiError::not_found("entity not found").into_response();
            response
                .headers_mut()
                .insert(CACHE_STATUS_HEADER, cache_status_value(fetched.status));
            Ok(response)
        }
    }
}

/// `GET /v1/entities` — paginated list keyed by query hash.
pub async fn list_entities(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let offset = params.offset.unwrap_or(0);

    let (body, status) = state
        .reads
        .list(limit, offset)
        .await
        .map_err(ApiError::from)?;

    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response();
    response
        .headers_mut()
        .insert(CACHE_STATUS_HEADER, cache_status_value(status));
    Ok(response)
}

fn idempotency_key(headers: &HeaderMap, required: bool) -> Result<Option<String>, ApiError> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|key| !key.is_empty());

    if required && key.is_none() {
        return Err(ApiError::validation(format!(
            "{IDEMPOTENCY_KEY_HEADER} header is required"
        )));
    }
    Ok(key)
}

fn submit_request(
    command_type: &str,
    entity_id: String,
    payload: serde_json::Value,
    idempotency_key: Option<String>,
) -> SubmitRequest {
    SubmitRequest {
        command_type: command_type.to_string(),
        entity_id,
        payload,
        idempotency_key,
        subject: None,
        correlation_id: None,
        priority: None,
        max_retries: None,
        timeout_ms: None,
        cache_tags: Vec::new(),
    }
}

/// `POST /v1/entities` — create command; `Idempotency-Key` required.
pub async fn create_entity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let key = idempotency_key(&headers, true)?;
    let entity_id = body
        .get("id")
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("e-{}", Uuid::new_v4()));

    let accepted = state
        .ingress
        .submit(submit_request("entity.create", entity_id, body, key))
        .await
        .map_err(ApiError::from)?;
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

/// `PATCH /v1/entities/{id}` — update command, same ingest semantics.
pub async fn patch_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let key = idempotency_key(&headers, true)?;
    let accepted = state
        .ingress
        .submit(submit_request("entity.update", id, body, key))
        .await
        .map_err(ApiError::from)?;
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

/// `DELETE /v1/entities/{id}` — delete command; emits a deletion event on
/// success. The idempotency key is honored when supplied.
pub async fn delete_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let key = idempotency_key(&headers, false)?;
    let accepted = state
        .ingress
        .submit(submit_request(
            "entity.delete",
            id,
            serde_json::json!({}),
            key,
        ))
        .await
        .map_err(ApiError::from)?;
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_is_stable_and_quoted() {
        let first = etag_for(b"{\"n\":\"x\"}");
        let second = etag_for(b"{\"n\":\"x\"}");
        assert_eq!(first, second);
        assert!(first.starts_with('"') && first.ends_with('"'));
        assert_ne!(first, etag_for(b"{\"n\":\"y\"}"));
    }

    #[test]
    fn idempotency_header_extraction() {
        let mut headers = HeaderMap::new();
        assert!(idempotency_key(&headers, true).is_err());
        assert_eq!(idempotency_key(&headers, false).unwrap(), None);

        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static("k1"));
        assert_eq!(
            idempotency_key(&headers, true).unwrap(),
            Some("k1".to_string())
        );
    }
}
