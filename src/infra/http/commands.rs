//! Command status lookups.

use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use crate::domain::CommandStatusView;

use super::error::ApiError;
use super::AppState;

/// `GET /v1/commands/{id}` — current status; the command store is
/// authoritative behind a short-lived cache.
pub async fn get_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CommandStatusView>, ApiError> {
    let id: Uuid = id
        .parse()
        .map_err(|_| ApiError::validation("command id must be a UUID"))?;
    let view = state.ingress.status(id).await.map_err(ApiError::from)?;
    Ok(Json(view))
}
