//! Public error surface: stable codes, correlation ids, no internal detail.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::application::error::AppError;
use crate::application::repos::RepoError;
use crate::domain::DomainError;
use crate::infra::error::InfraError;

pub mod codes {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const CONFLICT: &str = "CONFLICT";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: &'static str,
    pub message: String,
    pub correlation_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// An error ready to leave the process. Internal causes are logged under
/// the correlation id and never echoed to the client.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    correlation_id: Uuid,
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            correlation_id: Uuid::new_v4(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::VALIDATION_ERROR, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            codes::UNAUTHORIZED,
            "authentication required",
        )
    }

    pub fn forbidden() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            codes::FORBIDDEN,
            "operation not permitted",
        )
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, codes::CONFLICT, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            codes::SERVICE_UNAVAILABLE,
            message,
        )
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::INTERNAL_ERROR,
            "unexpected error",
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        let api = match &err {
            AppError::NotFound | AppError::Domain(DomainError::NotFound { .. }) => {
                ApiError::not_found("resource not found")
            }
            AppError::Repo(RepoError::NotFound) => ApiError::not_found("resource not found"),
            AppError::Validation(message)
            | AppError::Domain(DomainError::Validation { message }) => {
                ApiError::validation(message.clone())
            }
            AppError::Domain(DomainError::Conflict { message })
            | AppError::Repo(RepoError::Conflict { message }) => ApiError::conflict(message.clone()),
            AppError::Infra(InfraError::CircuitOpen { service })
            | AppError::Cache(crate::cache::CacheError::CircuitOpen(service)) => {
                ApiError::unavailable(format!("{service} temporarily unavailable"))
            }
            AppError::Infra(InfraError::Database { .. })
            | AppError::Infra(InfraError::Substrate { .. })
            | AppError::Infra(InfraError::EventLog { .. })
            | AppError::Repo(RepoError::Persistence { .. }) => {
                ApiError::unavailable("service temporarily unavailable")
            }
            AppError::Cache(_)
            | AppError::Domain(DomainError::Invariant { .. })
            | AppError::Infra(_)
            | AppError::Unexpected(_) => ApiError::internal(),
        };

        // The internal cause stays in the logs, tied to the correlation id.
        error!(
            correlation_id = %api.correlation_id,
            code = api.code,
            cause = %err,
            "Request failed"
        );
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code,
                message: self.message,
                correlation_id: self.correlation_id,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_error_mapping() {
        let api = ApiError::from(AppError::NotFound);
        assert_eq!(api.status(), StatusCode::NOT_FOUND);
        assert_eq!(api.code(), codes::NOT_FOUND);

        let api = ApiError::from(AppError::validation("bad field"));
        assert_eq!(api.status(), StatusCode::BAD_REQUEST);

        let api = ApiError::from(AppError::Infra(InfraError::CircuitOpen {
            service: "event-log",
        }));
        assert_eq!(api.status(), StatusCode::SERVICE_UNAVAILABLE);

        let api = ApiError::from(AppError::unexpected("boom"));
        assert_eq!(api.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.code(), codes::INTERNAL_ERROR);
    }

    #[test]
    fn internal_detail_is_not_echoed() {
        let api = ApiError::from(AppError::unexpected("secret connection string"));
        assert!(!api.message.contains("secret"));
    }
}
