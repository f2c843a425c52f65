use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use blog_shared::{ApiResponse, FieldError};
use thiserror::Error;

const OPAQUE_FAILURE: &str = "An error occurred. Request unsuccessful.";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("validation failed")]
    Validation(Vec<FieldError>),

    #[error("start date {start} is after end date {end}")]
    InvalidRange {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("forbidden")]
    Forbidden,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }

    /// A UNIQUE constraint failure becomes `Conflict`, anything else stays a
    /// database error.
    pub fn on_unique(e: rusqlite::Error, message: &str) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Self::Conflict(message.to_string())
            }
            _ => Self::Database(e),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidRange { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Database(_) | Self::Pool(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(anyhow::Error::new(e).context("blocking task failed"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed");
        }

        let (message, errors) = match self {
            AppError::Validation(errors) => ("Validation failed".to_string(), errors),
            AppError::InvalidRange { start, end } => (
                format!("start date {start} is after end date {end}"),
                vec![FieldError::new(
                    "endDate",
                    "End date cannot be less than start date",
                )],
            ),
            AppError::NotFound(what) => (format!("{what} does not exist"), Vec::new()),
            AppError::Unauthorized(reason) => (reason.to_string(), Vec::new()),
            AppError::Forbidden => (
                "You do not have the permission to perform this action".to_string(),
                Vec::new(),
            ),
            AppError::Conflict(message) => (message, Vec::new()),
            AppError::Database(_) | AppError::Pool(_) | AppError::Internal(_) => {
                (OPAQUE_FAILURE.to_string(), Vec::new())
            }
        };

        let body = ApiResponse::<()>::failure(status.as_u16(), message, errors);
        (status, Json(body)).into_response()
    }
}

/// Wraps a payload in the success envelope.
pub fn respond<T: serde::Serialize>(
    status: StatusCode,
    data: T,
    message: &str,
) -> (StatusCode, Json<ApiResponse<T>>) {
    (status, Json(ApiResponse::success(status.as_u16(), data, message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_of(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn internal_errors_are_opaque() {
        let (status, body) = body_of(AppError::Internal(anyhow::anyhow!("disk on fire"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], OPAQUE_FAILURE);
        assert_eq!(body["isSuccess"], false);
        assert!(!body.to_string().contains("disk on fire"));
    }

    #[tokio::test]
    async fn validation_errors_carry_fields() {
        let (status, body) = body_of(AppError::invalid("title", "Title is required")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["statusCode"], 400);
        assert_eq!(body["errors"][0]["field"], "title");
    }

    #[tokio::test]
    async fn conflict_maps_to_409() {
        let (status, body) = body_of(AppError::Conflict("Tag already exists".into())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["message"], "Tag already exists");
    }
}
