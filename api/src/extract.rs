//! Request extractors whose rejections render as the error envelope instead
//! of axum's plain-text bodies.

use axum::extract::{
    multipart::MultipartRejection,
    rejection::{JsonRejection, PathRejection, QueryRejection},
    FromRequest, FromRequestParts,
};

use crate::error::AppError;

#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct Json<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(AppError))]
pub struct Path<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct Query<T>(pub T);

/// serde reports a missing member as "missing field `name`"; anything else
/// is charged to the body as a whole.
fn body_field(message: &str) -> &str {
    message
        .split_once("missing field `")
        .and_then(|(_, rest)| rest.split_once('`'))
        .map(|(field, _)| field)
        .unwrap_or("body")
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        let message = rejection.body_text();
        AppError::invalid(body_field(&message), message.clone())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::invalid("id", rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        let message = rejection.body_text();
        AppError::invalid(body_field(&message), message.clone())
    }
}

impl From<MultipartRejection> for AppError {
    fn from(rejection: MultipartRejection) -> Self {
        AppError::invalid("coverImage", rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_members_name_their_field() {
        assert_eq!(
            body_field("Failed to deserialize the JSON body into the target type: missing field `name` at line 1 column 2"),
            "name"
        );
        assert_eq!(body_field("EOF while parsing a value"), "body");
    }
}
