use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use roadlens_common::Error;
use serde_json::json;
use tracing::error;

/// Domain error carried to the HTTP layer. The status mapping is the only
/// place where error classes and status codes meet.
pub(crate) struct ApiError(Error);

pub(crate) type ApiResult<T> = Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        }

        (status, Json(json!({"message": self.0.to_string()}))).into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn status_of(err: Error) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_not_found_maps_to_404() {
        assert_eq!(
            status_of(Error::NotFound("task \"x\"".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_validation_maps_to_400() {
        assert_eq!(
            status_of(Error::Validation("bad window".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_external_maps_to_500() {
        assert_eq!(
            status_of(Error::External("directory down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
