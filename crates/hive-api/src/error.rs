use hive_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    BadRequest,
    NotFound,
    NotImplemented,
    Internal,
}

impl ApiError {
    fn class(&self) -> Class {
        match self {
            ApiError::InvalidRequest(_) => Class::BadRequest,
            ApiError::NotFound(_) => Class::NotFound,
            ApiError::NotImplemented(_) => Class::NotImplemented,
            ApiError::Internal(_) => Class::Internal,
            ApiError::Core(e) if e.is_not_found() => Class::NotFound,
            ApiError::Core(e) if e.is_invalid_transition() => Class::BadRequest,
            ApiError::Core(CoreError::AlreadyRegistered(_)) => Class::BadRequest,
            ApiError::Core(_) => Class::Internal,
        }
    }
}

#[cfg(feature = "grpc")]
impl From<ApiError> for tonic::Status {
    fn from(err: ApiError) -> Self {
        let msg = err.to_string();
        match err.class() {
            Class::BadRequest => tonic::Status::invalid_argument(msg),
            Class::NotFound => tonic::Status::not_found(msg),
            Class::NotImplemented => tonic::Status::unimplemented(msg),
            Class::Internal => tonic::Status::internal(msg),
        }
    }
}

#[cfg(feature = "http")]
impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self.class() {
            Class::BadRequest => StatusCode::BAD_REQUEST,
            Class::NotFound => StatusCode::NOT_FOUND,
            Class::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Class::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        }
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_model::TaskState;

    #[test]
    fn core_errors_are_classified() {
        let not_found = ApiError::from(CoreError::TaskNotFound("t".into()));
        assert_eq!(not_found.class(), Class::NotFound);

        let illegal = ApiError::from(CoreError::InvalidState {
            id: "t".into(),
            action: "started",
            state: TaskState::Running,
        });
        assert_eq!(illegal.class(), Class::BadRequest);

        let dispatch = ApiError::from(CoreError::Dispatch("boom".into()));
        assert_eq!(dispatch.class(), Class::Internal);
        assert_eq!(ApiError::NotImplemented("report").class(), Class::NotImplemented);
    }

    #[cfg(feature = "grpc")]
    #[test]
    fn grpc_codes() {
        let status = tonic::Status::from(ApiError::NotFound("slave s1".into()));
        assert_eq!(status.code(), tonic::Code::NotFound);
        let status = tonic::Status::from(ApiError::InvalidRequest("empty id".into()));
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
