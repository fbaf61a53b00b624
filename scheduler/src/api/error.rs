use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use scheduler_core::SchedulerError;
use serde_json::json;

/// Wraps `SchedulerError` so this crate can implement the foreign
/// `IntoResponse` trait for it (§7: the typed taxonomy maps onto HTTP
/// statuses here; `Internal` never leaks its detail to the client).
pub struct ApiError(pub SchedulerError);

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            SchedulerError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            SchedulerError::MalformedCron(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            SchedulerError::AccountNotAllowed(account) => (
                StatusCode::BAD_REQUEST,
                format!("account '{account}' is not allowed"),
            ),
            SchedulerError::AccountMissing(account) => (
                StatusCode::BAD_REQUEST,
                format!("account '{account}' does not exist"),
            ),
            SchedulerError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            SchedulerError::Conflict => (StatusCode::CONFLICT, "task is already running".to_owned()),
            SchedulerError::DependencyNotMet => {
                (StatusCode::BAD_REQUEST, "dependencies are not met".to_owned())
            }
            SchedulerError::UnreachableSchedule => (
                StatusCode::BAD_REQUEST,
                "cron schedule is unreachable within the lookahead window".to_owned(),
            ),
            SchedulerError::PrivilegeRequired(account) => (
                StatusCode::BAD_REQUEST,
                format!("privileged account required to run as '{account}'"),
            ),
            SchedulerError::ExecutionFailure(_)
            | SchedulerError::Db(_)
            | SchedulerError::Io(_)
            | SchedulerError::Internal(_) => {
                tracing::error!("internal error: {:#}", self.0);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_owned())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
