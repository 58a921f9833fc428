use rocket::Request;
use rocket::http::Status;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;

/// JSON error responder used by every relay endpoint: an HTTP status plus a
/// body of `{"error": <message>, "kind": <stable machine-readable kind>}`.
/// The kinds form the closed set the protocol exposes to callers.
pub struct ApiError {
    pub status: Status,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: Status, kind: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Status::NotFound, "NotFound", message)
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(Status::Conflict, "Duplicate", message)
    }

    pub fn bad_request(kind: &'static str, message: impl Into<String>) -> Self {
        Self::new(Status::BadRequest, kind, message)
    }

    pub fn forbidden(kind: &'static str, message: impl Into<String>) -> Self {
        Self::new(Status::Forbidden, kind, message)
    }

    pub fn gone(message: impl Into<String>) -> Self {
        Self::new(Status::Gone, "Gone", message)
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(Status::InternalServerError, "Internal", err.to_string())
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        ApiError::internal(err)
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let body = Json(serde_json::json!({
            "error": self.message,
            "kind": self.kind,
        }));
        Response::build_from(body.respond_to(req)?)
            .status(self.status)
            .ok()
    }
}

/// Either error shape a relay endpoint can produce; 429s carry their own
/// responder so the rate-limit headers survive.
#[derive(rocket::Responder)]
pub enum RelayError {
    Api(ApiError),
    RateLimited(crate::rate_limit::RateLimitedError),
}

impl From<ApiError> for RelayError {
    fn from(err: ApiError) -> Self {
        RelayError::Api(err)
    }
}

impl From<crate::rate_limit::RateLimitedError> for RelayError {
    fn from(err: crate::rate_limit::RateLimitedError) -> Self {
        RelayError::RateLimited(err)
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        RelayError::Api(ApiError::internal(err))
    }
}
