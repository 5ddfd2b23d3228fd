//! HTTP mapping of core errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};

use crate::compile::GenerationError;
use crate::fleet::{CommandFailure, FleetError, PushFailure};
use crate::model::StoreError;
use crate::rules::ResolveError;
use crate::subscription::SubscriptionError;

/// Error response: `{"success": false, "error": ..., "transient": ...}`,
/// plus `attempts`/`formats` for failed remote operations.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub transient: bool,
    pub details: Map<String, Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            transient: false,
            details: Map::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = self.details;
        body.insert("success".into(), json!(false));
        body.insert("error".into(), json!(self.message));
        body.insert("transient".into(), json!(self.transient));
        (self.status, Json(Value::Object(body))).into_response()
    }
}

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        let status = match &e {
            FleetError::AgentNotFound(_) => StatusCode::NOT_FOUND,
            FleetError::AgentDisabled(_) => StatusCode::CONFLICT,
            FleetError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            FleetError::PushTimeout { .. } | FleetError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
            FleetError::AgentUnreachable { .. } | FleetError::Unauthorized | FleetError::Remote { .. } => {
                StatusCode::BAD_GATEWAY
            }
            FleetError::Generation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            FleetError::TaskFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            transient: e.is_transient(),
            message: e.to_string(),
            details: Map::new(),
        }
    }
}

impl From<PushFailure> for ApiError {
    fn from(failure: PushFailure) -> Self {
        let mut e = Self::from(failure.error);
        e.details.insert("formats".into(), json!(failure.formats));
        e.details.insert("attempts".into(), json!(failure.attempts));
        e
    }
}

impl From<CommandFailure> for ApiError {
    fn from(failure: CommandFailure) -> Self {
        let mut e = Self::from(failure.error);
        e.details.insert("attempts".into(), json!(failure.attempts));
        e
    }
}

impl From<GenerationError> for ApiError {
    fn from(e: GenerationError) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
    }
}

impl From<ResolveError> for ApiError {
    fn from(e: ResolveError) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
    }
}

impl From<SubscriptionError> for ApiError {
    fn from(e: SubscriptionError) -> Self {
        let status = match &e {
            SubscriptionError::NotFound(_) => StatusCode::NOT_FOUND,
            SubscriptionError::Disabled(_) => StatusCode::CONFLICT,
            SubscriptionError::Fetch(_) => StatusCode::BAD_GATEWAY,
            SubscriptionError::Parse(_) | SubscriptionError::EmptyResult(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SubscriptionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            transient: matches!(e, SubscriptionError::Fetch(_)),
            message: e.to_string(),
            details: Map::new(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::Invalid { .. } => StatusCode::BAD_REQUEST,
            StoreError::Io(_) | StoreError::Serde(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}
