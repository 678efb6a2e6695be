//! HTTP ingestion endpoint: validate an email request and enqueue it.
//!
//! Callers only learn whether the email was queued, never whether it was
//! eventually delivered.

use crate::broker::Publisher;
use crate::email::EmailMessage;
use crate::envelope::WorkItem;
use crate::error::WorkerError;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

pub const EMAIL_ROUTE: &str = "/api/notifications/email";

#[derive(Clone)]
pub struct ApiState {
    publisher: Arc<dyn Publisher>,
}

impl ApiState {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }
}

/// Build the HTTP router (used by the `email-api` binary and the tests).
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(EMAIL_ROUTE, post(enqueue_email))
        .with_state(state)
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

async fn enqueue_email(
    State(state): State<ApiState>,
    payload: Result<Json<EmailMessage>, JsonRejection>,
) -> Response {
    // Missing fields and malformed JSON are validation failures too.
    let Json(email) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return json_error(StatusCode::UNPROCESSABLE_ENTITY, "validation_error", rejection.body_text());
        }
    };

    if let Err(message) = email.validate() {
        return json_error(StatusCode::UNPROCESSABLE_ENTITY, "validation_error", message);
    }

    match publish(state.publisher.as_ref(), &email).await {
        Ok(()) => {
            log::info!("Queued email to {}", email.to);
            (
                StatusCode::ACCEPTED,
                Json(json!({ "message": "Email queued successfully" })),
            )
                .into_response()
        }
        Err(e) => {
            log::error!("Failed to queue email to {}: {}", email.to, e);
            let message = match e {
                WorkerError::Lapin(_) | WorkerError::Unavailable(_) => "Cannot connect to RabbitMQ".to_string(),
                other => other.to_string(),
            };
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "publish_error", message)
        }
    }
}

async fn publish(publisher: &dyn Publisher, email: &EmailMessage) -> Result<(), WorkerError> {
    let payload = serde_json::to_vec(email)?;
    publisher
        .publish(&WorkItem::new(payload).with_content_type("application/json"))
        .await
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
