//! HTTP ingress for inbound SMS/MMS webhooks.
//!
//! # Endpoints
//!
//! ```text
//! POST /webhook/sms   form fields From, Body, MessageSid, NumMedia, MediaUrl0
//! GET  /health
//! ```
//!
//! A webhook that is accepted and enqueued is answered with an empty `TwiML`
//! document so the SMS provider sends nothing back on its own; replies travel
//! through the reply queue instead. A webhook that cannot be enqueued is
//! answered synchronously with a status code and a JSON body:
//!
//! ```json
//! { "error": "Invalid sender: is required", "kind": "validation_error" }
//! ```
//!
//! Signature validation is the provider integration's concern and happens in
//! front of this router.

use axum::extract::rejection::FormRejection;
use axum::extract::{Form, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hound_runtime::{CommandProducer, InboundEvent, ProducerError};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

/// Empty `TwiML` response.
pub const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;

/// Shared state for ingress handlers.
#[derive(Clone)]
pub struct IngressState {
    producer: CommandProducer,
}

/// Build the ingress router.
pub fn router(producer: CommandProducer) -> Router {
    Router::new()
        .route("/webhook/sms", post(sms_webhook))
        .route("/health", get(health))
        .with_state(IngressState { producer })
        .layer(TraceLayer::new_for_http())
}

/// Webhook form as posted by the SMS provider.
#[derive(Debug, Default, Deserialize)]
pub struct SmsWebhook {
    /// Sender phone number.
    #[serde(rename = "From", default)]
    pub from: String,
    /// Message text.
    #[serde(rename = "Body")]
    pub body: Option<String>,
    /// Provider message id.
    #[serde(rename = "MessageSid", default)]
    pub message_sid: String,
    /// Number of media attachments.
    #[serde(rename = "NumMedia")]
    pub num_media: Option<String>,
    /// First media attachment.
    #[serde(rename = "MediaUrl0")]
    pub media_url: Option<String>,
}

impl From<SmsWebhook> for InboundEvent {
    fn from(form: SmsWebhook) -> Self {
        Self {
            sender: form.from,
            body: form.body,
            media_url: form.media_url,
            num_media: form.num_media,
            external_id: form.message_sid,
        }
    }
}

/// Machine-readable error body.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
    /// Error kind (`validation_error`, `encode_error`, `queue_unavailable`).
    pub kind: String,
}

/// A webhook that could not be enqueued.
#[derive(Debug)]
pub struct IngressError {
    status: StatusCode,
    body: ErrorBody,
}

impl From<ProducerError> for IngressError {
    fn from(error: ProducerError) -> Self {
        Self {
            status: StatusCode::from_u16(error.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body: ErrorBody {
                error: error.to_string(),
                kind: error.kind().to_string(),
            },
        }
    }
}

impl From<FormRejection> for IngressError {
    fn from(rejection: FormRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                error: rejection.body_text(),
                kind: "validation_error".to_string(),
            },
        }
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Validate the webhook, enqueue its command and acknowledge the provider.
///
/// # Errors
///
/// Returns [`IngressError`] with status 400 for a malformed or incomplete
/// webhook, 503 if the queue did not accept the command in time.
pub async fn sms_webhook(
    State(state): State<IngressState>,
    form: Result<Form<SmsWebhook>, FormRejection>,
) -> Result<Response, IngressError> {
    let Form(form) = form?;
    let event = InboundEvent::from(form);

    let envelope = state.producer.submit(&event).await?;
    tracing::debug!(queue = envelope.queue(), "Webhook accepted");

    Ok(([(header::CONTENT_TYPE, "text/xml")], EMPTY_TWIML).into_response())
}

/// Liveness check.
#[allow(clippy::unused_async)]
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use hound_core::envelope::{MEDIA_QUEUE, TEXT_COMMANDS_QUEUE, TextEnvelope};
    use hound_core::generate_key;
    use hound_testing::InMemoryQueue;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(queue: &InMemoryQueue) -> Router {
        router(CommandProducer::new(Arc::new(queue.clone())))
    }

    fn webhook(form: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhook/sms")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn text_webhook_is_enqueued_and_answered_with_twiml() {
        let queue = InMemoryQueue::new();

        let response = app(&queue)
            .oneshot(webhook("From=%2B15550001111&Body=buy+milk&MessageSid=SM1&NumMedia=0"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/xml");
        assert_eq!(body_text(response).await, EMPTY_TWIML);

        let envelopes = queue.published_envelopes::<TextEnvelope>(TEXT_COMMANDS_QUEUE);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].user_id, "+15550001111");
        assert_eq!(envelopes[0].command_text, "buy milk");
        assert_eq!(envelopes[0].idempotency_key, generate_key("SM1"));
    }

    #[tokio::test]
    async fn media_webhook_goes_to_the_media_queue() {
        let queue = InMemoryQueue::new();

        let response = app(&queue)
            .oneshot(webhook(
                "From=%2B1555&Body=hi&MessageSid=MM1&NumMedia=1&MediaUrl0=https%3A%2F%2Fmedia.example%2Fa.ogg",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(queue.published(MEDIA_QUEUE).len(), 1);
        assert!(queue.published(TEXT_COMMANDS_QUEUE).is_empty());
    }

    #[tokio::test]
    async fn missing_sender_is_a_validation_error() {
        let queue = InMemoryQueue::new();

        let response = app(&queue)
            .oneshot(webhook("Body=buy+milk&MessageSid=SM1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body.kind, "validation_error");
        assert!(queue.published(TEXT_COMMANDS_QUEUE).is_empty());
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let queue = InMemoryQueue::new();

        let response = app(&queue)
            .oneshot(webhook("From=%2B1555&Body=+&MessageSid=SM1&NumMedia=0"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unreachable_queue_is_reported_as_unavailable() {
        let queue = InMemoryQueue::new();
        queue.fail_next_publishes(TEXT_COMMANDS_QUEUE, 1);

        let response = app(&queue)
            .oneshot(webhook("From=%2B1555&Body=buy+milk&MessageSid=SM1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: ErrorBody = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body.kind, "queue_unavailable");
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let queue = InMemoryQueue::new();

        let response = app(&queue)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, r#"{"status":"healthy"}"#);
    }
}
