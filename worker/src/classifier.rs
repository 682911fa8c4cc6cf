//! LLM-backed intent classifier.
//!
//! Sends the user's message to a messages API together with the system
//! prompt from [`prompt`](crate::prompt) and reads the model's answer as a
//! [`RawClassification`]. An answer that is not valid JSON is not an error:
//! it becomes an `unclear` classification so the user is asked to rephrase.

use crate::config::ClassifierConfig;
use crate::prompt::system_prompt;
use hound_core::collaborator::{ClassifierError, IntentClassifier};
use hound_core::command::RawClassification;
use hound_core::environment::Clock;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

/// [`IntentClassifier`] over an LLM messages API.
#[derive(Clone)]
pub struct LlmIntentClassifier {
    client: Client,
    api_key: String,
    api_url: String,
    model: String,
    clock: Arc<dyn Clock>,
}

impl LlmIntentClassifier {
    /// Create a classifier from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ClassifierError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(config: &ClassifierConfig, clock: Arc<dyn Clock>) -> Result<Self, ClassifierError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ClassifierError::Unavailable(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            clock,
        })
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: String,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// The model's answer before parameter values are normalized to strings.
#[derive(Deserialize)]
struct ModelAnswer {
    action: String,
    #[serde(default)]
    parameters: HashMap<String, Value>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    explanation: String,
}

impl From<ModelAnswer> for RawClassification {
    fn from(answer: ModelAnswer) -> Self {
        let parameters = answer
            .parameters
            .into_iter()
            .filter_map(|(key, value)| match value {
                Value::Null => None,
                Value::String(text) => Some((key, text)),
                Value::Bool(_) | Value::Number(_) | Value::Array(_) | Value::Object(_) => {
                    Some((key, value.to_string()))
                },
            })
            .collect();

        Self {
            action: answer.action,
            parameters,
            confidence: answer.confidence,
            explanation: answer.explanation,
        }
    }
}

/// Remove a Markdown code fence the model may wrap its JSON in.
fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body).trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Read the model's text as a classification.
fn parse_answer(content: &str) -> RawClassification {
    match serde_json::from_str::<ModelAnswer>(strip_code_fence(content)) {
        Ok(answer) => answer.into(),
        Err(error) => {
            tracing::warn!(error = %error, "Classifier answer is not valid JSON");
            RawClassification::new("unclear", 0.0)
                .with_param("reason", "Failed to parse LLM response")
                .with_param("raw", content)
                .with_explanation("LLM response was not valid JSON")
        },
    }
}

impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, text: &str) -> Result<RawClassification, ClassifierError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system: system_prompt(self.clock.now()),
            messages: [ChatMessage {
                role: "user",
                content: text,
            }],
        };

        let response = self
            .client
            .post(format!("{}/messages", self.api_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(ClassifierError::Unavailable(format!(
                "Classifier returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Rejected(format!("status {status}: {body}")));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::InvalidResponse(e.to_string()))?;
        let content = body
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .ok_or_else(|| ClassifierError::InvalidResponse("No text in response".to_string()))?;

        let classification = parse_answer(&content.text);
        tracing::debug!(
            action = %classification.action,
            confidence = classification.confidence,
            "Message classified"
        );
        Ok(classification)
    }
}
