//! Queue message shapes.
//!
//! Envelopes are the only thing that crosses a queue boundary. Each one is a
//! flat JSON object whose fields are all required strings, so that a consumer
//! written in any language can decode it and so that a missing field is a
//! decode failure rather than a silently defaulted value.
//!
//! # Queues
//!
//! | Queue | Envelope |
//! |---|---|
//! | [`TEXT_COMMANDS_QUEUE`] | [`TextEnvelope`] |
//! | [`MEDIA_QUEUE`] | [`MediaEnvelope`] |
//! | [`REPLIES_QUEUE`] | [`ReplyEnvelope`] |
//!
//! Every queue has a companion [`dead_letter_queue`] that receives payloads the
//! consumer gave up on.

use crate::idempotency::IdempotencyKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Queue carrying text commands.
pub const TEXT_COMMANDS_QUEUE: &str = "text.commands";

/// Queue carrying media (voice note) commands.
pub const MEDIA_QUEUE: &str = "audio.processing";

/// Queue carrying outbound replies.
pub const REPLIES_QUEUE: &str = "sms.replies";

/// Suffix appended to a queue name to form its dead-letter queue.
pub const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// Name of the dead-letter queue for `queue`.
///
/// # Examples
///
/// ```
/// use hound_core::envelope::dead_letter_queue;
///
/// assert_eq!(dead_letter_queue("text.commands"), "text.commands.dead-letter");
/// ```
#[must_use]
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

/// Errors raised while encoding or decoding an envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The envelope could not be serialized.
    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    /// The payload is not a valid envelope of the expected shape.
    #[error("Failed to decode envelope: {0}")]
    Decode(String),

    /// A required field was present but empty.
    #[error("Envelope field '{0}' is empty")]
    MissingField(&'static str),
}

/// A message that travels over one specific queue.
///
/// Encoding is JSON. [`decode`](Envelope::decode) rejects payloads that are not
/// JSON objects of the right shape and payloads whose required fields are
/// empty, which the consumer treats as a malformed message.
pub trait Envelope: Serialize + DeserializeOwned + Send + Sync + Sized {
    /// The queue this envelope is published to.
    const QUEUE: &'static str;

    /// Check required fields after decoding.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MissingField`] naming the first empty field.
    fn validate(&self) -> Result<(), EnvelopeError>;

    /// Serialize to the wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if serialization fails.
    fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    /// Deserialize from the wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Decode`] for invalid JSON or a wrong shape and
    /// [`EnvelopeError::MissingField`] for an empty required field.
    fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self =
            serde_json::from_slice(payload).map_err(|e| EnvelopeError::Decode(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }
}

fn require(field: &'static str, value: &str) -> Result<(), EnvelopeError> {
    if value.is_empty() {
        Err(EnvelopeError::MissingField(field))
    } else {
        Ok(())
    }
}

/// A text command awaiting classification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextEnvelope {
    /// Sender identity (phone number).
    pub user_id: String,
    /// Trimmed message body.
    pub command_text: String,
    /// Id assigned to the event by the trigger source.
    pub external_id: String,
    /// Key derived from `external_id`.
    pub idempotency_key: IdempotencyKey,
}

impl Envelope for TextEnvelope {
    const QUEUE: &'static str = TEXT_COMMANDS_QUEUE;

    fn validate(&self) -> Result<(), EnvelopeError> {
        require("user_id", &self.user_id)?;
        require("command_text", &self.command_text)?;
        require("external_id", &self.external_id)?;
        require("idempotency_key", self.idempotency_key.as_str())
    }
}

/// A media command (voice note) awaiting transcription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediaEnvelope {
    /// Sender identity (phone number).
    pub user_id: String,
    /// Location of the media payload.
    pub media_url: String,
    /// Id assigned to the event by the trigger source.
    pub external_id: String,
    /// Key derived from `external_id`.
    pub idempotency_key: IdempotencyKey,
}

impl Envelope for MediaEnvelope {
    const QUEUE: &'static str = MEDIA_QUEUE;

    fn validate(&self) -> Result<(), EnvelopeError> {
        require("user_id", &self.user_id)?;
        require("media_url", &self.media_url)?;
        require("external_id", &self.external_id)?;
        require("idempotency_key", self.idempotency_key.as_str())
    }
}

/// An outbound message for a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplyEnvelope {
    /// Recipient identity (phone number).
    pub user_id: String,
    /// Message text.
    pub message: String,
}

impl Envelope for ReplyEnvelope {
    const QUEUE: &'static str = REPLIES_QUEUE;

    fn validate(&self) -> Result<(), EnvelopeError> {
        require("user_id", &self.user_id)?;
        require("message", &self.message)
    }
}

/// One of the two command envelopes produced from an inbound event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandEnvelope {
    /// Text command.
    Text(TextEnvelope),
    /// Media command.
    Media(MediaEnvelope),
}

impl CommandEnvelope {
    /// Queue the envelope belongs on.
    #[must_use]
    pub const fn queue(&self) -> &'static str {
        match self {
            Self::Text(_) => TextEnvelope::QUEUE,
            Self::Media(_) => MediaEnvelope::QUEUE,
        }
    }

    /// The envelope's idempotency key.
    #[must_use]
    pub const fn idempotency_key(&self) -> &IdempotencyKey {
        match self {
            Self::Text(env) => &env.idempotency_key,
            Self::Media(env) => &env.idempotency_key,
        }
    }

    /// The sender.
    #[must_use]
    pub fn user_id(&self) -> &str {
        match self {
            Self::Text(env) => &env.user_id,
            Self::Media(env) => &env.user_id,
        }
    }

    /// Serialize the inner envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        match self {
            Self::Text(env) => env.encode(),
            Self::Media(env) => env.encode(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::idempotency::generate_key;

    fn text() -> TextEnvelope {
        TextEnvelope {
            user_id: "+15550001111".to_string(),
            command_text: "buy milk".to_string(),
            external_id: "SM1".to_string(),
            idempotency_key: generate_key("SM1"),
        }
    }

    #[test]
    fn text_envelope_is_flat_json() {
        let bytes = text().encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let object = value.as_object().unwrap();

        assert_eq!(object.len(), 4);
        assert_eq!(object["user_id"], "+15550001111");
        assert_eq!(object["command_text"], "buy milk");
        assert_eq!(object["external_id"], "SM1");
        assert_eq!(object["idempotency_key"], "idem_e084a13cc812fc9d09d293dbd8ec4a52");
    }

    #[test]
    fn decode_accepts_encoded_envelope() {
        let env = text();
        let decoded = TextEnvelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn decode_rejects_missing_field() {
        let payload = br#"{"user_id":"+1","external_id":"SM1","idempotency_key":"idem_x"}"#;
        assert!(matches!(
            TextEnvelope::decode(payload),
            Err(EnvelopeError::Decode(_))
        ));
    }

    #[test]
    fn decode_rejects_empty_field() {
        let payload =
            br#"{"user_id":"+1","command_text":"","external_id":"SM1","idempotency_key":"idem_x"}"#;
        assert_eq!(
            TextEnvelope::decode(payload),
            Err(EnvelopeError::MissingField("command_text"))
        );
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            TextEnvelope::decode(b"not json"),
            Err(EnvelopeError::Decode(_))
        ));
        assert!(matches!(
            ReplyEnvelope::decode(b"[1,2,3]"),
            Err(EnvelopeError::Decode(_))
        ));
    }

    #[test]
    fn text_payload_does_not_decode_as_media() {
        let bytes = text().encode().unwrap();
        assert!(MediaEnvelope::decode(&bytes).is_err());
    }

    #[test]
    fn command_envelope_routes_by_kind() {
        let text = CommandEnvelope::Text(text());
        assert_eq!(text.queue(), "text.commands");

        let media = CommandEnvelope::Media(MediaEnvelope {
            user_id: "+1".to_string(),
            media_url: "https://media.example/1".to_string(),
            external_id: "MM1".to_string(),
            idempotency_key: generate_key("MM1"),
        });
        assert_eq!(media.queue(), "audio.processing");
        assert_eq!(media.idempotency_key(), &generate_key("MM1"));
    }

    #[test]
    fn dead_letter_names() {
        assert_eq!(dead_letter_queue(REPLIES_QUEUE), "sms.replies.dead-letter");
        assert_eq!(dead_letter_queue(MEDIA_QUEUE), "audio.processing.dead-letter");
    }
}
