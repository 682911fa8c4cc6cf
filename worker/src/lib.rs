//! # Hound Worker
//!
//! The deployable Hound service: one process that accepts SMS webhooks,
//! runs the command and reply workers, and serves Prometheus metrics.
//!
//! ```text
//!  POST /webhook/sms ──▶ ingress ──▶ CommandProducer ──▶ text.commands | audio.processing
//!
//!  text.commands ──▶ command worker (LlmIntentClassifier + PostgresTodoRepository)
//!                          │
//!                          ▼
//!                    sms.replies ──▶ reply worker ──▶ LoggingNotifier
//! ```
//!
//! ## Modules
//!
//! - [`config`]: environment configuration
//! - [`ingress`]: the axum webhook router
//! - [`classifier`]: the LLM-backed [`IntentClassifier`](hound_core::collaborator::IntentClassifier)
//! - [`prompt`]: the classifier's system prompt
//! - [`notifier`]: the logging [`NotificationSender`](hound_core::collaborator::NotificationSender)
//! - [`service`]: wiring of the two workers

pub mod classifier;
pub mod config;
pub mod ingress;
pub mod notifier;
pub mod prompt;
pub mod service;

pub use classifier::LlmIntentClassifier;
pub use config::{ConfigError, WorkerConfig};
pub use notifier::LoggingNotifier;
