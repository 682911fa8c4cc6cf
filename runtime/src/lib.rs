//! # Hound Runtime
//!
//! The moving parts of the Hound command pipeline.
//!
//! ```text
//!  InboundEvent ──▶ CommandProducer ──▶ text.commands ──▶ CommandConsumer
//!                                                             │
//!                                                    TextCommandHandler
//!                                              classify ─▶ CommandDispatcher
//!                                                             │
//!                                                        DomainStore (keyed)
//!                                                             │
//!  NotificationSender ◀── ReplyHandler ◀── sms.replies ◀── ReplyProducer
//! ```
//!
//! ## Core Components
//!
//! - **[`CommandProducer`]**: validates an inbound event and publishes one envelope
//! - **[`CommandConsumer`]**: prefetch-one pull loop with bounded retry and dead-lettering
//! - **[`DomainStore`]**: todo operations with at-most-once effect per idempotency key
//! - **[`CommandDispatcher`]**: maps a validated [`Intent`](hound_core::command::Intent) to a
//!   domain operation and renders the reply
//! - **[`TextCommandHandler`]** and **[`ReplyHandler`]**: the two handlers the service runs
//!
//! ## Example
//!
//! ```ignore
//! use hound_runtime::{CommandConsumer, RetryPolicy, TextCommandHandler, shutdown};
//!
//! let (trigger, signal) = shutdown::channel();
//! let consumer = CommandConsumer::new(queue, handler, RetryPolicy::default());
//! let worker = tokio::spawn(async move { consumer.run(signal).await });
//!
//! tokio::signal::ctrl_c().await?;
//! trigger.trigger();
//! worker.await??;
//! ```

pub mod consumer;
pub mod dispatcher;
pub mod domain_store;
pub mod handler;
pub mod metrics;
pub mod producer;
pub mod reply;
pub mod retry;
pub mod shutdown;

pub use consumer::{CommandConsumer, ConsumerStats, Outcome};
pub use dispatcher::CommandDispatcher;
pub use domain_store::DomainStore;
pub use handler::{HandlerError, MessageHandler, TextCommandHandler};
pub use producer::{CommandProducer, InboundEvent, ProducerError};
pub use reply::{ReplyHandler, ReplyProducer};
pub use retry::{RetryDecision, RetryPolicy};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
