//! Media job dispatcher.
//!
//! This crate provides:
//! - The per-family consumption loop (`Dispatcher`)
//! - The media processing capability and its HTTP client
//! - Completion webhooks for audio jobs
//! - Retry/backoff, metrics and structured job logging

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod retry;
pub mod webhook;

pub use config::WorkerConfig;
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::{WorkerError, WorkerResult};
pub use logging::JobLogger;
pub use processor::{HttpProcessor, Processor, ProcessorError, ProcessorResult, ProgressReporter};
pub use retry::{retry_async, FailureTracker, RetryConfig, RetryResult};
pub use webhook::{HttpWebhookNotifier, WebhookNotification, WebhookNotifier};
