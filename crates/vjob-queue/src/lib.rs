//! Job dispatch storage and transport.
//!
//! This crate provides:
//! - A priority task queue over independently served topics
//! - TTL-bounded job status records, one namespace per job kind
//! - Message transport over Redis Streams (or in-process for tests)
//! - Backend selection with fallback to in-memory storage

pub mod backend;
pub mod config;
pub mod error;
pub mod status;
pub mod submit;
pub mod task_queue;
pub mod transport;

pub use backend::Backend;
pub use config::{QueueConfig, TransportConfig, JOB_STATUS_TTL_SECS};
pub use error::{QueueError, QueueResult};
pub use status::{MemoryStatusBackend, RedisStatusBackend, StatusBackend, StatusStore, StatusUpdate};
pub use submit::JobSubmitter;
pub use task_queue::{clamp_priority, MemoryQueue, QueueBackend, QueueEntry, RedisQueue, TaskQueue};
pub use transport::{DeadLetter, Delivery, MemoryTransport, RedisStreamTransport, Transport};
