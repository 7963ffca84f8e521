//! Shared data models for the media job dispatch backend.
//!
//! This crate provides Serde-serializable types for:
//! - Job identity, kinds and families
//! - Job status records
//! - Job payloads and the tagged transport envelope

pub mod envelope;
pub mod job;
pub mod job_status;

// Re-export common types
pub use envelope::{AudioJob, JobEnvelope, OverlayJob, TakesJob, TrimJoinJob, MAX_PRIORITY};
pub use job::{JobFamily, JobId, JobKind};
pub use job_status::{JobRecord, JobStatus};
