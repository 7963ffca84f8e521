//! Job payloads and the tagged envelope carried by the transport.
//!
//! Every message declares its kind explicitly in a `kind` field, so the
//! dispatcher decodes once and routes by tag instead of guessing from
//! the payload shape.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{JobFamily, JobId, JobKind};

/// Highest queue priority. Lowest is 1.
pub const MAX_PRIORITY: u8 = 10;

fn default_target_language() -> String {
    "pt".to_string()
}

fn validate_job_id(id: &JobId) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::new("empty_job_id"));
    }
    Ok(())
}

/// Audio transcription job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct AudioJob {
    #[validate(custom(function = "validate_job_id"))]
    pub job_id: JobId,
    /// Audio file to transcribe
    #[validate(url)]
    pub audio_url: String,
    /// Existing transcript to align instead of transcribing from scratch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    /// Callback notified once the job completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(url)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_target_language")]
    pub target_language: String,
    #[serde(default)]
    pub priority: bool,
}

impl AudioJob {
    pub fn new(audio_url: impl Into<String>) -> Self {
        Self {
            job_id: JobId::new(),
            audio_url: audio_url.into(),
            transcript: None,
            webhook_url: None,
            target_language: default_target_language(),
            priority: false,
        }
    }

    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn with_transcript(mut self, transcript: impl Into<String>) -> Self {
        self.transcript = Some(transcript.into());
        self
    }
}

/// Subtitle and logo overlay job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct OverlayJob {
    #[validate(custom(function = "validate_job_id"))]
    pub job_id: JobId,
    #[validate(url)]
    pub video_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption_id: Option<String>,
    /// Subtitle file contents (SRT/VTT)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(url)]
    pub logo_url: Option<String>,
    /// Styling options passed through to the renderer untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle_config: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: bool,
}

impl OverlayJob {
    pub fn new(video_url: impl Into<String>) -> Self {
        Self {
            job_id: JobId::new(),
            video_url: video_url.into(),
            language: None,
            caption_id: None,
            subtitle_content: None,
            logo_url: None,
            subtitle_config: None,
            priority: false,
        }
    }
}

/// Trim several takes and join them into one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct TrimJoinJob {
    #[validate(custom(function = "validate_job_id"))]
    pub job_id: JobId,
    #[validate(length(min = 1))]
    pub takes: Vec<serde_json::Value>,
    #[serde(default)]
    pub priority: bool,
}

/// Process a batch of recorded takes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct TakesJob {
    #[validate(custom(function = "validate_job_id"))]
    pub job_id: JobId,
    #[validate(length(min = 1))]
    pub takes_data: Vec<serde_json::Value>,
    #[serde(default)]
    pub priority: bool,
}

/// Message envelope published on the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEnvelope {
    Audio(AudioJob),
    VideoOverlay(OverlayJob),
    VideoTrimJoin(TrimJoinJob),
    VideoTakes(TakesJob),
}

impl JobEnvelope {
    pub fn job_id(&self) -> &JobId {
        match self {
            JobEnvelope::Audio(j) => &j.job_id,
            JobEnvelope::VideoOverlay(j) => &j.job_id,
            JobEnvelope::VideoTrimJoin(j) => &j.job_id,
            JobEnvelope::VideoTakes(j) => &j.job_id,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobEnvelope::Audio(_) => JobKind::Audio,
            JobEnvelope::VideoOverlay(_) => JobKind::VideoOverlay,
            JobEnvelope::VideoTrimJoin(_) => JobKind::VideoTrimJoin,
            JobEnvelope::VideoTakes(_) => JobKind::VideoTakes,
        }
    }

    pub fn family(&self) -> JobFamily {
        self.kind().family()
    }

    /// Queue priority derived from the payload's priority flag.
    pub fn priority(&self) -> u8 {
        let flagged = match self {
            JobEnvelope::Audio(j) => j.priority,
            JobEnvelope::VideoOverlay(j) => j.priority,
            JobEnvelope::VideoTrimJoin(j) => j.priority,
            JobEnvelope::VideoTakes(j) => j.priority,
        };
        if flagged {
            MAX_PRIORITY
        } else {
            1
        }
    }

    /// Webhook to notify on completion. Only audio jobs carry one.
    pub fn webhook_url(&self) -> Option<&str> {
        match self {
            JobEnvelope::Audio(j) => j.webhook_url.as_deref(),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        match self {
            JobEnvelope::Audio(j) => j.validate(),
            JobEnvelope::VideoOverlay(j) => j.validate(),
            JobEnvelope::VideoTrimJoin(j) => j.validate(),
            JobEnvelope::VideoTakes(j) => j.validate(),
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

impl From<AudioJob> for JobEnvelope {
    fn from(job: AudioJob) -> Self {
        JobEnvelope::Audio(job)
    }
}

impl From<OverlayJob> for JobEnvelope {
    fn from(job: OverlayJob) -> Self {
        JobEnvelope::VideoOverlay(job)
    }
}

impl From<TrimJoinJob> for JobEnvelope {
    fn from(job: TrimJoinJob) -> Self {
        JobEnvelope::VideoTrimJoin(job)
    }
}

impl From<TakesJob> for JobEnvelope {
    fn from(job: TakesJob) -> Self {
        JobEnvelope::VideoTakes(job)
    }
}
