//! Job identity and classification.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of job. Selects the processing routine, the status namespace
/// and the queue topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Transcribe (and optionally translate) an audio file
    Audio,
    /// Burn subtitles and a logo into a video
    VideoOverlay,
    /// Trim several takes and join them into one video
    VideoTrimJoin,
    /// Process a list of already recorded takes
    VideoTakes,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Audio,
        JobKind::VideoOverlay,
        JobKind::VideoTrimJoin,
        JobKind::VideoTakes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Audio => "audio",
            JobKind::VideoOverlay => "video_overlay",
            JobKind::VideoTrimJoin => "video_trim_join",
            JobKind::VideoTakes => "video_takes",
        }
    }

    /// Key prefix of the status namespace owned by this kind.
    pub fn namespace(&self) -> &'static str {
        match self {
            JobKind::Audio => "job",
            JobKind::VideoOverlay => "video_job",
            JobKind::VideoTrimJoin => "trim_join_job",
            JobKind::VideoTakes => "takes_job",
        }
    }

    /// Queue topic for this kind.
    pub fn topic(&self) -> &'static str {
        self.as_str()
    }

    /// Label stored on status records so pollers can tell video jobs apart.
    pub fn job_type(&self) -> Option<&'static str> {
        match self {
            JobKind::Audio => None,
            JobKind::VideoOverlay => Some("video_processing"),
            JobKind::VideoTrimJoin => Some("video_trim_join"),
            JobKind::VideoTakes => Some("video_takes_processing"),
        }
    }

    pub fn family(&self) -> JobFamily {
        match self {
            JobKind::Audio => JobFamily::Audio,
            JobKind::VideoOverlay | JobKind::VideoTrimJoin | JobKind::VideoTakes => {
                JobFamily::Video
            }
        }
    }

    /// Progress written when a dispatcher accepts the job.
    pub fn accepted_progress(&self) -> u8 {
        match self {
            JobKind::Audio | JobKind::VideoOverlay => 10,
            JobKind::VideoTrimJoin | JobKind::VideoTakes => 5,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown job kind: {}", s))
    }
}

/// Group of job kinds served by one consumption loop and one transport stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobFamily {
    Audio,
    Video,
}

impl JobFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobFamily::Audio => "audio",
            JobFamily::Video => "video",
        }
    }

    /// Transport stream carrying payloads of this family.
    pub fn stream_name(&self) -> &'static str {
        match self {
            JobFamily::Audio => "audio_processing",
            JobFamily::Video => "video_processing",
        }
    }

    pub fn kinds(&self) -> &'static [JobKind] {
        match self {
            JobFamily::Audio => &[JobKind::Audio],
            JobFamily::Video => &[
                JobKind::VideoOverlay,
                JobKind::VideoTrimJoin,
                JobKind::VideoTakes,
            ],
        }
    }
}

impl fmt::Display for JobFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "audio" => Ok(JobFamily::Audio),
            "video" => Ok(JobFamily::Video),
            other => Err(format!("unknown job family: {}", other)),
        }
    }
}
