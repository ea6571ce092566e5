use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use crate::clip::ClipId;

/// Result type used by the synchronization crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors produced by playback synchronization.
///
/// Nothing here is fatal to the process. Load and transition failures are
/// retried locally and then surfaced per clip, `MemoryBudgetExceeded` is a soft
/// condition and `EndOfTimeline` is a terminal state rather than a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    LoadTimeout {
        clip_id: ClipId,
    },
    LoadError {
        clip_id: ClipId,
        reason: String,
    },
    RetryExhausted {
        clip_id: ClipId,
        attempts: u32,
    },
    TransitionTimeout {
        clip_id: ClipId,
    },
    PlaybackRejected {
        clip_id: ClipId,
        reason: String,
    },
    MemoryBudgetExceeded {
        clip_id: ClipId,
        required_mb: u64,
        available_mb: u64,
    },
    EndOfTimeline,
    ClipNotFound {
        clip_id: ClipId,
    },
    InvalidClip {
        clip_id: ClipId,
        reason: &'static str,
    },
    EmptyTimeline,
    InvalidTempo {
        reference_bpm: f64,
        target_bpm: f64,
    },
    InvalidConfig {
        reason: &'static str,
    },
    ConfigIo {
        path: PathBuf,
        reason: String,
    },
    ConfigParse {
        reason: String,
    },
}

impl SyncError {
    /// Returns the clip this error belongs to, if any.
    pub fn clip_id(&self) -> Option<ClipId> {
        match self {
            Self::LoadTimeout { clip_id }
            | Self::LoadError { clip_id, .. }
            | Self::RetryExhausted { clip_id, .. }
            | Self::TransitionTimeout { clip_id }
            | Self::PlaybackRejected { clip_id, .. }
            | Self::MemoryBudgetExceeded { clip_id, .. }
            | Self::ClipNotFound { clip_id }
            | Self::InvalidClip { clip_id, .. } => Some(*clip_id),
            _ => None,
        }
    }

    /// Returns true for failures that the engine retries with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LoadTimeout { .. }
                | Self::LoadError { .. }
                | Self::TransitionTimeout { .. }
                | Self::PlaybackRejected { .. }
                | Self::MemoryBudgetExceeded { .. }
        )
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoadTimeout { clip_id } => write!(f, "load timed out for clip {clip_id}"),
            Self::LoadError { clip_id, reason } => {
                write!(f, "load failed for clip {clip_id}: {reason}")
            }
            Self::RetryExhausted { clip_id, attempts } => {
                write!(f, "gave up on clip {clip_id} after {attempts} retries")
            }
            Self::TransitionTimeout { clip_id } => {
                write!(f, "clip {clip_id} did not become ready in time")
            }
            Self::PlaybackRejected { clip_id, reason } => {
                write!(f, "resume rejected for clip {clip_id}: {reason}")
            }
            Self::MemoryBudgetExceeded {
                clip_id,
                required_mb,
                available_mb,
            } => write!(
                f,
                "memory budget exceeded for clip {clip_id}: needs {required_mb} MB, {available_mb} MB available"
            ),
            Self::EndOfTimeline => write!(f, "end of timeline"),
            Self::ClipNotFound { clip_id } => write!(f, "clip not found: {clip_id}"),
            Self::InvalidClip { clip_id, reason } => {
                write!(f, "invalid clip {clip_id}: {reason}")
            }
            Self::EmptyTimeline => write!(f, "timeline has no clips"),
            Self::InvalidTempo {
                reference_bpm,
                target_bpm,
            } => write!(f, "invalid tempo {target_bpm} against reference {reference_bpm}"),
            Self::InvalidConfig { reason } => write!(f, "invalid config: {reason}"),
            Self::ConfigIo { path, reason } => {
                write!(f, "failed to read config {}: {reason}", path.display())
            }
            Self::ConfigParse { reason } => write!(f, "failed to parse config: {reason}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::ConfigParse {
            reason: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SyncError;

    #[test]
    fn memory_budget_exceeded_is_transient_and_names_the_clip() {
        let error = SyncError::MemoryBudgetExceeded {
            clip_id: 4,
            required_mb: 150,
            available_mb: 50,
        };

        assert!(error.is_transient());
        assert_eq!(error.clip_id(), Some(4));
        assert!(error.to_string().contains("150 MB"));
    }

    #[test]
    fn end_of_timeline_is_not_transient() {
        assert!(!SyncError::EndOfTimeline.is_transient());
        assert_eq!(SyncError::EndOfTimeline.clip_id(), None);
    }
}
