use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

/// Opaque identifier for timeline clips.
pub type ClipId = u64;

/// A trimmed media segment placed on the timeline.
///
/// Times are timeline ticks (microseconds) inside the clip's source media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clip {
    pub id: ClipId,
    pub source_ref: String,
    pub trim_start_tl: i64,
    pub trim_end_tl: i64,
    pub original_duration_tl: i64,
    pub order_index: u32,
    #[serde(default = "default_repeat_count")]
    pub repeat_count: u32,
}

fn default_repeat_count() -> u32 {
    1
}

impl Clip {
    /// Length of one pass through the trim window.
    pub fn trim_len_tl(&self) -> i64 {
        self.trim_end_tl - self.trim_start_tl
    }

    /// Timeline duration including repetitions.
    pub fn duration_tl(&self) -> i64 {
        self.trim_len_tl()
            .saturating_mul(i64::from(self.repeat_count.max(1)))
    }

    /// Maps an offset inside the clip to a position in the source media.
    ///
    /// The offset is clamped to the clip; repetitions wrap back to
    /// `trim_start_tl`, and the very end maps to `trim_end_tl`.
    ///
    /// # Example
    /// ```
    /// use timeline_sync::clip::Clip;
    ///
    /// let clip = Clip {
    ///     id: 1,
    ///     source_ref: "a.mp4".into(),
    ///     trim_start_tl: 2_000_000,
    ///     trim_end_tl: 4_000_000,
    ///     original_duration_tl: 10_000_000,
    ///     order_index: 0,
    ///     repeat_count: 2,
    /// };
    /// assert_eq!(clip.media_position_tl(500_000), 2_500_000);
    /// assert_eq!(clip.media_position_tl(2_500_000), 2_500_000);
    /// assert_eq!(clip.media_position_tl(4_000_000), 4_000_000);
    /// ```
    pub fn media_position_tl(&self, offset_tl: i64) -> i64 {
        let len = self.trim_len_tl();
        let offset = offset_tl.clamp(0, self.duration_tl());
        if offset == self.duration_tl() {
            return self.trim_end_tl;
        }
        self.trim_start_tl + offset.rem_euclid(len)
    }

    /// Returns the zero-based repetition that `offset_tl` falls into.
    pub fn iteration_at(&self, offset_tl: i64) -> u32 {
        let last = self.repeat_count.max(1) - 1;
        let iteration = offset_tl.max(0) / self.trim_len_tl();
        u32::try_from(iteration).unwrap_or(u32::MAX).min(last)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason| SyncError::InvalidClip {
            clip_id: self.id,
            reason,
        };
        if self.source_ref.trim().is_empty() {
            return Err(invalid("source reference is empty"));
        }
        if self.trim_start_tl < 0 {
            return Err(invalid("trim start is negative"));
        }
        if self.trim_start_tl >= self.trim_end_tl {
            return Err(invalid("trim start must precede trim end"));
        }
        if self.original_duration_tl < 0 {
            return Err(invalid("original duration is negative"));
        }
        if self.repeat_count == 0 {
            return Err(invalid("repeat count must be at least one"));
        }
        Ok(())
    }
}

/// Ordered, immutable view of the clips being played.
///
/// The registry is replaced wholesale when the timeline changes; cloning is
/// cheap and shares the clip storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClipRegistry {
    clips: Arc<[Clip]>,
}

impl ClipRegistry {
    /// Validates `clips` and orders them by `order_index`.
    ///
    /// An empty list is accepted and yields an empty registry.
    pub fn new(mut clips: Vec<Clip>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(clips.len());
        for clip in &clips {
            if let Err(error) = clip.validate() {
                warn!(clip_id = clip.id, %error, "clip rejected");
                return Err(error);
            }
            if !seen.insert(clip.id) {
                warn!(clip_id = clip.id, "clip rejected: duplicate id");
                return Err(SyncError::InvalidClip {
                    clip_id: clip.id,
                    reason: "duplicate clip id",
                });
            }
        }

        clips.sort_by_key(|clip| clip.order_index);
        debug!(clip_count = clips.len(), "clip registry built");
        Ok(Self {
            clips: clips.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Clip> {
        self.clips.get(index)
    }

    pub fn clips(&self) -> &[Clip] {
        &self.clips
    }

    /// Returns the timeline index of `clip_id`.
    pub fn index_of(&self, clip_id: ClipId) -> Option<usize> {
        self.clips.iter().position(|clip| clip.id == clip_id)
    }

    /// Looks up a clip by id.
    pub fn by_id(&self, clip_id: ClipId) -> Result<&Clip> {
        self.clips
            .iter()
            .find(|clip| clip.id == clip_id)
            .ok_or(SyncError::ClipNotFound { clip_id })
    }
}

#[cfg(test)]
pub(crate) fn sample_clip(id: ClipId, order_index: u32, seconds: i64) -> Clip {
    Clip {
        id,
        source_ref: format!("clip-{id}.mp4"),
        trim_start_tl: 0,
        trim_end_tl: seconds * crate::time::TIMELINE_TIME_BASE,
        original_duration_tl: seconds * crate::time::TIMELINE_TIME_BASE,
        order_index,
        repeat_count: 1,
    }
}
