use crate::clip::{Clip, ClipRegistry};

/// Location of a timeline timestamp inside the clip sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipPosition {
    pub index: usize,
    pub offset_tl: i64,
    /// True when the queried time is at or past the end of the timeline.
    pub at_end: bool,
}

/// Converts between absolute timeline time and `(clip index, offset)`.
///
/// Keeps a prefix array of cumulative clip starts that is rebuilt whenever the
/// registry is replaced.
///
/// # Example
/// ```
/// use timeline_sync::clip::{Clip, ClipRegistry};
/// use timeline_sync::position::PositionMapper;
///
/// let clip = |id, order_index| Clip {
///     id,
///     source_ref: format!("{id}.mp4"),
///     trim_start_tl: 0,
///     trim_end_tl: 2_000_000,
///     original_duration_tl: 2_000_000,
///     order_index,
///     repeat_count: 1,
/// };
/// let registry = ClipRegistry::new(vec![clip(1, 0), clip(2, 1)]).expect("valid clips");
/// let mapper = PositionMapper::new(registry);
///
/// let position = mapper.to_clip_position(2_500_000).expect("non-empty");
/// assert_eq!((position.index, position.offset_tl), (1, 500_000));
/// ```
#[derive(Debug, Clone, Default)]
pub struct PositionMapper {
    registry: ClipRegistry,
    starts_tl: Vec<i64>,
}

impl PositionMapper {
    pub fn new(registry: ClipRegistry) -> Self {
        let mut starts_tl = Vec::with_capacity(registry.len() + 1);
        let mut cursor = 0i64;
        starts_tl.push(cursor);
        for clip in registry.clips() {
            cursor = cursor.saturating_add(clip.duration_tl());
            starts_tl.push(cursor);
        }
        Self {
            registry,
            starts_tl,
        }
    }

    pub fn registry(&self) -> &ClipRegistry {
        &self.registry
    }

    pub fn clip(&self, index: usize) -> Option<&Clip> {
        self.registry.get(index)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Total timeline duration in ticks.
    pub fn total_duration_tl(&self) -> i64 {
        self.starts_tl.last().copied().unwrap_or(0)
    }

    /// Timeline duration of clip `index` including repetitions.
    pub fn clip_duration_tl(&self, index: usize) -> Option<i64> {
        self.registry.get(index).map(Clip::duration_tl)
    }

    /// Absolute timeline start of clip `index`.
    pub fn cumulative_start_tl(&self, index: usize) -> Option<i64> {
        if index >= self.registry.len() {
            return None;
        }
        self.starts_tl.get(index).copied()
    }

    /// Converts `(index, offset)` into absolute timeline ticks.
    ///
    /// The offset is clamped to the clip's duration.
    pub fn to_absolute(&self, index: usize, offset_tl: i64) -> Option<i64> {
        let start = self.cumulative_start_tl(index)?;
        let duration = self.clip_duration_tl(index)?;
        Some(start + offset_tl.clamp(0, duration))
    }

    /// Finds the clip whose `[start, start + duration)` contains `t_tl`.
    ///
    /// Times before zero map to the first clip; times at or past the end map
    /// to the end of the last clip with `at_end` set. Returns `None` for an
    /// empty timeline.
    pub fn to_clip_position(&self, t_tl: i64) -> Option<ClipPosition> {
        let count = self.registry.len();
        if count == 0 {
            return None;
        }

        let total = self.total_duration_tl();
        if t_tl >= total {
            let last = count - 1;
            return Some(ClipPosition {
                index: last,
                offset_tl: total - self.starts_tl[last],
                at_end: true,
            });
        }

        let t_tl = t_tl.max(0);
        // First start strictly greater than t, minus one, is the containing clip.
        let index = self.starts_tl[..count].partition_point(|start| *start <= t_tl) - 1;
        Some(ClipPosition {
            index,
            offset_tl: t_tl - self.starts_tl[index],
            at_end: false,
        })
    }
}
