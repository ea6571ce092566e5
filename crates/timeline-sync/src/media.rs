//! Interfaces consumed from the media collaborators.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::clip::Clip;
use crate::error::Result;
use crate::time::percent_of;

/// Handle to one media element owned by the backend.
///
/// The engine mints a fresh handle for every load attempt, so events that
/// arrive for a handle no slot owns anymore are stale and get discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementHandle(pub u64);

impl ElementHandle {
    /// The continuous soundtrack element. Its position is absolute timeline time.
    pub const SOUNDTRACK: Self = Self(0);
}

impl Display for ElementHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if *self == Self::SOUNDTRACK {
            write!(f, "soundtrack")
        } else {
            write!(f, "element#{}", self.0)
        }
    }
}

/// Half-open `[start, end)` range of source media that is buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferedRange {
    pub start_tl: i64,
    pub end_tl: i64,
}

/// Loadable reference returned by the source resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipSource {
    pub locator: String,
    /// Approximate in-memory size used for budget accounting.
    pub estimated_bytes: Option<u64>,
}

/// One load attempt handed to the backend.
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    pub handle: ElementHandle,
    pub clip: &'a Clip,
    pub source: &'a ClipSource,
}

/// Immediate answer of the backend to a resume request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayOutcome {
    Started,
    /// The answer arrives later as `PlayStarted` or `PlayRejected`.
    Pending,
    Rejected(String),
}

/// Native signals reported by media elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    Progress { handle: ElementHandle },
    CanPlay { handle: ElementHandle },
    Ended { handle: ElementHandle },
    Error { handle: ElementHandle, message: String },
    PlayStarted { handle: ElementHandle },
    PlayRejected { handle: ElementHandle, reason: String },
}

impl MediaEvent {
    pub fn handle(&self) -> ElementHandle {
        match self {
            Self::Progress { handle }
            | Self::CanPlay { handle }
            | Self::Ended { handle }
            | Self::Error { handle, .. }
            | Self::PlayStarted { handle }
            | Self::PlayRejected { handle, .. } => *handle,
        }
    }
}

/// Media playback backend driving one element per buffer slot plus the
/// soundtrack.
pub trait MediaBackend {
    /// Begins loading `request.clip` into a new element.
    ///
    /// Returns once the load is started; progress, readiness and failures are
    /// reported later as [`MediaEvent`]s for `request.handle`.
    fn open(&mut self, request: &LoadRequest<'_>) -> Result<()>;

    /// Releases an element and cancels its outstanding load.
    fn release(&mut self, handle: ElementHandle);

    fn play(&mut self, handle: ElementHandle) -> PlayOutcome;

    fn pause(&mut self, handle: ElementHandle);

    fn seek(&mut self, handle: ElementHandle, position_tl: i64);

    fn set_rate(&mut self, handle: ElementHandle, rate: f64);

    /// Current media position, `None` for unknown handles.
    fn current_time_tl(&self, handle: ElementHandle) -> Option<i64>;

    fn buffered(&self, handle: ElementHandle) -> Vec<BufferedRange>;

    fn is_seeking(&self, handle: ElementHandle) -> bool;

    fn is_playing(&self, handle: ElementHandle) -> bool;

    /// Native events raised since the previous call, for backends that queue
    /// their callbacks until the engine ticks.
    fn drain_events(&mut self, _now: Duration) -> Vec<MediaEvent> {
        Vec::new()
    }
}

/// Resolves clip ids into loadable references.
pub trait SourceResolver {
    fn resolve(&self, clip: &Clip) -> Result<ClipSource>;

    /// Frees any transient reference created by `resolve`.
    fn revoke(&self, _source: &ClipSource) {}
}

/// Percentage of `[window_start, window_end)` covered by `ranges`.
pub fn coverage_percent(ranges: &[BufferedRange], window_start: i64, window_end: i64) -> u8 {
    let mut clipped: Vec<(i64, i64)> = ranges
        .iter()
        .map(|range| {
            (
                range.start_tl.max(window_start),
                range.end_tl.min(window_end),
            )
        })
        .filter(|(start, end)| start < end)
        .collect();
    clipped.sort_unstable();

    let mut covered = 0i64;
    let mut cursor = window_start;
    for (start, end) in clipped {
        let start = start.max(cursor);
        if end > start {
            covered += end - start;
            cursor = end;
        }
    }
    percent_of(covered, window_end - window_start)
}

/// Contiguous buffered duration starting at `position_tl`.
pub fn buffered_ahead_tl(ranges: &[BufferedRange], position_tl: i64) -> i64 {
    let mut sorted = ranges.to_vec();
    sorted.sort_unstable_by_key(|range| range.start_tl);

    let mut reach = position_tl;
    for range in sorted {
        if range.start_tl <= reach && range.end_tl > reach {
            reach = range.end_tl;
        }
    }
    reach - position_tl
}
