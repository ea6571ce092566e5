//! Deterministic in-memory media backend for headless runs and tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::debug;

use crate::clip::{Clip, ClipId};
use crate::error::{Result, SyncError};
use crate::media::{
    BufferedRange, ClipSource, ElementHandle, LoadRequest, MediaBackend, MediaEvent, PlayOutcome,
    SourceResolver,
};
use crate::time::{duration_to_tl, scale_tl};

/// How the simulated environment answers resume requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlayPolicy {
    #[default]
    Immediate,
    /// Answers later with `PlayStarted` on the next `advance`.
    Deferred,
    /// Refuses every clip resume, like a strict autoplay policy. The
    /// soundtrack is started by a user gesture and plays unless blocked.
    Reject,
}

#[derive(Debug, Clone)]
struct SimElement {
    clip_id: ClipId,
    trim_start_tl: i64,
    trim_end_tl: i64,
    media_end_tl: i64,
    position_tl: i64,
    buffered_end_tl: i64,
    playing: bool,
    rate: f64,
    failing: bool,
    ended: bool,
    fully_buffered: bool,
}

#[derive(Debug, Clone, Default)]
struct SimSoundtrack {
    position_tl: i64,
    playing: bool,
    rate: f64,
}

/// Simulated media elements that buffer and play in virtual time.
///
/// Loads progress at `load_speed` media seconds per wall second; playback
/// stops at the end of the buffered data, which is how stalls are produced.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use timeline_sync::sim::SimulatedMedia;
///
/// let mut media = SimulatedMedia::default();
/// assert!(media.advance(Duration::from_millis(100)).is_empty());
/// ```
#[derive(Debug)]
pub struct SimulatedMedia {
    load_speed: f64,
    play_policy: PlayPolicy,
    elements: BTreeMap<ElementHandle, SimElement>,
    soundtrack: SimSoundtrack,
    soundtrack_blocked: bool,
    failures: HashMap<ClipId, u32>,
    load_limits: HashMap<ClipId, f64>,
    buffered_override: HashMap<ElementHandle, Vec<BufferedRange>>,
    pending: Vec<MediaEvent>,
    clock: Duration,
    released: Vec<ElementHandle>,
    opened: Vec<(ClipId, ElementHandle)>,
}

impl Default for SimulatedMedia {
    fn default() -> Self {
        Self {
            load_speed: 20.0,
            play_policy: PlayPolicy::Immediate,
            elements: BTreeMap::new(),
            soundtrack: SimSoundtrack {
                rate: 1.0,
                ..SimSoundtrack::default()
            },
            soundtrack_blocked: false,
            failures: HashMap::new(),
            load_limits: HashMap::new(),
            buffered_override: HashMap::new(),
            pending: Vec::new(),
            clock: Duration::ZERO,
            released: Vec::new(),
            opened: Vec::new(),
        }
    }
}

impl SimulatedMedia {
    /// Media seconds buffered per second of wall time.
    pub fn with_load_speed(mut self, load_speed: f64) -> Self {
        self.load_speed = load_speed.max(0.0);
        self
    }

    pub fn with_play_policy(mut self, play_policy: PlayPolicy) -> Self {
        self.play_policy = play_policy;
        self
    }

    pub fn set_play_policy(&mut self, play_policy: PlayPolicy) {
        self.play_policy = play_policy;
    }

    /// Makes the soundtrack refuse every resume while `blocked`.
    pub fn block_soundtrack(&mut self, blocked: bool) {
        self.soundtrack_blocked = blocked;
    }

    /// Makes the next `times` loads of `clip_id` fail with a decode error.
    pub fn fail_loads(&mut self, clip_id: ClipId, times: u32) {
        self.failures.insert(clip_id, times);
    }

    /// Caps buffering of `clip_id` at `fraction` of its trim window.
    pub fn limit_load(&mut self, clip_id: ClipId, fraction: f64) {
        self.load_limits.insert(clip_id, fraction.clamp(0.0, 1.0));
    }

    pub fn clear_load_limit(&mut self, clip_id: ClipId) {
        self.load_limits.remove(&clip_id);
    }

    /// Replaces the buffered ranges reported for `handle`.
    pub fn set_buffered(&mut self, handle: ElementHandle, ranges: Vec<BufferedRange>) {
        self.buffered_override.insert(handle, ranges);
    }

    pub fn released(&self) -> &[ElementHandle] {
        &self.released
    }

    /// Every `(clip, element)` pair opened so far, in order.
    pub fn opened(&self) -> &[(ClipId, ElementHandle)] {
        &self.opened
    }

    pub fn live_elements(&self) -> usize {
        self.elements.len()
    }

    pub fn rate(&self, handle: ElementHandle) -> Option<f64> {
        if handle == ElementHandle::SOUNDTRACK {
            return Some(self.soundtrack.rate);
        }
        self.elements.get(&handle).map(|element| element.rate)
    }

    /// Moves virtual time forward and returns the native events it produced.
    pub fn advance(&mut self, elapsed: Duration) -> Vec<MediaEvent> {
        let mut events = std::mem::take(&mut self.pending);
        let elapsed_tl = duration_to_tl(elapsed);

        if self.soundtrack.playing {
            self.soundtrack.position_tl += scale_tl(elapsed_tl, self.soundtrack.rate);
        }

        for (handle, element) in &mut self.elements {
            let handle = *handle;
            if element.failing {
                element.failing = false;
                events.push(MediaEvent::Error {
                    handle,
                    message: "simulated decode failure".to_owned(),
                });
                continue;
            }

            if !element.fully_buffered {
                let limit = self.load_limits.get(&element.clip_id).copied().unwrap_or(1.0);
                let window = element.trim_end_tl - element.trim_start_tl;
                let cap = element.trim_start_tl + (window as f64 * limit).round() as i64;
                let grown = element.buffered_end_tl + scale_tl(elapsed_tl, self.load_speed);
                let next = grown.min(cap).min(element.media_end_tl);
                if next != element.buffered_end_tl {
                    element.buffered_end_tl = next;
                    events.push(MediaEvent::Progress { handle });
                }
                if element.buffered_end_tl >= element.trim_end_tl {
                    element.fully_buffered = true;
                    events.push(MediaEvent::CanPlay { handle });
                }
            }

            if element.playing && !element.ended {
                let target = element.position_tl + scale_tl(elapsed_tl, element.rate);
                let reachable = if element.fully_buffered {
                    element.media_end_tl
                } else {
                    element.buffered_end_tl
                };
                element.position_tl = target.min(reachable.max(element.position_tl));
                if element.position_tl >= element.media_end_tl {
                    element.ended = true;
                    element.playing = false;
                    events.push(MediaEvent::Ended { handle });
                }
            }
        }
        events
    }
}

impl MediaBackend for SimulatedMedia {
    fn open(&mut self, request: &LoadRequest<'_>) -> Result<()> {
        let clip = request.clip;
        let failing = match self.failures.get_mut(&clip.id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        debug!(clip_id = clip.id, handle = %request.handle, failing, "simulated open");
        self.opened.push((clip.id, request.handle));
        self.elements.insert(
            request.handle,
            SimElement {
                clip_id: clip.id,
                trim_start_tl: clip.trim_start_tl,
                trim_end_tl: clip.trim_end_tl,
                media_end_tl: clip.original_duration_tl.max(clip.trim_end_tl),
                position_tl: clip.trim_start_tl,
                buffered_end_tl: clip.trim_start_tl,
                playing: false,
                rate: 1.0,
                failing,
                ended: false,
                fully_buffered: false,
            },
        );
        Ok(())
    }

    fn release(&mut self, handle: ElementHandle) {
        if self.elements.remove(&handle).is_some() {
            self.released.push(handle);
        }
        self.buffered_override.remove(&handle);
    }

    fn play(&mut self, handle: ElementHandle) -> PlayOutcome {
        if handle == ElementHandle::SOUNDTRACK {
            if self.soundtrack_blocked {
                return PlayOutcome::Rejected("soundtrack blocked".to_owned());
            }
            self.soundtrack.playing = true;
            return PlayOutcome::Started;
        }
        if self.play_policy == PlayPolicy::Reject {
            return PlayOutcome::Rejected("autoplay blocked".to_owned());
        }
        let Some(element) = self.elements.get_mut(&handle) else {
            return PlayOutcome::Rejected("unknown element".to_owned());
        };
        element.playing = true;
        element.ended = false;
        match self.play_policy {
            PlayPolicy::Deferred => {
                self.pending.push(MediaEvent::PlayStarted { handle });
                PlayOutcome::Pending
            }
            _ => PlayOutcome::Started,
        }
    }

    fn pause(&mut self, handle: ElementHandle) {
        if handle == ElementHandle::SOUNDTRACK {
            self.soundtrack.playing = false;
        } else if let Some(element) = self.elements.get_mut(&handle) {
            element.playing = false;
        }
    }

    fn seek(&mut self, handle: ElementHandle, position_tl: i64) {
        if handle == ElementHandle::SOUNDTRACK {
            self.soundtrack.position_tl = position_tl.max(0);
        } else if let Some(element) = self.elements.get_mut(&handle) {
            element.position_tl = position_tl.clamp(0, element.media_end_tl);
            element.ended = false;
        }
    }

    fn set_rate(&mut self, handle: ElementHandle, rate: f64) {
        if handle == ElementHandle::SOUNDTRACK {
            self.soundtrack.rate = rate;
        } else if let Some(element) = self.elements.get_mut(&handle) {
            element.rate = rate;
        }
    }

    fn current_time_tl(&self, handle: ElementHandle) -> Option<i64> {
        if handle == ElementHandle::SOUNDTRACK {
            return Some(self.soundtrack.position_tl);
        }
        self.elements.get(&handle).map(|element| element.position_tl)
    }

    fn buffered(&self, handle: ElementHandle) -> Vec<BufferedRange> {
        if let Some(ranges) = self.buffered_override.get(&handle) {
            return ranges.clone();
        }
        self.elements
            .get(&handle)
            .filter(|element| element.buffered_end_tl > element.trim_start_tl)
            .map(|element| {
                vec![BufferedRange {
                    start_tl: element.trim_start_tl,
                    end_tl: element.buffered_end_tl,
                }]
            })
            .unwrap_or_default()
    }

    fn is_seeking(&self, _handle: ElementHandle) -> bool {
        false
    }

    fn is_playing(&self, handle: ElementHandle) -> bool {
        if handle == ElementHandle::SOUNDTRACK {
            return self.soundtrack.playing;
        }
        self.elements
            .get(&handle)
            .is_some_and(|element| element.playing)
    }

    /// Advances virtual time up to the engine's `now`.
    fn drain_events(&mut self, now: Duration) -> Vec<MediaEvent> {
        let elapsed = now.saturating_sub(self.clock);
        self.clock = self.clock.max(now);
        self.advance(elapsed)
    }
}

/// Resolver that hands out the clip's own source reference.
#[derive(Debug, Default)]
pub struct SimulatedResolver {
    default_estimate_bytes: Option<u64>,
    estimates: HashMap<ClipId, u64>,
    unresolvable: Vec<ClipId>,
    revoked: RefCell<Vec<String>>,
}

impl SimulatedResolver {
    pub fn with_estimate(bytes: u64) -> Self {
        Self {
            default_estimate_bytes: Some(bytes),
            ..Self::default()
        }
    }

    pub fn set_estimate(&mut self, clip_id: ClipId, bytes: u64) {
        self.estimates.insert(clip_id, bytes);
    }

    pub fn make_unresolvable(&mut self, clip_id: ClipId) {
        self.unresolvable.push(clip_id);
    }

    /// Locators revoked so far, in order.
    pub fn revoked(&self) -> Vec<String> {
        self.revoked.borrow().clone()
    }
}

impl SourceResolver for SimulatedResolver {
    fn resolve(&self, clip: &Clip) -> Result<ClipSource> {
        if self.unresolvable.contains(&clip.id) {
            return Err(SyncError::LoadError {
                clip_id: clip.id,
                reason: format!("source not found: {}", clip.source_ref),
            });
        }
        Ok(ClipSource {
            locator: clip.source_ref.clone(),
            estimated_bytes: self
                .estimates
                .get(&clip.id)
                .copied()
                .or(self.default_estimate_bytes),
        })
    }

    fn revoke(&self, source: &ClipSource) {
        self.revoked.borrow_mut().push(source.locator.clone());
    }
}
