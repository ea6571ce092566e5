use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::budget::MemoryBudget;
use crate::clip::ClipId;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::media::{
    ClipSource, ElementHandle, LoadRequest, MediaBackend, SourceResolver, coverage_percent,
};
use crate::position::PositionMapper;

/// Load progress of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLoad {
    Loading { started_at: Duration },
    Ready,
    RetryScheduled { at: Duration },
    /// Retries are exhausted; the slot stays resident with its error.
    Failed,
}

/// A resident clip owning exactly one media element.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSlot {
    pub clip_id: ClipId,
    pub element: ElementHandle,
    pub is_ready: bool,
    pub buffer_health: u8,
    pub retry_count: u32,
    pub last_error: Option<SyncError>,
    pub resident_since: Duration,
    pub load: SlotLoad,
    source: ClipSource,
    estimate_mb: u64,
}

impl BufferSlot {
    pub fn estimate_mb(&self) -> u64 {
        self.estimate_mb
    }
}

/// Notifications produced while managing slots.
#[derive(Debug, Clone, PartialEq)]
pub enum PreloadEvent {
    Ready {
        clip_id: ClipId,
    },
    LoadFailed {
        clip_id: ClipId,
        error: SyncError,
        will_retry: bool,
    },
    Evicted {
        clip_id: ClipId,
    },
}

/// Collaborators a preload operation needs for one call.
pub struct PreloadContext<'a, M, R> {
    pub mapper: &'a PositionMapper,
    pub backend: &'a mut M,
    pub resolver: &'a R,
    pub now: Duration,
}

/// Owns the bounded set of loaded media slots and the memory budget.
///
/// # Example
/// ```
/// use timeline_sync::config::SyncConfig;
/// use timeline_sync::preload::PreloadManager;
///
/// let manager = PreloadManager::new(&SyncConfig::default());
/// assert_eq!(manager.window(2, 5), 1..=4);
/// assert_eq!(manager.window(0, 5), 0..=3);
/// ```
#[derive(Debug)]
pub struct PreloadManager {
    config: SyncConfig,
    budget: MemoryBudget,
    slots: HashMap<ClipId, BufferSlot>,
    unresolvable: HashMap<ClipId, SyncError>,
    next_handle: u64,
}

impl PreloadManager {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            config: config.clone(),
            budget: MemoryBudget::new(
                config.max_mb,
                config.max_slots,
                config.fallback_clip_estimate_mb,
            ),
            slots: HashMap::new(),
            unresolvable: HashMap::new(),
            next_handle: ElementHandle::SOUNDTRACK.0 + 1,
        }
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub fn ready_threshold(&self) -> u8 {
        self.config.ready_threshold
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, clip_id: ClipId) -> Option<&BufferSlot> {
        self.slots.get(&clip_id)
    }

    pub fn slots(&self) -> impl Iterator<Item = &BufferSlot> {
        self.slots.values()
    }

    pub fn is_resident(&self, clip_id: ClipId) -> bool {
        self.slots.contains_key(&clip_id)
    }

    /// Buffer health `0..=100`; zero for clips that are not resident.
    pub fn health(&self, clip_id: ClipId) -> u8 {
        self.slots
            .get(&clip_id)
            .map(|slot| slot.buffer_health)
            .unwrap_or(0)
    }

    /// True when the clip is resident and buffered past the ready threshold.
    pub fn is_ready(&self, clip_id: ClipId) -> bool {
        self.slots.get(&clip_id).is_some_and(|slot| {
            slot.is_ready && slot.buffer_health >= self.config.ready_threshold
        })
    }

    /// True when the clip failed permanently, either at resolve time or after
    /// exhausting its load retries.
    pub fn has_terminal_error(&self, clip_id: ClipId) -> bool {
        self.unresolvable.contains_key(&clip_id)
            || self
                .slots
                .get(&clip_id)
                .is_some_and(|slot| slot.load == SlotLoad::Failed)
    }

    pub fn element(&self, clip_id: ClipId) -> Option<ElementHandle> {
        self.slots.get(&clip_id).map(|slot| slot.element)
    }

    /// Last error recorded for `clip_id`, resident or not.
    pub fn last_error(&self, clip_id: ClipId) -> Option<SyncError> {
        self.slots
            .get(&clip_id)
            .and_then(|slot| slot.last_error.clone())
            .or_else(|| self.unresolvable.get(&clip_id).cloned())
    }

    /// Clip index range kept resident around `current_index`.
    pub fn window(&self, current_index: usize, clip_count: usize) -> RangeInclusive<usize> {
        if clip_count == 0 {
            return 1..=0;
        }
        let current = current_index.min(clip_count - 1);
        let first = current.saturating_sub(self.config.back_distance);
        let last = current
            .saturating_add(self.config.forward_distance)
            .min(clip_count - 1);
        first..=last
    }

    /// Evicts slots outside the preload window and allocates the missing ones,
    /// nearest to `current_index` first.
    ///
    /// Clips in `pinned` are never evicted here.
    pub fn ensure_window<M, R>(
        &mut self,
        current_index: usize,
        pinned: &[ClipId],
        ctx: &mut PreloadContext<'_, M, R>,
    ) -> Vec<PreloadEvent>
    where
        M: MediaBackend,
        R: SourceResolver,
    {
        let mut events = Vec::new();
        let mapper = ctx.mapper;
        let clip_count = mapper.len();
        let window = self.window(current_index, clip_count);

        let outside: Vec<ClipId> = self
            .slots
            .keys()
            .copied()
            .filter(|clip_id| !pinned.contains(clip_id))
            .filter(|clip_id| {
                mapper
                    .registry()
                    .index_of(*clip_id)
                    .is_none_or(|index| !window.contains(&index))
            })
            .collect();
        for clip_id in outside {
            if self.evict(clip_id, ctx.backend, ctx.resolver) {
                events.push(PreloadEvent::Evicted { clip_id });
            }
        }

        if window.is_empty() {
            return events;
        }
        let current = current_index.min(clip_count - 1);
        let nearest_first = (current..=*window.end()).chain((*window.start()..current).rev());
        for index in nearest_first {
            let Some(clip_id) = mapper.clip(index).map(|clip| clip.id) else {
                continue;
            };
            if self.slots.contains_key(&clip_id) || self.unresolvable.contains_key(&clip_id) {
                continue;
            }
            match self.allocate_with_events(clip_id, current, pinned, ctx, &mut events) {
                Ok(_) => {}
                Err(SyncError::MemoryBudgetExceeded {
                    required_mb,
                    available_mb,
                    ..
                }) => {
                    debug!(
                        clip_id,
                        index, required_mb, available_mb, "preload skipped: budget full"
                    );
                }
                Err(error) => {
                    warn!(clip_id, index, %error, "preload failed");
                }
            }
        }

        debug_assert!(self.slots.len() <= self.budget.max_slots());
        debug_assert!(self.budget.used_mb() <= self.budget.max_mb());
        events
    }

    /// Creates a slot for `clip_id` and starts loading it.
    ///
    /// When the budget is full, resident clips farther from `active_index`
    /// than the requested one are evicted first, farthest first. Fails with
    /// `MemoryBudgetExceeded` when that still does not free enough room.
    pub fn allocate<M, R>(
        &mut self,
        clip_id: ClipId,
        active_index: usize,
        pinned: &[ClipId],
        ctx: &mut PreloadContext<'_, M, R>,
    ) -> Result<(ElementHandle, Vec<PreloadEvent>)>
    where
        M: MediaBackend,
        R: SourceResolver,
    {
        let mut events = Vec::new();
        let handle = self.allocate_with_events(clip_id, active_index, pinned, ctx, &mut events)?;
        Ok((handle, events))
    }

    fn allocate_with_events<M, R>(
        &mut self,
        clip_id: ClipId,
        active_index: usize,
        pinned: &[ClipId],
        ctx: &mut PreloadContext<'_, M, R>,
        events: &mut Vec<PreloadEvent>,
    ) -> Result<ElementHandle>
    where
        M: MediaBackend,
        R: SourceResolver,
    {
        if let Some(slot) = self.slots.get(&clip_id) {
            return Ok(slot.element);
        }
        let mapper = ctx.mapper;
        let requested_index = mapper
            .registry()
            .index_of(clip_id)
            .ok_or(SyncError::ClipNotFound { clip_id })?;
        let clip = mapper.registry().by_id(clip_id)?;
        let source = match ctx.resolver.resolve(clip) {
            Ok(source) => source,
            Err(error) => {
                warn!(clip_id, %error, "clip source could not be resolved");
                self.unresolvable.insert(clip_id, error.clone());
                return Err(error);
            }
        };
        let estimate_mb = self.budget.estimate_mb(&source);

        let requested_distance = requested_index.abs_diff(active_index);
        while !self.budget.fits(estimate_mb, self.slots.len()) {
            let Some(victim) =
                self.farthest_victim(mapper, active_index, requested_distance, clip_id, pinned)
            else {
                ctx.resolver.revoke(&source);
                return Err(SyncError::MemoryBudgetExceeded {
                    clip_id,
                    required_mb: estimate_mb,
                    available_mb: self.budget.available_mb(),
                });
            };
            debug!(clip_id, victim, "evicting farthest clip to make room");
            if self.evict(victim, ctx.backend, ctx.resolver) {
                events.push(PreloadEvent::Evicted { clip_id: victim });
            }
        }

        self.budget.reserve(estimate_mb);
        let handle = self.mint_handle();
        self.slots.insert(
            clip_id,
            BufferSlot {
                clip_id,
                element: handle,
                is_ready: false,
                buffer_health: 0,
                retry_count: 0,
                last_error: None,
                resident_since: ctx.now,
                load: SlotLoad::Loading {
                    started_at: ctx.now,
                },
                source,
                estimate_mb,
            },
        );
        debug!(
            clip_id,
            %handle,
            estimate_mb,
            used_mb = self.budget.used_mb(),
            slot_count = self.slots.len(),
            "slot allocated"
        );
        self.start_load(clip_id, ctx, events);
        Ok(self.slots.get(&clip_id).map_or(handle, |slot| slot.element))
    }

    /// Releases the slot's element and its source reference.
    ///
    /// Returns false when the clip was not resident.
    pub fn evict<M, R>(&mut self, clip_id: ClipId, backend: &mut M, resolver: &R) -> bool
    where
        M: MediaBackend,
        R: SourceResolver,
    {
        let Some(slot) = self.slots.remove(&clip_id) else {
            return false;
        };
        backend.release(slot.element);
        resolver.revoke(&slot.source);
        self.budget.release(slot.estimate_mb);
        debug!(
            clip_id,
            handle = %slot.element,
            used_mb = self.budget.used_mb(),
            "slot evicted"
        );
        true
    }

    /// Evicts every slot and forgets resolve failures.
    pub fn evict_all<M, R>(&mut self, backend: &mut M, resolver: &R)
    where
        M: MediaBackend,
        R: SourceResolver,
    {
        let clip_ids: Vec<ClipId> = self.slots.keys().copied().collect();
        for clip_id in clip_ids {
            self.evict(clip_id, backend, resolver);
        }
        self.unresolvable.clear();
    }

    /// Starts a fresh load for a clip whose retries are exhausted.
    pub fn reload<M, R>(
        &mut self,
        clip_id: ClipId,
        ctx: &mut PreloadContext<'_, M, R>,
    ) -> Vec<PreloadEvent>
    where
        M: MediaBackend,
        R: SourceResolver,
    {
        let mut events = Vec::new();
        if self.unresolvable.remove(&clip_id).is_some() {
            info!(clip_id, "clip source will be resolved again");
            return events;
        }
        let Some(slot) = self.slots.get_mut(&clip_id) else {
            return events;
        };
        if slot.load != SlotLoad::Failed {
            return events;
        }
        info!(clip_id, "restarting failed load");
        slot.retry_count = 0;
        self.start_load(clip_id, ctx, &mut events);
        events
    }

    /// Routes one backend event to the slot owning its element.
    ///
    /// Events for elements no slot owns anymore are discarded.
    pub fn on_media_event<M, R>(
        &mut self,
        handle: ElementHandle,
        error: Option<String>,
        ctx: &mut PreloadContext<'_, M, R>,
    ) -> Vec<PreloadEvent>
    where
        M: MediaBackend,
        R: SourceResolver,
    {
        let mut events = Vec::new();
        let Some(clip_id) = self.clip_for_element(handle) else {
            debug!(%handle, "discarding event for stale element");
            return events;
        };
        match error {
            Some(reason) => {
                self.fail_load(clip_id, SyncError::LoadError { clip_id, reason }, ctx, &mut events)
            }
            None => self.refresh_health(clip_id, ctx, &mut events),
        }
        events
    }

    /// Restarts scheduled retries and times out stuck loads.
    pub fn poll<M, R>(&mut self, ctx: &mut PreloadContext<'_, M, R>) -> Vec<PreloadEvent>
    where
        M: MediaBackend,
        R: SourceResolver,
    {
        let mut events = Vec::new();
        let mut due: Vec<(ClipId, bool)> = self
            .slots
            .values()
            .filter_map(|slot| match slot.load {
                SlotLoad::RetryScheduled { at } if at <= ctx.now => Some((slot.clip_id, true)),
                SlotLoad::Loading { started_at }
                    if ctx.now.saturating_sub(started_at) >= self.config.load_timeout =>
                {
                    Some((slot.clip_id, false))
                }
                _ => None,
            })
            .collect();
        due.sort_unstable();

        for (clip_id, retry) in due {
            if retry {
                self.start_load(clip_id, ctx, &mut events);
            } else {
                warn!(clip_id, "load timed out");
                self.fail_load(clip_id, SyncError::LoadTimeout { clip_id }, ctx, &mut events);
            }
        }
        events
    }

    /// Re-reads buffered ranges for a clip whose playback stalled.
    pub fn recheck<M, R>(
        &mut self,
        clip_id: ClipId,
        ctx: &mut PreloadContext<'_, M, R>,
    ) -> Vec<PreloadEvent>
    where
        M: MediaBackend,
        R: SourceResolver,
    {
        let mut events = Vec::new();
        if self.slots.contains_key(&clip_id) {
            self.refresh_health(clip_id, ctx, &mut events);
        }
        events
    }

    pub fn clip_for_element(&self, handle: ElementHandle) -> Option<ClipId> {
        self.slots
            .values()
            .find(|slot| slot.element == handle)
            .map(|slot| slot.clip_id)
    }

    fn start_load<M, R>(
        &mut self,
        clip_id: ClipId,
        ctx: &mut PreloadContext<'_, M, R>,
        events: &mut Vec<PreloadEvent>,
    ) where
        M: MediaBackend,
        R: SourceResolver,
    {
        let handle = self.mint_handle();
        let mapper = ctx.mapper;
        let Ok(clip) = mapper.registry().by_id(clip_id) else {
            return;
        };
        let Some(slot) = self.slots.get_mut(&clip_id) else {
            return;
        };
        slot.element = handle;
        slot.is_ready = false;
        slot.buffer_health = 0;
        slot.load = SlotLoad::Loading {
            started_at: ctx.now,
        };

        let request = LoadRequest {
            handle,
            clip,
            source: &slot.source,
        };
        let opened = ctx.backend.open(&request);
        debug!(clip_id, %handle, retry_count = slot.retry_count, "load started");
        if let Err(error) = opened {
            let error = match error {
                error @ SyncError::LoadError { .. } => error,
                other => SyncError::LoadError {
                    clip_id,
                    reason: other.to_string(),
                },
            };
            self.fail_load(clip_id, error, ctx, events);
        }
    }

    fn refresh_health<M, R>(
        &mut self,
        clip_id: ClipId,
        ctx: &mut PreloadContext<'_, M, R>,
        events: &mut Vec<PreloadEvent>,
    ) where
        M: MediaBackend,
        R: SourceResolver,
    {
        let mapper = ctx.mapper;
        let Ok(clip) = mapper.registry().by_id(clip_id) else {
            return;
        };
        let Some(slot) = self.slots.get_mut(&clip_id) else {
            return;
        };
        if !matches!(slot.load, SlotLoad::Loading { .. } | SlotLoad::Ready) {
            return;
        }

        let ranges = ctx.backend.buffered(slot.element);
        slot.buffer_health = coverage_percent(&ranges, clip.trim_start_tl, clip.trim_end_tl);
        if !slot.is_ready && slot.buffer_health >= self.config.ready_threshold {
            slot.is_ready = true;
            slot.retry_count = 0;
            slot.last_error = None;
            slot.load = SlotLoad::Ready;
            debug!(clip_id, health = slot.buffer_health, "slot ready");
            events.push(PreloadEvent::Ready { clip_id });
        }
    }

    fn fail_load<M, R>(
        &mut self,
        clip_id: ClipId,
        error: SyncError,
        ctx: &mut PreloadContext<'_, M, R>,
        events: &mut Vec<PreloadEvent>,
    ) where
        M: MediaBackend,
        R: SourceResolver,
    {
        let Some(slot) = self.slots.get_mut(&clip_id) else {
            return;
        };
        if matches!(slot.load, SlotLoad::Failed | SlotLoad::RetryScheduled { .. }) {
            return;
        }
        slot.is_ready = false;
        ctx.backend.release(slot.element);

        if slot.retry_count < self.config.max_retries {
            slot.retry_count += 1;
            let delay = self.config.backoff_delay(slot.retry_count);
            slot.load = SlotLoad::RetryScheduled {
                at: ctx.now + delay,
            };
            slot.last_error = Some(error.clone());
            warn!(
                clip_id,
                retry_count = slot.retry_count,
                delay_ms = delay.as_millis() as u64,
                %error,
                "load failed, retry scheduled"
            );
            events.push(PreloadEvent::LoadFailed {
                clip_id,
                error,
                will_retry: true,
            });
        } else {
            let exhausted = SyncError::RetryExhausted {
                clip_id,
                attempts: slot.retry_count,
            };
            slot.load = SlotLoad::Failed;
            slot.last_error = Some(exhausted.clone());
            warn!(clip_id, %error, "load failed, retries exhausted");
            events.push(PreloadEvent::LoadFailed {
                clip_id,
                error: exhausted,
                will_retry: false,
            });
        }
    }

    fn farthest_victim(
        &self,
        mapper: &PositionMapper,
        active_index: usize,
        requested_distance: usize,
        requested: ClipId,
        pinned: &[ClipId],
    ) -> Option<ClipId> {
        self.slots
            .keys()
            .copied()
            .filter(|clip_id| *clip_id != requested && !pinned.contains(clip_id))
            .map(|clip_id| {
                let distance = mapper
                    .registry()
                    .index_of(clip_id)
                    .map_or(usize::MAX, |index| index.abs_diff(active_index));
                (distance, clip_id)
            })
            .filter(|(distance, _)| *distance > requested_distance)
            .max()
            .map(|(_, clip_id)| clip_id)
    }

    fn mint_handle(&mut self) -> ElementHandle {
        let handle = ElementHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{PreloadContext, PreloadEvent, PreloadManager, SlotLoad};
    use crate::clip::{ClipRegistry, sample_clip};
    use crate::config::SyncConfig;
    use crate::error::SyncError;
    use crate::media::BufferedRange;
    use crate::position::PositionMapper;
    use crate::sim::{SimulatedMedia, SimulatedResolver};

    const MB: u64 = 1024 * 1024;

    fn scenario_mapper() -> PositionMapper {
        let clips = [10, 8, 12, 6, 9]
            .into_iter()
            .enumerate()
            .map(|(index, seconds)| sample_clip(index as u64 + 1, index as u32, seconds))
            .collect();
        PositionMapper::new(ClipRegistry::new(clips).expect("valid clips"))
    }

    fn context<'a>(
        mapper: &'a PositionMapper,
        backend: &'a mut SimulatedMedia,
        resolver: &'a SimulatedResolver,
        now: Duration,
    ) -> PreloadContext<'a, SimulatedMedia, SimulatedResolver> {
        PreloadContext {
            mapper,
            backend,
            resolver,
            now,
        }
    }

    fn resident_ids(manager: &PreloadManager) -> Vec<u64> {
        let mut ids: Vec<_> = manager.slots().map(|slot| slot.clip_id).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn ensure_window_keeps_back_distance_and_evicts_older_clips() {
        let mapper = scenario_mapper();
        let mut backend = SimulatedMedia::default();
        let resolver = SimulatedResolver::with_estimate(10 * MB);
        let mut manager = PreloadManager::new(&SyncConfig::default());

        let mut ctx = context(&mapper, &mut backend, &resolver, Duration::ZERO);
        manager.ensure_window(0, &[], &mut ctx);
        assert_eq!(resident_ids(&manager), vec![1, 2, 3, 4]);

        let events = manager.ensure_window(2, &[], &mut ctx);
        assert_eq!(resident_ids(&manager), vec![2, 3, 4, 5]);
        assert!(events.contains(&PreloadEvent::Evicted { clip_id: 1 }));
        assert!(!events.contains(&PreloadEvent::Evicted { clip_id: 2 }));
        assert_eq!(manager.budget().used_mb(), 40);
    }

    #[test]
    fn slot_cap_limits_the_window_to_the_clips_nearest_the_active_one() {
        let mapper = scenario_mapper();
        let mut backend = SimulatedMedia::default();
        let resolver = SimulatedResolver::with_estimate(10 * MB);
        let config = SyncConfig {
            max_slots: 2,
            ..SyncConfig::default()
        };
        let mut manager = PreloadManager::new(&config);

        let mut ctx = context(&mapper, &mut backend, &resolver, Duration::ZERO);
        manager.ensure_window(0, &[], &mut ctx);
        assert_eq!(resident_ids(&manager), vec![1, 2]);

        let events = manager.ensure_window(2, &[], &mut ctx);
        assert_eq!(resident_ids(&manager), vec![2, 3]);
        assert_eq!(events.first(), Some(&PreloadEvent::Evicted { clip_id: 1 }));

        manager.ensure_window(4, &[], &mut ctx);
        assert_eq!(resident_ids(&manager), vec![4, 5]);
        assert!(manager.slot_count() <= 2);
        assert_eq!(backend.live_elements(), 2);
    }

    #[test]
    fn budget_limits_residency_and_prefers_clips_nearest_the_active_one() {
        let mapper = scenario_mapper();
        let mut backend = SimulatedMedia::default();
        let resolver = SimulatedResolver::with_estimate(150 * MB);
        let config = SyncConfig {
            max_mb: 500,
            ..SyncConfig::default()
        };
        let mut manager = PreloadManager::new(&config);

        let mut ctx = context(&mapper, &mut backend, &resolver, Duration::ZERO);
        manager.ensure_window(0, &[], &mut ctx);
        assert_eq!(resident_ids(&manager), vec![1, 2, 3]);
        assert!(manager.budget().used_mb() <= 500);

        let (handle, events) = manager
            .allocate(4, 3, &[], &mut ctx)
            .expect("allocation should evict the farthest clip");
        assert_eq!(events, vec![PreloadEvent::Evicted { clip_id: 1 }]);
        assert_eq!(manager.element(4), Some(handle));
        assert_eq!(resident_ids(&manager), vec![2, 3, 4]);
        assert_eq!(manager.budget().used_mb(), 450);
    }

    #[test]
    fn allocation_fails_when_only_nearer_clips_are_resident() {
        let mapper = scenario_mapper();
        let mut backend = SimulatedMedia::default();
        let resolver = SimulatedResolver::with_estimate(150 * MB);
        let config = SyncConfig {
            max_mb: 300,
            ..SyncConfig::default()
        };
        let mut manager = PreloadManager::new(&config);

        let mut ctx = context(&mapper, &mut backend, &resolver, Duration::ZERO);
        manager.ensure_window(0, &[], &mut ctx);
        let result = manager.allocate(5, 0, &[], &mut ctx);

        assert!(matches!(
            result,
            Err(SyncError::MemoryBudgetExceeded {
                clip_id: 5,
                required_mb: 150,
                available_mb: 0
            })
        ));
        assert_eq!(resident_ids(&manager), vec![1, 2]);
    }

    #[test]
    fn slot_becomes_ready_once_coverage_reaches_threshold() {
        let mapper = scenario_mapper();
        let mut backend = SimulatedMedia::default();
        let resolver = SimulatedResolver::with_estimate(10 * MB);
        let mut manager = PreloadManager::new(&SyncConfig::default());

        let mut ctx = context(&mapper, &mut backend, &resolver, Duration::ZERO);
        let (handle, _) = manager.allocate(1, 0, &[], &mut ctx).expect("allocate");

        ctx.backend.set_buffered(
            handle,
            vec![BufferedRange {
                start_tl: 0,
                end_tl: 5_000_000,
            }],
        );
        let events = manager.on_media_event(handle, None, &mut ctx);
        assert!(events.is_empty());
        assert_eq!(manager.health(1), 50);

        ctx.backend.set_buffered(
            handle,
            vec![BufferedRange {
                start_tl: 0,
                end_tl: 8_000_000,
            }],
        );
        let events = manager.on_media_event(handle, None, &mut ctx);
        assert_eq!(events, vec![PreloadEvent::Ready { clip_id: 1 }]);
        assert!(manager.is_ready(1));
    }

    #[test]
    fn load_errors_back_off_exponentially_and_then_stop() {
        let mapper = scenario_mapper();
        let mut backend = SimulatedMedia::default();
        let resolver = SimulatedResolver::with_estimate(10 * MB);
        let mut manager = PreloadManager::new(&SyncConfig::default());

        let mut now = Duration::ZERO;
        let mut ctx = context(&mapper, &mut backend, &resolver, now);
        let (mut handle, _) = manager.allocate(1, 0, &[], &mut ctx).expect("allocate");

        for (attempt, delay_secs) in [(1, 1), (2, 2), (3, 4)] {
            let mut ctx = context(&mapper, &mut backend, &resolver, now);
            let events = manager.on_media_event(handle, Some("decode".to_owned()), &mut ctx);
            assert!(matches!(
                events.as_slice(),
                [PreloadEvent::LoadFailed {
                    will_retry: true,
                    ..
                }]
            ));
            let slot = manager.slot(1).expect("slot stays resident");
            assert_eq!(slot.retry_count, attempt);
            assert_eq!(
                slot.load,
                SlotLoad::RetryScheduled {
                    at: now + Duration::from_secs(delay_secs)
                }
            );

            now += Duration::from_secs(delay_secs);
            let mut ctx = context(&mapper, &mut backend, &resolver, now);
            manager.poll(&mut ctx);
            let reloaded = manager.element(1).expect("slot stays resident");
            assert_ne!(reloaded, handle);
            handle = reloaded;
        }

        let mut ctx = context(&mapper, &mut backend, &resolver, now);
        let events = manager.on_media_event(handle, Some("decode".to_owned()), &mut ctx);
        assert_eq!(
            events,
            vec![PreloadEvent::LoadFailed {
                clip_id: 1,
                error: SyncError::RetryExhausted {
                    clip_id: 1,
                    attempts: 3
                },
                will_retry: false,
            }]
        );
        let slot = manager.slot(1).expect("slot stays resident");
        assert_eq!(slot.load, SlotLoad::Failed);
        assert_eq!(slot.retry_count, 3);

        now += Duration::from_secs(60);
        let mut ctx = context(&mapper, &mut backend, &resolver, now);
        assert!(manager.poll(&mut ctx).is_empty());
        assert!(manager.has_terminal_error(1));
    }

    #[test]
    fn retry_count_resets_after_a_successful_load() {
        let mapper = scenario_mapper();
        let mut backend = SimulatedMedia::default();
        let resolver = SimulatedResolver::with_estimate(10 * MB);
        let mut manager = PreloadManager::new(&SyncConfig::default());

        let mut ctx = context(&mapper, &mut backend, &resolver, Duration::ZERO);
        let (handle, _) = manager.allocate(1, 0, &[], &mut ctx).expect("allocate");
        manager.on_media_event(handle, Some("network".to_owned()), &mut ctx);

        let mut ctx = context(&mapper, &mut backend, &resolver, Duration::from_secs(1));
        manager.poll(&mut ctx);
        let handle = manager.element(1).expect("resident");
        ctx.backend.set_buffered(
            handle,
            vec![BufferedRange {
                start_tl: 0,
                end_tl: 10_000_000,
            }],
        );
        manager.on_media_event(handle, None, &mut ctx);

        let slot = manager.slot(1).expect("resident");
        assert_eq!(slot.retry_count, 0);
        assert!(slot.last_error.is_none());
    }

    #[test]
    fn stale_events_from_evicted_elements_are_ignored() {
        let mapper = scenario_mapper();
        let mut backend = SimulatedMedia::default();
        let resolver = SimulatedResolver::with_estimate(10 * MB);
        let mut manager = PreloadManager::new(&SyncConfig::default());

        let mut ctx = context(&mapper, &mut backend, &resolver, Duration::ZERO);
        let (handle, _) = manager.allocate(1, 0, &[], &mut ctx).expect("allocate");
        assert!(manager.evict(1, ctx.backend, ctx.resolver));

        let events = manager.on_media_event(handle, Some("late".to_owned()), &mut ctx);
        assert!(events.is_empty());
        assert!(!manager.is_resident(1));
        assert_eq!(manager.budget().used_mb(), 0);
        assert!(ctx.backend.released().contains(&handle));
        assert_eq!(ctx.resolver.revoked(), vec!["clip-1.mp4".to_owned()]);
    }

    #[test]
    fn stuck_load_times_out_into_the_retry_path() {
        let mapper = scenario_mapper();
        let mut backend = SimulatedMedia::default();
        let resolver = SimulatedResolver::with_estimate(10 * MB);
        let mut manager = PreloadManager::new(&SyncConfig::default());

        let mut ctx = context(&mapper, &mut backend, &resolver, Duration::ZERO);
        manager.allocate(2, 0, &[], &mut ctx).expect("allocate");

        let mut ctx = context(&mapper, &mut backend, &resolver, Duration::from_secs(15));
        let events = manager.poll(&mut ctx);
        assert_eq!(
            events,
            vec![PreloadEvent::LoadFailed {
                clip_id: 2,
                error: SyncError::LoadTimeout { clip_id: 2 },
                will_retry: true,
            }]
        );
        let slot = manager.slot(2).expect("slot stays resident");
        assert_eq!(
            slot.load,
            SlotLoad::RetryScheduled {
                at: Duration::from_secs(16)
            }
        );
    }
}
