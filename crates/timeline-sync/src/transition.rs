//! Clip-to-clip handoff protocol.
//!
//! One [`TransitionMachine`] runs at most one transition at a time. Triggers
//! that arrive while a transition is in flight retarget it instead of starting
//! another one.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clip::ClipId;
use crate::config::{ExhaustedPolicy, SyncConfig};
use crate::error::{Result, SyncError};
use crate::media::{ElementHandle, MediaBackend, PlayOutcome, SourceResolver};
use crate::position::PositionMapper;
use crate::preload::{PreloadContext, PreloadEvent, PreloadManager, SlotLoad};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TransitionPhase {
    #[default]
    Idle,
    Preparing,
    AwaitingReady,
    Swapping,
    Verifying,
    Committed,
    Failed,
    Aborted,
}

/// What started a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionTrigger {
    /// The master position crossed the end of the active clip.
    Boundary,
    /// An explicit seek landed outside the active clip.
    Seek,
    /// The active element reported its native end.
    Ended,
}

/// The clip whose element currently follows (or, in video mode, drives) the
/// master clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveClip {
    pub index: usize,
    pub clip_id: ClipId,
}

/// Observable state of the transition in flight.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionState {
    pub phase: TransitionPhase,
    pub from_clip_id: Option<ClipId>,
    pub to_clip_id: Option<ClipId>,
    pub progress_percent: u8,
    pub retry_count: u32,
    /// Last failure; kept after an abort until the next transition starts.
    pub error: Option<SyncError>,
}

/// Notifications produced by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionEvent {
    PhaseChanged(TransitionState),
    /// The active reference now points at `clip_id`'s element.
    Swapped {
        from_clip_id: Option<ClipId>,
        clip_id: ClipId,
        element: ElementHandle,
    },
    Committed {
        clip_id: ClipId,
        element: ElementHandle,
    },
    Failed {
        clip_id: ClipId,
        error: SyncError,
        retry_count: u32,
    },
    /// Terminal for this boundary: `EndOfTimeline` or `RetryExhausted`.
    Aborted { error: SyncError },
}

/// Collaborators a transition step needs, borrowed for one call.
pub struct TransitionContext<'a, M, R> {
    pub mapper: &'a PositionMapper,
    pub preload: &'a mut PreloadManager,
    pub backend: &'a mut M,
    pub resolver: &'a R,
    pub now: Duration,
    pub master_position_tl: i64,
    pub is_playing: bool,
}

impl<M, R> TransitionContext<'_, M, R> {
    fn preload_parts(&mut self) -> (&mut PreloadManager, PreloadContext<'_, M, R>) {
        (
            &mut *self.preload,
            PreloadContext {
                mapper: self.mapper,
                backend: &mut *self.backend,
                resolver: self.resolver,
                now: self.now,
            },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Target {
    index: usize,
    clip_id: ClipId,
}

/// Per-boundary state machine that swaps the active element.
///
/// Phases run `Idle -> Preparing -> AwaitingReady -> Swapping -> Verifying ->
/// Committed -> Idle`; failures go through `Failed` back to `Preparing` after
/// a backoff, and end in `Aborted` once retries are exhausted.
#[derive(Debug)]
pub struct TransitionMachine {
    config: SyncConfig,
    state: TransitionState,
    active: Option<ActiveClip>,
    target: Option<Target>,
    trigger: Option<TransitionTrigger>,
    awaiting_since: Duration,
    retry_at: Option<Duration>,
    verifying: Option<(ElementHandle, Duration)>,
    abandoned: Option<usize>,
    held: bool,
}

impl TransitionMachine {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            config: config.clone(),
            state: TransitionState::default(),
            active: None,
            target: None,
            trigger: None,
            awaiting_since: Duration::ZERO,
            retry_at: None,
            verifying: None,
            abandoned: None,
            held: false,
        }
    }

    pub fn state(&self) -> &TransitionState {
        &self.state
    }

    pub fn phase(&self) -> TransitionPhase {
        self.state.phase
    }

    pub fn is_idle(&self) -> bool {
        self.state.phase == TransitionPhase::Idle
    }

    pub fn active(&self) -> Option<ActiveClip> {
        self.active
    }

    pub fn target_clip_id(&self) -> Option<ClipId> {
        self.target.map(|target| target.clip_id)
    }

    pub fn trigger(&self) -> Option<TransitionTrigger> {
        self.trigger
    }

    pub fn target_index(&self) -> Option<usize> {
        self.target.map(|target| target.index)
    }

    /// True while the active element is deliberately kept paused after a
    /// failed transition or a refused resume.
    pub fn is_held(&self) -> bool {
        self.held
    }

    pub(crate) fn hold(&mut self) {
        self.held = true;
    }

    pub(crate) fn release_hold(&mut self) {
        self.held = false;
    }

    /// Index of the boundary target given up on, suppressed until cleared.
    pub fn abandoned(&self) -> Option<usize> {
        self.abandoned
    }

    pub fn clear_abandoned(&mut self) {
        self.abandoned = None;
    }

    /// Drops the active reference and any transition in flight.
    pub fn reset(&mut self) {
        debug!("transition state reset");
        self.state = TransitionState::default();
        self.active = None;
        self.target = None;
        self.trigger = None;
        self.retry_at = None;
        self.verifying = None;
        self.abandoned = None;
        self.held = false;
    }

    /// Starts a transition towards clip `target_index`, or retargets the one
    /// in flight.
    ///
    /// `None` means there is no clip after the active one: the machine passes
    /// through `Aborted` with `EndOfTimeline`.
    pub fn begin<M, R>(
        &mut self,
        trigger: TransitionTrigger,
        target_index: Option<usize>,
        ctx: &mut TransitionContext<'_, M, R>,
    ) -> Vec<TransitionEvent>
    where
        M: MediaBackend,
        R: SourceResolver,
    {
        let mut events = Vec::new();
        let Some(index) = target_index else {
            if self.is_idle() {
                self.finish_at_end(&mut events);
            }
            return events;
        };
        let Some(clip_id) = ctx.mapper.clip(index).map(|clip| clip.id) else {
            return events;
        };
        let target = Target { index, clip_id };

        if !self.is_idle() {
            self.retarget(trigger, target, ctx, &mut events);
            return events;
        }

        info!(
            ?trigger,
            from_clip_id = ?self.active.map(|active| active.clip_id),
            to_clip_id = clip_id,
            "transition started"
        );
        self.pause_active(ctx);
        self.trigger = Some(trigger);
        self.target = Some(target);
        self.retry_at = None;
        self.verifying = None;
        self.state = TransitionState {
            phase: TransitionPhase::Preparing,
            from_clip_id: self.active.map(|active| active.clip_id),
            to_clip_id: Some(clip_id),
            progress_percent: 0,
            retry_count: 0,
            error: None,
        };
        self.publish(&mut events);
        self.step(ctx, &mut events);
        events
    }

    fn retarget<M, R>(
        &mut self,
        trigger: TransitionTrigger,
        target: Target,
        ctx: &mut TransitionContext<'_, M, R>,
        events: &mut Vec<TransitionEvent>,
    ) where
        M: MediaBackend,
        R: SourceResolver,
    {
        if self.target == Some(target) {
            if let Some((element, _)) = self.verifying {
                // Swap already happened: only the offset moves.
                self.seek_element(element, target, ctx);
            }
            return;
        }
        debug!(
            ?trigger,
            previous = ?self.target_clip_id(),
            to_clip_id = target.clip_id,
            "transition retargeted"
        );
        self.trigger = Some(trigger);
        self.target = Some(target);
        self.retry_at = None;
        self.verifying = None;
        self.state.to_clip_id = Some(target.clip_id);
        self.state.retry_count = 0;
        self.state.error = None;
        self.enter(TransitionPhase::Preparing, events);
        self.step(ctx, events);
    }

    /// Routes a preload notification to the transition in flight.
    pub fn on_preload_event<M, R>(
        &mut self,
        event: &PreloadEvent,
        ctx: &mut TransitionContext<'_, M, R>,
    ) -> Vec<TransitionEvent>
    where
        M: MediaBackend,
        R: SourceResolver,
    {
        let mut events = Vec::new();
        let Some(target) = self.target else {
            return events;
        };
        if self.state.phase != TransitionPhase::AwaitingReady {
            return events;
        }
        match event {
            PreloadEvent::Ready { clip_id } if *clip_id == target.clip_id => {
                self.step(ctx, &mut events);
            }
            PreloadEvent::LoadFailed { clip_id, error, .. } if *clip_id == target.clip_id => {
                self.fail(error.clone(), ctx, &mut events);
            }
            PreloadEvent::Evicted { clip_id } if *clip_id == target.clip_id => {
                self.enter(TransitionPhase::Preparing, &mut events);
                self.step(ctx, &mut events);
            }
            _ => {}
        }
        events
    }

    /// Answer to a deferred resume request.
    pub fn on_play_result<M, R>(
        &mut self,
        element: ElementHandle,
        outcome: std::result::Result<(), String>,
        ctx: &mut TransitionContext<'_, M, R>,
    ) -> Vec<TransitionEvent>
    where
        M: MediaBackend,
        R: SourceResolver,
    {
        let mut events = Vec::new();
        if self.verifying.map(|(verified, _)| verified) != Some(element) {
            return events;
        }
        match outcome {
            Ok(()) => self.commit(element, &mut events),
            Err(reason) => {
                let clip_id = self.target_clip_id().unwrap_or_default();
                self.fail(SyncError::PlaybackRejected { clip_id, reason }, ctx, &mut events);
            }
        }
        events
    }

    /// Drives time-based phases: ready polling, timeouts and backoff.
    pub fn poll<M, R>(&mut self, ctx: &mut TransitionContext<'_, M, R>) -> Vec<TransitionEvent>
    where
        M: MediaBackend,
        R: SourceResolver,
    {
        let mut events = Vec::new();
        match self.state.phase {
            TransitionPhase::Failed => {
                if self.retry_at.is_some_and(|at| ctx.now >= at) {
                    self.retry_at = None;
                    self.enter(TransitionPhase::Preparing, &mut events);
                    self.step(ctx, &mut events);
                }
            }
            TransitionPhase::AwaitingReady => self.step(ctx, &mut events),
            TransitionPhase::Verifying => {
                if let Some((element, deadline)) = self.verifying
                    && ctx.now >= deadline
                {
                    if ctx.backend.is_playing(element) {
                        self.commit(element, &mut events);
                    } else {
                        let clip_id = self.target_clip_id().unwrap_or_default();
                        let error = SyncError::PlaybackRejected {
                            clip_id,
                            reason: "no answer to resume request".to_owned(),
                        };
                        self.fail(error, ctx, &mut events);
                    }
                }
            }
            _ => {}
        }
        events
    }

    fn step<M, R>(
        &mut self,
        ctx: &mut TransitionContext<'_, M, R>,
        events: &mut Vec<TransitionEvent>,
    ) where
        M: MediaBackend,
        R: SourceResolver,
    {
        let Some(target) = self.target else {
            return;
        };
        match self.state.phase {
            TransitionPhase::Preparing => {
                if ctx.preload.is_ready(target.clip_id) {
                    self.swap(target, ctx, events);
                    return;
                }
                if let Err(error) = self.request_load(target, ctx) {
                    self.fail(error, ctx, events);
                    return;
                }
                self.awaiting_since = ctx.now;
                self.enter(TransitionPhase::AwaitingReady, events);
                self.update_progress(ctx.preload.health(target.clip_id));
            }
            TransitionPhase::AwaitingReady => {
                if ctx.preload.is_ready(target.clip_id) {
                    self.swap(target, ctx, events);
                } else if ctx.now.saturating_sub(self.awaiting_since)
                    >= self.config.transition_timeout
                {
                    warn!(
                        clip_id = target.clip_id,
                        health = ctx.preload.health(target.clip_id),
                        "transition timed out waiting for clip"
                    );
                    let error = SyncError::TransitionTimeout {
                        clip_id: target.clip_id,
                    };
                    self.fail(error, ctx, events);
                } else {
                    self.update_progress(ctx.preload.health(target.clip_id));
                }
            }
            _ => {}
        }
    }

    /// Makes sure the target has a load in flight.
    fn request_load<M, R>(
        &mut self,
        target: Target,
        ctx: &mut TransitionContext<'_, M, R>,
    ) -> Result<()>
    where
        M: MediaBackend,
        R: SourceResolver,
    {
        let active_index = self.active.map_or(target.index, |active| active.index);
        let mut pinned = vec![target.clip_id];
        pinned.extend(self.active.map(|active| active.clip_id));

        let (preload, mut preload_ctx) = ctx.preload_parts();
        if preload.slot(target.clip_id).map(|slot| slot.load) == Some(SlotLoad::Failed)
            || (!preload.is_resident(target.clip_id) && preload.has_terminal_error(target.clip_id))
        {
            preload.reload(target.clip_id, &mut preload_ctx);
        }
        if !preload.is_resident(target.clip_id) {
            preload.allocate(target.clip_id, active_index, &pinned, &mut preload_ctx)?;
        }
        Ok(())
    }

    fn swap<M, R>(
        &mut self,
        target: Target,
        ctx: &mut TransitionContext<'_, M, R>,
        events: &mut Vec<TransitionEvent>,
    ) where
        M: MediaBackend,
        R: SourceResolver,
    {
        if let Some(overtaken_by) = self.overtaken_by(target, ctx) {
            debug!(
                stale_clip_id = target.clip_id,
                clip_id = overtaken_by.clip_id,
                "master already left the target clip"
            );
            self.retarget(TransitionTrigger::Boundary, overtaken_by, ctx, events);
            return;
        }
        self.enter(TransitionPhase::Swapping, events);
        let Some(element) = ctx.preload.element(target.clip_id) else {
            let error = SyncError::LoadError {
                clip_id: target.clip_id,
                reason: "element released before swap".to_owned(),
            };
            self.fail(error, ctx, events);
            return;
        };

        let from_clip_id = self.active.map(|active| active.clip_id);
        if let Some(previous) = self.active_element(ctx.preload)
            && previous != element
        {
            ctx.backend.pause(previous);
        }
        self.active = Some(ActiveClip {
            index: target.index,
            clip_id: target.clip_id,
        });
        self.held = false;
        self.seek_element(element, target, ctx);
        debug!(?from_clip_id, clip_id = target.clip_id, %element, "active element swapped");
        events.push(TransitionEvent::Swapped {
            from_clip_id,
            clip_id: target.clip_id,
            element,
        });

        self.enter(TransitionPhase::Verifying, events);
        if !ctx.is_playing {
            self.commit(element, events);
            return;
        }
        match ctx.backend.play(element) {
            PlayOutcome::Started => self.commit(element, events),
            PlayOutcome::Pending => {
                self.verifying = Some((element, ctx.now + self.config.verify_grace));
            }
            PlayOutcome::Rejected(reason) => {
                let error = SyncError::PlaybackRejected {
                    clip_id: target.clip_id,
                    reason,
                };
                self.fail(error, ctx, events);
            }
        }
    }

    /// The clip under the master when the master has already played past
    /// `target`.
    fn overtaken_by<M, R>(
        &self,
        target: Target,
        ctx: &TransitionContext<'_, M, R>,
    ) -> Option<Target> {
        let position = ctx.mapper.to_clip_position(ctx.master_position_tl)?;
        if position.index <= target.index {
            return None;
        }
        let clip_id = ctx.mapper.clip(position.index)?.id;
        Some(Target {
            index: position.index,
            clip_id,
        })
    }

    /// Seeks `element` to the media position matching the current master
    /// position.
    fn seek_element<M, R>(
        &self,
        element: ElementHandle,
        target: Target,
        ctx: &mut TransitionContext<'_, M, R>,
    ) where
        M: MediaBackend,
    {
        let Some(clip) = ctx.mapper.clip(target.index) else {
            return;
        };
        let start_tl = ctx.mapper.cumulative_start_tl(target.index).unwrap_or(0);
        let offset_tl = ctx.master_position_tl - start_tl;
        let media_tl = clip.media_position_tl(offset_tl);
        debug!(clip_id = clip.id, offset_tl, media_tl, "follower aligned to master");
        ctx.backend.seek(element, media_tl);
    }

    fn commit(&mut self, element: ElementHandle, events: &mut Vec<TransitionEvent>) {
        let Some(target) = self.target.take() else {
            return;
        };
        self.verifying = None;
        self.retry_at = None;
        self.trigger = None;
        self.abandoned = None;
        self.state.error = None;
        self.enter(TransitionPhase::Committed, events);
        info!(clip_id = target.clip_id, %element, "transition committed");
        events.push(TransitionEvent::Committed {
            clip_id: target.clip_id,
            element,
        });
        self.state = TransitionState::default();
        self.publish(events);
    }

    fn fail<M, R>(
        &mut self,
        error: SyncError,
        ctx: &mut TransitionContext<'_, M, R>,
        events: &mut Vec<TransitionEvent>,
    ) where
        M: MediaBackend,
        R: SourceResolver,
    {
        let Some(target) = self.target else {
            return;
        };
        self.verifying = None;
        self.state.error = Some(error.clone());

        if self.state.retry_count < self.config.max_retries {
            self.state.retry_count += 1;
            let delay = self.config.backoff_delay(self.state.retry_count);
            self.retry_at = Some(ctx.now + delay);
            warn!(
                clip_id = target.clip_id,
                retry_count = self.state.retry_count,
                delay_ms = delay.as_millis() as u64,
                %error,
                "transition failed, retry scheduled"
            );
            self.enter(TransitionPhase::Failed, events);
            events.push(TransitionEvent::Failed {
                clip_id: target.clip_id,
                error,
                retry_count: self.state.retry_count,
            });
            return;
        }

        let exhausted = SyncError::RetryExhausted {
            clip_id: target.clip_id,
            attempts: self.state.retry_count,
        };
        warn!(clip_id = target.clip_id, %error, "transition abandoned, retries exhausted");
        self.apply_exhausted_policy(target, ctx);
        self.abandoned = Some(target.index);
        self.held = true;
        self.state.error = Some(exhausted.clone());
        self.enter(TransitionPhase::Aborted, events);
        events.push(TransitionEvent::Aborted { error: exhausted });
        self.finish_aborted(events);
    }

    fn apply_exhausted_policy<M, R>(
        &mut self,
        target: Target,
        ctx: &mut TransitionContext<'_, M, R>,
    ) where
        M: MediaBackend,
    {
        let swapped = self.active.is_some_and(|active| active.clip_id == target.clip_id);
        if let Some(element) = self.active_element(ctx.preload) {
            ctx.backend.pause(element);
        }
        if swapped || self.config.exhausted_policy == ExhaustedPolicy::HoldLastFrame {
            return;
        }
        let Some(element) = ctx.preload.element(target.clip_id) else {
            return;
        };
        if let Some(clip) = ctx.mapper.clip(target.index) {
            ctx.backend.seek(element, clip.trim_start_tl);
        }
        self.active = Some(ActiveClip {
            index: target.index,
            clip_id: target.clip_id,
        });
        debug!(clip_id = target.clip_id, "showing first frame of abandoned clip");
    }

    fn finish_at_end(&mut self, events: &mut Vec<TransitionEvent>) {
        info!(from_clip_id = ?self.active.map(|active| active.clip_id), "end of timeline");
        self.state = TransitionState {
            phase: TransitionPhase::Aborted,
            from_clip_id: self.active.map(|active| active.clip_id),
            to_clip_id: None,
            progress_percent: 100,
            retry_count: 0,
            error: None,
        };
        self.publish(events);
        events.push(TransitionEvent::Aborted {
            error: SyncError::EndOfTimeline,
        });
        self.finish_aborted(events);
    }

    fn finish_aborted(&mut self, events: &mut Vec<TransitionEvent>) {
        let error = self.state.error.take();
        self.target = None;
        self.trigger = None;
        self.retry_at = None;
        self.verifying = None;
        self.state = TransitionState {
            error,
            ..TransitionState::default()
        };
        self.publish(events);
    }

    fn enter(&mut self, phase: TransitionPhase, events: &mut Vec<TransitionEvent>) {
        if self.state.phase == phase {
            return;
        }
        debug!(from = ?self.state.phase, to = ?phase, "transition phase changed");
        self.state.phase = phase;
        self.state.progress_percent = match phase {
            TransitionPhase::Idle | TransitionPhase::Preparing => 0,
            TransitionPhase::AwaitingReady | TransitionPhase::Failed => {
                self.state.progress_percent
            }
            TransitionPhase::Swapping => 80,
            TransitionPhase::Verifying => 90,
            TransitionPhase::Committed | TransitionPhase::Aborted => 100,
        };
        self.publish(events);
    }

    /// Loading accounts for the first 75 percent of a transition.
    fn update_progress(&mut self, target_health: u8) {
        let threshold = u32::from(self.config.ready_threshold.max(1));
        let loaded = (u32::from(target_health) * 75 / threshold).min(75);
        self.state.progress_percent = loaded as u8;
    }

    fn publish(&self, events: &mut Vec<TransitionEvent>) {
        events.push(TransitionEvent::PhaseChanged(self.state.clone()));
    }

    fn pause_active<M, R>(&self, ctx: &mut TransitionContext<'_, M, R>)
    where
        M: MediaBackend,
    {
        if let Some(element) = self.active_element(ctx.preload) {
            ctx.backend.pause(element);
        }
    }

    fn active_element(&self, preload: &PreloadManager) -> Option<ElementHandle> {
        self.active.and_then(|active| preload.element(active.clip_id))
    }
}
