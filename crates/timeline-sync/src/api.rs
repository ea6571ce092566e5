use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clip::{Clip, ClipId, ClipRegistry};
use crate::clock::{MasterClock, MasterMode};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::health::{HealthMonitor, PlayingFollower};
use crate::media::{ElementHandle, MediaBackend, MediaEvent, PlayOutcome, SourceResolver};
use crate::position::PositionMapper;
use crate::preload::{PreloadContext, PreloadEvent, PreloadManager};
use crate::rate::{RateController, RateState};
use crate::time::{duration_to_tl, tl_to_seconds};
use crate::transition::{
    TransitionContext, TransitionEvent, TransitionMachine, TransitionState, TransitionTrigger,
};

/// Commands accepted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Replaces the clip list. Playback stops, the position is kept.
    SetClips {
        clips: Vec<Clip>,
    },
    Play,
    Pause,
    /// Tears everything down and rewinds to zero. Clips are kept.
    Stop,
    /// Moves playback to `t_tl` absolute timeline ticks.
    ///
    /// # Example
    /// ```
    /// use timeline_sync::{Command, Engine, SimulatedMedia, SimulatedResolver};
    ///
    /// let mut engine = Engine::new(SimulatedMedia::default(), SimulatedResolver::default());
    /// let result = engine.handle_command(Command::SeekTo { t_tl: 1_500_000 });
    /// assert!(result.is_err());
    /// ```
    SeekTo {
        t_tl: i64,
    },
    SetMasterMode {
        mode: MasterMode,
    },
    SetTempo {
        reference_bpm: f64,
        target_bpm: f64,
        enabled: bool,
    },
    /// Advances the engine to `now`, measured from an arbitrary origin.
    Tick {
        now: Duration,
    },
    /// A native media event delivered outside of a tick.
    Media(MediaEvent),
}

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ClipsChanged { clip_count: usize, duration_tl: i64 },
    PlaybackChanged(PlaybackSnapshot),
    TransitionChanged(TransitionState),
    BufferChanged(BufferSnapshot),
    RateChanged(RateState),
    EndOfTimeline { t_tl: i64 },
    Error(EngineErrorEvent),
}

/// User-facing error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    LoadFailed,
    RetryExhausted,
    PlaybackRejected,
    MemoryBudgetExceeded,
    InvalidInput,
    Other,
}

impl From<&SyncError> for EngineErrorKind {
    fn from(value: &SyncError) -> Self {
        match value {
            SyncError::LoadTimeout { .. }
            | SyncError::LoadError { .. }
            | SyncError::TransitionTimeout { .. } => Self::LoadFailed,
            SyncError::RetryExhausted { .. } => Self::RetryExhausted,
            SyncError::PlaybackRejected { .. } => Self::PlaybackRejected,
            SyncError::MemoryBudgetExceeded { .. } => Self::MemoryBudgetExceeded,
            SyncError::ClipNotFound { .. }
            | SyncError::InvalidClip { .. }
            | SyncError::EmptyTimeline
            | SyncError::InvalidTempo { .. }
            | SyncError::InvalidConfig { .. } => Self::InvalidInput,
            _ => Self::Other,
        }
    }
}

/// User-facing error payload emitted as an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineErrorEvent {
    pub kind: EngineErrorKind,
    pub clip_id: Option<ClipId>,
    pub message: String,
}

impl EngineErrorEvent {
    pub fn from_error(error: &SyncError) -> Self {
        Self {
            kind: EngineErrorKind::from(error),
            clip_id: error.clip_id(),
            message: error.to_string(),
        }
    }
}

/// Playback state published to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackSnapshot {
    pub absolute_tl: i64,
    pub active_clip_id: Option<ClipId>,
    pub is_playing: bool,
    pub mode: MasterMode,
}

impl PlaybackSnapshot {
    pub fn absolute_seconds(&self) -> f64 {
        tl_to_seconds(self.absolute_tl)
    }
}

/// Buffer state of one clip.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSnapshot {
    pub clip_id: ClipId,
    pub is_resident: bool,
    pub is_ready: bool,
    pub health: u8,
    pub is_stalled: bool,
    pub retry_count: u32,
    pub last_error: Option<SyncError>,
}

/// Synchronization facade: the only owner of engine state.
///
/// Every collaborator call goes through [`Engine::handle_command`]; readers get
/// snapshots, never references into the components.
#[derive(Debug)]
pub struct Engine<M, R> {
    backend: M,
    resolver: R,
    config: SyncConfig,
    mapper: PositionMapper,
    preload: PreloadManager,
    health: HealthMonitor,
    transition: TransitionMachine,
    rate: RateController,
    clock: MasterClock,
    now: Duration,
}

impl<M, R> Engine<M, R>
where
    M: MediaBackend,
    R: SourceResolver,
{
    /// Creates an engine with the default configuration.
    ///
    /// # Example
    /// ```
    /// use timeline_sync::{Engine, SimulatedMedia, SimulatedResolver};
    ///
    /// let engine = Engine::new(SimulatedMedia::default(), SimulatedResolver::default());
    /// assert!(!engine.playback_state().is_playing);
    /// ```
    pub fn new(backend: M, resolver: R) -> Self {
        Self::build(backend, resolver, SyncConfig::default())
    }

    /// Creates an engine after validating `config`.
    pub fn with_config(backend: M, resolver: R, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(backend, resolver, config))
    }

    fn build(backend: M, resolver: R, config: SyncConfig) -> Self {
        Self {
            backend,
            resolver,
            mapper: PositionMapper::default(),
            preload: PreloadManager::new(&config),
            health: HealthMonitor::new(config.sample_interval, config.stall_threshold),
            transition: TransitionMachine::new(&config),
            rate: RateController::new(config.rate_min_health),
            clock: MasterClock::new(MasterMode::AudioMaster),
            now: Duration::ZERO,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn backend(&self) -> &M {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut M {
        &mut self.backend
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn clips(&self) -> &[Clip] {
        self.mapper.registry().clips()
    }

    pub fn duration_tl(&self) -> i64 {
        self.mapper.total_duration_tl()
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn playback_state(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            absolute_tl: self.clock.position_tl(),
            active_clip_id: self.transition.active().map(|active| active.clip_id),
            is_playing: self.clock.is_playing(),
            mode: self.clock.mode(),
        }
    }

    pub fn buffer_state(&self, clip_id: ClipId) -> BufferSnapshot {
        let slot = self.preload.slot(clip_id);
        BufferSnapshot {
            clip_id,
            is_resident: slot.is_some(),
            is_ready: self.preload.is_ready(clip_id),
            health: self
                .health
                .health(clip_id)
                .unwrap_or_else(|| self.preload.health(clip_id)),
            is_stalled: self.health.is_stalled(clip_id),
            retry_count: slot.map_or(0, |slot| slot.retry_count),
            last_error: self.preload.last_error(clip_id),
        }
    }

    pub fn transition_state(&self) -> TransitionState {
        self.transition.state().clone()
    }

    pub fn rate_state(&self) -> RateState {
        self.rate.state()
    }

    /// Latest sampled health of every resident clip.
    pub fn all_health(&self) -> BTreeMap<ClipId, u8> {
        self.health.all_health()
    }

    pub fn resident_clips(&self) -> Vec<ClipId> {
        let mut clip_ids: Vec<_> = self.preload.slots().map(|slot| slot.clip_id).collect();
        clip_ids.sort_unstable();
        clip_ids
    }

    pub fn used_mb(&self) -> u64 {
        self.preload.budget().used_mb()
    }

    /// Element currently playing the active clip.
    pub fn active_element(&self) -> Option<ElementHandle> {
        self.transition
            .active()
            .and_then(|active| self.preload.element(active.clip_id))
    }

    /// Applies one command and returns emitted events.
    pub fn handle_command(&mut self, command: Command) -> Result<Vec<Event>> {
        let before = self.playback_state();
        let mut events = match command {
            Command::SetClips { clips } => self.set_clips(clips),
            Command::Play => self.play(),
            Command::Pause => Ok(self.pause()),
            Command::Stop => Ok(self.stop()),
            Command::SeekTo { t_tl } => self.seek_to(t_tl),
            Command::SetMasterMode { mode } => Ok(self.set_master_mode(mode)),
            Command::SetTempo {
                reference_bpm,
                target_bpm,
                enabled,
            } => self.set_tempo(reference_bpm, target_bpm, enabled),
            Command::Tick { now } => Ok(self.tick(now)),
            Command::Media(event) => Ok(self.media_event(event)),
        }?;

        let after = self.playback_state();
        let changed = (before.active_clip_id, before.is_playing, before.mode)
            != (after.active_clip_id, after.is_playing, after.mode);
        if changed
            && !events
                .iter()
                .any(|event| matches!(event, Event::PlaybackChanged(_)))
        {
            events.push(Event::PlaybackChanged(after));
        }
        Ok(events)
    }

    fn set_clips(&mut self, clips: Vec<Clip>) -> Result<Vec<Event>> {
        let registry = ClipRegistry::new(clips)?;
        let mut events = Vec::new();
        self.teardown();

        self.mapper = PositionMapper::new(registry);
        let duration_tl = self.mapper.total_duration_tl();
        let position_tl = self.clock.position_tl().min(duration_tl);
        self.move_clock(position_tl);
        info!(
            clip_count = self.mapper.len(),
            duration_tl, position_tl, "clips replaced"
        );
        events.push(Event::ClipsChanged {
            clip_count: self.mapper.len(),
            duration_tl,
        });
        events.push(Event::TransitionChanged(self.transition_state()));

        if let Some(position) = self.mapper.to_clip_position(position_tl) {
            self.begin_transition(TransitionTrigger::Seek, Some(position.index), &mut events);
            self.maintain_window(&mut events);
        }
        Ok(events)
    }

    fn play(&mut self) -> Result<Vec<Event>> {
        if self.mapper.is_empty() {
            return Err(SyncError::EmptyTimeline);
        }
        let mut events = Vec::new();
        if self.clock.is_playing() {
            return Ok(events);
        }
        if self.clock.position_tl() >= self.mapper.total_duration_tl() {
            debug!("play at end of timeline restarts from zero");
            events.extend(self.seek_to(0)?);
        }

        self.clock.set_playing(true);
        if self.clock.mode() == MasterMode::AudioMaster {
            self.backend
                .seek(ElementHandle::SOUNDTRACK, self.clock.position_tl());
            if let PlayOutcome::Rejected(reason) = self.backend.play(ElementHandle::SOUNDTRACK) {
                self.clock.set_playing(false);
                warn!(%reason, "soundtrack refused to start");
                let clip_id = self
                    .transition
                    .active()
                    .map(|active| active.clip_id)
                    .unwrap_or_default();
                return Err(SyncError::PlaybackRejected { clip_id, reason });
            }
        }
        info!(t_tl = self.clock.position_tl(), mode = ?self.clock.mode(), "playback started");

        if self.transition.is_idle() {
            match self.transition.active() {
                Some(_) => {
                    self.transition.release_hold();
                    self.resume_active(&mut events);
                }
                None => {
                    let index = self
                        .mapper
                        .to_clip_position(self.clock.position_tl())
                        .map(|position| position.index);
                    self.begin_transition(TransitionTrigger::Seek, index, &mut events);
                    self.maintain_window(&mut events);
                }
            }
        }
        events.push(Event::PlaybackChanged(self.playback_state()));
        Ok(events)
    }

    fn pause(&mut self) -> Vec<Event> {
        if !self.clock.is_playing() {
            return Vec::new();
        }
        self.clock.set_playing(false);
        self.backend.pause(ElementHandle::SOUNDTRACK);
        if let Some(element) = self.active_element() {
            self.backend.pause(element);
        }
        let mut events = Vec::new();
        info!(t_tl = self.clock.position_tl(), "playback paused");
        events.push(Event::PlaybackChanged(self.playback_state()));
        events
    }

    fn stop(&mut self) -> Vec<Event> {
        self.teardown();
        self.clock.stop();
        self.backend.seek(ElementHandle::SOUNDTRACK, 0);
        info!("playback stopped");
        vec![
            Event::TransitionChanged(self.transition_state()),
            Event::PlaybackChanged(self.playback_state()),
        ]
    }

    fn seek_to(&mut self, t_tl: i64) -> Result<Vec<Event>> {
        if self.mapper.is_empty() {
            return Err(SyncError::EmptyTimeline);
        }
        let mut events = Vec::new();
        let t_tl = t_tl.clamp(0, self.mapper.total_duration_tl());
        let Some(position) = self.mapper.to_clip_position(t_tl) else {
            return Err(SyncError::EmptyTimeline);
        };
        self.move_clock(t_tl);
        self.transition.clear_abandoned();
        debug!(t_tl, index = position.index, "seek");

        let within_active = self
            .transition
            .active()
            .is_some_and(|active| active.index == position.index);
        if within_active && self.transition.is_idle() {
            if let Some(element) = self.active_element()
                && let Some(clip) = self.mapper.clip(position.index)
            {
                self.backend
                    .seek(element, clip.media_position_tl(position.offset_tl));
            }
            self.transition.release_hold();
            if self.clock.is_playing() {
                self.resume_active(&mut events);
            }
        } else {
            if self.clock.mode() == MasterMode::VideoMaster {
                self.clock.assign_writer(None);
            }
            self.begin_transition(TransitionTrigger::Seek, Some(position.index), &mut events);
            self.maintain_window(&mut events);
        }
        events.push(Event::PlaybackChanged(self.playback_state()));
        Ok(events)
    }

    fn set_master_mode(&mut self, mode: MasterMode) -> Vec<Event> {
        if self.clock.mode() == mode {
            return Vec::new();
        }
        self.rate.release_follower(&mut self.backend);
        self.clock.set_mode(mode);
        info!(?mode, "master mode changed");
        let mut events = Vec::new();

        match mode {
            MasterMode::AudioMaster => {
                self.backend
                    .seek(ElementHandle::SOUNDTRACK, self.clock.position_tl());
                if self.clock.is_playing()
                    && let PlayOutcome::Rejected(reason) =
                        self.backend.play(ElementHandle::SOUNDTRACK)
                {
                    self.stop_for_refused_master(reason, &mut events);
                }
            }
            MasterMode::VideoMaster => {
                let writer = self
                    .transition
                    .is_idle()
                    .then(|| self.active_element())
                    .flatten();
                self.clock.assign_writer(writer);
            }
        }
        events.push(Event::PlaybackChanged(self.playback_state()));
        events
    }

    fn set_tempo(
        &mut self,
        reference_bpm: f64,
        target_bpm: f64,
        enabled: bool,
    ) -> Result<Vec<Event>> {
        if enabled {
            self.rate.set_tempo(reference_bpm, target_bpm)?;
            let mut events = Vec::new();
            self.apply_rate(&mut events);
            if events.is_empty() {
                events.push(Event::RateChanged(self.rate.state()));
            }
            return Ok(events);
        }
        if self.rate.disable(&mut self.backend) {
            info!("tempo lock disabled");
        }
        Ok(vec![Event::RateChanged(self.rate.state())])
    }

    /// One engine step: clock, media events, loads, transition, preload
    /// window, health, rate and follower sync, in that order.
    fn tick(&mut self, now: Duration) -> Vec<Event> {
        self.now = self.now.max(now);
        let mut events = Vec::new();
        if self.mapper.is_empty() {
            return events;
        }

        let media_events = self.backend.drain_events(self.now);
        self.read_master_clock(&mut events);
        let mut progressed = false;
        for event in media_events {
            progressed |= self.route_media_event(event, &mut events);
        }

        let preload_events = {
            let (preload, mut ctx) = self.preload_parts();
            preload.poll(&mut ctx)
        };
        self.forward_preload_events(preload_events, &mut events);

        let transition_events = {
            let (machine, mut ctx) = self.transition_parts();
            machine.poll(&mut ctx)
        };
        self.apply_transition_events(transition_events, &mut events);

        self.detect_boundary(&mut events);
        self.maintain_window(&mut events);
        if progressed || self.health.is_due(self.now) {
            self.sample_health(&mut events);
        }
        self.apply_rate(&mut events);
        self.sync_followers(&mut events);
        events
    }

    fn media_event(&mut self, event: MediaEvent) -> Vec<Event> {
        let mut events = Vec::new();
        if self.route_media_event(event, &mut events) {
            self.sample_health(&mut events);
        }
        events
    }

    /// Returns true for buffering progress, which warrants a health sample.
    fn route_media_event(&mut self, event: MediaEvent, events: &mut Vec<Event>) -> bool {
        match event {
            MediaEvent::Progress { handle } | MediaEvent::CanPlay { handle } => {
                let preload_events = {
                    let (preload, mut ctx) = self.preload_parts();
                    preload.on_media_event(handle, None, &mut ctx)
                };
                self.forward_preload_events(preload_events, events);
                true
            }
            MediaEvent::Error { handle, message } => {
                let preload_events = {
                    let (preload, mut ctx) = self.preload_parts();
                    preload.on_media_event(handle, Some(message), &mut ctx)
                };
                self.forward_preload_events(preload_events, events);
                false
            }
            MediaEvent::Ended { handle } => {
                self.on_ended(handle, events);
                false
            }
            MediaEvent::PlayStarted { handle } => {
                let transition_events = {
                    let (machine, mut ctx) = self.transition_parts();
                    machine.on_play_result(handle, Ok(()), &mut ctx)
                };
                self.apply_transition_events(transition_events, events);
                false
            }
            MediaEvent::PlayRejected { handle, reason } => {
                let was_verifying = !self.transition.is_idle();
                let transition_events = {
                    let (machine, mut ctx) = self.transition_parts();
                    machine.on_play_result(handle, Err(reason.clone()), &mut ctx)
                };
                self.apply_transition_events(transition_events, events);
                if !was_verifying && self.active_element() == Some(handle) {
                    self.reject_resume(reason, events);
                }
                false
            }
        }
    }

    fn forward_preload_events(
        &mut self,
        preload_events: Vec<PreloadEvent>,
        events: &mut Vec<Event>,
    ) {
        for event in preload_events {
            let clip_id = match &event {
                PreloadEvent::Ready { clip_id } | PreloadEvent::Evicted { clip_id } => *clip_id,
                PreloadEvent::LoadFailed {
                    clip_id,
                    error,
                    will_retry,
                } => {
                    if !will_retry {
                        events.push(Event::Error(EngineErrorEvent::from_error(error)));
                    }
                    *clip_id
                }
            };
            events.push(Event::BufferChanged(self.buffer_state(clip_id)));

            let transition_events = {
                let (machine, mut ctx) = self.transition_parts();
                machine.on_preload_event(&event, &mut ctx)
            };
            self.apply_transition_events(transition_events, events);
        }
    }

    fn apply_transition_events(
        &mut self,
        transition_events: Vec<TransitionEvent>,
        events: &mut Vec<Event>,
    ) {
        for event in transition_events {
            match event {
                TransitionEvent::PhaseChanged(state) => {
                    events.push(Event::TransitionChanged(state));
                }
                TransitionEvent::Swapped { element, .. } => {
                    self.clock.assign_writer(Some(element));
                }
                TransitionEvent::Committed { .. } | TransitionEvent::Failed { .. } => {}
                TransitionEvent::Aborted {
                    error: SyncError::EndOfTimeline,
                } => self.finish_timeline(events),
                TransitionEvent::Aborted { error } => {
                    events.push(Event::Error(EngineErrorEvent::from_error(&error)));
                }
            }
        }
    }

    fn begin_transition(
        &mut self,
        trigger: TransitionTrigger,
        target_index: Option<usize>,
        events: &mut Vec<Event>,
    ) {
        let transition_events = {
            let (machine, mut ctx) = self.transition_parts();
            machine.begin(trigger, target_index, &mut ctx)
        };
        self.apply_transition_events(transition_events, events);
    }

    /// Publishes the writer's position to the master clock.
    fn read_master_clock(&mut self, events: &mut Vec<Event>) {
        let total_tl = self.mapper.total_duration_tl();
        match self.clock.mode() {
            MasterMode::AudioMaster => {
                if let Some(position_tl) = self.backend.current_time_tl(ElementHandle::SOUNDTRACK) {
                    self.clock
                        .publish(ElementHandle::SOUNDTRACK, position_tl.min(total_tl));
                }
            }
            MasterMode::VideoMaster => self.read_video_master(events),
        }
    }

    /// Maps the active element's media time to timeline time, looping inside
    /// the clip while repetitions remain and pausing at the final trim end.
    fn read_video_master(&mut self, events: &mut Vec<Event>) {
        let Some(writer) = self.clock.writer() else {
            return;
        };
        let Some(active) = self.transition.active() else {
            return;
        };
        if self.preload.element(active.clip_id) != Some(writer) {
            return;
        }
        let (Some(clip), Some(start_tl)) = (
            self.mapper.clip(active.index),
            self.mapper.cumulative_start_tl(active.index),
        ) else {
            return;
        };
        let Some(media_tl) = self.backend.current_time_tl(writer) else {
            return;
        };

        let offset_tl = (self.clock.position_tl() - start_tl).clamp(0, clip.duration_tl());
        let iteration = clip.iteration_at(offset_tl);
        let pass_start_tl = start_tl + i64::from(iteration) * clip.trim_len_tl();
        let position_tl = if media_tl < clip.trim_end_tl {
            pass_start_tl + (media_tl - clip.trim_start_tl).max(0)
        } else if iteration + 1 < clip.repeat_count.max(1) {
            self.backend.seek(writer, clip.trim_start_tl);
            let position_tl = pass_start_tl + clip.trim_len_tl();
            if self.clock.is_playing()
                && !self.backend.is_playing(writer)
                && let PlayOutcome::Rejected(reason) = self.backend.play(writer)
            {
                self.clock.publish(writer, position_tl);
                self.stop_for_refused_master(reason, events);
                return;
            }
            position_tl
        } else {
            self.backend.pause(writer);
            start_tl + clip.duration_tl()
        };
        self.clock.publish(writer, position_tl);
    }

    fn on_ended(&mut self, handle: ElementHandle, events: &mut Vec<Event>) {
        if !self.clock.is_playing() || !self.transition.is_idle() {
            return;
        }
        let Some(active) = self.transition.active() else {
            return;
        };
        if self.preload.element(active.clip_id) != Some(handle) {
            return;
        }
        let (Some(clip), Some(start_tl)) = (
            self.mapper.clip(active.index),
            self.mapper.cumulative_start_tl(active.index),
        ) else {
            return;
        };
        let offset_tl = (self.clock.position_tl() - start_tl).clamp(0, clip.duration_tl());
        if clip.iteration_at(offset_tl) + 1 < clip.repeat_count.max(1) {
            return;
        }
        let end_tl = start_tl + clip.duration_tl();
        let epsilon_tl = duration_to_tl(self.config.drift_epsilon);
        if self.clock.mode() == MasterMode::AudioMaster
            && self.clock.position_tl() < end_tl - epsilon_tl
        {
            debug!(clip_id = active.clip_id, "follower ended ahead of the master");
            return;
        }
        self.clock.publish(handle, end_tl);

        let next = active.index + 1;
        let target = (next < self.mapper.len()).then_some(next);
        if target.is_some() && target == self.transition.abandoned() {
            return;
        }
        debug!(clip_id = active.clip_id, "active element ended");
        self.begin_transition(TransitionTrigger::Ended, target, events);
    }

    fn detect_boundary(&mut self, events: &mut Vec<Event>) {
        if !self.clock.is_playing() || !self.transition.is_idle() {
            return;
        }
        let position_tl = self.clock.position_tl();
        if position_tl >= self.mapper.total_duration_tl() {
            self.begin_transition(TransitionTrigger::Boundary, None, events);
            return;
        }
        let Some(active) = self.transition.active() else {
            return;
        };
        let Some(end_tl) = self.mapper.to_absolute(active.index, i64::MAX) else {
            return;
        };
        if position_tl < end_tl {
            return;
        }
        let Some(position) = self.mapper.to_clip_position(position_tl) else {
            return;
        };
        let target = position.index.max(active.index + 1);
        if self.transition.abandoned() == Some(target) {
            return;
        }
        self.begin_transition(TransitionTrigger::Boundary, Some(target), events);
    }

    fn finish_timeline(&mut self, events: &mut Vec<Event>) {
        let total_tl = self.mapper.total_duration_tl();
        self.clock.set_playing(false);
        self.backend.pause(ElementHandle::SOUNDTRACK);
        if let Some(element) = self.active_element() {
            self.backend.pause(element);
        }
        self.move_clock(total_tl);
        info!(t_tl = total_tl, "end of timeline reached");
        events.push(Event::EndOfTimeline { t_tl: total_tl });
    }

    fn maintain_window(&mut self, events: &mut Vec<Event>) {
        let active = self.transition.active();
        let Some(center) = self
            .transition
            .target_index()
            .or(active.map(|active| active.index))
        else {
            return;
        };
        let pinned: Vec<ClipId> = active
            .map(|active| active.clip_id)
            .into_iter()
            .chain(self.transition.target_clip_id())
            .collect();

        let preload_events = {
            let (preload, mut ctx) = self.preload_parts();
            preload.ensure_window(center, &pinned, &mut ctx)
        };
        self.forward_preload_events(preload_events, events);
    }

    fn sample_health(&mut self, events: &mut Vec<Event>) {
        let follower = self.transition.active().and_then(|active| {
            let element = self.preload.element(active.clip_id)?;
            // Parked on its last frame, waiting for the master's boundary.
            let parked = self
                .mapper
                .clip(active.index)
                .zip(self.backend.current_time_tl(element))
                .is_some_and(|(clip, media_tl)| media_tl >= clip.trim_end_tl);
            Some(PlayingFollower {
                clip_id: active.clip_id,
                element,
                should_be_playing: self.clock.is_playing()
                    && self.transition.is_idle()
                    && !self.transition.is_held()
                    && !parked,
            })
        });
        let report = self.health.sample(
            self.now,
            &self.preload,
            &self.mapper,
            &self.backend,
            follower,
        );

        for clip_id in report.newly_stalled {
            let preload_events = {
                let (preload, mut ctx) = self.preload_parts();
                preload.recheck(clip_id, &mut ctx)
            };
            events.push(Event::BufferChanged(self.buffer_state(clip_id)));
            self.forward_preload_events(preload_events, events);
        }
        for clip_id in report.recovered {
            events.push(Event::BufferChanged(self.buffer_state(clip_id)));
        }
    }

    fn apply_rate(&mut self, events: &mut Vec<Event>) {
        let (follower, health) = match self.clock.mode() {
            MasterMode::AudioMaster => {
                let Some(active) = self.transition.active() else {
                    return;
                };
                (
                    self.preload.element(active.clip_id),
                    self.buffer_state(active.clip_id).health,
                )
            }
            MasterMode::VideoMaster => (Some(ElementHandle::SOUNDTRACK), 100),
        };
        let idle = self.transition.is_idle() && !self.transition.is_held();
        if self
            .rate
            .apply(&mut self.backend, follower, idle, health)
            .is_some()
        {
            events.push(Event::RateChanged(self.rate.state()));
        }
    }

    /// Keeps the follower aligned with the master while no transition runs.
    ///
    /// Drift correction is skipped while a tempo rate is applied; under tempo
    /// lock the follower runs at its own speed.
    fn sync_followers(&mut self, events: &mut Vec<Event>) {
        let running = self.clock.is_playing()
            && self.transition.is_idle()
            && !self.transition.is_held();
        let correct_drift = running && self.rate.applied_rate() == 1.0;
        let epsilon_tl = duration_to_tl(self.config.drift_epsilon);

        match self.clock.mode() {
            MasterMode::AudioMaster => {
                if !running {
                    return;
                }
                let Some(active) = self.transition.active() else {
                    return;
                };
                let Some(element) = self.preload.element(active.clip_id) else {
                    return;
                };
                let (Some(clip), Some(start_tl)) = (
                    self.mapper.clip(active.index),
                    self.mapper.cumulative_start_tl(active.index),
                ) else {
                    return;
                };
                let offset_tl = self.clock.position_tl() - start_tl;
                if offset_tl < 0 || offset_tl > clip.duration_tl() {
                    return;
                }
                let expected_tl = clip.media_position_tl(offset_tl);
                let mut actual_tl = self.backend.current_time_tl(element).unwrap_or(expected_tl);
                if correct_drift
                    && !self.backend.is_seeking(element)
                    && (actual_tl - expected_tl).abs() > epsilon_tl
                {
                    debug!(
                        clip_id = clip.id,
                        drift_tl = actual_tl - expected_tl,
                        "follower drift corrected"
                    );
                    self.backend.seek(element, expected_tl);
                    actual_tl = expected_tl;
                }
                if actual_tl >= clip.trim_end_tl {
                    if clip.iteration_at(offset_tl) + 1 < clip.repeat_count.max(1) {
                        debug!(clip_id = clip.id, "follower looped to trim start");
                        self.backend.seek(element, clip.trim_start_tl);
                    } else {
                        // A follower that ran ahead waits on its last frame.
                        if self.backend.is_playing(element) {
                            debug!(clip_id = clip.id, "follower parked at trim end");
                            self.backend.pause(element);
                        }
                        if actual_tl > clip.trim_end_tl {
                            self.backend.seek(element, clip.trim_end_tl);
                        }
                        return;
                    }
                }
                if !self.backend.is_playing(element) {
                    self.resume_active(events);
                }
            }
            MasterMode::VideoMaster => {
                let soundtrack = ElementHandle::SOUNDTRACK;
                if !running {
                    if self.backend.is_playing(soundtrack) {
                        self.backend.pause(soundtrack);
                    }
                    return;
                }
                let expected_tl = self.clock.position_tl();
                let actual_tl = self.backend.current_time_tl(soundtrack).unwrap_or(expected_tl);
                if correct_drift && (actual_tl - expected_tl).abs() > epsilon_tl {
                    debug!(drift_tl = actual_tl - expected_tl, "soundtrack drift corrected");
                    self.backend.seek(soundtrack, expected_tl);
                }
                if !self.backend.is_playing(soundtrack)
                    && let PlayOutcome::Rejected(reason) = self.backend.play(soundtrack)
                {
                    self.reject_resume(reason, events);
                }
            }
        }
    }

    /// Resumes the active element; a refusal holds it paused.
    fn resume_active(&mut self, events: &mut Vec<Event>) {
        let Some(element) = self.active_element() else {
            return;
        };
        if let PlayOutcome::Rejected(reason) = self.backend.play(element) {
            self.reject_resume(reason, events);
        }
    }

    fn reject_resume(&mut self, reason: String, events: &mut Vec<Event>) {
        let clip_id = self
            .transition
            .active()
            .map(|active| active.clip_id)
            .unwrap_or_default();
        warn!(clip_id, %reason, "resume rejected, holding follower");
        self.transition.hold();
        let error = SyncError::PlaybackRejected { clip_id, reason };
        events.push(Event::Error(EngineErrorEvent::from_error(&error)));
    }

    /// The master stream refused to run: playback stops and the refusal is
    /// surfaced.
    fn stop_for_refused_master(&mut self, reason: String, events: &mut Vec<Event>) {
        let clip_id = self
            .transition
            .active()
            .map(|active| active.clip_id)
            .unwrap_or_default();
        warn!(clip_id, %reason, mode = ?self.clock.mode(), "master refused to play, stopping");
        self.clock.set_playing(false);
        self.backend.pause(ElementHandle::SOUNDTRACK);
        if let Some(element) = self.active_element() {
            self.backend.pause(element);
        }
        let error = SyncError::PlaybackRejected { clip_id, reason };
        events.push(Event::Error(EngineErrorEvent::from_error(&error)));
    }

    /// Moves the clock on behalf of the facade and keeps the soundtrack in
    /// step when it is the master.
    fn move_clock(&mut self, position_tl: i64) {
        self.clock.force_position(position_tl);
        if self.clock.mode() == MasterMode::AudioMaster {
            self.backend.seek(ElementHandle::SOUNDTRACK, position_tl);
        }
    }

    /// Cancels loads and timers, releases every element and stops playback.
    fn teardown(&mut self) {
        self.clock.set_playing(false);
        self.backend.pause(ElementHandle::SOUNDTRACK);
        if let Some(element) = self.active_element() {
            self.backend.pause(element);
        }
        self.rate.release_follower(&mut self.backend);
        self.preload.evict_all(&mut self.backend, &self.resolver);
        self.transition.reset();
        self.health.reset();
        if self.clock.mode() == MasterMode::VideoMaster {
            self.clock.assign_writer(None);
        }
        debug!("engine torn down");
    }

    fn preload_parts(&mut self) -> (&mut PreloadManager, PreloadContext<'_, M, R>) {
        (
            &mut self.preload,
            PreloadContext {
                mapper: &self.mapper,
                backend: &mut self.backend,
                resolver: &self.resolver,
                now: self.now,
            },
        )
    }

    fn transition_parts(&mut self) -> (&mut TransitionMachine, TransitionContext<'_, M, R>) {
        (
            &mut self.transition,
            TransitionContext {
                mapper: &self.mapper,
                preload: &mut self.preload,
                backend: &mut self.backend,
                resolver: &self.resolver,
                now: self.now,
                master_position_tl: self.clock.position_tl(),
                is_playing: self.clock.is_playing(),
            },
        )
    }
}
