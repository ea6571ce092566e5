#![allow(dead_code)]

use std::time::Duration;

use timeline_sync::{
    Clip, ClipId, Command, Engine, Event, SimulatedMedia, SimulatedResolver, SyncConfig,
    TIMELINE_TIME_BASE, TransitionPhase, TransitionState,
};

pub const STEP: Duration = Duration::from_millis(100);

pub fn clip(id: ClipId, order_index: u32, seconds: i64) -> Clip {
    Clip {
        id,
        source_ref: format!("clip-{id}.mp4"),
        trim_start_tl: 0,
        trim_end_tl: seconds * TIMELINE_TIME_BASE,
        original_duration_tl: seconds * TIMELINE_TIME_BASE,
        order_index,
        repeat_count: 1,
    }
}

/// Clips with ids starting at 1, in the given order.
pub fn clips(seconds: &[i64]) -> Vec<Clip> {
    seconds
        .iter()
        .enumerate()
        .map(|(index, seconds)| clip(index as ClipId + 1, index as u32, *seconds))
        .collect()
}

pub fn secs(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds)
}

/// Drives an engine over simulated media in fixed steps and keeps every
/// event with the time it was emitted.
pub struct Harness {
    pub engine: Engine<SimulatedMedia, SimulatedResolver>,
    pub now: Duration,
    pub log: Vec<(Duration, Event)>,
}

impl Harness {
    pub fn new(media: SimulatedMedia) -> Self {
        Self::with(media, SimulatedResolver::default(), SyncConfig::default())
    }

    pub fn with(media: SimulatedMedia, resolver: SimulatedResolver, config: SyncConfig) -> Self {
        let engine = Engine::with_config(media, resolver, config).expect("valid config");
        Self {
            engine,
            now: Duration::ZERO,
            log: Vec::new(),
        }
    }

    pub fn send(&mut self, command: Command) -> Vec<Event> {
        let events = self
            .engine
            .handle_command(command)
            .expect("command should succeed");
        let now = self.now;
        self.log
            .extend(events.iter().cloned().map(|event| (now, event)));
        events
    }

    pub fn tick(&mut self) -> Vec<Event> {
        self.now += STEP;
        let now = self.now;
        self.send(Command::Tick { now })
    }

    /// Ticks until `now` reaches `until`.
    pub fn run_to(&mut self, until: Duration) {
        while self.now + STEP <= until + Duration::from_micros(1) {
            self.tick();
        }
    }

    /// Ticks until an emitted event matches, returning the time it happened.
    pub fn run_until(
        &mut self,
        limit: Duration,
        mut matches: impl FnMut(&Event) -> bool,
    ) -> Option<Duration> {
        while self.now < limit {
            if self.tick().iter().any(&mut matches) {
                return Some(self.now);
            }
        }
        None
    }

    pub fn transitions(&self) -> Vec<(Duration, TransitionState)> {
        self.log
            .iter()
            .filter_map(|(at, event)| match event {
                Event::TransitionChanged(state) => Some((*at, state.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn phases_since(&self, since: Duration) -> Vec<TransitionPhase> {
        self.transitions()
            .into_iter()
            .filter(|(at, _)| *at >= since)
            .map(|(_, state)| state.phase)
            .collect()
    }

    pub fn position_tl(&self) -> i64 {
        self.engine.playback_state().absolute_tl
    }

    pub fn media(&self) -> &SimulatedMedia {
        self.engine.backend()
    }

    pub fn media_mut(&mut self) -> &mut SimulatedMedia {
        self.engine.backend_mut()
    }
}
