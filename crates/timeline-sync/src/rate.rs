use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::media::{ElementHandle, MediaBackend};

pub const MIN_RATE: f64 = 0.5;
pub const MAX_RATE: f64 = 2.0;

/// Tempo settings and the rate currently applied to the follower.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateState {
    pub enabled: bool,
    pub reference_bpm: f64,
    pub target_bpm: f64,
    pub applied_rate: f64,
    pub clamp_range: (f64, f64),
}

/// Locks the follower stream to a target tempo.
///
/// The master stream always plays at 1.0; only the follower is sped up or
/// slowed down, and only while no transition is in flight.
#[derive(Debug, Clone)]
pub struct RateController {
    enabled: bool,
    reference_bpm: f64,
    target_bpm: f64,
    applied_rate: f64,
    applied_to: Option<ElementHandle>,
    min_health: u8,
}

/// Clamped tempo ratio.
///
/// # Example
/// ```
/// use timeline_sync::rate::tempo_rate;
///
/// assert_eq!(tempo_rate(120.0, 150.0), 1.25);
/// assert_eq!(tempo_rate(60.0, 240.0), 2.0);
/// ```
pub fn tempo_rate(reference_bpm: f64, target_bpm: f64) -> f64 {
    (target_bpm / reference_bpm).clamp(MIN_RATE, MAX_RATE)
}

fn is_valid_bpm(bpm: f64) -> bool {
    bpm.is_finite() && bpm > 0.0
}

impl RateController {
    pub fn new(min_health: u8) -> Self {
        Self {
            enabled: false,
            reference_bpm: 0.0,
            target_bpm: 0.0,
            applied_rate: 1.0,
            applied_to: None,
            min_health,
        }
    }

    pub fn state(&self) -> RateState {
        RateState {
            enabled: self.enabled,
            reference_bpm: self.reference_bpm,
            target_bpm: self.target_bpm,
            applied_rate: self.applied_rate,
            clamp_range: (MIN_RATE, MAX_RATE),
        }
    }

    pub fn applied_rate(&self) -> f64 {
        self.applied_rate
    }

    /// Rate the follower should end up at.
    pub fn desired_rate(&self) -> f64 {
        if self.enabled {
            tempo_rate(self.reference_bpm, self.target_bpm)
        } else {
            1.0
        }
    }

    /// Stores new tempo settings without touching any element.
    pub fn set_tempo(&mut self, reference_bpm: f64, target_bpm: f64) -> Result<()> {
        if !is_valid_bpm(reference_bpm) || !is_valid_bpm(target_bpm) {
            return Err(SyncError::InvalidTempo {
                reference_bpm,
                target_bpm,
            });
        }
        self.enabled = true;
        self.reference_bpm = reference_bpm;
        self.target_bpm = target_bpm;
        debug!(
            reference_bpm,
            target_bpm,
            rate = self.desired_rate(),
            "tempo updated"
        );
        Ok(())
    }

    /// Applies the desired rate to `follower` when the engine allows it.
    ///
    /// Returns the new applied rate when it changed.
    pub fn apply<M>(
        &mut self,
        backend: &mut M,
        follower: Option<ElementHandle>,
        transition_idle: bool,
        follower_health: u8,
    ) -> Option<f64>
    where
        M: MediaBackend,
    {
        let follower = follower?;
        if !transition_idle || follower_health < self.min_health {
            return None;
        }
        let rate = self.desired_rate();
        if self.applied_to == Some(follower) && self.applied_rate == rate {
            return None;
        }
        backend.set_rate(follower, rate);
        self.applied_to = Some(follower);
        let changed = self.applied_rate != rate;
        self.applied_rate = rate;
        changed.then(|| {
            info!(rate, %follower, "playback rate applied");
            rate
        })
    }

    /// Turns tempo lock off and puts the follower back to 1.0.
    pub fn disable<M>(&mut self, backend: &mut M) -> bool
    where
        M: MediaBackend,
    {
        self.enabled = false;
        if let Some(follower) = self.applied_to {
            backend.set_rate(follower, 1.0);
        }
        let changed = self.applied_rate != 1.0;
        self.applied_rate = 1.0;
        changed
    }

    /// Puts the last follower back to 1.0 and forgets it, e.g. when master
    /// roles are swapped. Tempo settings are kept.
    pub fn release_follower<M>(&mut self, backend: &mut M)
    where
        M: MediaBackend,
    {
        if let Some(follower) = self.applied_to.take() {
            backend.set_rate(follower, 1.0);
        }
        self.applied_rate = 1.0;
    }
}
