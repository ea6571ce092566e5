use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::media::ElementHandle;

/// Which stream defines playback time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterMode {
    /// The soundtrack writes the clock; the active clip element follows.
    #[default]
    AudioMaster,
    /// The active clip element writes the clock; the soundtrack follows.
    VideoMaster,
}

/// The authoritative playback position.
///
/// Exactly one element may publish positions at a time. Updates from any other
/// element are refused, so followers can never move the clock.
///
/// # Example
/// ```
/// use timeline_sync::clock::{MasterClock, MasterMode};
/// use timeline_sync::media::ElementHandle;
///
/// let mut clock = MasterClock::new(MasterMode::AudioMaster);
/// assert!(clock.publish(ElementHandle::SOUNDTRACK, 1_000_000));
/// assert!(!clock.publish(ElementHandle(7), 5_000_000));
/// assert_eq!(clock.position_tl(), 1_000_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterClock {
    mode: MasterMode,
    position_tl: i64,
    is_playing: bool,
    writer: Option<ElementHandle>,
}

impl MasterClock {
    pub fn new(mode: MasterMode) -> Self {
        let writer = match mode {
            MasterMode::AudioMaster => Some(ElementHandle::SOUNDTRACK),
            MasterMode::VideoMaster => None,
        };
        Self {
            mode,
            position_tl: 0,
            is_playing: false,
            writer,
        }
    }

    pub fn mode(&self) -> MasterMode {
        self.mode
    }

    pub fn position_tl(&self) -> i64 {
        self.position_tl
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    /// Element currently allowed to publish positions.
    pub fn writer(&self) -> Option<ElementHandle> {
        self.writer
    }

    /// Switches mode. Video mode starts without a writer until an active
    /// element is assigned.
    pub fn set_mode(&mut self, mode: MasterMode) {
        if self.mode == mode {
            return;
        }
        self.mode = mode;
        self.writer = match mode {
            MasterMode::AudioMaster => Some(ElementHandle::SOUNDTRACK),
            MasterMode::VideoMaster => None,
        };
        debug!(?mode, "master mode changed");
    }

    /// Hands the writer role to `writer`. Ignored in audio mode, where the
    /// soundtrack always holds it.
    pub fn assign_writer(&mut self, writer: Option<ElementHandle>) {
        if self.mode == MasterMode::AudioMaster {
            return;
        }
        if self.writer != writer {
            debug!(writer = ?writer, "clock writer reassigned");
            self.writer = writer;
        }
    }

    /// Accepts a position from the current writer only.
    pub fn publish(&mut self, writer: ElementHandle, position_tl: i64) -> bool {
        if self.writer != Some(writer) {
            return false;
        }
        self.position_tl = position_tl.max(0);
        true
    }

    /// Moves the clock on behalf of the engine owner (seek, teardown).
    pub(crate) fn force_position(&mut self, position_tl: i64) {
        self.position_tl = position_tl.max(0);
    }

    pub(crate) fn set_playing(&mut self, is_playing: bool) {
        self.is_playing = is_playing;
    }

    /// Stops playback and rewinds to zero.
    pub(crate) fn stop(&mut self) {
        self.is_playing = false;
        self.position_tl = 0;
        if self.mode == MasterMode::VideoMaster {
            self.writer = None;
        }
    }
}
