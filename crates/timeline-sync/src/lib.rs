//! Headless engine that keeps a clip sequence in step with a continuous
//! soundtrack: preloading, clip handoffs, drift correction and tempo lock.

pub mod api;
pub mod bridge;
pub mod budget;
pub mod clip;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod media;
pub mod position;
pub mod preload;
pub mod rate;
pub mod sim;
pub mod time;
pub mod transition;

pub use api::{
    BufferSnapshot, Command, Engine, EngineErrorEvent, EngineErrorKind, Event, PlaybackSnapshot,
};
pub use bridge::{EngineCommandSender, EngineEventReceiver, spawn_engine_bridge};
pub use clip::{Clip, ClipId, ClipRegistry};
pub use clock::MasterMode;
pub use config::{ExhaustedPolicy, SyncConfig, load_config};
pub use error::{Result, SyncError};
pub use media::{
    BufferedRange, ClipSource, ElementHandle, LoadRequest, MediaBackend, MediaEvent, PlayOutcome,
    SourceResolver,
};
pub use rate::RateState;
pub use sim::{PlayPolicy, SimulatedMedia, SimulatedResolver};
pub use time::{TIMELINE_TIME_BASE, seconds_to_tl, tl_to_seconds};
pub use transition::{TransitionPhase, TransitionState};
