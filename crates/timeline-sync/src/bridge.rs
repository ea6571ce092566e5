//! Runs an [`Engine`] on its own thread behind bounded channels.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::api::{Command, Engine, EngineErrorEvent, Event};
use crate::media::{MediaBackend, SourceResolver};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 8;

/// Interval between engine ticks while no command arrives.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Sender used by the host to dispatch commands to the engine thread.
pub type EngineCommandSender = mpsc::SyncSender<Command>;

/// Receiver used by the host to read events emitted by the engine thread.
pub type EngineEventReceiver = mpsc::Receiver<Event>;

/// Spawns a worker that owns `engine` and ticks it on wall-clock time.
///
/// Commands are applied in arrival order. Failed commands surface as
/// [`Event::Error`]. The worker exits once the command sender is dropped or
/// the event receiver goes away.
pub fn spawn_engine_bridge<M, R>(engine: Engine<M, R>) -> (EngineCommandSender, EngineEventReceiver)
where
    M: MediaBackend + Send + 'static,
    R: SourceResolver + Send + 'static,
{
    spawn_engine_bridge_with_interval(engine, TICK_INTERVAL)
}

/// Same as [`spawn_engine_bridge`] with a custom tick interval.
pub fn spawn_engine_bridge_with_interval<M, R>(
    mut engine: Engine<M, R>,
    tick_interval: Duration,
) -> (EngineCommandSender, EngineEventReceiver)
where
    M: MediaBackend + Send + 'static,
    R: SourceResolver + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::sync_channel::<Command>(COMMAND_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::sync_channel::<Event>(EVENT_CHANNEL_CAPACITY);

    thread::spawn(move || {
        let started = Instant::now();
        let mut next_tick = started + tick_interval;
        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            let command = match command_rx.recv_timeout(wait) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => {
                    next_tick = Instant::now() + tick_interval;
                    Command::Tick {
                        now: started.elapsed(),
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let events = match engine.handle_command(command) {
                Ok(events) => events,
                Err(error) => vec![Event::Error(EngineErrorEvent::from_error(&error))],
            };
            for event in events {
                if event_tx.send(event).is_err() {
                    debug!("event receiver dropped, stopping engine thread");
                    return;
                }
            }
        }
        debug!("command sender dropped, stopping engine thread");
    });

    (command_tx, event_rx)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{spawn_engine_bridge, spawn_engine_bridge_with_interval};
    use crate::api::{Command, Engine, EngineErrorKind, Event};
    use crate::clip::sample_clip;
    use crate::sim::{SimulatedMedia, SimulatedResolver};

    fn sim_engine() -> Engine<SimulatedMedia, SimulatedResolver> {
        Engine::new(
            SimulatedMedia::default(),
            SimulatedResolver::with_estimate(1024 * 1024),
        )
    }

    #[test]
    fn bridge_emits_error_event_when_command_fails() {
        let (command_tx, event_rx) = spawn_engine_bridge(sim_engine());

        command_tx.send(Command::Play).expect("send play command");

        let event = event_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("error event");
        let Event::Error(error) = event else {
            panic!("expected Event::Error");
        };
        assert_eq!(error.kind, EngineErrorKind::InvalidInput);
        assert!(error.message.contains("no clips"));
    }

    #[test]
    fn bridge_ticks_until_the_first_clip_is_committed() {
        let (command_tx, event_rx) =
            spawn_engine_bridge_with_interval(sim_engine(), Duration::from_millis(10));

        command_tx
            .send(Command::SetClips {
                clips: vec![sample_clip(1, 0, 2), sample_clip(2, 1, 2)],
            })
            .expect("send set clips command");

        let first = event_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("first event");
        assert!(matches!(
            first,
            Event::ClipsChanged {
                clip_count: 2,
                duration_tl: 4_000_000
            }
        ));

        let committed = (0..200)
            .filter_map(|_| event_rx.recv_timeout(Duration::from_secs(1)).ok())
            .any(|event| {
                matches!(
                    event,
                    Event::PlaybackChanged(snapshot) if snapshot.active_clip_id == Some(1)
                )
            });
        assert!(committed);
    }

    #[test]
    fn dropping_the_sender_stops_the_worker() {
        let (command_tx, event_rx) = spawn_engine_bridge(sim_engine());
        drop(command_tx);

        let result = event_rx.recv_timeout(Duration::from_secs(1));
        assert!(result.is_err());
    }
}
