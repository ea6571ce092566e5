use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use timeline_sync::{
    Clip, Command, Engine, Event, MasterMode, SimulatedMedia, SimulatedResolver, SyncConfig,
    SyncError, TransitionPhase,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_STEP: Duration = Duration::from_millis(100);
const DEFAULT_LOAD_SPEED: f64 = 20.0;

/// Input document for a simulated playback run.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunInput {
    clips: Vec<Clip>,
    #[serde(default)]
    config: SyncConfig,
    #[serde(default)]
    master_mode: MasterMode,
    #[serde(default)]
    tempo: Option<Tempo>,
    /// Media seconds the simulated backend buffers per second.
    #[serde(default = "default_load_speed")]
    load_speed: f64,
    /// Upper bound on simulated time; defaults to twice the timeline.
    #[serde(default)]
    max_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Tempo {
    reference_bpm: f64,
    target_bpm: f64,
}

fn default_load_speed() -> f64 {
    DEFAULT_LOAD_SPEED
}

#[derive(Debug, Default, Serialize)]
struct RunSummary {
    duration_tl: i64,
    final_position_tl: i64,
    simulated_ms: u64,
    reached_end: bool,
    committed_transitions: usize,
    aborted_transitions: usize,
    errors: Vec<String>,
}

fn main() -> ExitCode {
    init_tracing();

    let Some(path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        eprintln!("usage: timeline-sync <run.json>");
        return ExitCode::from(2);
    };
    match run(&path) {
        Ok(summary) => match serde_json::to_string_pretty(&summary) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!(%err, "failed to encode summary");
                ExitCode::FAILURE
            }
        },
        Err(err) => {
            error!(%err, path = %path.display(), "run failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(path: &Path) -> Result<RunSummary, SyncError> {
    let text = std::fs::read_to_string(path).map_err(|err| SyncError::ConfigIo {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    let input: RunInput = serde_json::from_str(&text)?;

    let backend = SimulatedMedia::default().with_load_speed(input.load_speed);
    let mut engine = Engine::with_config(backend, SimulatedResolver::default(), input.config)?;
    let mut summary = RunSummary::default();

    record(&mut summary, engine.handle_command(Command::SetClips { clips: input.clips })?);
    record(
        &mut summary,
        engine.handle_command(Command::SetMasterMode {
            mode: input.master_mode,
        })?,
    );
    if let Some(tempo) = input.tempo {
        record(
            &mut summary,
            engine.handle_command(Command::SetTempo {
                reference_bpm: tempo.reference_bpm,
                target_bpm: tempo.target_bpm,
                enabled: true,
            })?,
        );
    }
    summary.duration_tl = engine.duration_tl();
    record(&mut summary, engine.handle_command(Command::Play)?);

    let limit = run_limit(input.max_seconds, summary.duration_tl)?;
    info!(
        duration_tl = summary.duration_tl,
        limit_ms = limit.as_millis() as u64,
        "simulation started"
    );

    let mut now = Duration::ZERO;
    while now < limit && !summary.reached_end {
        now += DEFAULT_STEP;
        record(&mut summary, engine.handle_command(Command::Tick { now })?);
    }
    if !summary.reached_end {
        warn!(now_ms = now.as_millis() as u64, "simulation stopped before end of timeline");
    }

    summary.final_position_tl = engine.playback_state().absolute_tl;
    summary.simulated_ms = now.as_millis() as u64;
    Ok(summary)
}

/// Simulated time to run for: `max_seconds` when given, otherwise twice the
/// timeline.
fn run_limit(max_seconds: Option<f64>, duration_tl: i64) -> Result<Duration, SyncError> {
    match max_seconds {
        Some(seconds) => {
            Duration::try_from_secs_f64(seconds).map_err(|_| SyncError::InvalidConfig {
                reason: "max_seconds must be a finite non-negative number",
            })
        }
        None => Ok(Duration::from_micros(
            (duration_tl.max(0) as u64).saturating_mul(2),
        )),
    }
}

fn record(summary: &mut RunSummary, events: Vec<Event>) {
    for event in events {
        debug!(?event, "engine event");
        match event {
            Event::TransitionChanged(state) => match state.phase {
                TransitionPhase::Committed => summary.committed_transitions += 1,
                TransitionPhase::Aborted if state.to_clip_id.is_some() => {
                    summary.aborted_transitions += 1;
                }
                _ => {}
            },
            Event::EndOfTimeline { t_tl } => {
                info!(t_tl, "end of timeline");
                summary.reached_end = true;
            }
            Event::Error(error) => {
                warn!(
                    kind = ?error.kind,
                    clip_id = ?error.clip_id,
                    message = %error.message,
                    "engine error"
                );
                summary.errors.push(error.message);
            }
            Event::RateChanged(state) => info!(rate = state.applied_rate, "rate changed"),
            _ => {}
        }
    }
}
