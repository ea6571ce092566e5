mod common;

use std::time::Duration;

use common::{Harness, clips};
use timeline_sync::{
    Command, ElementHandle, EngineErrorKind, Event, MediaBackend, PlayPolicy, SimulatedMedia,
    SimulatedResolver, SyncConfig, SyncError, TransitionPhase,
};

fn patient_loads() -> SyncConfig {
    SyncConfig {
        load_timeout: Duration::from_secs(120),
        ..SyncConfig::default()
    }
}

#[test]
fn unready_next_clip_backs_off_then_aborts_while_master_keeps_running() {
    let mut media = SimulatedMedia::default();
    media.limit_load(2, 0.0);
    let mut harness = Harness::with(media, SimulatedResolver::default(), patient_loads());
    harness.send(Command::SetClips {
        clips: clips(&[10, 8, 12, 6, 9]),
    });
    harness.send(Command::Play);

    let aborted = harness
        .run_until(Duration::from_secs(45), |event| {
            matches!(event, Event::Error(error) if error.kind == EngineErrorKind::RetryExhausted)
        })
        .expect("transition is abandoned");

    assert_eq!(aborted, Duration::from_secs(37));
    assert_eq!(harness.position_tl(), 37_000_000);

    let in_flight: Vec<_> = harness
        .transitions()
        .into_iter()
        .filter(|(at, _)| *at >= Duration::from_secs(10) && *at < aborted)
        .collect();
    assert!(
        in_flight
            .iter()
            .all(|(_, state)| state.to_clip_id == Some(2))
    );
    let failures: Vec<_> = in_flight
        .iter()
        .filter(|(_, state)| state.phase == TransitionPhase::Failed)
        .map(|(at, state)| (at.as_secs(), state.retry_count))
        .collect();
    assert_eq!(failures, vec![(15, 1), (21, 2), (28, 3)]);
    assert!(in_flight.iter().all(|(_, state)| matches!(
        state.error,
        None | Some(SyncError::TransitionTimeout { clip_id: 2 })
    )));

    let error = harness
        .log
        .iter()
        .find_map(|(_, event)| match event {
            Event::Error(error) => Some(error.clone()),
            _ => None,
        })
        .expect("error surfaced");
    assert_eq!(error.clip_id, Some(2));

    // The boundary given up on stays suppressed; playback picks up at the
    // clip holding the master position.
    assert_eq!(harness.engine.playback_state().active_clip_id, Some(5));
    harness.run_to(Duration::from_secs(38));
    assert_eq!(harness.position_tl(), 38_000_000);
}

#[test]
fn seek_during_awaiting_ready_retargets_the_transition_in_flight() {
    let mut media = SimulatedMedia::default();
    media.limit_load(2, 0.0);
    let mut harness = Harness::with(media, SimulatedResolver::default(), patient_loads());
    harness.send(Command::SetClips {
        clips: clips(&[10, 8, 12, 6, 9]),
    });
    harness.send(Command::Play);
    harness.run_to(Duration::from_secs(11));

    let state = harness.engine.transition_state();
    assert_eq!(state.phase, TransitionPhase::AwaitingReady);
    assert_eq!(state.to_clip_id, Some(2));

    let seek_at = harness.now;
    harness.send(Command::SeekTo { t_tl: 20_000_000 });

    assert_eq!(
        harness.phases_since(seek_at),
        vec![
            TransitionPhase::Preparing,
            TransitionPhase::Swapping,
            TransitionPhase::Verifying,
            TransitionPhase::Committed,
            TransitionPhase::Idle,
        ]
    );
    let first = harness
        .transitions()
        .into_iter()
        .find(|(at, _)| *at >= seek_at)
        .map(|(_, state)| state)
        .expect("retargeted state");
    assert_eq!(first.to_clip_id, Some(3));
    assert_eq!(first.from_clip_id, Some(1));

    let state = harness.engine.playback_state();
    assert_eq!(state.active_clip_id, Some(3));
    assert!(state.is_playing);
    let element = harness.engine.active_element().expect("clip 3 is active");
    assert!(harness.media().is_playing(element));
}

#[test]
fn refused_resume_is_retried_then_held_until_the_user_seeks() {
    let media = SimulatedMedia::default().with_play_policy(PlayPolicy::Reject);
    let mut harness = Harness::new(media);
    harness.send(Command::SetClips {
        clips: clips(&[10, 8]),
    });
    harness.send(Command::Play);

    let aborted = harness
        .run_until(Duration::from_secs(10), |event| {
            matches!(event, Event::Error(error) if error.kind == EngineErrorKind::RetryExhausted)
        })
        .expect("resume is abandoned");

    assert_eq!(aborted, Duration::from_millis(7_400));
    let rejected = harness
        .transitions()
        .into_iter()
        .filter(|(_, state)| state.phase == TransitionPhase::Failed)
        .filter(|(_, state)| {
            matches!(state.error, Some(SyncError::PlaybackRejected { clip_id: 1, .. }))
        })
        .count();
    assert_eq!(rejected, 3);

    let element = harness.engine.active_element().expect("clip 1 stays active");
    assert!(!harness.media().is_playing(element));
    assert!(harness.media().is_playing(ElementHandle::SOUNDTRACK));

    harness
        .media_mut()
        .set_play_policy(PlayPolicy::Immediate);
    let position_tl = harness.position_tl();
    harness.send(Command::SeekTo { t_tl: position_tl });
    assert!(harness.media().is_playing(element));
}

#[test]
fn memory_budget_limits_residency_to_three_clips() {
    let config = SyncConfig {
        max_mb: 500,
        ..SyncConfig::default()
    };
    let resolver = SimulatedResolver::with_estimate(150 * 1024 * 1024);
    let mut harness = Harness::with(SimulatedMedia::default(), resolver, config);
    harness.send(Command::SetClips {
        clips: clips(&[10, 8, 12, 6, 9]),
    });
    assert_eq!(harness.engine.resident_clips(), vec![1, 2, 3]);
    assert_eq!(harness.engine.used_mb(), 450);

    harness.run_to(Duration::from_millis(500));
    assert_eq!(harness.engine.playback_state().active_clip_id, Some(1));

    harness.send(Command::SeekTo { t_tl: 30_000_000 });
    let limit = harness.now + Duration::from_secs(3);
    while harness.now < limit {
        harness.tick();
        assert!(harness.engine.resident_clips().len() <= 3);
        assert!(harness.engine.used_mb() <= 500);
    }

    assert_eq!(harness.engine.playback_state().active_clip_id, Some(4));
    assert_eq!(harness.engine.resident_clips(), vec![3, 4, 5]);
    let revoked = harness.engine.resolver().revoked();
    assert!(revoked.contains(&"clip-1.mp4".to_owned()));
    assert!(revoked.contains(&"clip-2.mp4".to_owned()));
}

#[test]
fn tempo_lock_only_changes_the_follower_rate() {
    let mut harness = Harness::new(SimulatedMedia::default());
    harness.send(Command::SetClips {
        clips: clips(&[10, 8]),
    });
    harness.send(Command::Play);
    harness.run_to(Duration::from_secs(1));
    let first = harness.engine.active_element().expect("clip 1 is active");

    let events = harness.send(Command::SetTempo {
        reference_bpm: 120.0,
        target_bpm: 150.0,
        enabled: true,
    });

    assert!(events.iter().any(|event| matches!(
        event,
        Event::RateChanged(state) if state.enabled && state.applied_rate == 1.25
    )));
    assert_eq!(harness.media().rate(first), Some(1.25));
    assert_eq!(harness.media().rate(ElementHandle::SOUNDTRACK), Some(1.0));

    let switched = harness
        .run_until(Duration::from_secs(12), |event| {
            matches!(event, Event::PlaybackChanged(state) if state.active_clip_id == Some(2))
        })
        .expect("second clip becomes active");
    assert!(switched >= Duration::from_secs(10));

    let second = harness.engine.active_element().expect("clip 2 is active");
    assert_eq!(harness.media().rate(second), Some(1.25));
    assert_eq!(harness.media().rate(ElementHandle::SOUNDTRACK), Some(1.0));

    harness.send(Command::SetTempo {
        reference_bpm: 120.0,
        target_bpm: 150.0,
        enabled: false,
    });
    assert_eq!(harness.media().rate(second), Some(1.0));
    assert!(!harness.engine.rate_state().enabled);
}

#[test]
fn invalid_tempo_is_rejected_without_side_effects() {
    let mut harness = Harness::new(SimulatedMedia::default());
    harness.send(Command::SetClips {
        clips: clips(&[10]),
    });

    let error = harness
        .engine
        .handle_command(Command::SetTempo {
            reference_bpm: 120.0,
            target_bpm: f64::NAN,
            enabled: true,
        })
        .expect_err("tempo must be finite");

    assert!(matches!(error, SyncError::InvalidTempo { .. }));
    assert!(!harness.engine.rate_state().enabled);
}

#[test]
fn transient_load_failures_are_retried_without_surfacing_errors() {
    let mut media = SimulatedMedia::default();
    media.fail_loads(2, 2);
    let mut harness = Harness::new(media);
    harness.send(Command::SetClips {
        clips: clips(&[10, 8]),
    });
    harness.send(Command::Play);

    let switched = harness
        .run_until(Duration::from_secs(12), |event| {
            matches!(event, Event::PlaybackChanged(state) if state.active_clip_id == Some(2))
        })
        .expect("second clip becomes active");

    assert!(switched <= Duration::from_millis(10_500));
    let opens = harness
        .media()
        .opened()
        .iter()
        .filter(|(clip_id, _)| *clip_id == 2)
        .count();
    assert_eq!(opens, 3);
    assert!(
        !harness
            .log
            .iter()
            .any(|(_, event)| matches!(event, Event::Error(_)))
    );
    assert_eq!(harness.engine.buffer_state(2).retry_count, 0);
}

#[test]
fn per_clip_estimates_feed_the_budget() {
    let mut resolver = SimulatedResolver::default();
    resolver.set_estimate(1, 100 * 1024 * 1024);
    let mut harness = Harness::with(SimulatedMedia::default(), resolver, SyncConfig::default());
    harness.send(Command::SetClips {
        clips: clips(&[10, 8]),
    });

    // Clip 2 has no estimate and is charged the fallback size.
    assert_eq!(harness.engine.used_mb(), 164);
}

#[test]
fn unresolvable_clip_is_reported_and_never_loaded() {
    let mut resolver = SimulatedResolver::default();
    resolver.make_unresolvable(3);
    let mut harness = Harness::with(SimulatedMedia::default(), resolver, SyncConfig::default());
    harness.send(Command::SetClips {
        clips: clips(&[10, 8, 12]),
    });

    assert_eq!(harness.engine.resident_clips(), vec![1, 2]);
    let snapshot = harness.engine.buffer_state(3);
    assert!(!snapshot.is_resident);
    assert!(matches!(
        snapshot.last_error,
        Some(SyncError::LoadError { clip_id: 3, .. })
    ));
    assert!(
        !harness
            .media()
            .opened()
            .iter()
            .any(|(clip_id, _)| *clip_id == 3)
    );
}

#[test]
fn late_ready_clip_the_master_already_passed_is_skipped() {
    let mut media = SimulatedMedia::default();
    media.limit_load(2, 0.0);
    let mut harness = Harness::with(media, SimulatedResolver::default(), patient_loads());
    harness.send(Command::SetClips {
        clips: clips(&[10, 2, 10]),
    });
    harness.send(Command::Play);
    harness.run_to(Duration::from_millis(12_500));

    let state = harness.engine.transition_state();
    assert_eq!(state.phase, TransitionPhase::AwaitingReady);
    assert_eq!(state.to_clip_id, Some(2));

    harness.media_mut().clear_load_limit(2);
    harness.tick();

    assert_eq!(harness.engine.playback_state().active_clip_id, Some(3));
    assert!(!harness.transitions().iter().any(|(_, state)| {
        state.to_clip_id == Some(2)
            && matches!(
                state.phase,
                TransitionPhase::Swapping | TransitionPhase::Verifying | TransitionPhase::Committed
            )
    }));
    assert!(!harness.log.iter().any(|(_, event)| matches!(
        event,
        Event::PlaybackChanged(state) if state.active_clip_id == Some(2)
    )));
    let element = harness.engine.active_element().expect("clip 3 is active");
    assert!(harness.media().is_playing(element));
    assert!(
        harness
            .media()
            .opened()
            .iter()
            .filter(|(clip_id, _)| *clip_id == 2)
            .all(|(_, handle)| !harness.media().is_playing(*handle))
    );
}
