use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::{debug, warn};

use crate::clip::ClipId;
use crate::media::{ElementHandle, MediaBackend, buffered_ahead_tl};
use crate::position::PositionMapper;
use crate::preload::PreloadManager;
use crate::time::percent_of;

/// One health reading for a resident slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotReading {
    pub clip_id: ClipId,
    pub position_tl: i64,
    pub buffered_ahead_tl: i64,
    pub health: u8,
    pub is_stalled: bool,
}

/// The element expected to advance between samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayingFollower {
    pub clip_id: ClipId,
    pub element: ElementHandle,
    pub should_be_playing: bool,
}

/// Outcome of one sampling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub readings: Vec<SlotReading>,
    pub newly_stalled: Vec<ClipId>,
    pub recovered: Vec<ClipId>,
}

#[derive(Debug, Clone, Copy)]
struct ProgressMark {
    position_tl: i64,
    advanced_at: Duration,
    stalled: bool,
}

/// Samples buffered ranges and playback progress of resident slots.
#[derive(Debug)]
pub struct HealthMonitor {
    sample_interval: Duration,
    stall_threshold: Duration,
    last_sample_at: Option<Duration>,
    readings: HashMap<ClipId, SlotReading>,
    progress: HashMap<ClipId, ProgressMark>,
}

impl HealthMonitor {
    pub fn new(sample_interval: Duration, stall_threshold: Duration) -> Self {
        Self {
            sample_interval,
            stall_threshold,
            last_sample_at: None,
            readings: HashMap::new(),
            progress: HashMap::new(),
        }
    }

    /// True when the fixed sampling interval has elapsed.
    pub fn is_due(&self, now: Duration) -> bool {
        self.last_sample_at
            .is_none_or(|last| now.saturating_sub(last) >= self.sample_interval)
    }

    /// Recomputes buffered-ahead and stall state for every resident slot.
    ///
    /// Only `follower` can stall: position must fail to advance for longer
    /// than the stall threshold while it should be playing and is not seeking.
    pub fn sample<M>(
        &mut self,
        now: Duration,
        preload: &PreloadManager,
        mapper: &PositionMapper,
        backend: &M,
        follower: Option<PlayingFollower>,
    ) -> HealthReport
    where
        M: MediaBackend,
    {
        self.last_sample_at = Some(now);
        let mut report = HealthReport::default();

        self.readings
            .retain(|clip_id, _| preload.is_resident(*clip_id));
        self.progress
            .retain(|clip_id, _| follower.is_some_and(|follower| follower.clip_id == *clip_id));

        for slot in preload.slots() {
            let Ok(clip) = mapper.registry().by_id(slot.clip_id) else {
                continue;
            };
            let position_tl = backend
                .current_time_tl(slot.element)
                .unwrap_or(clip.trim_start_tl)
                .clamp(clip.trim_start_tl, clip.trim_end_tl);
            let ranges = backend.buffered(slot.element);
            let ahead_tl = buffered_ahead_tl(&ranges, position_tl);
            let health = percent_of(ahead_tl, clip.trim_end_tl - position_tl);

            let is_stalled = match follower {
                Some(follower) if follower.clip_id == slot.clip_id => {
                    self.track_progress(now, follower, position_tl, backend, &mut report)
                }
                _ => false,
            };

            let reading = SlotReading {
                clip_id: slot.clip_id,
                position_tl,
                buffered_ahead_tl: ahead_tl,
                health,
                is_stalled,
            };
            self.readings.insert(slot.clip_id, reading);
            report.readings.push(reading);
        }

        report.readings.sort_unstable_by_key(|reading| reading.clip_id);
        report
    }

    fn track_progress<M>(
        &mut self,
        now: Duration,
        follower: PlayingFollower,
        position_tl: i64,
        backend: &M,
        report: &mut HealthReport,
    ) -> bool
    where
        M: MediaBackend,
    {
        let mark = self.progress.entry(follower.clip_id).or_insert(ProgressMark {
            position_tl,
            advanced_at: now,
            stalled: false,
        });

        let idle = !follower.should_be_playing || backend.is_seeking(follower.element);
        if idle || mark.position_tl != position_tl {
            if mark.stalled {
                debug!(clip_id = follower.clip_id, "playback recovered from stall");
                report.recovered.push(follower.clip_id);
            }
            *mark = ProgressMark {
                position_tl,
                advanced_at: now,
                stalled: false,
            };
            return false;
        }

        if !mark.stalled && now.saturating_sub(mark.advanced_at) >= self.stall_threshold {
            mark.stalled = true;
            warn!(
                clip_id = follower.clip_id,
                position_tl,
                stalled_ms = now.saturating_sub(mark.advanced_at).as_millis() as u64,
                "playback stalled"
            );
            report.newly_stalled.push(follower.clip_id);
        }
        mark.stalled
    }

    pub fn health(&self, clip_id: ClipId) -> Option<u8> {
        self.readings.get(&clip_id).map(|reading| reading.health)
    }

    pub fn is_stalled(&self, clip_id: ClipId) -> bool {
        self.readings
            .get(&clip_id)
            .is_some_and(|reading| reading.is_stalled)
    }

    /// Latest health of every sampled clip, ordered by clip id.
    pub fn all_health(&self) -> BTreeMap<ClipId, u8> {
        self.readings
            .iter()
            .map(|(clip_id, reading)| (*clip_id, reading.health))
            .collect()
    }

    /// Forgets all readings, e.g. when the clip list is replaced.
    pub fn reset(&mut self) {
        self.last_sample_at = None;
        self.readings.clear();
        self.progress.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{HealthMonitor, PlayingFollower};
    use crate::clip::{ClipRegistry, sample_clip};
    use crate::config::SyncConfig;
    use crate::media::{BufferedRange, MediaBackend};
    use crate::position::PositionMapper;
    use crate::preload::{PreloadContext, PreloadManager};
    use crate::sim::{SimulatedMedia, SimulatedResolver};

    struct Fixture {
        mapper: PositionMapper,
        backend: SimulatedMedia,
        preload: PreloadManager,
    }

    fn fixture() -> Fixture {
        let mapper = PositionMapper::new(
            ClipRegistry::new(vec![sample_clip(1, 0, 10), sample_clip(2, 1, 10)])
                .expect("valid clips"),
        );
        let mut backend = SimulatedMedia::default();
        let resolver = SimulatedResolver::with_estimate(1024 * 1024);
        let mut preload = PreloadManager::new(&SyncConfig::default());
        let mut ctx = PreloadContext {
            mapper: &mapper,
            backend: &mut backend,
            resolver: &resolver,
            now: Duration::ZERO,
        };
        preload.ensure_window(0, &[], &mut ctx);
        Fixture {
            mapper,
            backend,
            preload,
        }
    }

    #[test]
    fn health_measures_buffer_ahead_of_the_element_position() {
        let mut fx = fixture();
        let handle = fx.preload.element(1).expect("resident");
        fx.backend.set_buffered(
            handle,
            vec![BufferedRange {
                start_tl: 0,
                end_tl: 6_000_000,
            }],
        );
        fx.backend.seek(handle, 2_000_000);

        let mut monitor = HealthMonitor::new(Duration::from_secs(1), Duration::from_secs(3));
        let report = monitor.sample(Duration::ZERO, &fx.preload, &fx.mapper, &fx.backend, None);

        let reading = report.readings[0];
        assert_eq!(reading.clip_id, 1);
        assert_eq!(reading.buffered_ahead_tl, 4_000_000);
        assert_eq!(reading.health, 50);
        assert_eq!(monitor.all_health().get(&2), Some(&0));
    }

    #[test]
    fn stall_is_flagged_after_threshold_without_progress() {
        let mut fx = fixture();
        let handle = fx.preload.element(1).expect("resident");
        let follower = Some(PlayingFollower {
            clip_id: 1,
            element: handle,
            should_be_playing: true,
        });
        let mut monitor = HealthMonitor::new(Duration::from_secs(1), Duration::from_secs(3));

        for second in 0..3 {
            let report = monitor.sample(
                Duration::from_secs(second),
                &fx.preload,
                &fx.mapper,
                &fx.backend,
                follower,
            );
            assert!(report.newly_stalled.is_empty());
        }
        let report = monitor.sample(
            Duration::from_secs(3),
            &fx.preload,
            &fx.mapper,
            &fx.backend,
            follower,
        );
        assert_eq!(report.newly_stalled, vec![1]);
        assert!(monitor.is_stalled(1));

        fx.backend.seek(handle, 500_000);
        let report = monitor.sample(
            Duration::from_secs(4),
            &fx.preload,
            &fx.mapper,
            &fx.backend,
            follower,
        );
        assert_eq!(report.recovered, vec![1]);
        assert!(!monitor.is_stalled(1));
    }

    #[test]
    fn paused_follower_never_stalls() {
        let fx = fixture();
        let handle = fx.preload.element(1).expect("resident");
        let follower = Some(PlayingFollower {
            clip_id: 1,
            element: handle,
            should_be_playing: false,
        });
        let mut monitor = HealthMonitor::new(Duration::from_secs(1), Duration::from_secs(3));

        for second in 0..10 {
            let report = monitor.sample(
                Duration::from_secs(second),
                &fx.preload,
                &fx.mapper,
                &fx.backend,
                follower,
            );
            assert!(report.newly_stalled.is_empty());
        }
        assert!(!monitor.is_due(Duration::from_millis(9_500)));
        assert!(monitor.is_due(Duration::from_secs(10)));
    }
}
