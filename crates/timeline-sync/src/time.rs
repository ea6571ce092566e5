use std::time::Duration;

/// Timeline ticks per second: the timeline counts microseconds.
pub const TIMELINE_TIME_BASE: i64 = 1_000_000;

/// Converts seconds into timeline ticks with nearest rounding.
///
/// Non-finite input maps to zero.
///
/// # Example
/// ```
/// use timeline_sync::time::seconds_to_tl;
///
/// assert_eq!(seconds_to_tl(1.5), 1_500_000);
/// ```
pub fn seconds_to_tl(seconds: f64) -> i64 {
    if !seconds.is_finite() {
        return 0;
    }
    (seconds * TIMELINE_TIME_BASE as f64).round() as i64
}

/// Converts timeline ticks into seconds.
pub fn tl_to_seconds(t_tl: i64) -> f64 {
    t_tl as f64 / TIMELINE_TIME_BASE as f64
}

/// Converts a wall-clock duration into timeline ticks.
pub fn duration_to_tl(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

/// Scales a tick count by a playback rate.
pub fn scale_tl(t_tl: i64, rate: f64) -> i64 {
    (t_tl as f64 * rate).round() as i64
}

/// Returns `part / whole` as a percentage in `0..=100` with nearest rounding.
///
/// # Example
/// ```
/// use timeline_sync::time::percent_of;
///
/// assert_eq!(percent_of(1, 3), 33);
/// assert_eq!(percent_of(5, 0), 100);
/// ```
pub fn percent_of(part: i64, whole: i64) -> u8 {
    if whole <= 0 {
        return 100;
    }
    let part = part.clamp(0, whole);
    let percent = div_round_nearest(i128::from(part) * 100, i128::from(whole));
    percent.clamp(0, 100) as u8
}

fn div_round_nearest(num: i128, den: i128) -> i128 {
    debug_assert!(den > 0);

    let abs_num = num.abs();
    let mut out = abs_num / den;
    let remainder = abs_num % den;
    if remainder.saturating_mul(2) >= den {
        out += 1;
    }

    if num < 0 { -out } else { out }
}
