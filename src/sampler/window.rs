//! Session index math for the scrollable analysis window.
//!
//! A window covers `total_window_s` seconds of samples. A normalized factor
//! `f` in `[0, 1]` scrolls it over the session.

use std::ops::RangeInclusive;

/// Number of samples covering `total_window_s` at the given tick interval
pub fn window_samples(total_window_s: u32, interval_ms: u64) -> usize {
    (total_window_s as u64 * 1000 / interval_ms.max(1)) as usize
}

/// Index of the first sample in the window
pub fn first_index(total: usize, window_samples: usize, factor: f64) -> usize {
    let factor = factor.clamp(0.0, 1.0);
    let first = ((total as f64 - window_samples as f64) * factor).floor();
    if first < 0.0 {
        0
    } else {
        first as usize
    }
}

/// Index of the last sample in the window, clamped to the session end
pub fn last_index(total: usize, window_samples: usize, factor: f64) -> usize {
    let last = first_index(total, window_samples, factor) + window_samples;
    last.min(total.saturating_sub(1))
}

/// Inclusive index range of the window, `None` for an empty session
pub fn window_range(total: usize, window_samples: usize, factor: f64) -> Option<RangeInclusive<usize>> {
    if total == 0 {
        return None;
    }
    Some(first_index(total, window_samples, factor)..=last_index(total, window_samples, factor))
}
