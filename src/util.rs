//! Utility traits and functions.
//!
//! This module provides general-purpose utilities including:
//! * Type conversion traits
//! * Small time arithmetic helpers shared by the clocks

use std::time::Duration;

/// Trait for converting numeric values to `f32` with controlled truncation.
///
/// Provides safe conversion to `f32` by:
/// * Clamping values to `f32` range
/// * Preventing infinity values
/// * Preventing NaN values
///
/// # Example
///
/// ```rust
/// use kinema::util::ToF32;
///
/// let large_value: f64 = 1e308;
/// let clamped: f32 = large_value.to_f32_lossy();
/// assert!(clamped == f32::MAX);
/// ```
pub trait ToF32 {
    /// Converts a value to `f32`, clamping to prevent invalid results.
    ///
    /// Values outside the `f32` range are clamped to the nearest valid value:
    /// * Values > `f32::MAX` become `f32::MAX`
    /// * Values < `f32::MIN` become `f32::MIN`
    fn to_f32_lossy(self) -> f32;
}

impl ToF32 for f64 {
    #[expect(clippy::cast_possible_truncation)]
    fn to_f32_lossy(self) -> f32 {
        self.clamp(f64::from(f32::MIN), f64::from(f32::MAX)) as f32
    }
}

/// Converts a media time in seconds to a `Duration`, treating negative
/// and non-finite inputs as zero.
///
/// Container timestamps are `f64` seconds throughout the engine; this is
/// the single place where they meet the standard library's unsigned
/// `Duration`.
#[must_use]
pub fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

/// Clamps a media time into `[0, duration]`.
///
/// `duration` of `None` leaves the upper bound open. NaN collapses to 0.
#[must_use]
pub fn clamp_media_time(t: f64, duration: Option<f64>) -> f64 {
    let t = if t.is_nan() { 0.0 } else { t };
    let t = t.max(0.0);
    match duration {
        Some(d) if d > 0.0 => t.min(d),
        _ => t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_f32_lossy_clamps_out_of_range() {
        assert_eq!(f64::MAX.to_f32_lossy(), f32::MAX);
        assert_eq!(f64::MIN.to_f32_lossy(), f32::MIN);
        assert_eq!(1.5f64.to_f32_lossy(), 1.5f32);
    }

    #[test]
    fn secs_to_duration_rejects_invalid() {
        assert_eq!(secs_to_duration(-1.0), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(secs_to_duration(1.25), Duration::from_millis(1250));
    }

    #[test]
    fn clamp_media_time_bounds() {
        assert_eq!(clamp_media_time(-3.0, Some(10.0)), 0.0);
        assert_eq!(clamp_media_time(12.0, Some(10.0)), 10.0);
        assert_eq!(clamp_media_time(12.0, None), 12.0);
        assert_eq!(clamp_media_time(f64::NAN, Some(10.0)), 0.0);
    }
}
