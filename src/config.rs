//! Configuration for a kinema media session.
//!
//! This module handles:
//! * Media source selection (URL or local path)
//! * Decoder backend preference (hardware, software, automatic)
//! * Cache sizing for the source layer
//! * Preview (thumbnail) pipeline enablement
//! * Audio behavior (pitch preservation, stereo downmix)
//!
//! Most settings have reasonable defaults that can be overridden as
//! needed.
//!
//! # Examples
//!
//! ```rust
//! use kinema::config::{DecoderPreference, PlayerConfig};
//!
//! let config = PlayerConfig {
//!     decoder: DecoderPreference::Auto,
//!     cache_max_size_mb: 100,
//!     enable_previews: true,
//!     ..PlayerConfig::default()
//! };
//! ```

use serde::{Deserialize, Serialize};

/// Which decode backend the session should use.
///
/// `Auto` is the production setting: hardware first with transparent
/// software fallback. The explicit settings exist for debugging and for
/// hosts with known-broken platform decoders.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "binary", derive(clap::ValueEnum))]
pub enum DecoderPreference {
    /// Prefer the platform decoder, fall back to software on failure.
    #[default]
    Auto,
    /// Platform decoder only; configuration fails if unsupported.
    Hardware,
    /// Software decode only; the platform decoder is never probed.
    Software,
}

/// Complete configuration for a media session.
///
/// Passed to [`Player::new`](crate::player::Player::new) once; immutable
/// afterwards. Runtime-adjustable values (volume, rate, mute) live on
/// the player itself and persist through [`settings`](crate::settings).
#[derive(Clone, Debug, PartialEq)]
pub struct PlayerConfig {
    /// Decode backend preference.
    pub decoder: DecoderPreference,

    /// Upper bound for the shared chunk cache, in MiB.
    ///
    /// The local-file source allocates its chunks from this budget.
    /// Defaults to 100 MiB.
    pub cache_max_size_mb: u32,

    /// Whether the isolated preview (thumbnail) pipeline is created.
    ///
    /// Disabling saves one parser instance and its source window.
    pub enable_previews: bool,

    /// Keep pitch constant when the playback rate is not 1.0.
    ///
    /// When disabled the audio renderer applies the rate directly to
    /// the output buffers, shifting pitch with speed.
    pub preserve_pitch: bool,

    /// Downmix sources with more than two channels to stereo.
    pub downmix_to_stereo: bool,

    /// Start the session muted.
    ///
    /// Hosts with autoplay restrictions start muted and resume the
    /// output device on the first unmute.
    pub start_muted: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            decoder: DecoderPreference::Auto,
            cache_max_size_mb: 100,
            enable_previews: true,
            preserve_pitch: true,
            downmix_to_stereo: true,
            start_muted: false,
        }
    }
}

impl PlayerConfig {
    /// Lowest accepted playback rate.
    pub const MIN_PLAYBACK_RATE: f64 = 0.25;

    /// Highest accepted playback rate.
    pub const MAX_PLAYBACK_RATE: f64 = 4.0;

    /// Validates a playback rate against the supported range.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if `rate` is outside
    /// [`MIN_PLAYBACK_RATE`](Self::MIN_PLAYBACK_RATE)..=[`MAX_PLAYBACK_RATE`](Self::MAX_PLAYBACK_RATE)
    /// or not finite.
    pub fn validate_playback_rate(rate: f64) -> crate::error::Result<f64> {
        if rate.is_finite() && (Self::MIN_PLAYBACK_RATE..=Self::MAX_PLAYBACK_RATE).contains(&rate) {
            Ok(rate)
        } else {
            Err(crate::error::Error::out_of_range(format!(
                "playback rate {rate} outside [{}, {}]",
                Self::MIN_PLAYBACK_RATE,
                Self::MAX_PLAYBACK_RATE
            )))
        }
    }

    /// Cache budget in bytes.
    #[must_use]
    pub fn cache_max_bytes(&self) -> u64 {
        u64::from(self.cache_max_size_mb) * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_rate_bounds() {
        assert!(PlayerConfig::validate_playback_rate(1.0).is_ok());
        assert!(PlayerConfig::validate_playback_rate(0.25).is_ok());
        assert!(PlayerConfig::validate_playback_rate(4.0).is_ok());
        assert!(PlayerConfig::validate_playback_rate(0.1).is_err());
        assert!(PlayerConfig::validate_playback_rate(4.5).is_err());
        assert!(PlayerConfig::validate_playback_rate(f64::NAN).is_err());
    }

    #[test]
    fn default_config_is_auto_with_previews() {
        let config = PlayerConfig::default();
        assert_eq!(config.decoder, DecoderPreference::Auto);
        assert!(config.enable_previews);
        assert_eq!(config.cache_max_bytes(), 100 * 1024 * 1024);
    }
}
