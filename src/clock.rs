//! The media-time source.
//!
//! Audio hardware is the only true clock in the pipeline, but querying
//! it every tick is jittery (device callbacks quantize time) and it
//! disappears entirely on mute-less streams or during rebuffering. The
//! playback clock is therefore wall-clock based for smoothness and
//! *loosely corrected* toward the audio clock: large drifts are halved
//! per correction rather than snapped, except for the very first
//! contact with a healthy audio clock, which snaps exactly.

use std::time::Instant;

/// Drift beyond this triggers a correction.
const DRIFT_THRESHOLD: f64 = 0.100;

/// Fraction of the drift applied per correction.
const DRIFT_CORRECTION: f64 = 0.5;

/// Wall-clock media time with audio correction.
#[derive(Debug)]
pub struct PlaybackClock {
    /// Media time at `base_wall`.
    base_media_time: f64,
    /// Wall instant the base was taken; `None` while paused.
    base_wall: Option<Instant>,
    playback_rate: f64,
    /// Media duration used to clamp all outputs.
    duration: Option<f64>,
    /// Whether the clock has synced to audio since the last seek.
    audio_synced: bool,
}

impl PlaybackClock {
    /// Creates a paused clock at media time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_media_time: 0.0,
            base_wall: None,
            playback_rate: 1.0,
            duration: None,
            audio_synced: false,
        }
    }

    /// Starts the clock advancing.
    pub fn start(&mut self) {
        if self.base_wall.is_none() {
            self.base_wall = Some(Instant::now());
        }
    }

    /// Freezes the clock at its current time.
    pub fn pause(&mut self) {
        self.base_media_time = self.get_time();
        self.base_wall = None;
    }

    /// Whether the clock is advancing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.base_wall.is_some()
    }

    /// Jumps to a media time, keeping the running state. Resets the
    /// audio sync so the next healthy audio clock snaps exactly.
    pub fn seek(&mut self, time: f64) {
        self.base_media_time = self.clamp(time);
        if self.base_wall.is_some() {
            self.base_wall = Some(Instant::now());
        }
        self.audio_synced = false;
    }

    /// Changes the playback rate, rebasing so time is continuous.
    pub fn set_playback_rate(&mut self, rate: f64) {
        self.base_media_time = self.get_time();
        if self.base_wall.is_some() {
            self.base_wall = Some(Instant::now());
        }
        self.playback_rate = rate;
    }

    /// The current playback rate.
    #[must_use]
    pub fn playback_rate(&self) -> f64 {
        self.playback_rate
    }

    /// Sets the duration used to clamp outputs at EOF.
    pub fn set_duration(&mut self, duration: f64) {
        self.duration = (duration > 0.0).then_some(duration);
    }

    /// Current media time.
    ///
    /// While paused, repeated calls return the same value.
    #[must_use]
    pub fn get_time(&self) -> f64 {
        let time = match self.base_wall {
            Some(base) => self.base_media_time + base.elapsed().as_secs_f64() * self.playback_rate,
            None => self.base_media_time,
        };
        self.clamp(time)
    }

    /// Feeds an audio clock reading.
    ///
    /// The first healthy reading snaps the base exactly; afterwards a
    /// drift beyond 100 ms nudges the base by half the drift, keeping
    /// presentation smooth while converging on the audio timeline.
    pub fn sync_to_audio(&mut self, audio_time: f64) {
        let wall_time = self.get_time();

        if !self.audio_synced {
            trace!("clock snapping to first audio time {audio_time:.3}");
            self.base_media_time = self.clamp(audio_time);
            if self.base_wall.is_some() {
                self.base_wall = Some(Instant::now());
            }
            self.audio_synced = true;
            return;
        }

        let drift = wall_time - audio_time;
        if drift.abs() > DRIFT_THRESHOLD {
            debug!("clock drift {:.1} ms, correcting", drift * 1000.0);
            self.base_media_time = self.clamp(wall_time - drift * DRIFT_CORRECTION);
            if self.base_wall.is_some() {
                self.base_wall = Some(Instant::now());
            }
        }
    }

    /// The time video presentation should sync against: audio when
    /// available, the wall clock otherwise.
    #[must_use]
    pub fn get_video_sync_time(&self, audio_time: Option<f64>) -> f64 {
        match audio_time {
            Some(time) => self.clamp(time),
            None => self.get_time(),
        }
    }

    fn clamp(&self, time: f64) -> f64 {
        let time = time.max(0.0);
        match self.duration {
            Some(duration) => time.min(duration),
            None => time,
        }
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}
