//! Scheduled audio playback and the master clock.
//!
//! The renderer commits decoded blocks onto the output device at
//! sample-accurate positions in the device's own clock domain, and from
//! the committed schedule answers the one question the rest of the
//! engine cares about: *what media time is coming out of the speakers
//! right now*. Video presentation and the wall clock both follow this
//! answer.
//!
//! The anchor pair `(first_buffer_scheduled_at, first_buffer_media_time)`
//! relates device time to media time. Under-runs re-anchor it; drifts
//! beyond 20 ms snap the schedule back onto the anchored timeline.
//! The clock query clamps below by the first buffer's media time
//! (high-latency Bluetooth devices otherwise report time before any
//! audio has played) and above by the furthest committed media time
//! (so the clock cannot run past EOF during a stall).

use std::time::{Duration, Instant};

use crate::decoder::AudioSamples;
use crate::sink::OutputDevice;

/// Lead time given to the device when the schedule has fallen behind.
const SCHEDULE_LEAD: f64 = 0.005;

/// Drift between the running schedule and the anchored timeline that
/// forces a re-sync.
const DRIFT_RESYNC: f64 = 0.020;

/// Buffer lead considered healthy during the first few chunks.
const HEALTHY_LEAD_WARMUP: f64 = 0.1;

/// Buffer lead considered healthy in steady state.
const HEALTHY_LEAD_STEADY: f64 = 0.02;

/// Chunks that count as warmup.
const WARMUP_CHUNKS: u64 = 5;

/// The decoder must have produced output this recently for the buffer
/// to count as healthy.
const DECODER_OUTPUT_RECENCY: Duration = Duration::from_millis(500);

/// Grain size for the pitch-preserving stretcher, in frames.
const STRETCH_GRAIN: usize = 1024;

/// The audio renderer.
pub struct AudioRenderer {
    device: Box<dyn OutputDevice>,

    /// Device-clock position through which audio is committed.
    scheduled_time: f64,
    /// Device time of the first committed buffer since the last anchor
    /// reset.
    first_buffer_scheduled_at: Option<f64>,
    /// Media time of that buffer.
    first_buffer_media_time: f64,
    /// Furthest-forward media time ever committed. Non-decreasing
    /// except on [`reset`](Self::reset).
    max_scheduled_media_time: f64,
    /// Blocks committed since the last reset.
    chunks_scheduled: u64,

    playback_rate: f64,
    preserve_pitch: bool,
    volume: f32,
    muted: bool,
    paused: bool,
    is_rebuffering: bool,

    /// Device was suspended at a muted start and resumes on unmute.
    suspended_for_autoplay: bool,

    /// Last time the audio decoder produced output, reported by the
    /// player's demux loop.
    last_decoder_output: Option<Instant>,
}

impl AudioRenderer {
    /// Creates a renderer over an output device.
    #[must_use]
    pub fn new(device: Box<dyn OutputDevice>) -> Self {
        Self {
            device,
            scheduled_time: 0.0,
            first_buffer_scheduled_at: None,
            first_buffer_media_time: 0.0,
            max_scheduled_media_time: 0.0,
            chunks_scheduled: 0,
            playback_rate: 1.0,
            preserve_pitch: true,
            volume: 1.0,
            muted: false,
            paused: true,
            is_rebuffering: false,
            suspended_for_autoplay: false,
            last_decoder_output: None,
        }
    }

    /// Starts playback.
    ///
    /// With a muted start under an autoplay policy the device stays
    /// suspended until the first unmute; everything else resumes it
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the device refuses to resume.
    pub async fn play(&mut self, autoplay_requires_gesture: bool) -> crate::error::Result<()> {
        self.paused = false;

        if self.muted && autoplay_requires_gesture && !self.device.is_running() {
            debug!("muted autoplay: deferring device resume until unmute");
            self.suspended_for_autoplay = true;
            return Ok(());
        }

        self.device.resume().await
    }

    /// Pauses playback, suspending the device.
    pub fn pause(&mut self) {
        self.paused = true;
        self.device.suspend();
    }

    /// Whether the renderer accepts blocks.
    #[must_use]
    pub fn is_playing(&self) -> bool {
        !self.paused
    }

    /// Commits one decoded block onto the device schedule.
    ///
    /// Paused or autoplay-suspended renderers drop the block: decoded
    /// audio is cheap to reproduce and stale blocks after a resume are
    /// worse than silence.
    pub fn render(&mut self, samples: &AudioSamples) {
        if self.paused || self.suspended_for_autoplay {
            trace!("dropping audio block at {:.3} while inactive", samples.pts_seconds);
            return;
        }
        if samples.frame_count() == 0 {
            return;
        }

        // Pitch preservation stretches the samples and plays them at
        // native rate; otherwise the device consumes at the playback
        // rate directly.
        let stretched;
        let (block, device_rate) = if (self.playback_rate - 1.0).abs() > f64::EPSILON {
            if self.preserve_pitch {
                stretched = time_stretch(samples, self.playback_rate);
                (&stretched, 1.0)
            } else {
                (samples, self.playback_rate)
            }
        } else {
            (samples, 1.0)
        };

        let now = self.device.now();
        let mut at = self.scheduled_time.max(now + SCHEDULE_LEAD);

        // Under-run: the schedule fell behind the device clock. The old
        // anchor would claim time that never played; re-anchor here.
        if self.scheduled_time < now && self.chunks_scheduled > 0 {
            debug!(
                "audio under-run ({:.3} < {:.3}), re-anchoring",
                self.scheduled_time, now
            );
            self.first_buffer_scheduled_at = Some(at);
            self.first_buffer_media_time = samples.pts_seconds;
        }

        match self.first_buffer_scheduled_at {
            None => {
                self.first_buffer_scheduled_at = Some(at);
                self.first_buffer_media_time = samples.pts_seconds;
            }
            Some(anchor_at) => {
                // Where this block belongs on the anchored timeline.
                let anchored =
                    anchor_at + (samples.pts_seconds - self.first_buffer_media_time) / self.playback_rate;
                if (anchored - at).abs() > DRIFT_RESYNC && anchored > now {
                    trace!(
                        "schedule drift {:.1} ms, snapping to anchored time",
                        (anchored - at).abs() * 1000.0
                    );
                    at = anchored;
                }
            }
        }

        self.device.commit(block, at, device_rate);

        self.scheduled_time = at + samples.duration() / self.playback_rate;
        self.max_scheduled_media_time = self
            .max_scheduled_media_time
            .max(samples.pts_seconds + samples.duration());
        self.chunks_scheduled += 1;
        self.is_rebuffering = false;
    }

    /// The master clock: media time currently at the speakers.
    ///
    /// `None` until the first buffer is committed and the device is
    /// running.
    #[must_use]
    pub fn get_audio_clock(&self) -> Option<f64> {
        let anchor_at = self.first_buffer_scheduled_at?;
        if !self.device.is_running() {
            return None;
        }

        let elapsed = self.device.now() - anchor_at;
        let latency = self.device.output_latency();
        let time = self.first_buffer_media_time + (elapsed - latency) * self.playback_rate;

        Some(
            time.max(self.first_buffer_media_time)
                .min(self.max_scheduled_media_time),
        )
    }

    /// Whether enough audio is committed for smooth playback.
    ///
    /// Warmup chunks demand a deeper buffer; once the pipeline is
    /// primed a shallow one suffices. A silent decoder (no output for
    /// half a second) always reads as unhealthy.
    #[must_use]
    pub fn has_healthy_buffer(&self) -> bool {
        if !self.device.is_running() {
            return false;
        }

        let lead = self.scheduled_time - self.device.now();
        let required = if self.chunks_scheduled < WARMUP_CHUNKS {
            HEALTHY_LEAD_WARMUP
        } else {
            HEALTHY_LEAD_STEADY
        };
        if lead < required {
            return false;
        }

        self.last_decoder_output
            .is_some_and(|at| at.elapsed() <= DECODER_OUTPUT_RECENCY)
    }

    /// Reports decoder activity for the health heuristic.
    pub fn note_decoder_output(&mut self) {
        self.last_decoder_output = Some(Instant::now());
    }

    /// Whether the renderer is waiting for its first block after a
    /// schedule-destroying change.
    #[must_use]
    pub fn is_rebuffering(&self) -> bool {
        self.is_rebuffering
    }

    /// Changes the playback rate.
    ///
    /// Everything scheduled was committed for the old rate, so it is
    /// stopped; the next render re-anchors the timeline.
    pub fn set_playback_rate(&mut self, rate: f64) {
        if (rate - self.playback_rate).abs() < f64::EPSILON {
            return;
        }
        info!("audio playback rate {} -> {rate}", self.playback_rate);

        self.device.stop_all();
        self.scheduled_time = self.device.now();
        self.first_buffer_scheduled_at = None;
        self.playback_rate = rate;
        self.is_rebuffering = true;
    }

    /// The current playback rate.
    #[must_use]
    pub fn playback_rate(&self) -> f64 {
        self.playback_rate
    }

    /// Enables or disables pitch preservation for non-unity rates.
    pub fn set_preserve_pitch(&mut self, preserve: bool) {
        self.preserve_pitch = preserve;
    }

    /// Sets the output volume. Stored even while muted so an unmute
    /// restores the exact pre-mute gain.
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        if !self.muted {
            self.device.set_gain(self.volume);
        }
    }

    /// The stored volume setting.
    #[must_use]
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Mutes or unmutes.
    ///
    /// Muting zeroes the gain without stopping the device; the clock
    /// keeps advancing. Unmuting a session that deferred its device
    /// resume (muted autoplay) resumes the device now and re-anchors
    /// the schedule at this moment.
    ///
    /// # Errors
    ///
    /// Returns error if the deferred device resume fails.
    pub async fn set_muted(&mut self, muted: bool) -> crate::error::Result<()> {
        if muted == self.muted {
            return Ok(());
        }
        self.muted = muted;

        if muted {
            self.device.set_gain(0.0);
            return Ok(());
        }

        self.device.set_gain(self.volume);
        if self.suspended_for_autoplay {
            self.suspended_for_autoplay = false;
            self.first_buffer_scheduled_at = None;
            self.scheduled_time = self.device.now();
            self.device.resume().await?;
        }
        Ok(())
    }

    /// Whether output is muted.
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Stops all scheduled audio and clears the timeline (seek, track
    /// switch). This is the one operation allowed to move
    /// `max_scheduled_media_time` backwards.
    pub fn reset(&mut self) {
        self.device.stop_all();
        self.scheduled_time = self.device.now();
        self.first_buffer_scheduled_at = None;
        self.first_buffer_media_time = 0.0;
        self.max_scheduled_media_time = 0.0;
        self.chunks_scheduled = 0;
        self.is_rebuffering = true;
    }

    /// Suspends the device and releases scheduled audio (destroy).
    pub fn close(&mut self) {
        self.device.stop_all();
        self.device.suspend();
    }
}

/// Pitch-preserving time stretch by windowed overlap-add.
///
/// Grains of [`STRETCH_GRAIN`] frames are read at `rate` times the
/// synthesis hop and cross-faded with a Hann window. Artifacts are
/// audible on transients at extreme rates, which matches what the
/// speed-watching use case tolerates.
#[must_use]
pub fn time_stretch(samples: &AudioSamples, rate: f64) -> AudioSamples {
    if (rate - 1.0).abs() < f64::EPSILON || samples.frame_count() == 0 {
        return samples.clone();
    }

    let in_frames = samples.frame_count();
    let grain = STRETCH_GRAIN.min(in_frames);
    let syn_hop = grain / 2;
    let ana_hop = (syn_hop as f64 * rate).max(1.0);

    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let out_frames = ((in_frames as f64) / rate).floor() as usize;
    if out_frames == 0 || syn_hop == 0 {
        return samples.clone();
    }

    #[expect(clippy::cast_precision_loss)]
    let window: Vec<f32> = (0..grain)
        .map(|i| {
            let phase = std::f32::consts::PI * 2.0 * i as f32 / grain as f32;
            0.5 * (1.0 - phase.cos())
        })
        .collect();

    let planes = samples
        .planes
        .iter()
        .map(|plane| {
            let mut out = vec![0.0f32; out_frames + grain];
            let mut weight = vec![0.0f32; out_frames + grain];

            let mut syn_pos = 0usize;
            let mut ana_pos = 0.0f64;
            while syn_pos < out_frames {
                #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let read = (ana_pos as usize).min(in_frames.saturating_sub(grain));
                for i in 0..grain {
                    let sample = plane[(read + i).min(in_frames - 1)] * window[i];
                    out[syn_pos + i] += sample;
                    weight[syn_pos + i] += window[i];
                }
                syn_pos += syn_hop;
                ana_pos += ana_hop;
            }

            out.truncate(out_frames);
            for (sample, w) in out.iter_mut().zip(&weight) {
                if *w > f32::EPSILON {
                    *sample /= w;
                }
            }
            out
        })
        .collect();

    AudioSamples {
        sample_rate: samples.sample_rate,
        pts_seconds: samples.pts_seconds,
        planes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::SharedOutput;

    fn block(pts: f64, frames: usize) -> AudioSamples {
        AudioSamples {
            sample_rate: 48_000,
            pts_seconds: pts,
            planes: vec![vec![0.1; frames], vec![0.1; frames]],
        }
    }

    async fn playing_renderer() -> (AudioRenderer, SharedOutput) {
        let shared = SharedOutput::new();
        let mut renderer = AudioRenderer::new(Box::new(shared.clone()));
        renderer.play(false).await.unwrap();
        (renderer, shared)
    }

    #[tokio::test]
    async fn first_render_anchors_and_commits_with_lead() {
        let (mut renderer, shared) = playing_renderer().await;

        renderer.render(&block(10.0, 4800));
        let (at, duration, rate) = shared.with(|d| d.commits[0]);
        assert!((at - SCHEDULE_LEAD).abs() < 1e-9);
        assert!((duration - 0.1).abs() < 1e-9);
        assert!((rate - 1.0).abs() < 1e-9);

        // Clock is clamped below by the first buffer's media time.
        assert_eq!(renderer.get_audio_clock(), Some(10.0));
    }

    #[tokio::test]
    async fn scheduled_time_is_monotonic_over_a_segment() {
        let (mut renderer, _shared) = playing_renderer().await;

        let mut previous = 0.0;
        for i in 0..10 {
            renderer.render(&block(f64::from(i) * 0.1, 4800));
            assert!(renderer.scheduled_time >= previous);
            previous = renderer.scheduled_time;
        }
    }

    #[tokio::test]
    async fn clock_tracks_device_and_clamps_at_max_scheduled() {
        let (mut renderer, shared) = playing_renderer().await;
        shared.with(|d| d.latency = 0.0);

        renderer.render(&block(0.0, 4800));
        renderer.render(&block(0.1, 4800));

        shared.advance(0.105);
        let clock = renderer.get_audio_clock().unwrap();
        assert!((clock - 0.1).abs() < 0.01);

        // Far past everything scheduled: clamped to max media time.
        shared.advance(10.0);
        assert_eq!(renderer.get_audio_clock(), Some(0.2));
    }

    #[tokio::test]
    async fn clock_is_none_before_first_buffer_or_while_stopped() {
        let shared = SharedOutput::new();
        let mut renderer = AudioRenderer::new(Box::new(shared.clone()));
        assert_eq!(renderer.get_audio_clock(), None);

        renderer.play(false).await.unwrap();
        renderer.render(&block(0.0, 480));
        assert!(renderer.get_audio_clock().is_some());

        shared.with(|d| d.running = false);
        assert_eq!(renderer.get_audio_clock(), None);
    }

    #[tokio::test]
    async fn underrun_reanchors_the_timeline() {
        let (mut renderer, shared) = playing_renderer().await;
        shared.with(|d| d.latency = 0.0);

        renderer.render(&block(0.0, 4800));
        // Device plays past the committed audio: under-run.
        shared.advance(1.0);

        renderer.render(&block(5.0, 4800));
        shared.advance(0.05);
        let clock = renderer.get_audio_clock().unwrap();
        assert!((clock - 5.045).abs() < 0.01, "clock follows the new anchor, got {clock}");
    }

    #[tokio::test]
    async fn drifted_schedule_snaps_to_anchored_time() {
        let (mut renderer, shared) = playing_renderer().await;

        renderer.render(&block(0.0, 4800));
        // A gap in media time: the next block belongs 0.5 s later on
        // the anchored timeline than the contiguous schedule claims.
        renderer.render(&block(0.6, 4800));

        let (first_at, _, _) = shared.with(|d| d.commits[0]);
        let (second_at, _, _) = shared.with(|d| d.commits[1]);
        assert!((second_at - (first_at + 0.6)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn healthy_buffer_thresholds_follow_warmup() {
        let (mut renderer, shared) = playing_renderer().await;
        assert!(!renderer.has_healthy_buffer(), "nothing scheduled yet");

        renderer.note_decoder_output();
        renderer.render(&block(0.0, 4800)); // 100 ms scheduled
        assert!(renderer.has_healthy_buffer());

        // Warmup demands 100 ms of lead; 50 ms is not enough.
        shared.advance(0.05);
        assert!(!renderer.has_healthy_buffer());

        // Steady state (>= 5 chunks) accepts 20 ms.
        for i in 1..6 {
            renderer.render(&block(f64::from(i) * 0.1, 4800));
        }
        let lead = renderer.scheduled_time - shared.with(|d| d.clock);
        shared.advance(lead - 0.05);
        assert!(renderer.has_healthy_buffer());
    }

    #[tokio::test]
    async fn stale_decoder_output_reads_unhealthy() {
        let (mut renderer, _shared) = playing_renderer().await;
        renderer.render(&block(0.0, 48_000));

        renderer.last_decoder_output =
            Instant::now().checked_sub(Duration::from_millis(600));
        assert!(!renderer.has_healthy_buffer());
    }

    #[tokio::test]
    async fn rate_change_stops_sources_and_marks_rebuffering() {
        let (mut renderer, shared) = playing_renderer().await;
        renderer.render(&block(0.0, 4800));

        renderer.set_playback_rate(2.0);
        assert_eq!(shared.with(|d| d.stop_count), 1);
        assert!(renderer.is_rebuffering());

        renderer.note_decoder_output();
        renderer.render(&block(0.1, 4800));
        assert!(!renderer.is_rebuffering());

        // Pitch preservation: stretched block committed at native rate.
        let (_, duration, rate) = shared.with(|d| d.commits[1]);
        assert!((rate - 1.0).abs() < 1e-9);
        assert!((duration - 0.05).abs() < 0.01, "half the frames at 2x");
    }

    #[tokio::test]
    async fn non_preserving_rate_commits_at_device_rate() {
        let (mut renderer, shared) = playing_renderer().await;
        renderer.set_preserve_pitch(false);
        renderer.set_playback_rate(1.5);

        renderer.render(&block(0.0, 4800));
        let (_, _, rate) = shared.with(|d| d.commits[0]);
        assert!((rate - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn mute_unmute_restores_exact_gain() {
        let (mut renderer, shared) = playing_renderer().await;
        renderer.set_volume(0.37);
        assert!((shared.with(|d| d.gain) - 0.37).abs() < 1e-6);

        renderer.set_muted(true).await.unwrap();
        assert_eq!(shared.with(|d| d.gain), 0.0);
        assert!(shared.with(|d| d.running), "device keeps running muted");

        renderer.set_muted(false).await.unwrap();
        assert!((shared.with(|d| d.gain) - 0.37).abs() < 1e-6);
    }

    #[tokio::test]
    async fn muted_autoplay_defers_resume_until_unmute() {
        let shared = SharedOutput::new();
        let mut renderer = AudioRenderer::new(Box::new(shared.clone()));

        renderer.set_muted(true).await.unwrap();
        renderer.play(true).await.unwrap();
        assert!(!shared.with(|d| d.running), "device stays suspended");
        assert_eq!(shared.with(|d| d.resume_count), 0);

        // Blocks rendered while suspended are dropped.
        renderer.render(&block(1.0, 4800));
        assert!(shared.with(|d| d.commits.is_empty()));

        shared.advance(1.0);
        renderer.set_muted(false).await.unwrap();
        assert!(shared.with(|d| d.running));
        assert_eq!(shared.with(|d| d.resume_count), 1);

        // The anchor is established by the first post-unmute block, so
        // the clock reports media time >= that block's pts.
        renderer.render(&block(1.2, 4800));
        assert!(renderer.get_audio_clock().unwrap() >= 1.2);
    }

    #[tokio::test]
    async fn paused_renderer_drops_blocks() {
        let (mut renderer, shared) = playing_renderer().await;
        renderer.pause();
        renderer.render(&block(0.0, 4800));
        assert!(shared.with(|d| d.commits.is_empty()));
    }

    #[tokio::test]
    async fn reset_rewinds_max_scheduled_media_time() {
        let (mut renderer, _shared) = playing_renderer().await;
        renderer.render(&block(100.0, 4800));
        assert!(renderer.max_scheduled_media_time > 0.0);

        renderer.reset();
        assert_eq!(renderer.max_scheduled_media_time, 0.0);
        assert_eq!(renderer.get_audio_clock(), None);
    }

    #[test]
    fn time_stretch_scales_length_inverse_to_rate() {
        let samples = block(0.0, 9600);
        let double = time_stretch(&samples, 2.0);
        assert_eq!(double.frame_count(), 4800);

        let half = time_stretch(&samples, 0.5);
        assert_eq!(half.frame_count(), 19_200);

        let same = time_stretch(&samples, 1.0);
        assert_eq!(same.frame_count(), 9600);
    }

    #[test]
    fn time_stretch_preserves_amplitude_roughly() {
        let samples = AudioSamples {
            sample_rate: 48_000,
            pts_seconds: 0.0,
            planes: vec![vec![0.5; 9600]],
        };
        let out = time_stretch(&samples, 1.5);
        let mid = out.planes[0][out.frame_count() / 2];
        assert!((mid - 0.5).abs() < 0.05, "DC level survives, got {mid}");
    }
}
