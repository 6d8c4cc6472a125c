//! Seek state and target-time filtering.
//!
//! A seek lands on the keyframe at or before its target, which means
//! the demuxer resumes with packets the user never asked to see. The
//! controller owns the state that makes this invisible:
//!
//! * video packets below the target are decoded (the decoder needs the
//!   reference chain) but their frames are discarded,
//! * audio packets below the target are buffered unplayed until the
//!   first in-range video frame arrives, then flushed to the decoder,
//! * a clock snap covers containers whose first in-range frame lands
//!   more than 10 ms past the target.
//!
//! Every invocation allocates a fresh monotonic session id. Any code
//! that crossed an await point re-checks its id against the current
//! one and abandons its work when superseded; this is the entire
//! cancellation model, there are no aborts.
//!
//! Late audio filtering stops the moment the first in-range video
//! frame clears `waiting_for_video_sync`. Packets already buffered are
//! flushed to the decoder then; later sub-target audio (possible with
//! loosely interleaved containers) plays as-is, since the renderer
//! clamps its clock below by the first buffer's media time and a
//! sub-10 ms overlap is inaudible.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::demux::Packet;

/// How long a seek waits for the keyframe before the watchdog accepts
/// whatever frame comes next.
pub const KEYFRAME_WATCHDOG: Duration = Duration::from_secs(5);

/// Window after a seek during which demux input is throttled.
const THROTTLE_WINDOW: Duration = Duration::from_millis(200);

/// Demux burst size while throttled.
const THROTTLED_BURST: usize = 5;

/// Demux burst size in steady state.
const NORMAL_BURST: usize = 20;

/// Packets between yields to the host scheduler while throttled.
const THROTTLED_YIELD_EVERY: usize = 3;

/// A frame landing further past the target than this snaps the clock.
const SNAP_THRESHOLD: f64 = 0.010;

/// How long to wait for an in-flight demux read before seeking anyway.
pub const DEMUX_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval while draining.
const DEMUX_DRAIN_POLL: Duration = Duration::from_millis(25);

/// What the demux loop should do with an audio packet during a seek.
#[derive(Debug, PartialEq)]
pub enum AudioAction {
    /// Feed the decoder and renderer normally.
    Play,
    /// Held by the controller until video syncs; nothing to do now.
    Buffered,
}

/// Outcome of the first in-range video frame.
#[derive(Debug, PartialEq)]
pub struct VideoSync {
    /// The target this seek was asked for.
    pub target: f64,
    /// Snap the clock here (frame overshot the target by > 10 ms).
    pub snap_clock_to: Option<f64>,
    /// Audio packets buffered below the target, now due for decoding.
    pub buffered_audio: Vec<Packet>,
}

/// Shared flags the demux loop and seek procedure coordinate through.
///
/// Everything is owned by the player task; the atomics exist because
/// the demux loop and seek procedure are separate futures, not separate
/// threads.
#[derive(Debug)]
pub struct SeekController {
    session_id: Arc<AtomicU64>,
    demux_in_flight: Arc<AtomicBool>,

    seek_target_pts: Option<f64>,
    waiting_for_video_sync: bool,
    seeking_to_keyframe: bool,
    keyframe_deadline: Option<Instant>,
    was_playing_before_seek: bool,
    throttle_until: Option<Instant>,
    buffered_audio: Vec<Packet>,
}

impl SeekController {
    /// Creates an idle controller.
    #[must_use]
    pub fn new() -> Self {
        Self {
            session_id: Arc::new(AtomicU64::new(0)),
            demux_in_flight: Arc::new(AtomicBool::new(false)),
            seek_target_pts: None,
            waiting_for_video_sync: false,
            seeking_to_keyframe: false,
            keyframe_deadline: None,
            was_playing_before_seek: false,
            throttle_until: None,
            buffered_audio: Vec::new(),
        }
    }

    /// Begins a seek session, superseding any in-flight one.
    ///
    /// Returns the new session id; every async continuation of this
    /// seek must carry it and re-check with
    /// [`is_current`](Self::is_current) after each await.
    pub fn begin(&mut self, target: f64, was_playing: bool) -> u64 {
        let id = self.session_id.fetch_add(1, Ordering::SeqCst) + 1;

        self.seek_target_pts = Some(target);
        self.waiting_for_video_sync = true;
        self.seeking_to_keyframe = true;
        self.keyframe_deadline = Some(Instant::now() + KEYFRAME_WATCHDOG);
        self.was_playing_before_seek = was_playing;
        self.buffered_audio.clear();

        debug!("seek session {id} -> {target:.3}s (was_playing: {was_playing})");
        id
    }

    /// Finishes the session: starts the post-seek throttle window and
    /// returns whether playback should resume.
    pub fn finish(&mut self) -> bool {
        self.throttle_until = Some(Instant::now() + THROTTLE_WINDOW);
        self.seeking_to_keyframe = false;
        self.keyframe_deadline = None;
        self.was_playing_before_seek
    }

    /// Whether `session` is still the active seek session.
    #[must_use]
    pub fn is_current(&self, session: u64) -> bool {
        self.session_id.load(Ordering::SeqCst) == session
    }

    /// The current session id.
    #[must_use]
    pub fn current_session(&self) -> u64 {
        self.session_id.load(Ordering::SeqCst)
    }

    /// The target of the in-progress seek, if one is resolving.
    #[must_use]
    pub fn seek_target(&self) -> Option<f64> {
        self.seek_target_pts
    }

    /// Whether the engine is between `seek()` and the first in-range
    /// video frame.
    #[must_use]
    pub fn waiting_for_video_sync(&self) -> bool {
        self.waiting_for_video_sync
    }

    /// Marks a demux read as started/finished. The demux loop brackets
    /// every `read_packet` with this.
    pub fn set_demux_in_flight(&self, in_flight: bool) {
        self.demux_in_flight.store(in_flight, Ordering::SeqCst);
    }

    /// Waits (bounded) for an in-flight demux read to complete before
    /// the flush, bailing out early when a newer seek supersedes this
    /// one.
    ///
    /// Returns `false` when superseded.
    pub async fn drain_demux(&self, session: u64) -> bool {
        let deadline = Instant::now() + DEMUX_DRAIN_TIMEOUT;
        while self.demux_in_flight.load(Ordering::SeqCst) {
            if !self.is_current(session) {
                return false;
            }
            if Instant::now() >= deadline {
                debug!("demux still in flight after {DEMUX_DRAIN_TIMEOUT:?}, seeking anyway");
                break;
            }
            tokio::time::sleep(DEMUX_DRAIN_POLL).await;
        }
        self.is_current(session)
    }

    /// Routes an audio packet during seek resolution.
    ///
    /// Sub-target audio is buffered; it becomes decodable when video
    /// syncs (feeding it earlier would play audio from before the
    /// target while the screen still shows the old position).
    pub fn route_audio(&mut self, packet: Packet) -> AudioAction {
        if !self.waiting_for_video_sync {
            return AudioAction::Play;
        }
        match self.seek_target_pts {
            Some(target) if packet.pts < target => {
                self.buffered_audio.push(packet);
                AudioAction::Buffered
            }
            _ => {
                // At or past target but video has not synced yet: hold,
                // the flush will release it in order.
                self.buffered_audio.push(packet);
                AudioAction::Buffered
            }
        }
    }

    /// Reports the first emitted video frame at or past the target.
    ///
    /// Returns `None` while not waiting for sync. Otherwise clears the
    /// wait, computes the optional clock snap and releases the buffered
    /// audio.
    pub fn on_video_synced(&mut self, frame_pts: f64) -> Option<VideoSync> {
        if !self.waiting_for_video_sync {
            return None;
        }
        let target = self.seek_target_pts.take()?;

        self.waiting_for_video_sync = false;
        let snap_clock_to = (frame_pts - target > SNAP_THRESHOLD).then_some(frame_pts);
        if let Some(snap) = snap_clock_to {
            debug!("first frame overshot target by {:.0} ms, snapping clock to {snap:.3}",
                (frame_pts - target) * 1000.0);
        }

        Some(VideoSync {
            target,
            snap_clock_to,
            buffered_audio: std::mem::take(&mut self.buffered_audio),
        })
    }

    /// The keyframe watchdog: when a seek has waited 5 s without an
    /// in-range frame, give up on filtering and accept whatever frame
    /// arrives next.
    ///
    /// Returns `true` when the watchdog fired.
    pub fn check_keyframe_watchdog(&mut self) -> bool {
        if !self.seeking_to_keyframe {
            return false;
        }
        let expired = self
            .keyframe_deadline
            .is_some_and(|deadline| Instant::now() >= deadline);
        if expired {
            warn!("keyframe seek watchdog fired, accepting next frame");
            self.seeking_to_keyframe = false;
            self.keyframe_deadline = None;
            self.seek_target_pts = None;
            self.waiting_for_video_sync = false;
        }
        expired
    }

    /// Demux burst size: reduced for 200 ms after a seek so weak
    /// devices are not buried under the post-seek packet storm.
    #[must_use]
    pub fn demux_burst_size(&self) -> usize {
        if self.is_throttled() {
            THROTTLED_BURST
        } else {
            NORMAL_BURST
        }
    }

    /// Whether the demux loop should yield to the host scheduler after
    /// `packets_read` packets of the current burst.
    #[must_use]
    pub fn should_yield(&self, packets_read: usize) -> bool {
        self.is_throttled() && packets_read % THROTTLED_YIELD_EVERY == 0 && packets_read > 0
    }

    fn is_throttled(&self) -> bool {
        self.throttle_until
            .is_some_and(|until| Instant::now() < until)
    }
}

impl Default for SeekController {
    fn default() -> Self {
        Self::new()
    }
}
