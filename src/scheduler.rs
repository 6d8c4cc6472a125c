//! The video presentation scheduler.
//!
//! Owns the pts-ordered queue of decoded frames and the per-tick
//! presentation decision. The tick runs at display cadence (the host's
//! frame callback); each one selects the latest frame due against the
//! sync clock, drops what will never be shown, animates the fit-mode
//! placement and hands the frame to the raster sink.
//!
//! Ownership: queued frames belong to the queue. Presenting moves the
//! frame into the `last_presented` slot (replacing and closing the
//! previous occupant) so that a resize during pause can redraw without
//! re-decoding. Every other exit path closes the frame on the spot.

use std::collections::VecDeque;

use crate::decoder::VideoFrame;
use crate::sink::{FitMode, Placement, RasterSink};
use crate::track::VideoTrack;

/// Nominal queue capacity; the demux loop treats a full queue as
/// back-pressure.
pub const QUEUE_CAPACITY: usize = 120;

/// Hard ceiling: at 10x capacity incoming frames are dropped.
const EMERGENCY_CAPACITY: usize = QUEUE_CAPACITY * 10;

/// A frame is "due" slightly before its pts to absorb timer jitter.
const DUE_TOLERANCE: f64 = 0.005;

/// Stale frames are dropped once they trail the clock by this much (or
/// two frame intervals, whichever is larger).
const STALE_FLOOR: f64 = 2.0;

/// Below this frame rate the low-fps memory pruning applies.
const LOW_FPS_THRESHOLD: f64 = 20.0;

/// Tolerance before the next target when pruning low-fps queues.
const LOW_FPS_TOLERANCE: f64 = 0.050;

/// Low-fps pruning keeps frames within this window behind the target.
const LOW_FPS_KEEP_BEHIND: f64 = 0.200;

/// Per-tick interpolation factor for fit-mode animation.
const SCALE_LERP: f64 = 0.15;

/// The frame queue and presentation logic.
pub struct FrameScheduler {
    /// Frames sorted by pts ascending.
    queue: VecDeque<VideoFrame>,
    /// The frame currently on screen, retained for redraw.
    last_presented: Option<VideoFrame>,
    last_presented_pts: Option<f64>,

    frame_rate: f64,
    rotation_degrees: u32,
    video_width: u32,
    video_height: u32,

    fit_mode: FitMode,
    zoom: f64,
    /// Animated placement state; `None` before the first present.
    current_rect: Option<[f64; 4]>,
    /// Set after a seek so the next present snaps instead of lerping.
    snap_next: bool,

    /// Frames dropped by the emergency overflow, for diagnostics.
    overflow_dropped: u64,
}

impl FrameScheduler {
    /// Creates a scheduler for a video track.
    #[must_use]
    pub fn new(track: &VideoTrack) -> Self {
        Self {
            queue: VecDeque::new(),
            last_presented: None,
            last_presented_pts: None,
            frame_rate: track.frame_rate,
            rotation_degrees: track.rotation_degrees,
            video_width: track.width,
            video_height: track.height,
            fit_mode: FitMode::default(),
            zoom: 1.0,
            current_rect: None,
            snap_next: true,
            overflow_dropped: 0,
        }
    }

    /// Nominal seconds between frames; 1/24 when the rate is unknown.
    #[must_use]
    pub fn frame_interval(&self) -> f64 {
        if self.frame_rate > 0.0 {
            1.0 / self.frame_rate
        } else {
            1.0 / 24.0
        }
    }

    /// Whether the demux loop should stop feeding video.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.queue.len() >= QUEUE_CAPACITY
    }

    /// Queued frame count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The pts of the most recently presented frame.
    #[must_use]
    pub fn last_presented_pts(&self) -> Option<f64> {
        self.last_presented_pts
    }

    /// Inserts a decoded frame, keeping the queue pts-sorted.
    ///
    /// Monotonic arrivals append in O(1); hardware decoders that
    /// reorder their output callbacks fall back to binary insertion.
    /// Beyond the emergency ceiling the incoming frame is dropped.
    pub fn insert(&mut self, mut frame: VideoFrame) {
        if self.queue.len() >= EMERGENCY_CAPACITY {
            self.overflow_dropped += 1;
            warn!(
                "frame queue overflow, dropping frame at {:.3} ({} dropped)",
                frame.pts_seconds, self.overflow_dropped
            );
            frame.close();
            return;
        }

        let monotonic = self
            .queue
            .back()
            .is_none_or(|back| back.pts_seconds <= frame.pts_seconds);
        if monotonic {
            self.queue.push_back(frame);
            return;
        }

        let at = self
            .queue
            .partition_point(|queued| queued.pts_seconds <= frame.pts_seconds);
        self.queue.insert(at, frame);
    }

    /// Sets how frames map onto the surface.
    pub fn set_fit_mode(&mut self, mode: FitMode) {
        self.fit_mode = mode;
    }

    /// Sets the zoom factor used by [`FitMode::Zoom`].
    pub fn set_zoom(&mut self, zoom: f64) {
        self.zoom = zoom.clamp(1.0, 8.0);
    }

    /// Makes the next present snap its placement instead of animating.
    /// Called after seeks, where a glide would look like drift.
    pub fn snap_on_next_present(&mut self) {
        self.snap_next = true;
    }

    /// Empties the queue, closing every frame. The `last_presented`
    /// slot survives so a paused surface can still redraw.
    pub fn clear(&mut self) {
        for mut frame in self.queue.drain(..) {
            frame.close();
        }
    }

    /// Releases everything including the redraw slot.
    pub fn destroy(&mut self) {
        self.clear();
        if let Some(mut frame) = self.last_presented.take() {
            frame.close();
        }
        self.last_presented_pts = None;
    }

    /// Redraws the retained frame (resize while paused).
    pub fn redraw(&mut self, sink: &mut dyn RasterSink) {
        if let Some(frame) = &self.last_presented {
            let placement = self.target_rect(sink.viewport());
            let placement = Placement {
                x: placement[0],
                y: placement[1],
                width: placement[2],
                height: placement[3],
                rotation_degrees: self.rotation_degrees,
            };
            sink.present(frame, &placement);
        }
    }

    /// One presentation tick.
    ///
    /// `now` is the sync clock's media time. Returns the pts of the
    /// frame presented this tick, if any.
    pub fn tick(&mut self, now: f64, sink: &mut dyn RasterSink) -> Option<f64> {
        let interval = self.frame_interval();

        // Latest frame that is due (pts within tolerance of the clock).
        let due_index = self
            .queue
            .iter()
            .rposition(|frame| frame.pts_seconds <= now + DUE_TOLERANCE);

        // Frames behind the selected one are superseded: either stale
        // past the drop cutoff, or skipped by a clock jump. Neither
        // will ever be shown.
        let stale_cutoff = now - (2.0 * interval).max(STALE_FLOOR);
        let selected = match due_index {
            Some(index) => {
                for mut skipped in self.queue.drain(..index) {
                    if skipped.pts_seconds < stale_cutoff {
                        trace!("dropping stale frame at {:.3}", skipped.pts_seconds);
                    } else {
                        trace!("skipping late frame at {:.3}", skipped.pts_seconds);
                    }
                    skipped.close();
                }
                self.queue.pop_front()
            }
            None => {
                self.prune_low_fps(now, interval);

                // Nothing due: present the next frame early when it is
                // within one frame interval, rather than stuttering.
                let next_due_soon = self
                    .queue
                    .front()
                    .is_some_and(|front| front.pts_seconds - now < interval);
                if next_due_soon {
                    self.queue.pop_front()
                } else {
                    None
                }
            }
        }?;

        let placement = self.placement_for(sink.viewport());
        sink.present(&selected, &placement);

        let pts = selected.pts_seconds;
        if let Some(mut previous) = self.last_presented.replace(selected) {
            previous.close();
        }
        self.last_presented_pts = Some(pts);
        Some(pts)
    }

    /// Bounds queue memory for low-frame-rate content.
    ///
    /// A 4K software-decoded slideshow can hold seconds of decoded
    /// frames per queue slot; while waiting for a far-off target, keep
    /// only frames near it.
    fn prune_low_fps(&mut self, now: f64, interval: f64) {
        if self.frame_rate <= 0.0 || self.frame_rate >= LOW_FPS_THRESHOLD {
            return;
        }
        let target = self.last_presented_pts.map_or_else(
            || self.queue.front().map_or(now, |f| f.pts_seconds),
            |pts| pts + interval,
        );
        if now + LOW_FPS_TOLERANCE >= target {
            return;
        }

        while let Some(front) = self.queue.front() {
            if front.pts_seconds >= target - LOW_FPS_KEEP_BEHIND {
                break;
            }
            let mut pruned = self.queue.pop_front().expect("front exists");
            pruned.close();
        }
    }

    /// The animated placement for this tick.
    fn placement_for(&mut self, viewport: (u32, u32)) -> Placement {
        let target = self.target_rect(viewport);

        let rect = match (self.current_rect, self.snap_next) {
            (Some(current), false) => {
                let mut rect = [0.0; 4];
                for i in 0..4 {
                    rect[i] = current[i] + (target[i] - current[i]) * SCALE_LERP;
                }
                rect
            }
            _ => target,
        };
        self.snap_next = false;
        self.current_rect = Some(rect);

        Placement {
            x: rect[0],
            y: rect[1],
            width: rect[2],
            height: rect[3],
            rotation_degrees: self.rotation_degrees,
        }
    }

    /// The target rectangle for the current fit mode, centered in the
    /// viewport. Rotation by 90/270 swaps the aspect the fit sees.
    fn target_rect(&self, viewport: (u32, u32)) -> [f64; 4] {
        let (vw, vh) = (f64::from(viewport.0), f64::from(viewport.1));
        let (mut fw, mut fh) = (f64::from(self.video_width), f64::from(self.video_height));
        if matches!(self.rotation_degrees, 90 | 270) {
            std::mem::swap(&mut fw, &mut fh);
        }
        if fw <= 0.0 || fh <= 0.0 || vw <= 0.0 || vh <= 0.0 {
            return [0.0, 0.0, vw, vh];
        }

        let (width, height) = match self.fit_mode {
            FitMode::Fill => (vw, vh),
            FitMode::Contain | FitMode::Control => {
                let s = (vw / fw).min(vh / fh);
                (fw * s, fh * s)
            }
            FitMode::Cover => {
                let s = (vw / fw).max(vh / fh);
                (fw * s, fh * s)
            }
            FitMode::Zoom => {
                let s = (vw / fw).max(vh / fh) * self.zoom;
                (fw * s, fh * s)
            }
        };

        [(vw - width) / 2.0, (vh - height) / 2.0, width, height]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::FramePixels;
    use crate::sink::testing::RecordingRaster;
    use crate::track::{ColorPrimaries, ColorSpace, ColorTransfer};

    fn track(frame_rate: f64) -> VideoTrack {
        VideoTrack {
            id: 0,
            codec_name: "h264".into(),
            width: 1920,
            height: 1080,
            frame_rate,
            profile: 100,
            level: 40,
            color_primaries: ColorPrimaries::Bt709,
            color_transfer: ColorTransfer::Bt709,
            color_space: ColorSpace::Bt709,
            rotation_degrees: 0,
            is_hdr: false,
            extradata: None,
        }
    }

    fn frame(pts: f64) -> VideoFrame {
        VideoFrame::new(pts, 1920, 1080, FramePixels::Texture { handle: 0 })
    }

    #[test]
    fn queue_stays_sorted_under_reordered_insertion() {
        let mut scheduler = FrameScheduler::new(&track(24.0));
        scheduler.insert(frame(0.0));
        scheduler.insert(frame(0.3));
        // Hardware reorder: 0.1 arrives after 0.3.
        scheduler.insert(frame(0.1));
        scheduler.insert(frame(0.2));

        let mut sink = RecordingRaster::new(1920, 1080);
        // Everything is due; latest wins, earlier are skipped.
        let presented = scheduler.tick(0.3, &mut sink).unwrap();
        assert_eq!(presented, 0.3);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn selects_latest_due_frame_and_keeps_future_ones() {
        let mut scheduler = FrameScheduler::new(&track(24.0));
        for pts in [0.0, 0.5, 1.0, 2.0] {
            scheduler.insert(frame(pts));
        }

        let mut sink = RecordingRaster::new(1920, 1080);
        assert_eq!(scheduler.tick(1.0, &mut sink), Some(1.0));
        assert_eq!(scheduler.len(), 1, "the 2.0 frame stays queued");
        assert_eq!(scheduler.last_presented_pts(), Some(1.0));
    }

    #[test]
    fn due_tolerance_presents_slightly_early_frames() {
        let mut scheduler = FrameScheduler::new(&track(24.0));
        scheduler.insert(frame(1.004));

        let mut sink = RecordingRaster::new(1920, 1080);
        assert_eq!(scheduler.tick(1.0, &mut sink), Some(1.004));
    }

    #[test]
    fn early_by_one_frame_interval_is_acceptable() {
        let mut scheduler = FrameScheduler::new(&track(24.0));
        scheduler.insert(frame(1.03));

        let mut sink = RecordingRaster::new(1920, 1080);
        // 1.03 is one interval (41.7ms) ahead of 1.0: present early.
        assert_eq!(scheduler.tick(1.0, &mut sink), Some(1.03));
    }

    #[test]
    fn distant_future_frames_are_not_presented() {
        let mut scheduler = FrameScheduler::new(&track(24.0));
        scheduler.insert(frame(5.0));

        let mut sink = RecordingRaster::new(1920, 1080);
        assert_eq!(scheduler.tick(1.0, &mut sink), None);
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn stale_frames_dropped_alongside_selection() {
        let mut scheduler = FrameScheduler::new(&track(24.0));
        scheduler.insert(frame(0.0));
        scheduler.insert(frame(2.9));
        scheduler.insert(frame(10.0));

        let mut sink = RecordingRaster::new(1920, 1080);
        // Clock at 3.0: 0.0 trails by > 2 s and is dropped, 2.9 is the
        // late-but-presentable selection, 10.0 is far future.
        assert_eq!(scheduler.tick(3.0, &mut sink), Some(2.9));
        assert_eq!(scheduler.len(), 1);
        scheduler.destroy();
    }

    #[test]
    fn emergency_overflow_drops_incoming() {
        let mut scheduler = FrameScheduler::new(&track(24.0));
        for i in 0..EMERGENCY_CAPACITY {
            scheduler.insert(frame(i as f64));
        }
        assert_eq!(scheduler.len(), EMERGENCY_CAPACITY);

        scheduler.insert(frame(9999.0));
        assert_eq!(scheduler.len(), EMERGENCY_CAPACITY);
        assert!(scheduler.is_full());
        scheduler.destroy();
    }

    #[test]
    fn back_pressure_at_nominal_capacity() {
        let mut scheduler = FrameScheduler::new(&track(24.0));
        for i in 0..QUEUE_CAPACITY {
            scheduler.insert(frame(i as f64));
        }
        assert!(scheduler.is_full());
        scheduler.destroy();
    }

    #[test]
    fn present_replaces_and_closes_previous_retained_frame() {
        let mut scheduler = FrameScheduler::new(&track(24.0));
        scheduler.insert(frame(0.0));
        scheduler.insert(frame(1.0));

        let mut sink = RecordingRaster::new(1920, 1080);
        scheduler.tick(0.0, &mut sink);
        scheduler.tick(1.0, &mut sink);

        assert_eq!(sink.presented.len(), 2);
        assert_eq!(scheduler.last_presented_pts(), Some(1.0));

        // Redraw uses the retained frame without consuming it.
        scheduler.redraw(&mut sink);
        assert_eq!(sink.presented.len(), 3);
        assert_eq!(sink.presented[2].0, 1.0);
        scheduler.destroy();
    }

    #[test]
    fn placement_lerps_between_fit_modes_and_snaps_after_seek() {
        let mut scheduler = FrameScheduler::new(&track(24.0));
        let mut sink = RecordingRaster::new(960, 1080);

        scheduler.insert(frame(0.0));
        scheduler.tick(0.0, &mut sink);
        let contain = sink.presented[0].1;
        // 1920x1080 into 960x1080 contained: 960x540.
        assert!((contain.width - 960.0).abs() < 1e-6);
        assert!((contain.height - 540.0).abs() < 1e-6);

        scheduler.set_fit_mode(FitMode::Cover);
        scheduler.insert(frame(0.1));
        scheduler.tick(0.1, &mut sink);
        let mid = sink.presented[1].1;
        // One lerp step toward cover (1920x1080): 15% of the way.
        assert!(mid.width > contain.width);
        assert!(mid.width < 1920.0);

        scheduler.snap_on_next_present();
        scheduler.insert(frame(0.2));
        scheduler.tick(0.2, &mut sink);
        let snapped = sink.presented[2].1;
        assert!((snapped.width - 1920.0).abs() < 1e-6);
        scheduler.destroy();
    }

    #[test]
    fn rotation_swaps_fit_aspect() {
        let mut rotated = track(24.0);
        rotated.rotation_degrees = 90;
        let mut scheduler = FrameScheduler::new(&rotated);
        let mut sink = RecordingRaster::new(1080, 1920);

        scheduler.insert(frame(0.0));
        scheduler.tick(0.0, &mut sink);
        let placement = sink.presented[0].1;
        // Rotated 1920x1080 fits a portrait viewport fully.
        assert!((placement.width - 1080.0).abs() < 1e-6);
        assert!((placement.height - 1920.0).abs() < 1e-6);
        assert_eq!(placement.rotation_degrees, 90);
        scheduler.destroy();
    }

    #[test]
    fn low_fps_prunes_frames_far_behind_next_target() {
        // 2 fps: the next target after presenting 0.0 is 0.5.
        let mut scheduler = FrameScheduler::new(&track(2.0));
        let mut sink = RecordingRaster::new(1920, 1080);

        scheduler.insert(frame(0.0));
        assert_eq!(scheduler.tick(0.0, &mut sink), Some(0.0));

        // Leftover frames more than 200 ms before the target get
        // pruned while the clock has not reached it.
        scheduler.insert(frame(0.1));
        scheduler.insert(frame(0.2));
        scheduler.insert(frame(0.6));
        assert_eq!(scheduler.tick(0.01, &mut sink), None);
        assert_eq!(scheduler.len(), 1, "only the near-target frame stays");
        scheduler.destroy();
    }

    #[test]
    fn clear_keeps_redraw_slot() {
        let mut scheduler = FrameScheduler::new(&track(24.0));
        let mut sink = RecordingRaster::new(1920, 1080);

        scheduler.insert(frame(0.0));
        scheduler.tick(0.0, &mut sink);
        scheduler.insert(frame(1.0));
        scheduler.clear();

        assert!(scheduler.is_empty());
        scheduler.redraw(&mut sink);
        assert_eq!(sink.presented.len(), 2);
        scheduler.destroy();
    }
}
