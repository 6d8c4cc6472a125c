//! Output contracts: the video rasterizer and the audio device.
//!
//! Both ends of the pipeline are host property. The engine talks to
//! them through two small traits so that the scheduler and renderer
//! stay testable and the embedder keeps control over surfaces and
//! devices. A cpal-backed [`CpalOutput`] is included for headless
//! playback; raster sinks are always supplied by the embedder.

use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;

use crate::decoder::subtitle::SubtitleCue;
use crate::decoder::{AudioSamples, VideoFrame};
use crate::error::Result;
use crate::track::{ColorPrimaries, ColorTransfer};

/// How a decoded frame maps into the output surface.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FitMode {
    /// Letterbox: whole frame visible, aspect preserved.
    #[default]
    Contain,
    /// Fill the surface, aspect preserved, overflow cropped.
    Cover,
    /// Stretch to the surface, aspect ignored.
    Fill,
    /// Cover scaled further by the user's zoom factor.
    Zoom,
    /// The embedder positions the frame itself.
    Control,
}

/// Rasterizer configuration, set once per video track.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterConfig {
    pub width: u32,
    pub height: u32,
    pub color_primaries: ColorPrimaries,
    pub color_transfer: ColorTransfer,
    pub frame_rate: f64,
    pub rotation_degrees: u32,
    pub is_hdr: bool,
}

/// Where and how large a frame is drawn, in surface pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Placement {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Applied as a transform by the sink; the pixel data is never
    /// rotated on the CPU.
    pub rotation_degrees: u32,
}

/// The video output surface contract.
///
/// Uploading a frame does not transfer its close obligation; the
/// scheduler closes (or retains) frames after `present` returns.
pub trait RasterSink: Send {
    /// Applies track-level configuration before the first frame.
    fn configure(&mut self, config: &RasterConfig);

    /// Current surface size in pixels.
    fn viewport(&self) -> (u32, u32);

    /// Uploads and draws one frame at the given placement.
    fn present(&mut self, frame: &VideoFrame, placement: &Placement);

    /// Replaces the subtitle overlay content. `None` clears it.
    fn render_subtitle(&mut self, cue: Option<&SubtitleCue>);

    /// Clears the surface (stop, error).
    fn clear(&mut self);
}

/// The audio output device contract.
///
/// The device exposes its own clock; all scheduling happens in that
/// clock's domain. `commit` is sample-accurate: the block starts
/// playing exactly at the given device time.
pub trait OutputDevice: Send {
    /// Device clock in seconds. Monotonic while running.
    fn now(&self) -> f64;

    /// Reported output latency in seconds (hardware + mixer).
    fn output_latency(&self) -> f64;

    /// Device output sample rate.
    fn sample_rate(&self) -> u32;

    /// Schedules a block to start at device time `at`, consuming input
    /// frames at `rate` (1.0 = native).
    fn commit(&mut self, samples: &AudioSamples, at: f64, rate: f64);

    /// Stops and discards everything scheduled but not yet played.
    fn stop_all(&mut self);

    /// Output gain, 0.0..=1.0. Zero keeps the device running.
    fn set_gain(&mut self, gain: f32);

    /// Starts or resumes the device. May suspend on host autoplay
    /// policy until a user gesture arrives.
    fn resume(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Suspends the device without discarding schedule state.
    fn suspend(&mut self);

    /// Whether the device clock is advancing.
    fn is_running(&self) -> bool;
}

/// One scheduled block in the cpal mixer, ordered by start time.
struct ScheduledBlock {
    /// Start position in device frames.
    start_frame: u64,
    /// Playback-rate step through the source per output frame.
    step: f64,
    /// Read cursor in source frames.
    cursor: f64,
    planes: Vec<Vec<f32>>,
}

impl ScheduledBlock {
    fn is_done(&self) -> bool {
        let len = self.planes.first().map_or(0, Vec::len);
        #[expect(clippy::cast_precision_loss)]
        let end = len.saturating_sub(1) as f64;
        self.cursor >= end
    }
}

impl PartialEq for ScheduledBlock {
    fn eq(&self, other: &Self) -> bool {
        self.start_frame == other.start_frame
    }
}
impl Eq for ScheduledBlock {}
impl PartialOrd for ScheduledBlock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledBlock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Min-heap on start frame.
        other.start_frame.cmp(&self.start_frame)
    }
}

/// Mixer state shared with the cpal callback.
struct MixerState {
    /// Frames written to the device since creation.
    position: u64,
    gain: f32,
    running: bool,
    queue: BinaryHeap<ScheduledBlock>,
}

/// A cpal-backed output device with sample-accurate scheduling.
///
/// The device clock is the number of frames the callback has consumed,
/// divided by the rate; blocks are mixed in when the clock passes their
/// start frame. Stereo output only, which is what the decoder's
/// downmix produces.
///
/// `cpal::Stream` is not `Send`, so the stream lives on a dedicated
/// holder thread; this handle carries only the shared mixer state.
pub struct CpalOutput {
    state: Arc<Mutex<MixerState>>,
    sample_rate: u32,
    latency: f64,
    /// Dropping the sender releases the holder thread and the stream.
    _shutdown: std::sync::mpsc::Sender<()>,
}

impl CpalOutput {
    /// Opens the default output device at its native configuration.
    ///
    /// # Errors
    ///
    /// Returns error if no output device exists or the stream cannot
    /// be built.
    pub fn open() -> Result<Self> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let state = Arc::new(Mutex::new(MixerState {
            position: 0,
            gain: 1.0,
            running: false,
            queue: BinaryHeap::new(),
        }));

        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<u32>>();

        let thread_state = Arc::clone(&state);
        std::thread::Builder::new()
            .name("kinema-audio".into())
            .spawn(move || {
                let build = || -> Result<(cpal::Stream, u32)> {
                    let host = cpal::default_host();
                    let device = host.default_output_device().ok_or_else(|| {
                        crate::error::Error::not_found("default audio output device not found")
                    })?;
                    let config = device.default_output_config()?;
                    let sample_rate = config.sample_rate().0;
                    let channels = usize::from(config.channels());

                    let callback_state = Arc::clone(&thread_state);
                    let stream = device.build_output_stream(
                        &config.into(),
                        move |data: &mut [f32], _| {
                            Self::fill(&callback_state, data, channels);
                        },
                        |e| error!("audio output stream error: {e}"),
                        None,
                    )?;
                    stream.play()?;
                    Ok((stream, sample_rate))
                };

                match build() {
                    Ok((stream, sample_rate)) => {
                        let _ = ready_tx.send(Ok(sample_rate));
                        // Park until the handle drops; the stream must
                        // stay alive on this thread.
                        let _ = shutdown_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| crate::error::Error::internal(e.to_string()))?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| crate::error::Error::unavailable("audio thread died during setup"))??;

        info!("audio output open at {sample_rate} Hz");
        Ok(Self {
            state,
            sample_rate,
            // cpal does not report latency; a frame of the default
            // buffer size is a workable estimate.
            latency: 1024.0 / f64::from(sample_rate),
            _shutdown: shutdown_tx,
        })
    }

    /// The mixer callback: advances the clock and mixes due blocks.
    fn fill(state: &Arc<Mutex<MixerState>>, data: &mut [f32], channels: usize) {
        data.fill(0.0);
        let mut state = state.lock().expect("mixer lock poisoned");
        let frames = (data.len() / channels) as u64;

        if !state.running {
            return;
        }

        let gain = state.gain;
        let start = state.position;

        // Blocks whose window overlaps this callback get mixed; the
        // heap keeps them start-ordered.
        let mut pending: Vec<ScheduledBlock> = Vec::new();
        while let Some(block) = state.queue.peek() {
            if block.start_frame >= start + frames {
                break;
            }
            pending.push(state.queue.pop().expect("peeked block"));
        }

        for mut block in pending {
            let offset = block.start_frame.saturating_sub(start) as usize;
            for frame in offset..frames as usize {
                if block.is_done() {
                    break;
                }
                #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let base = block.cursor.floor() as usize;
                let frac = (block.cursor - block.cursor.floor()) as f32;

                for (channel, plane) in block.planes.iter().enumerate().take(channels) {
                    let a = plane[base.min(plane.len() - 1)];
                    let b = plane[(base + 1).min(plane.len() - 1)];
                    let sample = (a + (b - a) * frac) * gain;
                    data[frame * channels + channel] += sample;
                }
                // Mono blocks feed both sides.
                if block.planes.len() == 1 && channels > 1 {
                    let value = data[frame * channels];
                    data[frame * channels + 1] += value;
                }

                block.cursor += block.step;
            }

            if !block.is_done() {
                // Continues into the next callback.
                block.start_frame = start + frames;
                state.queue.push(block);
            }
        }

        state.position = start + frames;
    }
}

impl OutputDevice for CpalOutput {
    fn now(&self) -> f64 {
        let state = self.state.lock().expect("mixer lock poisoned");
        #[expect(clippy::cast_precision_loss)]
        let seconds = state.position as f64 / f64::from(self.sample_rate);
        seconds
    }

    fn output_latency(&self) -> f64 {
        self.latency
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn commit(&mut self, samples: &AudioSamples, at: f64, rate: f64) {
        let mut state = self.state.lock().expect("mixer lock poisoned");
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let start_frame = (at.max(0.0) * f64::from(self.sample_rate)) as u64;

        // The block is stored at the source rate; the step covers both
        // rate conversion and playback-rate scaling.
        let step = f64::from(samples.sample_rate) / f64::from(self.sample_rate) * rate;

        state.queue.push(ScheduledBlock {
            start_frame,
            step,
            cursor: 0.0,
            planes: samples.planes.clone(),
        });
    }

    fn stop_all(&mut self) {
        self.state
            .lock()
            .expect("mixer lock poisoned")
            .queue
            .clear();
    }

    fn set_gain(&mut self, gain: f32) {
        self.state.lock().expect("mixer lock poisoned").gain = gain.clamp(0.0, 1.0);
    }

    fn resume(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.state.lock().expect("mixer lock poisoned").running = true;
            Ok(())
        })
    }

    fn suspend(&mut self) {
        self.state.lock().expect("mixer lock poisoned").running = false;
    }

    fn is_running(&self) -> bool {
        self.state.lock().expect("mixer lock poisoned").running
    }
}
