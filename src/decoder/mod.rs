//! Decoder orchestration.
//!
//! Each elementary stream gets one decoder component that owns the
//! choice between a hardware backend (the platform's codec API, behind
//! the [`HardwareVideo`]/[`HardwareAudio`] contracts) and a software
//! fallback. The submodules carry the per-kind logic:
//!
//! * [`video`]: configure/decode with the full recovery state machine
//! * [`audio`]: decode plus resampling to the renderer's layout
//! * [`subtitle`]: cue extraction and lifetime management
//!
//! Decoders never queue output beyond a single pending buffer. Queueing
//! and pacing belong to the scheduler and renderer.

pub mod audio;
pub mod subtitle;
pub mod video;

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::demux::parser::RgbaImage;
use crate::track::{ColorPrimaries, ColorSpace, ColorTransfer};

/// Color metadata handed to a hardware decoder configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VideoColorInfo {
    pub primaries: ColorPrimaries,
    pub transfer: ColorTransfer,
    pub matrix: ColorSpace,
}

/// One hardware decoder configuration attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoDecoderConfig {
    /// Canonical codec string, e.g. `hvc1.2.4.L153.B0`.
    pub codec_string: String,
    pub coded_width: u32,
    pub coded_height: u32,
    /// `None` strips color metadata from the attempt; some platform
    /// decoders reject configurations over metadata they could ignore.
    pub color: Option<VideoColorInfo>,
    /// The configuration record, possibly profile-patched.
    pub extradata: Option<Bytes>,
}

/// One encoded unit handed to a decode backend.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodeRequest {
    pub data: Bytes,
    pub pts: f64,
    pub dts: f64,
    /// Container-level keyframe claim.
    pub keyframe: bool,
}

/// Pixel storage of a decoded frame.
#[derive(Clone, Debug, PartialEq)]
pub enum FramePixels {
    /// Opaque GPU texture handle owned by the hardware backend.
    Texture { handle: u64 },
    /// CPU RGBA from the software path.
    Rgba(RgbaImage),
}

/// A decoded video frame with a single close obligation.
///
/// Closing releases the backing texture (or drops the CPU pixels) and
/// must happen exactly once; the scheduler, rasterizer and
/// `last_presented` slot pass the obligation along explicitly. A frame
/// dropped without `close()` logs a leak in debug builds.
#[derive(Debug)]
pub struct VideoFrame {
    pub pts_seconds: f64,
    pub display_width: u32,
    pub display_height: u32,
    pixels: Option<FramePixels>,
}

impl VideoFrame {
    /// Wraps freshly decoded pixels.
    #[must_use]
    pub fn new(pts_seconds: f64, display_width: u32, display_height: u32, pixels: FramePixels) -> Self {
        Self {
            pts_seconds,
            display_width,
            display_height,
            pixels: Some(pixels),
        }
    }

    /// The pixel payload; `None` once closed.
    #[must_use]
    pub fn pixels(&self) -> Option<&FramePixels> {
        self.pixels.as_ref()
    }

    /// Releases the frame's pixel resources. Idempotence is *not*
    /// offered on purpose: a second close is a bookkeeping bug and
    /// panics in debug builds.
    pub fn close(&mut self) {
        debug_assert!(self.pixels.is_some(), "video frame closed twice");
        self.pixels = None;
    }

    /// Whether [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pixels.is_none()
    }

    /// Copies the frame for the redraw slot. The clone carries its own
    /// close obligation.
    #[must_use]
    pub fn clone_for_redraw(&self) -> Option<Self> {
        self.pixels.clone().map(|pixels| Self {
            pts_seconds: self.pts_seconds,
            display_width: self.display_width,
            display_height: self.display_height,
            pixels: Some(pixels),
        })
    }
}

impl Drop for VideoFrame {
    fn drop(&mut self) {
        if self.pixels.is_some() {
            debug!(
                "video frame at pts {:.3} dropped without close",
                self.pts_seconds
            );
        }
    }
}

/// Why a video decode or configure attempt failed.
///
/// The recovery state machine dispatches on this; backends are required
/// to classify their platform's error codes into these categories.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VideoDecodeError {
    /// The packet was marked as a key frame but the decoder rejected it
    /// as one (open-GOP CRA frame after a flush, typically).
    #[error("key frame required but frame was rejected as one")]
    KeyFrameRejected,

    /// The configuration's profile is not handled by this decoder.
    #[error("unsupported profile {profile}")]
    UnsupportedProfile { profile: u8 },

    /// A decode error that a reset may clear.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The backend is gone and must be recreated.
    #[error("decoder fatal: {0}")]
    Fatal(String),
}

/// The platform video decoder contract.
///
/// Implemented by the embedder over whatever the platform offers.
/// All methods are synchronous except the support probe, which may ask
/// the driver.
pub trait HardwareVideo: Send {
    /// Asks the platform whether it can decode `config` at all.
    fn probe(&self, config: &VideoDecoderConfig) -> BoxFuture<'_, bool>;

    /// (Re)configures the decoder. Implicitly flushes.
    ///
    /// # Errors
    ///
    /// Returns a classified error; `UnsupportedProfile` triggers the
    /// orchestrator's profile-swap path.
    fn configure(&mut self, config: &VideoDecoderConfig) -> Result<(), VideoDecodeError>;

    /// Decodes one packet, emitting at most one frame.
    ///
    /// Hardware decoders reorder internally; `None` means the frame for
    /// this packet (or an earlier one) is still buffered.
    ///
    /// # Errors
    ///
    /// Returns a classified error for the recovery state machine.
    fn decode(&mut self, request: &DecodeRequest) -> Result<Option<VideoFrame>, VideoDecodeError>;

    /// Copies a decoded frame's pixels back to the CPU, when the
    /// platform supports readback. The preview pipeline uses this to
    /// turn a texture frame into an image; `None` sends it down the
    /// software fallback instead.
    fn read_back(&mut self, frame: &VideoFrame) -> Option<RgbaImage> {
        let _ = frame;
        None
    }

    /// Drains and closes every in-flight frame.
    fn flush(&mut self);

    /// Fast-path reset keeping the configuration.
    ///
    /// # Errors
    ///
    /// Returns error when the instance is beyond reset and must be
    /// recreated.
    fn reset(&mut self) -> Result<(), VideoDecodeError>;

    /// Releases the decoder instance.
    fn close(&mut self);
}

/// Factory for hardware video decoder instances.
///
/// Recovery sometimes needs to recreate the backend outright, so the
/// orchestrator owns a factory rather than a single instance.
pub trait HardwareVideoFactory: Send + Sync {
    fn create(&self) -> Box<dyn HardwareVideo>;
}

/// Decoded audio in the engine's interchange layout: 32-bit float,
/// planar (one `Vec` per channel), at the stated rate.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioSamples {
    pub sample_rate: u32,
    pub pts_seconds: f64,
    /// One plane per channel, all the same length.
    pub planes: Vec<Vec<f32>>,
}

impl AudioSamples {
    /// Channel count.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.planes.len()
    }

    /// Frames (samples per channel).
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.planes.first().map_or(0, Vec::len)
    }

    /// Duration of the block in seconds.
    #[must_use]
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / f64::from(self.sample_rate)
    }
}

/// The platform audio decoder contract, mirroring [`HardwareVideo`].
pub trait HardwareAudio: Send {
    /// Whether the platform decodes `codec_name` with the given
    /// extradata.
    fn supports(&self, codec_name: &str, extradata: Option<&[u8]>) -> bool;

    /// Configures for a stream.
    ///
    /// # Errors
    ///
    /// Returns a message describing the rejection.
    fn configure(
        &mut self,
        codec_name: &str,
        sample_rate: u32,
        channels: u32,
        extradata: Option<&[u8]>,
    ) -> Result<(), String>;

    /// Decodes one packet into at most one sample block.
    ///
    /// # Errors
    ///
    /// Returns a message; audio errors are never fatal to the session.
    fn decode(&mut self, request: &DecodeRequest) -> Result<Option<AudioSamples>, String>;

    /// Drops any buffered output.
    fn flush(&mut self);

    /// Releases the decoder instance.
    fn close(&mut self);
}
