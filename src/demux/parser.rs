//! The container parser contract.
//!
//! The parsing library itself is a consumed black box: it knows the
//! container grammar, yields encoded packets, and can decode subtitles
//! and (as the software fallback) raw RGBA video. The engine drives it
//! exclusively through these traits.
//!
//! Parsers are synchronous and blocking. All file access goes through
//! the [`ParserIo`] handle a call receives, which is where the
//! [bridge](super) suspends the call stack while async reads complete.
//! Offsets and sizes are 64-bit everywhere; containers regularly exceed
//! 4 GiB.

use bytes::Bytes;

use crate::error::Result;
use crate::track::{ColorPrimaries, ColorSpace, ColorTransfer, SubtitleKind};

/// Blocking I/O handle the parser reads the container through.
///
/// Implementations may block the calling thread; parsers must never be
/// driven from an async context directly.
pub trait ParserIo: Send {
    /// Total size of the container in bytes.
    fn size(&mut self) -> u64;

    /// Reads up to `buf.len()` bytes at `offset`, returning the count.
    /// Zero means EOF.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the underlying source failed; the
    /// parser surfaces it from whatever call triggered the read.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// One encoded unit as the parser yields it.
#[derive(Clone, Debug, PartialEq)]
pub struct RawPacket {
    /// Index of the elementary stream this packet belongs to.
    pub stream_index: u32,
    /// Presentation timestamp in seconds.
    pub pts: f64,
    /// Decode timestamp in seconds; precedes pts for B-frames.
    pub dts: f64,
    /// Display duration in seconds, 0 when the container omits it.
    pub duration: f64,
    /// The container's keyframe flag. A claim, not a guarantee; see
    /// [`codec::packet_is_sync_frame`](crate::codec::packet_is_sync_frame).
    pub keyframe: bool,
    /// Encoded payload.
    pub data: Bytes,
}

/// What kind of elementary stream an index refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    /// Data/attachment streams the engine ignores.
    Other,
}

/// Per-stream metadata as reported by the parser, before any
/// normalization.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    pub index: u32,
    pub kind: StreamKind,
    pub codec_name: String,

    // Video fields; zero/default for other kinds.
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub profile: i32,
    pub level: i32,
    pub color_primaries: ColorPrimaries,
    pub color_transfer: ColorTransfer,
    pub color_space: ColorSpace,
    pub rotation_degrees: u32,

    // Audio fields.
    pub sample_rate: u32,
    pub channels: u32,

    // Subtitle fields.
    pub subtitle_kind: SubtitleKind,

    pub language: Option<String>,
    pub extradata: Option<Bytes>,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            index: 0,
            kind: StreamKind::Other,
            codec_name: String::new(),
            width: 0,
            height: 0,
            frame_rate: 0.0,
            profile: -1,
            level: -1,
            color_primaries: ColorPrimaries::Unspecified,
            color_transfer: ColorTransfer::Unspecified,
            color_space: ColorSpace::Unspecified,
            rotation_degrees: 0,
            sample_rate: 0,
            channels: 0,
            subtitle_kind: SubtitleKind::Text,
            language: None,
            extradata: None,
        }
    }
}

/// Container-level metadata available after [`ContainerParser::open`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerInfo {
    pub format_name: String,
    pub duration_seconds: f64,
    pub start_time_seconds: f64,
    pub bit_rate: u64,
}

/// How a seek resolves within the container.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SeekFlags {
    /// Land on the keyframe at or before the target (the only mode the
    /// engine uses; decoders cannot start mid-GOP).
    pub backward: bool,
}

/// One rectangle of a decoded subtitle event.
#[derive(Clone, Debug, PartialEq)]
pub enum SubtitleRect {
    /// Styled text, in the parser's inline markup (ASS-style tags).
    Text { markup: String },
    /// Palette-indexed bitmap with its BGRA palette.
    Bitmap {
        width: u32,
        height: u32,
        x: u32,
        y: u32,
        /// One byte per pixel, indexing into `palette`.
        indices: Bytes,
        /// Up to 256 BGRA entries, 4 bytes each.
        palette: Bytes,
    },
}

/// A decoded subtitle event before cue conversion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawSubtitle {
    /// End of display relative to the packet pts, in seconds, when the
    /// codec carries one.
    pub end_display_time: Option<f64>,
    pub rects: Vec<SubtitleRect>,
}

impl RawSubtitle {
    /// Whether the event carries nothing displayable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }
}

/// A software-decoded video frame.
#[derive(Clone, Debug, PartialEq)]
pub struct RgbaImage {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA, `width * height * 4` bytes.
    pub data: Bytes,
}

/// The container parser itself.
///
/// One instance is exclusive to one demuxer; the preview pipeline
/// creates a second, fully isolated instance so its I/O cannot race
/// playback. Every method that touches the container receives the I/O
/// handle explicitly.
pub trait ContainerParser: Send {
    /// Parses container headers. Returns the number of elementary
    /// streams found.
    ///
    /// # Errors
    ///
    /// Returns error if the container is unreadable or not a supported
    /// format.
    fn open(&mut self, io: &mut dyn ParserIo) -> Result<u32>;

    /// Container-level metadata. Valid after `open`.
    fn container_info(&self) -> ContainerInfo;

    /// Metadata for stream `index`. Valid after `open`.
    ///
    /// # Errors
    ///
    /// Returns error if `index` is out of range.
    fn stream_info(&self, index: u32) -> Result<StreamInfo>;

    /// Out-of-band codec configuration for stream `index`.
    ///
    /// # Errors
    ///
    /// Returns error if `index` is out of range.
    fn extradata(&self, index: u32) -> Result<Option<Bytes>>;

    /// Reads the next packet in container order, `None` at EOF.
    ///
    /// # Errors
    ///
    /// Returns error on I/O failure or unrecoverable container damage.
    fn read_frame(&mut self, io: &mut dyn ParserIo) -> Result<Option<RawPacket>>;

    /// Repositions so the next `read_frame` yields a keyframe at or
    /// before `pts_seconds` on `stream_index`.
    ///
    /// # Errors
    ///
    /// Returns error if the target is outside the container or the
    /// index is unseekable.
    fn seek(
        &mut self,
        io: &mut dyn ParserIo,
        pts_seconds: f64,
        stream_index: u32,
        flags: SeekFlags,
    ) -> Result<()>;

    /// Decodes a subtitle packet into displayable rectangles.
    ///
    /// # Errors
    ///
    /// Returns error on malformed subtitle data.
    fn decode_subtitle(&mut self, packet: &RawPacket) -> Result<RawSubtitle>;

    /// Software-decodes a video packet straight to RGBA at the given
    /// output size. This is the hardware decoder's fallback path.
    ///
    /// # Errors
    ///
    /// Returns error on decode failure (the caller's recovery FSM
    /// classifies it).
    fn decode_video_rgba(&mut self, packet: &RawPacket, width: u32, height: u32)
        -> Result<RgbaImage>;

    /// Releases all parser resources. Further calls are invalid.
    fn destroy(&mut self);
}
