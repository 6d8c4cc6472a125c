//! Track metadata and selection state.
//!
//! This module holds:
//! * The three track variants (video, audio, subtitle) and their
//!   codec-level metadata
//! * [`MediaInfo`], the immutable result of opening a container
//! * [`TrackManager`], the selection state the demux loop filters
//!   packets against
//!
//! Track ids are the container's stream indices and are stable for the
//! lifetime of a session.

use bytes::Bytes;
use serde::Serialize;

use crate::error::{Error, Result};

/// Color primaries of a video track.
///
/// Only the values the engine acts on are enumerated; everything else
/// the parser reports collapses to `Unspecified` and may be filled in
/// by the demuxer's normalization heuristics.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorPrimaries {
    #[default]
    Unspecified,
    /// ITU-R BT.709 (SDR HD content).
    Bt709,
    /// ITU-R BT.2020 (wide gamut, UHD/HDR content).
    Bt2020,
}

/// Transfer characteristics of a video track.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorTransfer {
    #[default]
    Unspecified,
    /// ITU-R BT.709 OETF.
    Bt709,
    /// SMPTE ST 2084 perceptual quantizer (HDR10).
    Smpte2084,
    /// Hybrid log-gamma.
    AribStdB67,
}

/// Matrix coefficients of a video track.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorSpace {
    #[default]
    Unspecified,
    /// ITU-R BT.709 matrix.
    Bt709,
    /// ITU-R BT.2020 non-constant luminance.
    Bt2020Ncl,
}

/// Video stream metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoTrack {
    /// Container stream index, used as the track id.
    pub id: u32,
    /// Codec name as reported by the parser, e.g. `hevc`, `h264`.
    pub codec_name: String,
    /// Coded width in pixels.
    pub width: u32,
    /// Coded height in pixels.
    pub height: u32,
    /// Nominal frame rate in frames per second, 0 when unknown.
    pub frame_rate: f64,
    /// Codec profile identifier, `-1` when unknown.
    pub profile: i32,
    /// Codec level identifier, `-1` when unknown.
    pub level: i32,
    /// Color primaries, possibly normalized by the demuxer.
    pub color_primaries: ColorPrimaries,
    /// Transfer characteristics, possibly normalized by the demuxer.
    pub color_transfer: ColorTransfer,
    /// Matrix coefficients, possibly normalized by the demuxer.
    pub color_space: ColorSpace,
    /// Display rotation in degrees, one of 0, 90, 180, 270.
    pub rotation_degrees: u32,
    /// Whether the track carries HDR content.
    pub is_hdr: bool,
    /// Out-of-band codec configuration (`avcC`, `hvcC`, `vpcC`, `av1C`).
    pub extradata: Option<Bytes>,
}

/// Audio stream metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioTrack {
    /// Container stream index, used as the track id.
    pub id: u32,
    /// Codec name as reported by the parser, e.g. `aac`, `opus`.
    pub codec_name: String,
    /// Samples per second.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u32,
    /// ISO 639 language tag, if the container carries one.
    pub language: Option<String>,
    /// Out-of-band codec configuration.
    pub extradata: Option<Bytes>,
}

/// Whether a subtitle stream carries text cues or rendered bitmaps.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleKind {
    /// Text cues with inline styling (SRT, ASS, WebVTT, mov_text).
    Text,
    /// Palette-indexed bitmap cues (PGS, DVB, VobSub).
    Image,
}

/// Subtitle stream metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct SubtitleTrack {
    /// Container stream index, used as the track id.
    pub id: u32,
    /// Codec name as reported by the parser.
    pub codec_name: String,
    /// Text or bitmap.
    pub kind: SubtitleKind,
    /// ISO 639 language tag, if the container carries one.
    pub language: Option<String>,
    /// Codec header (e.g. the ASS style block).
    pub extradata: Option<Bytes>,
}

/// One elementary stream of the container.
#[derive(Clone, Debug, PartialEq)]
pub enum Track {
    Video(VideoTrack),
    Audio(AudioTrack),
    Subtitle(SubtitleTrack),
}

impl Track {
    /// The container stream index.
    #[must_use]
    pub fn id(&self) -> u32 {
        match self {
            Self::Video(t) => t.id,
            Self::Audio(t) => t.id,
            Self::Subtitle(t) => t.id,
        }
    }

    /// The parser-reported codec name.
    #[must_use]
    pub fn codec_name(&self) -> &str {
        match self {
            Self::Video(t) => &t.codec_name,
            Self::Audio(t) => &t.codec_name,
            Self::Subtitle(t) => &t.codec_name,
        }
    }
}

/// Immutable description of an opened container.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaInfo {
    /// Container format name, e.g. `matroska`, `mov,mp4,m4a`.
    pub format_name: String,
    /// Total duration in seconds.
    pub duration_seconds: f64,
    /// Timestamp of the first packet in seconds; pts are absolute, so
    /// seeks and displays offset by this.
    pub start_time_seconds: f64,
    /// Container-level bit rate in bits per second, 0 when unknown.
    pub bit_rate: u64,
    /// Every elementary stream found.
    pub tracks: Vec<Track>,
}

impl MediaInfo {
    /// Finds a track by id.
    #[must_use]
    pub fn track(&self, id: u32) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id() == id)
    }
}

/// A selection change reported to observers.
#[derive(Clone, Debug, PartialEq)]
pub enum TrackChange {
    Video(VideoTrack),
    Audio(AudioTrack),
    Subtitle(Option<SubtitleTrack>),
}

/// Stream selection state.
///
/// Holds the full track list and the currently selected
/// (video, audio, subtitle) triple. The demux loop calls
/// [`is_active_stream`](Self::is_active_stream) per packet, so lookups
/// are kept branch-cheap.
#[derive(Debug, Default)]
pub struct TrackManager {
    tracks: Vec<Track>,
    video_id: Option<u32>,
    audio_id: Option<u32>,
    subtitle_id: Option<u32>,
}

impl TrackManager {
    /// Builds the manager from an opened container.
    ///
    /// Default selection: first video track, first audio track, no
    /// subtitle.
    #[must_use]
    pub fn new(tracks: Vec<Track>) -> Self {
        let video_id = tracks.iter().find_map(|t| match t {
            Track::Video(v) => Some(v.id),
            _ => None,
        });
        let audio_id = tracks.iter().find_map(|t| match t {
            Track::Audio(a) => Some(a.id),
            _ => None,
        });

        Self {
            tracks,
            video_id,
            audio_id,
            subtitle_id: None,
        }
    }

    /// Whether packets of `stream_index` are currently consumed.
    #[must_use]
    pub fn is_active_stream(&self, stream_index: u32) -> bool {
        self.video_id == Some(stream_index)
            || self.audio_id == Some(stream_index)
            || self.subtitle_id == Some(stream_index)
    }

    /// The selected video track id.
    #[must_use]
    pub fn video_id(&self) -> Option<u32> {
        self.video_id
    }

    /// The selected audio track id.
    #[must_use]
    pub fn audio_id(&self) -> Option<u32> {
        self.audio_id
    }

    /// The selected subtitle track id.
    #[must_use]
    pub fn subtitle_id(&self) -> Option<u32> {
        self.subtitle_id
    }

    /// The full track list in container order.
    #[must_use]
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// The currently selected video track.
    #[must_use]
    pub fn video_track(&self) -> Option<&VideoTrack> {
        self.video_id.and_then(|id| {
            self.tracks.iter().find_map(|t| match t {
                Track::Video(v) if v.id == id => Some(v),
                _ => None,
            })
        })
    }

    /// The currently selected audio track.
    #[must_use]
    pub fn audio_track(&self) -> Option<&AudioTrack> {
        self.audio_id.and_then(|id| {
            self.tracks.iter().find_map(|t| match t {
                Track::Audio(a) if a.id == id => Some(a),
                _ => None,
            })
        })
    }

    /// The currently selected subtitle track.
    #[must_use]
    pub fn subtitle_track(&self) -> Option<&SubtitleTrack> {
        self.subtitle_id.and_then(|id| {
            self.tracks.iter().find_map(|t| match t {
                Track::Subtitle(s) if s.id == id => Some(s),
                _ => None,
            })
        })
    }

    /// Selects a video track.
    ///
    /// Selecting the current id is a no-op and returns `None`; selecting
    /// an unknown id fails without side effects. On change, returns the
    /// new track for the change event.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `id` is not a video track.
    pub fn select_video(&mut self, id: u32) -> Result<Option<TrackChange>> {
        if self.video_id == Some(id) {
            return Ok(None);
        }
        let track = self
            .tracks
            .iter()
            .find_map(|t| match t {
                Track::Video(v) if v.id == id => Some(v.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::not_found(format!("video track {id} not in session")))?;

        self.video_id = Some(id);
        Ok(Some(TrackChange::Video(track)))
    }

    /// Selects an audio track. Same contract as [`select_video`](Self::select_video).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `id` is not an audio track.
    pub fn select_audio(&mut self, id: u32) -> Result<Option<TrackChange>> {
        if self.audio_id == Some(id) {
            return Ok(None);
        }
        let track = self
            .tracks
            .iter()
            .find_map(|t| match t {
                Track::Audio(a) if a.id == id => Some(a.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::not_found(format!("audio track {id} not in session")))?;

        self.audio_id = Some(id);
        Ok(Some(TrackChange::Audio(track)))
    }

    /// Selects a subtitle track, or disables subtitles with `None`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `id` is not a subtitle track.
    pub fn select_subtitle(&mut self, id: Option<u32>) -> Result<Option<TrackChange>> {
        if self.subtitle_id == id {
            return Ok(None);
        }

        let track = match id {
            None => None,
            Some(id) => Some(
                self.tracks
                    .iter()
                    .find_map(|t| match t {
                        Track::Subtitle(s) if s.id == id => Some(s.clone()),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        Error::not_found(format!("subtitle track {id} not in session"))
                    })?,
            ),
        };

        self.subtitle_id = id;
        Ok(Some(TrackChange::Subtitle(track)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(id: u32) -> Track {
        Track::Video(VideoTrack {
            id,
            codec_name: "hevc".to_owned(),
            width: 3840,
            height: 2160,
            frame_rate: 23.976,
            profile: 2,
            level: 153,
            color_primaries: ColorPrimaries::default(),
            color_transfer: ColorTransfer::default(),
            color_space: ColorSpace::default(),
            rotation_degrees: 0,
            is_hdr: true,
            extradata: None,
        })
    }

    fn audio(id: u32, language: &str) -> Track {
        Track::Audio(AudioTrack {
            id,
            codec_name: "aac".to_owned(),
            sample_rate: 48_000,
            channels: 6,
            language: Some(language.to_owned()),
            extradata: None,
        })
    }

    fn subtitle(id: u32) -> Track {
        Track::Subtitle(SubtitleTrack {
            id,
            codec_name: "subrip".to_owned(),
            kind: SubtitleKind::Text,
            language: Some("eng".to_owned()),
            extradata: None,
        })
    }

    fn manager() -> TrackManager {
        TrackManager::new(vec![
            video(0),
            audio(1, "eng"),
            audio(2, "spa"),
            audio(3, "jpn"),
            subtitle(4),
        ])
    }

    #[test]
    fn defaults_are_first_video_first_audio_no_subtitle() {
        let tm = manager();
        assert_eq!(tm.video_id(), Some(0));
        assert_eq!(tm.audio_id(), Some(1));
        assert_eq!(tm.subtitle_id(), None);

        assert!(tm.is_active_stream(0));
        assert!(tm.is_active_stream(1));
        assert!(!tm.is_active_stream(2));
        assert!(!tm.is_active_stream(4));
    }

    #[test]
    fn selecting_same_id_is_a_no_op() {
        let mut tm = manager();
        assert!(tm.select_audio(1).unwrap().is_none());
        assert!(tm.select_subtitle(None).unwrap().is_none());
    }

    #[test]
    fn selecting_unknown_id_fails_without_side_effects() {
        let mut tm = manager();
        assert!(tm.select_audio(9).is_err());
        assert_eq!(tm.audio_id(), Some(1));

        // A video id is not an audio id.
        assert!(tm.select_audio(0).is_err());
        assert_eq!(tm.audio_id(), Some(1));
    }

    #[test]
    fn audio_switch_reports_the_new_track() {
        let mut tm = manager();
        let change = tm.select_audio(2).unwrap().unwrap();
        match change {
            TrackChange::Audio(track) => {
                assert_eq!(track.id, 2);
                assert_eq!(track.language.as_deref(), Some("spa"));
            }
            other => panic!("unexpected change: {other:?}"),
        }
        assert!(tm.is_active_stream(2));
        assert!(!tm.is_active_stream(1));
    }

    #[test]
    fn subtitle_can_be_disabled() {
        let mut tm = manager();
        tm.select_subtitle(Some(4)).unwrap();
        assert!(tm.is_active_stream(4));

        let change = tm.select_subtitle(None).unwrap().unwrap();
        assert_eq!(change, TrackChange::Subtitle(None));
        assert!(!tm.is_active_stream(4));
    }
}
