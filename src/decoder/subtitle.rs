//! Subtitle cue extraction and lifetime.
//!
//! Text events arrive as ASS-style markup from the parser; the
//! conversion keeps exactly four inline styles (italic, bold,
//! underline, font color) as a safe HTML subset and escapes everything
//! else, so a malicious subtitle file cannot inject markup into the
//! overlay. Bitmap events are palette-indexed pixels plus a BGRA
//! palette and convert straight to RGBA.
//!
//! Cue timing prefers explicit durations, then the codec's end display
//! time, then a reading-speed estimate. Some muxers write absurd
//! multi-hour durations on the last cue of a file; anything implying
//! more than an hour on screen is treated as buggy and re-estimated.

use bytes::Bytes;

use crate::demux::parser::{RawSubtitle, SubtitleRect};
use crate::demux::Packet;
use crate::track::{SubtitleKind, SubtitleTrack};

/// Minimum estimated text cue duration.
const MIN_TEXT_DURATION: f64 = 0.8;

/// Maximum estimated text cue duration.
const MAX_TEXT_DURATION: f64 = 10.0;

/// Fixed duration for bitmap cues without timing.
const IMAGE_DURATION: f64 = 3.0;

/// Implied durations beyond this are treated as muxer bugs.
const MAX_SANE_DURATION: f64 = 3600.0;

/// Reading-speed estimate per character of cue text.
const SECONDS_PER_CHAR: f64 = 0.06;

/// Cues whose end lies this far behind the clock are purged.
const PURGE_SLACK: f64 = 0.3;

/// A decoded bitmap cue image.
#[derive(Clone, Debug, PartialEq)]
pub struct CueImage {
    pub rgba: Bytes,
    pub width: u32,
    pub height: u32,
}

/// One displayable subtitle cue.
#[derive(Clone, Debug, PartialEq)]
pub struct SubtitleCue {
    pub start_s: f64,
    pub end_s: f64,
    /// Safe-HTML text for text cues.
    pub text: Option<String>,
    /// Decoded image for bitmap cues.
    pub image: Option<CueImage>,
    /// Overlay position in pixels, when the codec positions cues.
    pub position: Option<(u32, u32)>,
}

/// The subtitle decoder: converts raw events and owns the active list.
#[derive(Debug)]
pub struct SubtitleDecoder {
    track: SubtitleTrack,
    /// Active cues sorted by `start_s`.
    cues: Vec<SubtitleCue>,
}

impl SubtitleDecoder {
    /// Creates a decoder for the selected subtitle track.
    #[must_use]
    pub fn new(track: SubtitleTrack) -> Self {
        Self {
            track,
            cues: Vec::new(),
        }
    }

    /// The track being decoded.
    #[must_use]
    pub fn track(&self) -> &SubtitleTrack {
        &self.track
    }

    /// Converts a raw event into cues and inserts them, keeping the
    /// list sorted by start time.
    pub fn push_event(&mut self, packet: &Packet, raw: &RawSubtitle) {
        for rect in &raw.rects {
            let cue = build_cue(&self.track, packet, raw, rect);
            let at = self
                .cues
                .partition_point(|existing| existing.start_s <= cue.start_s);
            self.cues.insert(at, cue);
        }
    }

    /// The cue that should be on screen at `time`, latest-starting wins
    /// on overlap.
    #[must_use]
    pub fn active_at(&self, time: f64) -> Option<&SubtitleCue> {
        self.cues
            .iter()
            .rev()
            .find(|cue| cue.start_s <= time && time < cue.end_s)
    }

    /// Drops cues that ended more than the slack behind the clock.
    ///
    /// Keeps the invariant that no active cue has
    /// `end_s < current_time - 0.3`.
    pub fn purge_before(&mut self, current_time: f64) {
        self.cues.retain(|cue| cue.end_s >= current_time - PURGE_SLACK);
    }

    /// Clears all cues (seek, track switch).
    pub fn flush(&mut self) {
        self.cues.clear();
    }

    /// Number of cues currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cues.len()
    }

    /// Whether no cues are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }
}

/// Builds one cue from a raw rectangle.
fn build_cue(
    track: &SubtitleTrack,
    packet: &Packet,
    raw: &RawSubtitle,
    rect: &SubtitleRect,
) -> SubtitleCue {
    let start_s = packet.pts;

    match rect {
        SubtitleRect::Text { markup } => {
            let text = markup_to_safe_html(markup);
            let end_s = start_s + text_duration(packet, raw, &text);
            SubtitleCue {
                start_s,
                end_s,
                text: Some(text),
                image: None,
                position: None,
            }
        }
        SubtitleRect::Bitmap {
            width,
            height,
            x,
            y,
            indices,
            palette,
        } => {
            let duration = explicit_duration(packet, raw).unwrap_or(IMAGE_DURATION);
            SubtitleCue {
                start_s,
                end_s: start_s + duration,
                text: None,
                image: Some(CueImage {
                    rgba: palette_to_rgba(indices, palette, *width, *height),
                    width: *width,
                    height: *height,
                }),
                position: Some((*x, *y)),
            }
        }
    }
}

/// Explicit timing from the packet or the codec, sanity-checked.
fn explicit_duration(packet: &Packet, raw: &RawSubtitle) -> Option<f64> {
    let duration = if packet.duration > 0.0 {
        Some(packet.duration)
    } else {
        raw.end_display_time
    }?;

    (duration > 0.0 && duration <= MAX_SANE_DURATION).then_some(duration)
}

/// Cue duration for text: explicit when sane, else reading-speed
/// estimate clamped to [0.8 s, 10 s].
fn text_duration(packet: &Packet, raw: &RawSubtitle, text: &str) -> f64 {
    explicit_duration(packet, raw).unwrap_or_else(|| {
        #[expect(clippy::cast_precision_loss)]
        let estimate = text.chars().count() as f64 * SECONDS_PER_CHAR;
        estimate.clamp(MIN_TEXT_DURATION, MAX_TEXT_DURATION)
    })
}

/// Converts ASS-style inline markup into the safe HTML subset.
///
/// Recognized: `{\i1}`/`{\i0}`, `{\b1}`/`{\b0}`, `{\u1}`/`{\u0}`,
/// `{\c&HBBGGRR&}` (and `\1c`), plus `\N`/`\n` newline markers. Every
/// other override block is stripped; all remaining text is escaped.
/// Open tags are closed at end of cue so the overlay always receives
/// balanced markup.
#[must_use]
pub fn markup_to_safe_html(markup: &str) -> String {
    let mut out = String::with_capacity(markup.len());
    let mut open: Vec<&'static str> = Vec::new();
    let mut chars = markup.chars().peekable();

    let close_tag = |out: &mut String, open: &mut Vec<&'static str>, tag: &str| {
        if let Some(position) = open.iter().rposition(|t| *t == tag) {
            // Close inner tags first to keep nesting valid.
            for tag in open.drain(position..).rev().collect::<Vec<_>>() {
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                let mut block = String::new();
                for inner in chars.by_ref() {
                    if inner == '}' {
                        break;
                    }
                    block.push(inner);
                }
                for tag in block.split('\\').filter(|t| !t.is_empty()) {
                    match tag {
                        "i1" => {
                            out.push_str("<i>");
                            open.push("i");
                        }
                        "i0" => close_tag(&mut out, &mut open, "i"),
                        "b1" => {
                            out.push_str("<b>");
                            open.push("b");
                        }
                        "b0" => close_tag(&mut out, &mut open, "b"),
                        "u1" => {
                            out.push_str("<u>");
                            open.push("u");
                        }
                        "u0" => close_tag(&mut out, &mut open, "u"),
                        other => {
                            let color = other
                                .strip_prefix("1c")
                                .or_else(|| other.strip_prefix('c'));
                            if let Some(rgb) = color.and_then(parse_ass_color) {
                                close_tag(&mut out, &mut open, "font");
                                out.push_str(&format!("<font color=\"#{rgb}\">"));
                                open.push("font");
                            }
                            // Anything else ({\pos...}, {\fad...}) is styling
                            // the overlay does not honor.
                        }
                    }
                }
            }
            '\\' => match chars.peek() {
                Some('N' | 'n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('h') => {
                    chars.next();
                    out.push(' ');
                }
                _ => out.push('\\'),
            },
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }

    for tag in open.drain(..).rev().collect::<Vec<_>>() {
        out.push_str("</");
        out.push_str(tag);
        out.push('>');
    }

    out
}

/// Parses an ASS `&HBBGGRR&` color into `RRGGBB` hex.
fn parse_ass_color(value: &str) -> Option<String> {
    let hex = value.trim_start_matches("&H").trim_end_matches('&');
    if hex.is_empty() || hex.len() > 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let bgr = u32::from_str_radix(hex, 16).ok()?;
    let (b, g, r) = ((bgr >> 16) & 0xFF, (bgr >> 8) & 0xFF, bgr & 0xFF);
    Some(format!("{r:02X}{g:02X}{b:02X}"))
}

/// Expands palette-indexed pixels through a BGRA palette into RGBA.
///
/// Out-of-range indices render transparent rather than failing the
/// whole cue.
#[must_use]
pub fn palette_to_rgba(indices: &[u8], palette: &[u8], width: u32, height: u32) -> Bytes {
    let pixels = (width as usize) * (height as usize);
    let mut rgba = vec![0u8; pixels * 4];

    for (i, out) in rgba.chunks_exact_mut(4).enumerate() {
        let Some(&index) = indices.get(i) else { break };
        let at = usize::from(index) * 4;
        if let Some([b, g, r, a]) = palette.get(at..at + 4).and_then(|s| <[u8; 4]>::try_from(s).ok())
        {
            out.copy_from_slice(&[r, g, b, a]);
        }
    }

    Bytes::from(rgba)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::SubtitleTrack;

    fn text_track() -> SubtitleTrack {
        SubtitleTrack {
            id: 4,
            codec_name: "ass".into(),
            kind: SubtitleKind::Text,
            language: Some("eng".into()),
            extradata: None,
        }
    }

    fn text_packet(pts: f64, duration: f64, markup: &str) -> (Packet, RawSubtitle) {
        let packet = Packet {
            stream_index: 4,
            pts,
            dts: pts,
            duration,
            keyframe: true,
            data: Bytes::new(),
        };
        let raw = RawSubtitle {
            end_display_time: None,
            rects: vec![SubtitleRect::Text {
                markup: markup.to_owned(),
            }],
        };
        (packet, raw)
    }

    #[test]
    fn style_tags_become_safe_html() {
        assert_eq!(
            markup_to_safe_html(r"{\i1}ciao{\i0} mondo"),
            "<i>ciao</i> mondo"
        );
        assert_eq!(
            markup_to_safe_html(r"{\b1}{\u1}both{\u0}{\b0}"),
            "<b><u>both</u></b>"
        );
        assert_eq!(
            markup_to_safe_html(r"{\c&H0000FF&}red{\c&HFF0000&}blue"),
            "<font color=\"#FF0000\">red</font><font color=\"#0000FF\">blue</font>"
        );
    }

    #[test]
    fn html_is_escaped_and_unknown_overrides_dropped() {
        assert_eq!(
            markup_to_safe_html(r"{\pos(10,20)}<script>&x</script>"),
            "&lt;script&gt;&amp;x&lt;/script&gt;"
        );
    }

    #[test]
    fn newline_markers_become_newlines() {
        assert_eq!(markup_to_safe_html(r"one\Ntwo\nthree"), "one\ntwo\nthree");
    }

    #[test]
    fn unterminated_tags_are_closed() {
        assert_eq!(markup_to_safe_html(r"{\i1}tilt"), "<i>tilt</i>");
    }

    #[test]
    fn explicit_duration_wins() {
        let mut decoder = SubtitleDecoder::new(text_track());
        let (packet, raw) = text_packet(10.0, 2.5, "hello");
        decoder.push_event(&packet, &raw);

        let cue = decoder.active_at(11.0).unwrap();
        assert_eq!(cue.start_s, 10.0);
        assert_eq!(cue.end_s, 12.5);
    }

    #[test]
    fn missing_duration_uses_clamped_estimate() {
        let mut decoder = SubtitleDecoder::new(text_track());

        let (packet, raw) = text_packet(0.0, 0.0, "hi");
        decoder.push_event(&packet, &raw);
        assert_eq!(decoder.active_at(0.1).unwrap().end_s, MIN_TEXT_DURATION);

        let long = "x".repeat(500);
        let (packet, raw) = text_packet(5.0, 0.0, &long);
        decoder.push_event(&packet, &raw);
        assert_eq!(decoder.active_at(6.0).unwrap().end_s, 5.0 + MAX_TEXT_DURATION);
    }

    #[test]
    fn absurd_duration_is_replaced_by_estimate() {
        let mut decoder = SubtitleDecoder::new(text_track());
        let (packet, raw) = text_packet(0.0, 7200.0, "stuck cue");
        decoder.push_event(&packet, &raw);

        let cue = decoder.active_at(0.1).unwrap();
        assert!(cue.end_s <= MAX_TEXT_DURATION);
    }

    #[test]
    fn purge_respects_slack() {
        let mut decoder = SubtitleDecoder::new(text_track());
        let (packet, raw) = text_packet(0.0, 2.0, "early");
        decoder.push_event(&packet, &raw);

        decoder.purge_before(2.2);
        assert_eq!(decoder.len(), 1, "within the 0.3 s slack");

        decoder.purge_before(2.4);
        assert!(decoder.is_empty());
    }

    #[test]
    fn cues_stay_sorted_and_latest_wins() {
        let mut decoder = SubtitleDecoder::new(text_track());
        let (p2, r2) = text_packet(5.0, 4.0, "second");
        let (p1, r1) = text_packet(4.0, 4.0, "first");
        decoder.push_event(&p2, &r2);
        decoder.push_event(&p1, &r1);

        let cue = decoder.active_at(6.0).unwrap();
        assert_eq!(cue.text.as_deref(), Some("second"));
    }

    #[test]
    fn bitmap_cues_convert_palette_and_default_duration() {
        let track = SubtitleTrack {
            kind: SubtitleKind::Image,
            codec_name: "hdmv_pgs_subtitle".into(),
            ..text_track()
        };
        let mut decoder = SubtitleDecoder::new(track);

        // Palette entry 1: BGRA = blue-ish, opaque.
        let palette = Bytes::from(vec![0, 0, 0, 0, 200, 10, 30, 255]);
        let packet = Packet {
            stream_index: 4,
            pts: 1.0,
            dts: 1.0,
            duration: 0.0,
            keyframe: true,
            data: Bytes::new(),
        };
        let raw = RawSubtitle {
            end_display_time: None,
            rects: vec![SubtitleRect::Bitmap {
                width: 2,
                height: 1,
                x: 100,
                y: 900,
                indices: Bytes::from(vec![1, 0]),
                palette,
            }],
        };
        decoder.push_event(&packet, &raw);

        let cue = decoder.active_at(1.5).unwrap();
        assert_eq!(cue.end_s, 1.0 + IMAGE_DURATION);
        assert_eq!(cue.position, Some((100, 900)));

        let image = cue.image.as_ref().unwrap();
        // BGRA 200,10,30,255 -> RGBA 30,10,200,255; index 0 transparent.
        assert_eq!(&image.rgba[..4], &[30, 10, 200, 255]);
        assert_eq!(&image.rgba[4..8], &[0, 0, 0, 0]);
    }
}
