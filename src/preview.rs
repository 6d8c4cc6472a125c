//! The thumbnail preview pipeline.
//!
//! Scrub previews must never disturb playback, so this pipeline is a
//! fully isolated stack: its own source (with a small window and fetch
//! cap, scrubs are bursty and cheap), its own parser instance, its own
//! decoder. Nothing here shares state with the playing session.
//!
//! A preview request seeks the isolated demuxer to the nearest
//! keyframe, offers the packet to a hardware decoder under a 500 ms
//! watchdog, and falls back to the parser's software RGBA decode when
//! hardware is slow or cannot read its frame back. At most one preview
//! is in flight; a request arriving while one runs fails fast with
//! `ResourceExhausted` so rapid scrubbing degrades to latest-wins at
//! the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::decoder::{DecodeRequest, HardwareVideoFactory};
use crate::demux::parser::RgbaImage;
use crate::demux::{Demuxer, Packet};
use crate::error::{Error, Result};
use crate::track::VideoTrack;

/// Sliding window for the preview source (512 KiB).
pub const PREVIEW_WINDOW_SIZE: u64 = 512 * 1024;

/// Fetch cap for the preview source (5 MiB).
pub const PREVIEW_MAX_FETCH: u64 = 5 * 1024 * 1024;

/// Hardware decode budget before the software fallback.
pub const DECODE_WATCHDOG: Duration = Duration::from_millis(500);

/// Packets scanned for the keyframe before giving up on a target.
const MAX_PACKET_SCAN: usize = 256;

/// Releases the single-flight slot on every exit path.
struct FlightGuard(Arc<AtomicBool>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The isolated preview stack.
pub struct PreviewPipeline {
    demuxer: Arc<Demuxer>,
    factory: Arc<dyn HardwareVideoFactory>,
    track: VideoTrack,
    in_flight: Arc<AtomicBool>,
}

impl PreviewPipeline {
    /// Wraps an isolated demuxer (own parser, own source) and a decoder
    /// factory.
    #[must_use]
    pub fn new(
        demuxer: Arc<Demuxer>,
        factory: Arc<dyn HardwareVideoFactory>,
        track: VideoTrack,
    ) -> Self {
        Self {
            demuxer,
            factory,
            track,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The isolated demuxer, exposed so the owner can close it on
    /// teardown.
    #[must_use]
    pub fn demuxer(&self) -> &Demuxer {
        &self.demuxer
    }

    /// Generates a preview image near `time`.
    ///
    /// `width`/`height` default to a quarter of the track size.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * Another preview is already in flight (`ResourceExhausted`)
    /// * No keyframe exists near the target
    /// * Both decode paths fail
    pub async fn generate(
        &self,
        time: f64,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<RgbaImage> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(Error::resource_exhausted("a preview is already in flight"));
        }
        let _guard = FlightGuard(Arc::clone(&self.in_flight));

        let width = width.unwrap_or_else(|| (self.track.width / 4).max(2));
        let height = height.unwrap_or_else(|| (self.track.height / 4).max(2));

        self.demuxer.seek(time).await?;
        let packet = self.find_keyframe_packet().await?;

        match self.try_hardware(&packet).await {
            Some(image) => Ok(image),
            None => {
                trace!("preview falling back to software decode at {time:.3}");
                self.demuxer
                    .decode_video_rgba(packet, width, height)
                    .await
            }
        }
    }

    /// Reads forward to the first keyframe packet on the video stream.
    ///
    /// Scrub targets at or past the last keyframe can exhaust the
    /// stream without hitting one (open-GOP tails, targets near EOF).
    /// The last video packet seen is kept as a fallback: the closest
    /// available frame beats failing the scrub outright.
    async fn find_keyframe_packet(&self) -> Result<Packet> {
        let mut last_seen: Option<Packet> = None;

        for _ in 0..MAX_PACKET_SCAN {
            let Some(packet) = self.demuxer.read_packet().await? else {
                break;
            };
            if packet.stream_index != self.track.id {
                continue;
            }
            if packet.keyframe {
                return Ok(packet);
            }
            last_seen = Some(packet);
        }

        match last_seen {
            Some(packet) => {
                trace!(
                    "no keyframe near target, falling back to frame at {:.3}",
                    packet.pts
                );
                Ok(packet)
            }
            None => Err(Error::not_found("end of media before any video packet")),
        }
    }

    /// One hardware attempt under the watchdog. `None` means fall back.
    async fn try_hardware(&self, packet: &Packet) -> Option<RgbaImage> {
        let config = crate::decoder::VideoDecoderConfig {
            codec_string: crate::codec::codec_string_from_extradata(
                &self.track.codec_name,
                self.track.extradata.as_deref().unwrap_or(&[]),
            )
            .or_else(|| {
                crate::codec::manual_codec_string(
                    &self.track.codec_name,
                    self.track.profile,
                    self.track.level,
                    self.track.is_hdr,
                )
            })?,
            coded_width: self.track.width,
            coded_height: self.track.height,
            color: None,
            extradata: self.track.extradata.clone(),
        };

        let mut backend = self.factory.create();
        if !backend.probe(&config).await {
            backend.close();
            return None;
        }

        // configure + decode are synchronous and may genuinely stall on
        // broken drivers; run them off-loop so the watchdog can abandon
        // them. The abandoned thread still closes its backend.
        let request = DecodeRequest {
            data: packet.data.clone(),
            pts: packet.pts,
            dts: packet.dts,
            keyframe: packet.keyframe,
        };
        let attempt = tokio::task::spawn_blocking(move || {
            let result = backend.configure(&config).ok().and_then(|()| {
                let frame = backend.decode(&request).ok().flatten()?;
                let image = backend.read_back(&frame);
                let mut frame = frame;
                frame.close();
                image
            });
            backend.close();
            result
        });

        match tokio::time::timeout(DECODE_WATCHDOG, attempt).await {
            Ok(Ok(image)) => image,
            Ok(Err(e)) => {
                debug!("preview hardware attempt panicked: {e}");
                None
            }
            Err(_) => {
                debug!("preview hardware attempt exceeded {DECODE_WATCHDOG:?}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::video::testing::{HardwareScript, ScriptedFactory};
    use crate::demux::testing::{audio_packet, uhd_fixture, video_packet};
    use crate::track::Track;

    async fn pipeline_with(
        script: Arc<HardwareScript>,
        packets: Vec<crate::demux::Packet>,
    ) -> PreviewPipeline {
        let demuxer = uhd_fixture(packets);
        let info = demuxer.open().await.unwrap();
        let track = match &info.tracks[0] {
            Track::Video(v) => v.clone(),
            other => panic!("expected video, got {other:?}"),
        };

        PreviewPipeline::new(
            Arc::new(demuxer),
            Arc::new(ScriptedFactory(script)),
            track,
        )
    }

    async fn pipeline(script: Arc<HardwareScript>) -> PreviewPipeline {
        pipeline_with(
            script,
            vec![
                video_packet(0.0, true),
                audio_packet(1, 0.0),
                video_packet(1.0, false),
                video_packet(2.0, true),
                video_packet(3.0, false),
            ],
        )
        .await
    }

    #[tokio::test]
    async fn software_fallback_returns_requested_size() {
        let script = Arc::new(HardwareScript::default());
        // Hardware rejects everything; software path delivers.
        script.accept_only(&["nothing"]);
        let preview = pipeline(script).await;

        let image = preview.generate(2.1, Some(320), Some(180)).await.unwrap();
        assert_eq!((image.width, image.height), (320, 180));
        assert_eq!(image.data.len(), 320 * 180 * 4);
    }

    #[tokio::test]
    async fn seeks_to_keyframe_before_target() {
        let script = Arc::new(HardwareScript::default());
        script.accept_only(&["nothing"]);
        let preview = pipeline(script).await;

        // Target 3.5 resolves to the keyframe at 2.0 and decodes it.
        let image = preview.generate(3.5, None, None).await.unwrap();
        assert_eq!((image.width, image.height), (3840 / 4, 2160 / 4));
    }

    #[tokio::test]
    async fn scrub_past_last_keyframe_degrades_to_nearest_frame() {
        let script = Arc::new(HardwareScript::default());
        script.accept_only(&["nothing"]);

        // Open-GOP tail: nothing the demuxer replays for a target past
        // the stream's last keyframe carries the keyframe flag, so the
        // scan runs dry and must fall back to the closest frame seen.
        let preview = pipeline_with(
            Arc::clone(&script),
            vec![
                video_packet(598.0, false),
                audio_packet(1, 598.0),
                video_packet(599.0, false),
            ],
        )
        .await;

        let image = preview.generate(599.9, Some(160), Some(90)).await.unwrap();
        assert_eq!((image.width, image.height), (160, 90));
        assert!(!preview.in_flight.load(Ordering::SeqCst));

        // A stream with no video packets at all still reports failure.
        let empty = pipeline_with(script, vec![audio_packet(1, 0.0)]).await;
        let err = empty.generate(1.0, None, None).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn second_request_while_in_flight_is_rejected() {
        let script = Arc::new(HardwareScript::default());
        script.accept_only(&["nothing"]);
        let preview = Arc::new(pipeline(script).await);

        preview.in_flight.store(true, Ordering::SeqCst);
        let err = preview.generate(1.0, None, None).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ResourceExhausted);

        preview.in_flight.store(false, Ordering::SeqCst);
        assert!(preview.generate(1.0, None, None).await.is_ok());
    }

    #[tokio::test]
    async fn flight_slot_is_released_between_requests() {
        let script = Arc::new(HardwareScript::default());
        script.accept_only(&["nothing"]);
        let preview = pipeline(script).await;

        preview.generate(0.5, None, None).await.unwrap();
        assert!(!preview.in_flight.load(Ordering::SeqCst));
        preview.generate(2.5, None, None).await.unwrap();
        assert!(!preview.in_flight.load(Ordering::SeqCst));
    }
}
