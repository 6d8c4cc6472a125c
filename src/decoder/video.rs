//! Video decoding with hardware-first orchestration.
//!
//! The decoder owns the choice between the platform backend and the
//! software fallback, and the recovery state machine that keeps frames
//! flowing through driver quirks:
//!
//! * **Open-GOP rejections**: a stream's "key" frame turns out to be a
//!   CRA frame the decoder cannot start from. Reset, wait for the next
//!   one, and after 16 rejections stop fighting and go software.
//! * **Profile rejections**: HEVC Rext bitstreams that actually fit
//!   Main10 get their codec string and configuration record patched to
//!   the compatible profile.
//! * **Generic errors**: reset, then recreate, then give up if five
//!   arrive within a 30 second window.
//! * **Hardware resurrection**: software mode is persistent, but every
//!   once in a while (10 s, then every 30 s, at most 10 times) the next
//!   true IRAP packet is offered to a fresh hardware instance. One
//!   failed frame sends it straight back.
//!
//! After any flush the decoder drops packets silently until a keyframe
//! arrives. During a seek, packets below the target are still decoded
//! (reference state must be built) but their frames never leave this
//! module.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;

use crate::codec;
use crate::config::DecoderPreference;
use crate::demux::parser::RgbaImage;
use crate::demux::Packet;
use crate::error::{Error, Result};
use crate::track::VideoTrack;

use super::{
    DecodeRequest, FramePixels, HardwareVideo, HardwareVideoFactory, VideoColorInfo,
    VideoDecodeError, VideoDecoderConfig, VideoFrame,
};

/// Open-GOP rejections tolerated before the downgrade to software.
const OPEN_GOP_LIMIT: u32 = 15;

/// Errors within [`ERROR_WINDOW`] that make the stream fatal.
const FATAL_ERROR_COUNT: u32 = 5;

/// The rolling window for counting decode errors.
const ERROR_WINDOW: Duration = Duration::from_secs(30);

/// Software dwell time before the first hardware resurrection attempt.
const RESURRECTION_INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Cooldown between subsequent resurrection attempts.
const RESURRECTION_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Resurrection attempts per decoder lifetime.
const RESURRECTION_MAX_ATTEMPTS: u32 = 10;

/// The software decode capability, provided by the demuxer's parser.
///
/// Kept as a trait so the decoder is testable without a parser thread.
pub trait SoftwareVideo: Send + Sync {
    /// Decodes one packet straight to RGBA at the given output size.
    fn decode_rgba(
        &self,
        packet: Packet,
        width: u32,
        height: u32,
    ) -> BoxFuture<'_, Result<RgbaImage>>;
}

/// Which backend currently emits frames.
enum Backend {
    Hardware(Box<dyn HardwareVideo>),
    Software,
}

/// The video decoder component.
pub struct VideoDecoder {
    track: VideoTrack,
    preference: DecoderPreference,
    factory: Arc<dyn HardwareVideoFactory>,
    software: Arc<dyn SoftwareVideo>,

    backend: Backend,
    config: Option<VideoDecoderConfig>,

    waiting_for_keyframe: bool,
    seek_target: Option<f64>,

    open_gop_count: u32,
    consecutive_error_count: u32,
    last_error_at: Option<Instant>,

    software_since: Option<Instant>,
    resurrection_attempts: u32,
    last_resurrection_at: Option<Instant>,
}

impl VideoDecoder {
    /// Creates an unconfigured decoder for a track.
    #[must_use]
    pub fn new(
        track: VideoTrack,
        preference: DecoderPreference,
        factory: Arc<dyn HardwareVideoFactory>,
        software: Arc<dyn SoftwareVideo>,
    ) -> Self {
        Self {
            track,
            preference,
            factory,
            software,
            backend: Backend::Software,
            config: None,
            waiting_for_keyframe: true,
            seek_target: None,
            open_gop_count: 0,
            consecutive_error_count: 0,
            last_error_at: None,
            software_since: Some(Instant::now()),
            resurrection_attempts: 0,
            last_resurrection_at: None,
        }
    }

    /// Whether the software fallback is active.
    #[must_use]
    pub fn is_software(&self) -> bool {
        matches!(self.backend, Backend::Software)
    }

    /// Open-GOP rejections seen since the last flush.
    #[must_use]
    pub fn open_gop_count(&self) -> u32 {
        self.open_gop_count
    }

    /// The codec string of the active configuration, if configured.
    #[must_use]
    pub fn codec_string(&self) -> Option<&str> {
        self.config.as_ref().map(|c| c.codec_string.as_str())
    }

    /// Computes the canonical codec string for the track.
    ///
    /// Order per the configure contract: in-box configuration record
    /// first (unless Annex-B framed), manual mapping second.
    fn compute_codec_string(&self) -> Result<String> {
        if let Some(extradata) = &self.track.extradata {
            if let Some(s) = codec::codec_string_from_extradata(&self.track.codec_name, extradata) {
                return Ok(s);
            }
        }

        codec::manual_codec_string(
            &self.track.codec_name,
            self.track.profile,
            self.track.level,
            self.track.is_hdr,
        )
        .ok_or_else(|| {
            Error::unimplemented(format!(
                "no codec string mapping for {}",
                self.track.codec_name
            ))
        })
    }

    /// Builds the full-fidelity configuration attempt.
    fn base_config(&self, codec_string: String) -> VideoDecoderConfig {
        VideoDecoderConfig {
            codec_string,
            coded_width: self.track.width,
            coded_height: self.track.height,
            color: Some(VideoColorInfo {
                primaries: self.track.color_primaries,
                transfer: self.track.color_transfer,
                matrix: self.track.color_space,
            }),
            extradata: self.track.extradata.clone(),
        }
    }

    /// The retry ladder for hardware configuration: full config, then
    /// without color metadata, then the compatible-profile swap (with
    /// the configuration record patched to match).
    fn config_candidates(&self, base: &VideoDecoderConfig) -> Vec<VideoDecoderConfig> {
        let mut candidates = vec![base.clone()];

        candidates.push(VideoDecoderConfig {
            color: None,
            ..base.clone()
        });

        if let Some(fallback) = codec::compatible_profile_fallback(&base.codec_string) {
            let extradata = base.extradata.as_ref().map(|data| {
                let mut patched = data.to_vec();
                if let Some(profile) = codec::hevc_profile_of(&fallback) {
                    codec::patch_hevc_profile_idc(&mut patched, profile);
                }
                bytes::Bytes::from(patched)
            });
            candidates.push(VideoDecoderConfig {
                codec_string: fallback,
                color: None,
                extradata,
                ..base.clone()
            });
        }

        candidates
    }

    /// Configures the decoder for its track.
    ///
    /// Probes hardware support along the candidate ladder unless the
    /// preference forbids it; initializes software when every hardware
    /// attempt fails.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * No codec string can be derived for the track
    /// * The preference is `Hardware` and no candidate is supported
    pub async fn configure(&mut self) -> Result<()> {
        let codec_string = self.compute_codec_string()?;
        let base = self.base_config(codec_string);

        if self.preference == DecoderPreference::Software {
            self.config = Some(base);
            self.enter_software("software decode requested");
            return Ok(());
        }

        if self.try_hardware(&base).await {
            return Ok(());
        }

        if self.preference == DecoderPreference::Hardware {
            return Err(Error::unimplemented(format!(
                "hardware decode unsupported for {}",
                base.codec_string
            )));
        }

        self.config = Some(base);
        self.enter_software("no supported hardware configuration");
        Ok(())
    }

    /// Walks the candidate ladder on a fresh backend instance.
    ///
    /// On success the backend is installed and the accepted candidate
    /// becomes the active configuration.
    async fn try_hardware(&mut self, base: &VideoDecoderConfig) -> bool {
        let mut backend = self.factory.create();

        for candidate in self.config_candidates(base) {
            if !backend.probe(&candidate).await {
                debug!("hardware rejected {}", candidate.codec_string);
                continue;
            }
            match backend.configure(&candidate) {
                Ok(()) => {
                    info!("hardware decoder configured: {}", candidate.codec_string);
                    self.backend = Backend::Hardware(backend);
                    self.config = Some(candidate);
                    self.waiting_for_keyframe = true;
                    self.software_since = None;
                    return true;
                }
                Err(e) => {
                    debug!("hardware configure failed for {}: {e}", candidate.codec_string);
                }
            }
        }

        backend.close();
        false
    }

    /// Switches to the software backend. Software mode is persistent
    /// until a resurrection attempt succeeds.
    fn enter_software(&mut self, reason: &str) {
        if let Backend::Hardware(backend) = &mut self.backend {
            backend.close();
            warn!("downgrading to software decode: {reason}");
        } else {
            debug!("software decode active: {reason}");
        }
        self.backend = Backend::Software;
        self.waiting_for_keyframe = true;
        self.software_since = Some(Instant::now());
    }

    /// Marks the decoder as waiting for a seek to complete; frames
    /// below `target` are decoded but never emitted.
    pub fn set_seek_target(&mut self, target: Option<f64>) {
        self.seek_target = target;
    }

    /// Drains in-flight state after a seek, config change or recovery.
    ///
    /// Closes all pending frames, clears the open-GOP counter and
    /// reenters the keyframe wait.
    pub fn flush(&mut self) {
        if let Backend::Hardware(backend) = &mut self.backend {
            backend.flush();
        }
        self.waiting_for_keyframe = true;
        self.open_gop_count = 0;
    }

    /// Releases the backend.
    pub fn close(&mut self) {
        if let Backend::Hardware(backend) = &mut self.backend {
            backend.close();
        }
        self.backend = Backend::Software;
        self.config = None;
    }

    /// Decodes one packet, emitting at most one frame.
    ///
    /// `Ok(None)` covers: frame still buffered in the backend, packet
    /// dropped while waiting for a keyframe, frame filtered below the
    /// seek target, or an error the recovery machine absorbed.
    ///
    /// # Errors
    ///
    /// Returns error only for fatal conditions: five decode errors
    /// within 30 seconds, or recovery unable to produce any backend.
    pub async fn decode(&mut self, packet: &Packet) -> Result<Option<VideoFrame>> {
        // A parked software session periodically offers a true sync
        // frame to fresh hardware. When hardware takes over it has
        // consumed this packet, buffered or not.
        if self.is_software() && self.resurrection_due(packet) {
            if let Some(emitted) = self.try_resurrect(packet).await {
                return Ok(emitted.and_then(|frame| self.apply_seek_filter(frame)));
            }
        }

        if self.waiting_for_keyframe {
            if !packet.keyframe {
                trace!("dropping non-keyframe at {:.3} while syncing", packet.pts);
                return Ok(None);
            }
            self.waiting_for_keyframe = false;
        }

        let request = DecodeRequest {
            data: packet.data.clone(),
            pts: packet.pts,
            dts: packet.dts,
            keyframe: packet.keyframe,
        };

        let result = match &mut self.backend {
            Backend::Hardware(backend) => backend.decode(&request),
            Backend::Software => {
                let (w, h) = (self.track.width, self.track.height);
                match self.software.decode_rgba(packet.clone(), w, h).await {
                    Ok(image) => Ok(Some(VideoFrame::new(
                        packet.pts,
                        image.width,
                        image.height,
                        FramePixels::Rgba(image),
                    ))),
                    Err(e) => Err(VideoDecodeError::Decode(e.to_string())),
                }
            }
        };

        match result {
            Ok(Some(frame)) => Ok(self.apply_seek_filter(frame)),
            Ok(None) => Ok(None),
            Err(e) => self.recover(e).await,
        }
    }

    /// Discards frames below the seek target; the first frame at or
    /// past it clears the filter.
    fn apply_seek_filter(&mut self, mut frame: VideoFrame) -> Option<VideoFrame> {
        match self.seek_target {
            Some(target) if frame.pts_seconds < target => {
                trace!(
                    "discarding pre-target frame {:.3} < {:.3}",
                    frame.pts_seconds,
                    target
                );
                frame.close();
                None
            }
            Some(_) => {
                self.seek_target = None;
                Some(frame)
            }
            None => Some(frame),
        }
    }

    /// The recovery state machine. Returns `Ok(None)` when the error
    /// was absorbed and decoding continues with later packets.
    async fn recover(&mut self, error: VideoDecodeError) -> Result<Option<VideoFrame>> {
        match error {
            VideoDecodeError::KeyFrameRejected => {
                self.open_gop_count += 1;
                debug!(
                    "key frame rejected (open GOP), count {}",
                    self.open_gop_count
                );

                if self.open_gop_count > OPEN_GOP_LIMIT {
                    self.enter_software("open-GOP rejections exceeded limit");
                    return Ok(None);
                }

                self.reset_or_recreate().await;
                Ok(None)
            }

            VideoDecodeError::UnsupportedProfile { profile } => {
                debug!("decoder rejected profile {profile}");
                let swapped = self.swap_compatible_profile().await;
                if !swapped {
                    self.enter_software("no compatible profile accepted");
                }
                Ok(None)
            }

            VideoDecodeError::Decode(message) => {
                if self.note_error() >= FATAL_ERROR_COUNT {
                    return Err(Error::data_loss(format!(
                        "persistent decode errors: {message}"
                    )));
                }
                warn!("decode error ({message}), resetting decoder");
                self.reset_or_recreate().await;
                Ok(None)
            }

            VideoDecodeError::Fatal(message) => {
                if self.note_error() >= FATAL_ERROR_COUNT {
                    return Err(Error::data_loss(format!("decoder kept failing: {message}")));
                }
                warn!("decoder fatal ({message}), recreating backend");
                self.recreate().await;
                Ok(None)
            }
        }
    }

    /// Counts an error against the rolling 30 second window.
    fn note_error(&mut self) -> u32 {
        let now = Instant::now();
        match self.last_error_at {
            Some(previous) if now.duration_since(previous) <= ERROR_WINDOW => {
                self.consecutive_error_count += 1;
            }
            _ => self.consecutive_error_count = 1,
        }
        self.last_error_at = Some(now);
        self.consecutive_error_count
    }

    /// Fast path: reset the backend and reapply the configuration.
    /// Falls back to full recreation when the reset is refused.
    async fn reset_or_recreate(&mut self) {
        self.waiting_for_keyframe = true;

        let config = self.config.clone();
        if let Backend::Hardware(backend) = &mut self.backend {
            let mut ok = backend.reset().is_ok();
            if ok {
                if let Some(config) = &config {
                    ok = backend.configure(config).is_ok();
                }
            }
            if ok {
                return;
            }
            debug!("fast reset refused, recreating decoder");
        } else {
            // Software has no state worth resetting.
            return;
        }

        self.recreate().await;
    }

    /// Recreates the hardware backend outright; drops to software when
    /// the fresh instance rejects the active configuration.
    async fn recreate(&mut self) {
        self.waiting_for_keyframe = true;

        if !matches!(self.backend, Backend::Hardware(_)) {
            return;
        }
        let Some(config) = self.config.clone() else {
            self.enter_software("no configuration to recreate with");
            return;
        };

        if let Backend::Hardware(old) = &mut self.backend {
            old.close();
        }

        let mut fresh = self.factory.create();
        if fresh.probe(&config).await && fresh.configure(&config).is_ok() {
            self.backend = Backend::Hardware(fresh);
        } else {
            fresh.close();
            self.enter_software("recreated decoder rejected configuration");
        }
    }

    /// Swaps to the compatible-profile codec string, patching the
    /// configuration record so the advertised profile matches.
    async fn swap_compatible_profile(&mut self) -> bool {
        let Some(config) = self.config.clone() else {
            return false;
        };
        let Some(fallback) = codec::compatible_profile_fallback(&config.codec_string) else {
            return false;
        };

        let extradata = config.extradata.as_ref().map(|data| {
            let mut patched = data.to_vec();
            if let Some(profile) = codec::hevc_profile_of(&fallback) {
                codec::patch_hevc_profile_idc(&mut patched, profile);
            }
            bytes::Bytes::from(patched)
        });

        let candidate = VideoDecoderConfig {
            codec_string: fallback,
            extradata,
            ..config
        };

        self.waiting_for_keyframe = true;

        if let Backend::Hardware(backend) = &mut self.backend {
            if backend.reset().is_ok() && backend.configure(&candidate).is_ok() {
                info!("profile swap accepted: {}", candidate.codec_string);
                self.config = Some(candidate);
                return true;
            }
        }

        false
    }

    /// Whether this packet should be offered to fresh hardware.
    ///
    /// Requires: attempts remaining, the cooldown elapsed, and the
    /// packet verified as a true random-access point by bitstream
    /// inspection (the container flag alone readmits open-GOP frames,
    /// which is how we got here in the first place).
    fn resurrection_due(&self, packet: &Packet) -> bool {
        if self.preference == DecoderPreference::Software
            || self.resurrection_attempts >= RESURRECTION_MAX_ATTEMPTS
        {
            return false;
        }

        let cooled_down = match self.last_resurrection_at {
            Some(last) => last.elapsed() >= RESURRECTION_RETRY_DELAY,
            None => self
                .software_since
                .is_some_and(|since| since.elapsed() >= RESURRECTION_INITIAL_DELAY),
        };
        if !cooled_down {
            return false;
        }

        codec::packet_is_sync_frame(&self.track.codec_name, &packet.data, packet.keyframe)
    }

    /// One resurrection attempt. The outer `Option` is whether hardware
    /// took over (and consumed the packet); the inner one is the frame
    /// it may already have emitted. `None` leaves software mode in
    /// place for this and subsequent packets.
    async fn try_resurrect(&mut self, packet: &Packet) -> Option<Option<VideoFrame>> {
        self.resurrection_attempts += 1;
        self.last_resurrection_at = Some(Instant::now());
        info!(
            "attempting hardware resurrection ({}/{RESURRECTION_MAX_ATTEMPTS})",
            self.resurrection_attempts
        );

        let config = self.config.clone()?;
        let mut backend = self.factory.create();

        if !backend.probe(&config).await || backend.configure(&config).is_err() {
            backend.close();
            debug!("resurrection rejected at configure");
            return None;
        }

        let request = DecodeRequest {
            data: packet.data.clone(),
            pts: packet.pts,
            dts: packet.dts,
            keyframe: packet.keyframe,
        };

        match backend.decode(&request) {
            Ok(frame) => {
                info!("hardware decoder resurrected");
                self.backend = Backend::Hardware(backend);
                self.waiting_for_keyframe = false;
                self.software_since = None;
                Some(frame)
            }
            Err(e) => {
                // First sync frame failed: straight back to software.
                debug!("resurrection failed on first frame: {e}");
                backend.close();
                None
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::demux::testing::video_packet;
    use crate::track::{ColorPrimaries, ColorSpace, ColorTransfer};

    fn hevc_track() -> VideoTrack {
        // Main10 hvcC: profile 2, compat 0x4 after reversal, level 153.
        let mut extradata = vec![0u8; 13];
        extradata[0] = 1;
        extradata[1] = 0x02;
        extradata[2..6].copy_from_slice(&0x2000_0000u32.to_be_bytes());
        extradata[6] = 0xB0;
        extradata[12] = 153;

        VideoTrack {
            id: 0,
            codec_name: "hevc".into(),
            width: 3840,
            height: 2160,
            frame_rate: 24.0,
            profile: 2,
            level: 153,
            color_primaries: ColorPrimaries::Bt2020,
            color_transfer: ColorTransfer::Smpte2084,
            color_space: ColorSpace::Bt2020Ncl,
            rotation_degrees: 0,
            is_hdr: true,
            extradata: Some(bytes::Bytes::from(extradata)),
        }
    }

    fn decoder_with(script: &Arc<HardwareScript>, preference: DecoderPreference) -> VideoDecoder {
        VideoDecoder::new(
            hevc_track(),
            preference,
            Arc::new(ScriptedFactory(Arc::clone(script))),
            Arc::new(NullSoftware),
        )
    }

    #[tokio::test]
    async fn configure_prefers_full_hardware_config() {
        let script = Arc::new(HardwareScript::default());
        let mut decoder = decoder_with(&script, DecoderPreference::Auto);

        decoder.configure().await.unwrap();
        assert!(!decoder.is_software());
        assert_eq!(decoder.codec_string(), Some("hvc1.2.4.L153.B0"));
    }

    #[tokio::test]
    async fn configure_walks_ladder_to_software() {
        let script = Arc::new(HardwareScript::default());
        script.accept_only(&["nothing"]);
        let mut decoder = decoder_with(&script, DecoderPreference::Auto);

        decoder.configure().await.unwrap();
        assert!(decoder.is_software());
    }

    #[tokio::test]
    async fn hardware_preference_fails_when_unsupported() {
        let script = Arc::new(HardwareScript::default());
        script.accept_only(&["nothing"]);
        let mut decoder = decoder_with(&script, DecoderPreference::Hardware);

        assert!(decoder.configure().await.is_err());
    }

    #[tokio::test]
    async fn non_keyframes_dropped_while_syncing() {
        let script = Arc::new(HardwareScript::default());
        let mut decoder = decoder_with(&script, DecoderPreference::Auto);
        decoder.configure().await.unwrap();

        assert!(decoder
            .decode(&video_packet(0.5, false))
            .await
            .unwrap()
            .is_none());

        let mut frame = decoder
            .decode(&video_packet(1.0, true))
            .await
            .unwrap()
            .expect("keyframe decodes");
        assert_eq!(frame.pts_seconds, 1.0);
        frame.close();
    }

    #[tokio::test]
    async fn seek_filter_discards_frames_below_target() {
        let script = Arc::new(HardwareScript::default());
        let mut decoder = decoder_with(&script, DecoderPreference::Auto);
        decoder.configure().await.unwrap();
        decoder.set_seek_target(Some(10.0));

        assert!(decoder
            .decode(&video_packet(9.0, true))
            .await
            .unwrap()
            .is_none());
        assert!(decoder
            .decode(&video_packet(9.5, false))
            .await
            .unwrap()
            .is_none());

        let mut frame = decoder
            .decode(&video_packet(10.01, false))
            .await
            .unwrap()
            .expect("first frame past target is emitted");
        assert!(frame.pts_seconds >= 10.0);
        frame.close();

        // Filter clears itself after the first in-range frame.
        let mut after = decoder
            .decode(&video_packet(9.9, false))
            .await
            .unwrap()
            .expect("filter cleared");
        after.close();
    }

    #[tokio::test]
    async fn open_gop_downgrades_after_sixteenth_rejection() {
        let script = Arc::new(HardwareScript::default());
        let mut decoder = decoder_with(&script, DecoderPreference::Auto);
        decoder.configure().await.unwrap();

        for i in 0..=OPEN_GOP_LIMIT {
            script.push_decode(Err(VideoDecodeError::KeyFrameRejected));
            let result = decoder
                .decode(&video_packet(f64::from(i), true))
                .await
                .unwrap();
            assert!(result.is_none());
        }

        assert_eq!(decoder.open_gop_count(), OPEN_GOP_LIMIT + 1);
        assert!(decoder.is_software(), "16th rejection goes software");

        // Frames keep flowing through the software path.
        let mut frame = decoder
            .decode(&video_packet(20.0, true))
            .await
            .unwrap()
            .expect("software continues emitting");
        frame.close();
    }

    #[tokio::test]
    async fn five_errors_in_window_become_fatal() {
        let script = Arc::new(HardwareScript::default());
        let mut decoder = decoder_with(&script, DecoderPreference::Auto);
        decoder.configure().await.unwrap();

        for i in 0..4 {
            script.push_decode(Err(VideoDecodeError::Decode("bitstream".into())));
            // Recovery reenters the keyframe wait, so keep feeding keys.
            assert!(decoder
                .decode(&video_packet(f64::from(i), true))
                .await
                .unwrap()
                .is_none());
        }

        script.push_decode(Err(VideoDecodeError::Decode("bitstream".into())));
        let err = decoder.decode(&video_packet(5.0, true)).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::DataLoss);
    }

    #[tokio::test]
    async fn stale_error_window_resets_count() {
        let script = Arc::new(HardwareScript::default());
        let mut decoder = decoder_with(&script, DecoderPreference::Auto);
        decoder.configure().await.unwrap();

        decoder.consecutive_error_count = 4;
        decoder.last_error_at = Instant::now().checked_sub(Duration::from_secs(31));

        script.push_decode(Err(VideoDecodeError::Decode("blip".into())));
        assert!(decoder
            .decode(&video_packet(0.0, true))
            .await
            .unwrap()
            .is_none());
        assert_eq!(decoder.consecutive_error_count, 1);
    }

    #[tokio::test]
    async fn profile_rejection_swaps_to_main10() {
        let script = Arc::new(HardwareScript::default());
        script.accept_only(&["hvc1.4.10.L153.B0", "hvc1.2.4.L153.B0"]);

        let mut track = hevc_track();
        track.profile = 4;
        // Rext hvcC: profile_idc 4, compat flags reversing to 0x10.
        let mut extradata = track.extradata.as_ref().unwrap().to_vec();
        extradata[1] = 0x04;
        extradata[2..6].copy_from_slice(&0x0800_0000u32.to_be_bytes());
        track.extradata = Some(bytes::Bytes::from(extradata));

        let mut decoder = VideoDecoder::new(
            track,
            DecoderPreference::Auto,
            Arc::new(ScriptedFactory(Arc::clone(&script))),
            Arc::new(NullSoftware),
        );
        decoder.configure().await.unwrap();
        assert_eq!(decoder.codec_string(), Some("hvc1.4.10.L153.B0"));

        script.push_decode(Err(VideoDecodeError::UnsupportedProfile { profile: 4 }));
        assert!(decoder
            .decode(&video_packet(0.0, true))
            .await
            .unwrap()
            .is_none());

        assert!(!decoder.is_software());
        assert_eq!(decoder.codec_string(), Some("hvc1.2.4.L153.B0"));

        // The patched record now advertises profile 2.
        let patched = decoder.config.as_ref().unwrap().extradata.as_ref().unwrap();
        assert_eq!(patched[1] & 0x1F, 2);
    }

    #[tokio::test]
    async fn resurrection_waits_for_true_sync_frame() {
        let script = Arc::new(HardwareScript::default());
        script.accept_only(&["nothing"]);
        let mut decoder = decoder_with(&script, DecoderPreference::Auto);
        decoder.configure().await.unwrap();
        assert!(decoder.is_software());

        // Cooldown elapsed, but packets are TRAIL slices: no attempt.
        decoder.software_since = Instant::now().checked_sub(Duration::from_secs(11));
        let trail = Packet {
            data: bytes::Bytes::from_static(&[0, 0, 0, 2, 0x02, 0x01]),
            ..video_packet(0.0, true)
        };
        script.accept_only(&[]);
        let mut frame = decoder.decode(&trail).await.unwrap().expect("software frame");
        frame.close();
        assert!(decoder.is_software());
        assert_eq!(decoder.resurrection_attempts, 0);

        // A true IDR slice triggers the attempt and hardware takes over.
        let mut frame = decoder
            .decode(&video_packet(1.0, true))
            .await
            .unwrap()
            .expect("resurrected frame");
        frame.close();
        assert!(!decoder.is_software());
        assert_eq!(decoder.resurrection_attempts, 1);
    }

    #[tokio::test]
    async fn failed_resurrection_returns_to_software_immediately() {
        let script = Arc::new(HardwareScript::default());
        script.accept_only(&["nothing"]);
        let mut decoder = decoder_with(&script, DecoderPreference::Auto);
        decoder.configure().await.unwrap();
        assert!(decoder.is_software());

        decoder.software_since = Instant::now().checked_sub(Duration::from_secs(11));
        script.accept_only(&[]);
        script.push_decode(Err(VideoDecodeError::Decode("first sync frame".into())));

        // The attempt fails on its first frame; software serves it.
        let mut frame = decoder
            .decode(&video_packet(1.0, true))
            .await
            .unwrap()
            .expect("software still serves the packet");
        frame.close();
        assert!(decoder.is_software());
        assert_eq!(decoder.resurrection_attempts, 1);

        // Next attempt only after the 30 s retry delay.
        let idr = video_packet(2.0, true);
        assert!(!decoder.resurrection_due(&idr));
    }

    #[tokio::test]
    async fn flush_resets_open_gop_and_keyframe_wait() {
        let script = Arc::new(HardwareScript::default());
        let mut decoder = decoder_with(&script, DecoderPreference::Auto);
        decoder.configure().await.unwrap();

        script.push_decode(Err(VideoDecodeError::KeyFrameRejected));
        decoder.decode(&video_packet(0.0, true)).await.unwrap();
        assert_eq!(decoder.open_gop_count(), 1);

        decoder.flush();
        assert_eq!(decoder.open_gop_count(), 0);
        assert!(decoder
            .decode(&video_packet(1.0, false))
            .await
            .unwrap()
            .is_none());
    }
}
