//! Audio decoding and sample-layout conversion.
//!
//! Mirrors the video decoder's backend duality: a platform decoder when
//! the host offers one, otherwise Symphonia configured straight from
//! the track's codec parameters and extradata. Output is always
//! float-planar at the source rate, then optionally downmixed to stereo
//! and resampled to the renderer's rate.
//!
//! Audio failures are never fatal to a session. The player surfaces
//! them and keeps the video going; a movie with a broken commentary
//! track should still play.

use std::time::Instant;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{
    CodecParameters, CodecType, DecoderOptions, CODEC_TYPE_AAC, CODEC_TYPE_FLAC, CODEC_TYPE_MP3,
    CODEC_TYPE_PCM_F32LE, CODEC_TYPE_PCM_S16LE,
};

use crate::demux::Packet;
use crate::error::{Error, Result};
use crate::track::AudioTrack;

use super::{AudioSamples, DecodeRequest, HardwareAudio};

/// Renderer-facing output layout.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AudioOutputSpec {
    /// Target sample rate; `None` keeps the source rate.
    pub sample_rate: Option<u32>,
    /// Fold layouts wider than stereo down to two channels.
    pub downmix_to_stereo: bool,
}

impl Default for AudioOutputSpec {
    fn default() -> Self {
        Self {
            sample_rate: None,
            downmix_to_stereo: true,
        }
    }
}

/// Which backend decodes.
enum Backend {
    Hardware(Box<dyn HardwareAudio>),
    Software(SymphoniaBackend),
}

/// The audio decoder component.
pub struct AudioDecoder {
    track: AudioTrack,
    backend: Backend,
    spec: AudioOutputSpec,
    last_output_at: Option<Instant>,
}

impl AudioDecoder {
    /// Creates and configures a decoder for a track.
    ///
    /// The hardware backend is used when the host provides one that
    /// claims support; everything else lands on Symphonia.
    ///
    /// # Errors
    ///
    /// Returns error only if no backend at all can handle the codec.
    pub fn new(
        track: AudioTrack,
        hardware: Option<Box<dyn HardwareAudio>>,
        spec: AudioOutputSpec,
    ) -> Result<Self> {
        let extradata = track.extradata.as_deref();

        if let Some(mut hw) = hardware {
            if hw.supports(&track.codec_name, extradata) {
                match hw.configure(&track.codec_name, track.sample_rate, track.channels, extradata)
                {
                    Ok(()) => {
                        debug!("hardware audio decoder configured: {}", track.codec_name);
                        return Ok(Self {
                            track,
                            backend: Backend::Hardware(hw),
                            spec,
                            last_output_at: None,
                        });
                    }
                    Err(e) => {
                        debug!("hardware audio configure failed: {e}");
                    }
                }
            }
        }

        let software = SymphoniaBackend::new(&track)?;
        debug!("software audio decoder configured: {}", track.codec_name);
        Ok(Self {
            track,
            backend: Backend::Software(software),
            spec,
            last_output_at: None,
        })
    }

    /// Decodes one packet into at most one block of samples, already in
    /// the renderer's layout.
    ///
    /// # Errors
    ///
    /// Errors are reportable but non-fatal; the caller logs and keeps
    /// feeding packets.
    pub fn decode(&mut self, packet: &Packet) -> Result<Option<AudioSamples>> {
        let request = DecodeRequest {
            data: packet.data.clone(),
            pts: packet.pts,
            dts: packet.dts,
            keyframe: packet.keyframe,
        };

        let decoded = match &mut self.backend {
            Backend::Hardware(hw) => hw
                .decode(&request)
                .map_err(Error::data_loss)?,
            Backend::Software(sw) => sw.decode(&request)?,
        };

        let Some(mut samples) = decoded else {
            return Ok(None);
        };

        if self.spec.downmix_to_stereo && samples.channel_count() > 2 {
            samples = downmix_to_stereo(&samples);
        }
        if let Some(rate) = self.spec.sample_rate {
            if rate != samples.sample_rate {
                samples = resample_linear(&samples, rate);
            }
        }

        self.last_output_at = Some(Instant::now());
        Ok(Some(samples))
    }

    /// When the decoder last produced output; feeds the renderer's
    /// healthy-buffer heuristic.
    #[must_use]
    pub fn last_output_at(&self) -> Option<Instant> {
        self.last_output_at
    }

    /// Drops buffered state after a seek or track switch.
    pub fn flush(&mut self) {
        match &mut self.backend {
            Backend::Hardware(hw) => hw.flush(),
            Backend::Software(sw) => sw.reset(),
        }
    }

    /// The track this decoder was built for.
    #[must_use]
    pub fn track(&self) -> &AudioTrack {
        &self.track
    }

    /// Releases the backend.
    pub fn close(&mut self) {
        if let Backend::Hardware(hw) = &mut self.backend {
            hw.close();
        }
    }
}

/// Maps a parser codec name onto a Symphonia codec type.
fn codec_type_for(codec_name: &str) -> Option<CodecType> {
    match codec_name {
        "aac" => Some(CODEC_TYPE_AAC),
        "mp3" | "mp2" => Some(CODEC_TYPE_MP3),
        "flac" => Some(CODEC_TYPE_FLAC),
        "pcm_s16le" => Some(CODEC_TYPE_PCM_S16LE),
        "pcm_f32le" => Some(CODEC_TYPE_PCM_F32LE),
        _ => None,
    }
}

/// Symphonia-backed software decode.
///
/// Configured directly from track parameters rather than through a
/// format probe: the container is already demuxed, so Symphonia only
/// sees raw codec packets.
struct SymphoniaBackend {
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    sample_rate: u32,
    /// Reusable interleaved buffer, sized on first decode.
    buffer: Option<SampleBuffer<f32>>,
}

impl SymphoniaBackend {
    fn new(track: &AudioTrack) -> Result<Self> {
        let codec_type = codec_type_for(&track.codec_name).ok_or_else(|| {
            Error::unimplemented(format!(
                "no software decoder for audio codec {}",
                track.codec_name
            ))
        })?;

        let mut params = CodecParameters::new();
        params
            .for_codec(codec_type)
            .with_sample_rate(track.sample_rate);
        if let Some(extradata) = &track.extradata {
            params.with_extra_data(extradata.to_vec().into_boxed_slice());
        }

        let decoder = symphonia::default::get_codecs().make(&params, &DecoderOptions::default())?;

        Ok(Self {
            decoder,
            sample_rate: track.sample_rate,
            buffer: None,
        })
    }

    fn decode(&mut self, request: &DecodeRequest) -> Result<Option<AudioSamples>> {
        let packet = symphonia::core::formats::Packet::new_from_boxed_slice(
            0,
            0,
            0,
            request.data.to_vec().into_boxed_slice(),
        );

        let decoded = self.decoder.decode(&packet)?;
        let spec = *decoded.spec();
        let channels = spec.channels.count();
        if channels == 0 || decoded.frames() == 0 {
            return Ok(None);
        }

        // Undersized buffers are dropped so the match below can
        // reallocate at the decoded capacity.
        if self
            .buffer
            .as_ref()
            .is_some_and(|b| b.capacity() < decoded.capacity() * channels)
        {
            self.buffer = None;
        }
        let buffer = match self.buffer.as_mut() {
            Some(buffer) => buffer,
            None => self
                .buffer
                .insert(SampleBuffer::new(decoded.capacity() as u64, spec)),
        };
        buffer.copy_interleaved_ref(decoded);

        // De-interleave into the engine's planar layout.
        let interleaved = buffer.samples();
        let frames = interleaved.len() / channels;
        let mut planes = vec![Vec::with_capacity(frames); channels];
        for frame in interleaved.chunks_exact(channels) {
            for (plane, &sample) in planes.iter_mut().zip(frame) {
                plane.push(sample);
            }
        }

        Ok(Some(AudioSamples {
            sample_rate: if spec.rate > 0 {
                spec.rate
            } else {
                self.sample_rate
            },
            pts_seconds: request.pts,
            planes,
        }))
    }

    fn reset(&mut self) {
        self.decoder.reset();
        self.buffer = None;
    }
}

/// Folds an arbitrary layout down to stereo.
///
/// The first two planes are taken as front left/right; every further
/// plane (center, surrounds, LFE) is mixed into both sides at -3 dB.
/// Output is rescaled by the total weight so a full-scale input cannot
/// clip.
#[must_use]
pub fn downmix_to_stereo(samples: &AudioSamples) -> AudioSamples {
    let frames = samples.frame_count();
    let mut left = vec![0.0f32; frames];
    let mut right = vec![0.0f32; frames];

    let surround_gain = std::f32::consts::FRAC_1_SQRT_2;
    let extra = samples.planes.len().saturating_sub(2);
    #[expect(clippy::cast_precision_loss)]
    let scale = 1.0 / (1.0 + surround_gain * extra as f32);

    for (index, plane) in samples.planes.iter().enumerate() {
        match index {
            0 => left.copy_from_slice(plane),
            1 => right.copy_from_slice(plane),
            _ => {
                for ((l, r), &s) in left.iter_mut().zip(right.iter_mut()).zip(plane) {
                    *l += s * surround_gain;
                    *r += s * surround_gain;
                }
            }
        }
    }

    if samples.planes.len() == 1 {
        right.copy_from_slice(&left);
    }

    for (l, r) in left.iter_mut().zip(right.iter_mut()) {
        *l *= scale;
        *r *= scale;
    }

    AudioSamples {
        sample_rate: samples.sample_rate,
        pts_seconds: samples.pts_seconds,
        planes: vec![left, right],
    }
}

/// Linear-interpolation resampler.
///
/// Quality is adequate for playback-rate conversion between the common
/// 44.1/48 kHz family; anything fancier belongs in the output device.
#[must_use]
pub fn resample_linear(samples: &AudioSamples, target_rate: u32) -> AudioSamples {
    if samples.sample_rate == target_rate || samples.sample_rate == 0 {
        return samples.clone();
    }

    let ratio = f64::from(samples.sample_rate) / f64::from(target_rate);
    let in_frames = samples.frame_count();
    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let out_frames = ((in_frames as f64) / ratio).floor() as usize;

    let planes = samples
        .planes
        .iter()
        .map(|plane| {
            (0..out_frames)
                .map(|i| {
                    let pos = i as f64 * ratio;
                    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let base = pos.floor() as usize;
                    let frac = (pos - pos.floor()) as f32;
                    let a = plane[base.min(in_frames - 1)];
                    let b = plane[(base + 1).min(in_frames - 1)];
                    a + (b - a) * frac
                })
                .collect()
        })
        .collect();

    AudioSamples {
        sample_rate: target_rate,
        pts_seconds: samples.pts_seconds,
        planes,
    }
}
