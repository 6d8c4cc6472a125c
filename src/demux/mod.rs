//! The async demuxer bridge.
//!
//! The container parser is synchronous: `read_frame` blocks until its
//! I/O callbacks are answered. The engine's sources are async. This
//! module reconciles the two by running the parser on a dedicated
//! thread and parking each of its I/O callbacks as a continuation
//! `{offset, size, resolver}` that an async task services from the
//! source, copying the bytes back and unblocking the parser.
//!
//! Exactly one parser call is in flight per demuxer at any time.
//! Callers that arrive while a call is in flight wait; a call stuck for
//! more than [`IN_FLIGHT_TIMEOUT`] has its flag force-reset so the
//! session can continue (typically into a seek that abandons the stuck
//! read).
//!
//! All offsets are 64-bit: a 2-hour UHD remux crosses the 4 GiB line in
//! its first half hour.

pub mod parser;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{Error, Result};
use crate::source::Source;
use crate::track::{
    AudioTrack, ColorPrimaries, ColorSpace, ColorTransfer, MediaInfo, SubtitleTrack, Track,
    VideoTrack,
};

use parser::{
    ContainerInfo, ContainerParser, ParserIo, RawPacket, RawSubtitle, RgbaImage, SeekFlags,
    StreamInfo, StreamKind,
};

/// A packet as handed to decoders. Identical to the parser's raw
/// packet; re-exported under the engine's name for its data model.
pub type Packet = RawPacket;

/// How long one parser call may stay in flight before the guard is
/// force-reset.
pub const IN_FLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

/// Polling interval while waiting for the in-flight slot.
const IN_FLIGHT_POLL: Duration = Duration::from_millis(25);

/// One parked parser I/O callback.
///
/// Created on the parser thread, resolved by the async I/O task.
struct IoContinuation {
    offset: u64,
    size: u64,
    resolver: std::sync::mpsc::SyncSender<Result<Bytes>>,
}

/// The blocking I/O handle given to the parser.
///
/// Each read sends a continuation to the async side and blocks the
/// parser thread until it resolves.
struct BridgeIo {
    requests: mpsc::UnboundedSender<IoContinuation>,
    size: u64,
}

impl ParserIo for BridgeIo {
    fn size(&mut self) -> u64 {
        self.size
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let (resolver, resolved) = std::sync::mpsc::sync_channel(1);
        let continuation = IoContinuation {
            offset,
            size: buf.len() as u64,
            resolver,
        };

        if self.requests.send(continuation).is_err() {
            // The async side is gone; the session is closing.
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "source task terminated",
            ));
        }

        match resolved.recv() {
            Ok(Ok(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Ok(Err(e)) => Err(std::io::Error::other(e.to_string())),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "source task dropped the continuation",
            )),
        }
    }
}

/// Commands executed on the parser thread.
enum ParserCommand {
    Open {
        reply: oneshot::Sender<Result<(ContainerInfo, Vec<StreamInfo>)>>,
    },
    ReadFrame {
        reply: oneshot::Sender<Result<Option<RawPacket>>>,
    },
    Seek {
        target: f64,
        stream_index: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    Extradata {
        stream_index: u32,
        reply: oneshot::Sender<Result<Option<Bytes>>>,
    },
    DecodeSubtitle {
        packet: RawPacket,
        reply: oneshot::Sender<Result<RawSubtitle>>,
    },
    DecodeVideoRgba {
        packet: RawPacket,
        width: u32,
        height: u32,
        reply: oneshot::Sender<Result<RgbaImage>>,
    },
}

/// In-flight guard state.
struct InFlight {
    busy: bool,
    since: Instant,
}

/// Async facade over one parser instance and one source.
///
/// Owns the parser thread and the I/O servicing task. Dropping or
/// closing the demuxer tears both down and aborts outstanding reads.
pub struct Demuxer {
    commands: StdMutex<Option<std::sync::mpsc::Sender<ParserCommand>>>,
    in_flight: Arc<StdMutex<InFlight>>,
    source: Arc<Mutex<Box<dyn Source>>>,
    io_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    parser_thread: StdMutex<Option<std::thread::JoinHandle<()>>>,
    /// Stream the parser should resolve seeks against (first video).
    seek_stream: std::sync::atomic::AtomicU32,
    info: StdMutex<Option<MediaInfo>>,
}

impl Demuxer {
    /// Creates the bridge around a parser and a source.
    ///
    /// Spawns the parser thread and the I/O task immediately; no
    /// container data is touched until [`open`](Self::open).
    #[must_use]
    pub fn new(mut parser: Box<dyn ContainerParser>, source: Box<dyn Source>) -> Self {
        let source = Arc::new(Mutex::new(source));
        let size = {
            // The lock is uncontended here; `try_lock` cannot fail.
            source.try_lock().map_or(0, |s| s.size())
        };

        let (io_tx, mut io_rx) = mpsc::unbounded_channel::<IoContinuation>();
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<ParserCommand>();

        // Services parser I/O continuations from the async source.
        let io_source = Arc::clone(&source);
        let io_task = tokio::spawn(async move {
            while let Some(continuation) = io_rx.recv().await {
                let result = {
                    let mut source = io_source.lock().await;
                    source.read(continuation.offset, continuation.size).await
                };
                // A dropped resolver means the parser call was abandoned.
                let _ = continuation.resolver.send(result);
            }
        });

        // The parser lives here, blocking on its I/O through BridgeIo.
        let parser_thread = std::thread::Builder::new()
            .name("kinema-parser".into())
            .spawn(move || {
                let mut io = BridgeIo {
                    requests: io_tx,
                    size,
                };

                while let Ok(command) = cmd_rx.recv() {
                    match command {
                        ParserCommand::Open { reply } => {
                            let result = parser.open(&mut io).and_then(|count| {
                                let mut streams = Vec::with_capacity(count as usize);
                                for index in 0..count {
                                    streams.push(parser.stream_info(index)?);
                                }
                                Ok((parser.container_info(), streams))
                            });
                            let _ = reply.send(result);
                        }
                        ParserCommand::ReadFrame { reply } => {
                            let _ = reply.send(parser.read_frame(&mut io));
                        }
                        ParserCommand::Seek {
                            target,
                            stream_index,
                            reply,
                        } => {
                            let result = parser.seek(
                                &mut io,
                                target,
                                stream_index,
                                SeekFlags { backward: true },
                            );
                            let _ = reply.send(result);
                        }
                        ParserCommand::Extradata {
                            stream_index,
                            reply,
                        } => {
                            let _ = reply.send(parser.extradata(stream_index));
                        }
                        ParserCommand::DecodeSubtitle { packet, reply } => {
                            let _ = reply.send(parser.decode_subtitle(&packet));
                        }
                        ParserCommand::DecodeVideoRgba {
                            packet,
                            width,
                            height,
                            reply,
                        } => {
                            let _ = reply.send(parser.decode_video_rgba(&packet, width, height));
                        }
                    }
                }

                parser.destroy();
            })
            .expect("failed to spawn parser thread");

        Self {
            commands: StdMutex::new(Some(cmd_tx)),
            in_flight: Arc::new(StdMutex::new(InFlight {
                busy: false,
                since: Instant::now(),
            })),
            source,
            io_task: StdMutex::new(Some(io_task)),
            parser_thread: StdMutex::new(Some(parser_thread)),
            seek_stream: std::sync::atomic::AtomicU32::new(0),
            info: StdMutex::new(None),
        }
    }

    /// Claims the single in-flight slot, waiting while another call
    /// runs and force-resetting a stuck one after [`IN_FLIGHT_TIMEOUT`].
    async fn begin_call(&self) -> Result<()> {
        let wait_deadline = Instant::now() + IN_FLIGHT_TIMEOUT + IN_FLIGHT_TIMEOUT;
        loop {
            {
                let mut guard = self.in_flight.lock().expect("in-flight lock poisoned");
                if !guard.busy {
                    guard.busy = true;
                    guard.since = Instant::now();
                    return Ok(());
                }
                if guard.since.elapsed() >= IN_FLIGHT_TIMEOUT {
                    warn!("parser call stuck for {IN_FLIGHT_TIMEOUT:?}, force-resetting in-flight guard");
                    guard.since = Instant::now();
                    return Ok(());
                }
            }

            if Instant::now() >= wait_deadline {
                return Err(Error::deadline_exceeded(
                    "timed out waiting for the in-flight parser call",
                ));
            }
            tokio::time::sleep(IN_FLIGHT_POLL).await;
        }
    }

    /// Releases the in-flight slot.
    fn end_call(&self) {
        let mut guard = self.in_flight.lock().expect("in-flight lock poisoned");
        guard.busy = false;
    }

    /// Runs one parser command under the in-flight discipline.
    async fn call<T, F>(&self, make: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> ParserCommand,
    {
        let commands = self
            .commands
            .lock()
            .expect("command lock poisoned")
            .clone()
            .ok_or_else(|| Error::cancelled("demuxer closed"))?;

        self.begin_call().await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        if commands.send(make(reply_tx)).is_err() {
            self.end_call();
            return Err(Error::cancelled("parser thread terminated"));
        }

        let result = match tokio::time::timeout(IN_FLIGHT_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::cancelled("parser call dropped")),
            Err(_) => Err(Error::deadline_exceeded("parser call exceeded 10s watchdog")),
        };

        self.end_call();
        result
    }

    /// Parses container headers and returns the media description.
    ///
    /// Color metadata the parser leaves unspecified is normalized here;
    /// see [`normalize_video_color`].
    ///
    /// # Errors
    ///
    /// Returns error if the container cannot be parsed.
    pub async fn open(&self) -> Result<MediaInfo> {
        let (container, streams) = self
            .call(|reply| ParserCommand::Open { reply })
            .await?;

        let mut tracks = Vec::with_capacity(streams.len());
        for stream in streams {
            match stream.kind {
                StreamKind::Video => {
                    let mut video = VideoTrack {
                        id: stream.index,
                        codec_name: stream.codec_name,
                        width: stream.width,
                        height: stream.height,
                        frame_rate: stream.frame_rate,
                        profile: stream.profile,
                        level: stream.level,
                        color_primaries: stream.color_primaries,
                        color_transfer: stream.color_transfer,
                        color_space: stream.color_space,
                        rotation_degrees: stream.rotation_degrees,
                        is_hdr: false,
                        extradata: stream.extradata,
                    };
                    normalize_video_color(&mut video);
                    video.is_hdr = matches!(
                        video.color_transfer,
                        ColorTransfer::Smpte2084 | ColorTransfer::AribStdB67
                    );
                    tracks.push(Track::Video(video));
                }
                StreamKind::Audio => tracks.push(Track::Audio(AudioTrack {
                    id: stream.index,
                    codec_name: stream.codec_name,
                    sample_rate: stream.sample_rate,
                    channels: stream.channels,
                    language: stream.language,
                    extradata: stream.extradata,
                })),
                StreamKind::Subtitle => tracks.push(Track::Subtitle(SubtitleTrack {
                    id: stream.index,
                    codec_name: stream.codec_name,
                    kind: stream.subtitle_kind,
                    language: stream.language,
                    extradata: stream.extradata,
                })),
                StreamKind::Other => {
                    trace!("ignoring non-media stream {}", stream.index);
                }
            }
        }

        // Prefer the first video stream for seek resolution.
        let seek_stream = tracks
            .iter()
            .find_map(|t| match t {
                Track::Video(v) => Some(v.id),
                _ => None,
            })
            .unwrap_or(0);
        self.seek_stream
            .store(seek_stream, std::sync::atomic::Ordering::Relaxed);

        let info = MediaInfo {
            format_name: container.format_name,
            duration_seconds: container.duration_seconds,
            start_time_seconds: container.start_time_seconds,
            bit_rate: container.bit_rate,
            tracks,
        };
        *self.info.lock().expect("info lock poisoned") = Some(info.clone());

        debug!(
            "opened {} ({:.1}s, {} tracks)",
            info.format_name,
            info.duration_seconds,
            info.tracks.len()
        );
        Ok(info)
    }

    /// Media description from the last successful [`open`](Self::open).
    #[must_use]
    pub fn info(&self) -> Option<MediaInfo> {
        self.info.lock().expect("info lock poisoned").clone()
    }

    /// Reads the next packet in container order, `None` at EOF.
    ///
    /// # Errors
    ///
    /// Returns error on source failure, parser failure or watchdog
    /// expiry.
    pub async fn read_packet(&self) -> Result<Option<Packet>> {
        let packet = self
            .call(|reply| ParserCommand::ReadFrame { reply })
            .await?;

        Ok(packet.map(|mut p| {
            // Containers occasionally omit pts on non-presented frames;
            // decoders need something monotonic-ish, dts is the best bet.
            if p.pts.is_nan() {
                p.pts = p.dts;
            }
            p
        }))
    }

    /// Repositions so the next packets come from the keyframe at or
    /// before `target_seconds` on the primary video stream.
    ///
    /// # Errors
    ///
    /// Returns error if the parser rejects the target.
    pub async fn seek(&self, target_seconds: f64) -> Result<()> {
        let stream_index = self.seek_stream.load(std::sync::atomic::Ordering::Relaxed);
        self.call(|reply| ParserCommand::Seek {
            target: target_seconds,
            stream_index,
            reply,
        })
        .await
    }

    /// Out-of-band codec configuration for a stream.
    ///
    /// # Errors
    ///
    /// Returns error if the stream index is unknown.
    pub async fn extradata(&self, stream_index: u32) -> Result<Option<Bytes>> {
        self.call(|reply| ParserCommand::Extradata {
            stream_index,
            reply,
        })
        .await
    }

    /// Decodes a subtitle packet through the parser.
    ///
    /// # Errors
    ///
    /// Returns error on malformed subtitle data.
    pub async fn decode_subtitle(&self, packet: Packet) -> Result<RawSubtitle> {
        self.call(|reply| ParserCommand::DecodeSubtitle { packet, reply })
            .await
    }

    /// Software-decodes a video packet to RGBA through the parser.
    ///
    /// # Errors
    ///
    /// Returns error on decode failure.
    pub async fn decode_video_rgba(
        &self,
        packet: Packet,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage> {
        self.call(|reply| ParserCommand::DecodeVideoRgba {
            packet,
            width,
            height,
            reply,
        })
        .await
    }

    /// Furthest byte the source has contiguously buffered.
    pub async fn buffered_to(&self) -> u64 {
        self.source.lock().await.buffered_to()
    }

    /// Total source size in bytes.
    pub async fn source_size(&self) -> u64 {
        self.source.lock().await.size()
    }

    /// Tears down the parser thread, aborts outstanding I/O and closes
    /// the source. Pending async calls fail with `Cancelled`.
    pub async fn close(&self) {
        // Dropping the command sender ends the parser thread loop; its
        // in-progress read fails once the I/O task is aborted.
        *self.commands.lock().expect("command lock poisoned") = None;

        let io_task = self.io_task.lock().expect("io task lock poisoned").take();
        if let Some(io_task) = io_task {
            io_task.abort();
        }

        self.source.lock().await.close();

        let thread = self
            .parser_thread
            .lock()
            .expect("parser thread lock poisoned")
            .take();
        if let Some(thread) = thread {
            // The thread exits as soon as its current call unblocks.
            let _ = thread.join();
        }
        trace!("demuxer closed");
    }
}

/// Fills in color metadata the parser reported as unspecified.
///
/// UHD content authored with HEVC Main10/Rext but missing tags is in
/// practice always BT.2020/PQ; presenting it as BT.709 crushes it into
/// gray. Smaller video keeps `Unspecified` and the rasterizer's default
/// treatment.
pub fn normalize_video_color(video: &mut VideoTrack) {
    if video.color_primaries != ColorPrimaries::Unspecified {
        return;
    }

    let is_uhd = video.width >= 3840 && video.height >= 2160;
    let is_hevc_10bit_profile = matches!(video.codec_name.as_str(), "hevc" | "h265")
        && matches!(video.profile, 2 | 4);

    if is_uhd && (is_hevc_10bit_profile || video.color_transfer == ColorTransfer::Unspecified) {
        video.color_primaries = ColorPrimaries::Bt2020;
        video.color_transfer = ColorTransfer::Smpte2084;
        video.color_space = ColorSpace::Bt2020Ncl;
        debug!(
            "normalized unspecified color metadata to BT.2020/PQ for {}x{} {}",
            video.width, video.height, video.codec_name
        );
    }
}
