//! Streaming video playback engine.
//!
//! **kinema** pulls an encoded media container over byte-range reads,
//! splits it into elementary streams, decodes them with a hardware-first
//! strategy, and presents synchronized audio, video and subtitles at
//! display cadence. Multi-gigabyte sources play without being downloaded
//! in full, and seeking is random-access.
//!
//! # Core Features
//!
//! * **Pull-based sources**: HTTP byte-range and local-file sources
//!   behind one trait, with a bounded chunk cache
//! * **Async demuxer bridge**: drives a blocking container parser from
//!   async I/O without ever holding more than one call in flight
//! * **Decoder orchestration**: hardware decode with automatic software
//!   fallback, open-GOP recovery and hardware resurrection
//! * **A/V sync**: the audio renderer is the master clock; the video
//!   clock follows it loosely for smoothness
//!
//! # Architecture
//!
//! The library is organized into several key modules:
//!
//! * **Input**
//!   - [`source`]: byte-range sources and the shared chunk cache
//!   - [`demux`]: the async bridge around the container parser
//!   - [`track`]: stream metadata and selection state
//!
//! * **Decoding**
//!   - [`codec`]: codec-string computation and bitstream inspection
//!   - [`decoder`]: video, audio and subtitle decoders
//!
//! * **Presentation**
//!   - [`scheduler`]: the pts-ordered frame queue and presentation loop
//!   - [`renderer`]: scheduled audio playback and the master clock
//!   - [`clock`]: the wall-clock media-time source
//!   - [`sink`]: raster and audio output contracts
//!
//! * **Control**
//!   - [`player`]: the embedding API and demux loop
//!   - [`state`]: the playback state machine
//!   - [`seek`]: flush, keyframe skip and target-time filtering
//!   - [`preview`]: the isolated thumbnail pipeline
//!
//! * **Configuration**
//!   - [`config`]: session settings
//!   - [`settings`]: persisted user preferences
//!
//! * **Utilities**
//!   - [`error`]: error types and handling
//!   - [`events`]: event fan-out for embedders
//!   - [`util`]: general helper functions
//!
//! # Example
//!
//! ```rust,no_run
//! use kinema::{config::PlayerConfig, player::Player};
//!
//! async fn example() -> kinema::error::Result<()> {
//!     let config = PlayerConfig::default();
//!     let mut player = Player::new(config);
//!
//!     let info = player.load("https://example.com/movie.mkv").await?;
//!     println!("duration: {:.1}s", info.duration_seconds);
//!
//!     player.play().await?;
//!     player.seek(123.45).await?;
//!
//!     player.destroy().await;
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! Errors are handled through the types in the [`error`] module, with
//! most functions returning [`Result`](error::Result). Recoverable
//! conditions (transient network failures, unsupported hardware codecs,
//! open-GOP key frames) are handled inside the component that owns the
//! resource and never reach the embedder.
//!
//! # Concurrency
//!
//! The engine runs on the Tokio runtime. The container parser is
//! synchronous and blocking; the [`demux`] bridge suspends its call
//! stack on a dedicated thread while async source reads complete.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![doc(test(attr(ignore)))]

#[macro_use]
extern crate log;

pub mod clock;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod demux;
pub mod error;
pub mod events;
pub mod player;
pub mod preview;
pub mod renderer;
pub mod scheduler;
pub mod seek;
pub mod settings;
pub mod sink;
pub mod source;
pub mod state;
pub mod track;
pub mod util;
