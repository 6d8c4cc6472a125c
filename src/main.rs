//! Command line entry point.
//!
//! The engine consumes its container parser through a trait, so full
//! playback only exists inside an embedding application that links a
//! parser in. What the binary offers is the part that works standalone
//! and breaks most often in the field: the source layer. It probes a
//! URL or file the way a playback session would (range support, size,
//! retry policy) and reports what the engine would see.
//!
//! # Runtime Behavior
//!
//! 1. Parses command line arguments
//! 2. Configures logging
//! 3. Opens the source with the playback retry policy
//! 4. Reads the probe windows and reports throughput
//!
//! # Error Handling
//!
//! * Invalid arguments terminate immediately
//! * Transient network errors retry with the engine's backoff
//! * Fatal source errors (no range support, 4xx) report and exit

use std::process;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use clap::{Parser, ValueHint};
use log::{error, info, LevelFilter};

use kinema::{
    config::PlayerConfig,
    error::{Error, Result},
    source::http::{HttpSource, HttpSourceOptions, NetworkMonitor},
    source::{file::FileSource, ChunkCache, Source},
};

/// Build profile indicator for logging.
///
/// Shows "debug" when built without optimizations.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";

/// Build profile indicator for logging.
///
/// Shows "release" when built with optimizations.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Media URL (http/https) or local file path to probe
    #[arg(value_hint = ValueHint::Url, env = "KINEMA_SOURCE")]
    source: String,

    /// Byte offset to start the probe read at
    #[arg(long, default_value_t = 0, env = "KINEMA_OFFSET")]
    offset: u64,

    /// Number of bytes to read for the throughput probe
    #[arg(long, default_value_t = 4 * 1024 * 1024, env = "KINEMA_PROBE_BYTES")]
    probe_bytes: u64,

    /// Suppress all output except warnings and errors
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING, env = "KINEMA_QUIET")]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Use -v for debug logging
    /// Use -vv for trace logging
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING, env = "KINEMA_VERBOSE")]
    verbose: u8,
}

/// Initialize logging system.
///
/// Configures logging based on command line arguments and environment:
/// * `-q` sets Warning level
/// * `-v` sets Debug level
/// * `-vv` sets Trace level
/// * `RUST_LOG` environment variable provides defaults
/// * External crates are limited to Error level unless tracing
///
/// # Panics
///
/// Panics if logger is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you
        // should probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let mut external_level = LevelFilter::Error;
    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose`
                // is 0 by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::max(),
        };

        logger.filter_module("kinema", level);

        if level == LevelFilter::Trace {
            external_level = LevelFilter::max();
        }
    };

    // Filter log messages of external crates.
    for external_module in ["reqwest", "hyper", "rustls", "symphonia_core", "cpal"] {
        logger.filter_module(external_module, external_level);
    }

    logger.init();
}

/// Probes the source the way a playback session opens it.
async fn run(args: Args) -> Result<()> {
    let is_remote = args.source.starts_with("http://") || args.source.starts_with("https://");

    let mut source: Box<dyn Source> = if is_remote {
        let opened = HttpSource::open(
            &args.source,
            HttpSourceOptions::default(),
            NetworkMonitor::new(),
        )
        .await?;
        info!("server supports range requests");
        Box::new(opened)
    } else {
        let config = PlayerConfig::default();
        let cache = Arc::new(Mutex::new(ChunkCache::new(config.cache_max_bytes())));
        Box::new(FileSource::open(&args.source, cache).await?)
    };

    let size = source.size();
    info!("source size: {size} bytes ({:.1} MiB)", size as f64 / 1024.0 / 1024.0);

    if args.offset >= size {
        return Err(Error::out_of_range(format!(
            "probe offset {} beyond source size {size}",
            args.offset
        )));
    }

    let want = args.probe_bytes.min(size - args.offset);
    let started = Instant::now();
    let mut read = 0u64;
    let mut offset = args.offset;

    while read < want {
        let chunk = source.read(offset, (want - read).min(2 * 1024 * 1024)).await?;
        if chunk.is_empty() {
            break;
        }
        read += chunk.len() as u64;
        offset += chunk.len() as u64;
    }

    let elapsed = started.elapsed().as_secs_f64();
    #[expect(clippy::cast_precision_loss)]
    let mib = read as f64 / 1024.0 / 1024.0;
    info!(
        "read {read} bytes in {elapsed:.2}s ({:.1} MiB/s)",
        mib / elapsed.max(1e-6)
    );
    info!(
        "buffered through byte {} after the probe",
        source.buffered_to()
    );

    source.close();
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(&args);

    info!(
        "starting {} {} ({BUILD_PROFILE})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
