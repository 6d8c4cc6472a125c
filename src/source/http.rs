//! Remote byte-range source.
//!
//! Issues HTTP range requests against a media URL, keeping a sliding
//! window buffer so that the demuxer's many small sequential reads hit
//! the network only once per window.
//!
//! # Retry Policy
//!
//! Transient failures (HTTP 5xx, 429, connection errors) are retried
//! with exponential backoff: base 1 s, factor 1.5, capped at 5 s, at
//! most 5 retries. A 416 response means the read ran past EOF and
//! yields an empty buffer. A 200 response where 206 was expected is
//! fatal: the server ignored the `Range` header, and downloading a
//! multi-gigabyte file whole is never acceptable.
//!
//! # Offline Handling
//!
//! When the embedder reports the network as offline through the
//! [`NetworkMonitor`], in-progress reads suspend until restoration
//! instead of burning their retry budget.

use std::time::Duration;

use bytes::Bytes;
use exponential_backoff::Backoff;
use futures_util::future::BoxFuture;
use http::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use url::Url;

use crate::error::{Error, ErrorKind, Result};

use super::Source;

/// Default sliding window size (2 MiB).
///
/// Each network round trip fetches at least this much, so sequential
/// demuxing of interleaved containers stays at a handful of requests
/// per second even at high bitrates.
pub const WINDOW_SIZE: u64 = 2 * 1024 * 1024;

/// Upper bound for a single fetch (16 MiB).
pub const MAX_FETCH_SIZE: u64 = 16 * 1024 * 1024;

/// Per-request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of retry attempts before a transient failure becomes fatal.
const RETRY_ATTEMPTS: u32 = 5;

/// First retry delay.
const MIN_BACKOFF: Duration = Duration::from_secs(1);

/// Retry delays never exceed this.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Backoff growth factor per attempt.
const BACKOFF_FACTOR: f32 = 1.5;

/// Shared network-state signal.
///
/// The embedder flips this when the host reports connectivity changes;
/// sources suspend reads while offline and resume on restoration.
#[derive(Clone, Debug)]
pub struct NetworkMonitor {
    online: tokio::sync::watch::Sender<bool>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkMonitor {
    /// Creates a monitor that starts online.
    #[must_use]
    pub fn new() -> Self {
        let (online, _) = tokio::sync::watch::channel(true);
        Self { online }
    }

    /// Reports a connectivity change.
    pub fn set_online(&self, is_online: bool) {
        if *self.online.borrow() != is_online {
            info!(
                "network {}",
                if is_online { "restored" } else { "offline" }
            );
            self.online.send_replace(is_online);
        }
    }

    /// Whether the network is currently believed reachable.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Waits until the network is online. Returns immediately when it
    /// already is.
    async fn wait_online(&self) {
        let mut rx = self.online.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Tuning knobs for a remote source.
///
/// The playback source uses the defaults; the preview pipeline uses a
/// smaller window so scrub requests stay cheap.
#[derive(Clone, Copy, Debug)]
pub struct HttpSourceOptions {
    /// Sliding window size in bytes.
    pub window_size: u64,
    /// Cap for one fetch in bytes.
    pub max_fetch_size: u64,
}

impl Default for HttpSourceOptions {
    fn default() -> Self {
        Self {
            window_size: WINDOW_SIZE,
            max_fetch_size: MAX_FETCH_SIZE,
        }
    }
}

/// The sliding window: one contiguous span of the remote file.
#[derive(Debug)]
struct Window {
    start: u64,
    data: Bytes,
}

impl Window {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    fn contains(&self, offset: u64, length: u64) -> bool {
        offset >= self.start && offset + length <= self.end()
    }
}

/// Remote media source over HTTP byte ranges.
///
/// Created per media session with [`open`](Self::open), which probes the
/// server for range support and learns the file size. The URL string is
/// the cache namespace.
pub struct HttpSource {
    client: reqwest::Client,
    url: Url,
    cache_key: String,
    size: u64,
    position: u64,
    window: Option<Window>,
    options: HttpSourceOptions,
    network: NetworkMonitor,
    closed: bool,
}

impl HttpSource {
    /// Opens a remote source, probing for size and range support.
    ///
    /// The probe requests the first byte; a 200 response instead of 206
    /// means the server ignores `Range` and the source is unusable.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * The URL is invalid
    /// * The server does not support range requests
    /// * The response carries no usable `Content-Range` total
    /// * The probe fails after retries
    pub async fn open(
        url: &str,
        options: HttpSourceOptions,
        network: NetworkMonitor,
    ) -> Result<Self> {
        let url: Url = url.parse()?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;

        let mut source = Self {
            client,
            cache_key: url.to_string(),
            url,
            size: 0,
            position: 0,
            window: None,
            options,
            network,
            closed: false,
        };

        // Probe with a one-byte range; keep the byte as the start of the
        // window so the parser's first read is already warm.
        let (total, body) = source.fetch_range(0, 1).await?;
        source.size = total.ok_or_else(|| {
            Error::failed_precondition("server did not report a total size in Content-Range")
        })?;
        source.window = Some(Window {
            start: 0,
            data: body,
        });

        debug!("opened remote source, {} bytes: {}", source.size, source.cache_key);
        Ok(source)
    }

    /// Issues one ranged GET with the retry policy applied.
    ///
    /// Returns the total size parsed from `Content-Range` (if present)
    /// and the response body. `length` of zero is never requested.
    async fn fetch_range(&self, offset: u64, length: u64) -> Result<(Option<u64>, Bytes)> {
        let backoff = {
            let mut backoff = Backoff::new(RETRY_ATTEMPTS, MIN_BACKOFF, MAX_BACKOFF);
            backoff.set_factor(BACKOFF_FACTOR);
            backoff
        };

        let end = offset + length - 1;
        let range = format!("bytes={offset}-{end}");

        for (attempt, delay) in backoff.into_iter().enumerate() {
            self.network.wait_online().await;

            let response = self
                .client
                .get(self.url.clone())
                .header(RANGE, range.as_str())
                .send()
                .await;

            let retry_after = |e: Error| async move {
                match delay {
                    Some(duration) => {
                        warn!(
                            "range fetch failed: {e}; retrying in {duration:?} ({}/{RETRY_ATTEMPTS})",
                            attempt + 1
                        );
                        tokio::time::sleep(duration).await;
                        Ok(())
                    }
                    None => Err(e),
                }
            };

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    // Connection-level failures are transient by definition;
                    // everything else from reqwest at this stage is too.
                    retry_after(e.into()).await?;
                    continue;
                }
            };

            match response.status() {
                StatusCode::PARTIAL_CONTENT => {
                    let total = parse_content_range_total(
                        response
                            .headers()
                            .get(CONTENT_RANGE)
                            .and_then(|v| v.to_str().ok()),
                    );
                    let body = response.bytes().await?;
                    return Ok((total, body));
                }

                // The requested range starts at or past EOF.
                StatusCode::RANGE_NOT_SATISFIABLE => return Ok((None, Bytes::new())),

                // The server ignored the Range header. Streaming the whole
                // file is not an option; surface as fatal.
                StatusCode::OK => {
                    return Err(Error::failed_precondition(
                        "server does not support range requests (got 200, expected 206)",
                    ));
                }

                status if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
                    retry_after(Error::unavailable(format!(
                        "server returned {status} for {range}"
                    )))
                    .await?;
                }

                status => {
                    // Remaining 4xx (403 CORS-style rejections, 404, ...)
                    // will not improve on retry.
                    return Err(Error::permission_denied(format!(
                        "server refused range request with {status}"
                    )));
                }
            }
        }

        Err(Error::unavailable("range fetch retries exhausted"))
    }

    /// Refills the window so that `[offset, offset + length)` is covered.
    async fn fill_window(&mut self, offset: u64, length: u64) -> Result<()> {
        let want = length
            .max(self.options.window_size)
            .min(self.options.max_fetch_size)
            .min(self.size.saturating_sub(offset));

        if want == 0 {
            self.window = Some(Window {
                start: offset,
                data: Bytes::new(),
            });
            return Ok(());
        }

        let (_, data) = self.fetch_range(offset, want).await?;
        self.window = Some(Window {
            start: offset,
            data,
        });
        Ok(())
    }
}

/// Extracts the total size from a `Content-Range: bytes a-b/total` value.
fn parse_content_range_total(value: Option<&str>) -> Option<u64> {
    let value = value?;
    let total = value.rsplit('/').next()?;
    total.trim().parse().ok()
}

impl Source for HttpSource {
    fn cache_key(&self) -> &str {
        &self.cache_key
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, offset: u64, length: u64) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(async move {
            if self.closed {
                return Err(Error::cancelled("source closed"));
            }
            if offset >= self.size || length == 0 {
                return Ok(Bytes::new());
            }
            let length = length.min(self.size - offset);

            let covered = self
                .window
                .as_ref()
                .is_some_and(|w| w.contains(offset, length));
            if !covered {
                self.fill_window(offset, length).await?;
            }

            let window = self.window.as_ref().expect("window just filled");
            let start = (offset - window.start) as usize;
            let end = (start + length as usize).min(window.data.len());
            self.position = offset + (end - start) as u64;
            Ok(window.data.slice(start..end))
        })
    }

    fn seek(&mut self, offset: u64) -> u64 {
        self.position = offset.min(self.size);
        self.position
    }

    fn buffered_to(&self) -> u64 {
        match &self.window {
            Some(w) if (w.start..=w.end()).contains(&self.position) => w.end(),
            _ => self.position,
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.window = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total_parses() {
        assert_eq!(
            parse_content_range_total(Some("bytes 0-0/73914102")),
            Some(73_914_102)
        );
        assert_eq!(parse_content_range_total(Some("bytes 5-9/*")), None);
        assert_eq!(parse_content_range_total(None), None);
    }

    #[test]
    fn window_containment() {
        let window = Window {
            start: 100,
            data: Bytes::from(vec![0u8; 50]),
        };
        assert!(window.contains(100, 50));
        assert!(window.contains(120, 10));
        assert!(!window.contains(99, 2));
        assert!(!window.contains(140, 20));
    }

    #[test]
    fn monitor_starts_online_and_toggles() {
        let monitor = NetworkMonitor::new();
        assert!(monitor.is_online());
        monitor.set_online(false);
        assert!(!monitor.is_online());
        monitor.set_online(true);
        assert!(monitor.is_online());
    }
}
