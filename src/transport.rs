//! HTTP transport abstraction.
//!
//! The listing and download paths only talk to the network through
//! [`Transport`], so every caller can run against [`MemoryTransport`]
//! fixtures instead of a live server.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};

use crate::config::HttpConfig;
use crate::error::{Error, Result};

/// Response body as a stream of byte pieces.
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// An inclusive byte range; `end == None` means "to the end of the file".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// `Range` header value for this range.
    #[must_use]
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{end}", self.start),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// What a metadata probe learned about a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    /// Total size, when the server disclosed it.
    pub total_bytes: Option<u64>,
    /// Whether the server honours byte-range requests.
    pub accepts_ranges: bool,
}

/// Network operations needed by listing and downloading.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetches a page as text.
    async fn get_text(&self, url: &str) -> Result<String>;

    /// Learns the size of a file and whether ranges are supported.
    async fn probe(&self, url: &str) -> Result<Probe>;

    /// Streams a file, or a byte range of it.
    async fn get_range(&self, url: &str, range: Option<ByteRange>) -> Result<BodyStream>;
}

/// Extracts the total length from a `Content-Range` value such as
/// `bytes 0-0/12345` or `bytes */12345`.
#[must_use]
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

fn map_reqwest_error(url: &str, err: reqwest::Error) -> Error {
    if err.is_connect() || err.is_timeout() {
        Error::SourceUnreachable {
            url: url.to_string(),
            reason: err.to_string(),
        }
    } else {
        Error::Http(err)
    }
}

fn ignored_range(url: &str) -> Error {
    Error::RangeIgnored {
        url: url.to_string(),
    }
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a client with connect/read timeouts and pooling.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .pool_idle_timeout(std::time::Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, url: &str, range: Option<ByteRange>) -> Result<reqwest::Response> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }
        request.send().await.map_err(|e| map_reqwest_error(url, e))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get_text(&self, url: &str) -> Result<String> {
        let response = self.send(url, None).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(|e| map_reqwest_error(url, e))
    }

    async fn probe(&self, url: &str) -> Result<Probe> {
        let response = self
            .send(url, Some(ByteRange { start: 0, end: Some(0) }))
            .await?;
        let content_range_total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);

        match response.status() {
            StatusCode::PARTIAL_CONTENT => Ok(Probe {
                total_bytes: content_range_total,
                accepts_ranges: true,
            }),
            // Zero-length files cannot satisfy bytes=0-0.
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(Probe {
                total_bytes: content_range_total.or(Some(0)),
                accepts_ranges: false,
            }),
            status if status.is_success() => Ok(Probe {
                total_bytes: response.content_length(),
                accepts_ranges: false,
            }),
            status => Err(Error::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn get_range(&self, url: &str, range: Option<ByteRange>) -> Result<BodyStream> {
        let response = self.send(url, range).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if range.is_some_and(|r| r.start > 0) && status != StatusCode::PARTIAL_CONTENT {
            return Err(ignored_range(url));
        }

        let url = url.to_string();
        Ok(response
            .bytes_stream()
            .map_err(move |e| map_reqwest_error(&url, e))
            .boxed())
    }
}

// ============================================================================
// In-memory transport
// ============================================================================

/// A scripted failure returned by [`MemoryTransport::get_range`].
#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Respond with this HTTP status.
    Status(u16),
    /// Fail to connect.
    Unreachable,
    /// Deliver the first half of the requested bytes, then drop the connection.
    Reset,
}

#[derive(Debug, Clone)]
enum Resource {
    Page(String),
    File {
        body: Bytes,
        /// What the probe reports.
        advertise_ranges: bool,
        /// What body requests actually do.
        honour_ranges: bool,
        advertise_size: bool,
    },
}

#[derive(Debug, Default)]
struct MemoryState {
    resources: HashMap<String, Resource>,
    statuses: HashMap<String, u16>,
    failures: HashMap<String, VecDeque<Failure>>,
    requests: Vec<(String, Option<ByteRange>)>,
}

/// In-memory [`Transport`] serving fixture pages and files.
///
/// Meant for tests of code built on this crate; it never touches the network.
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    piece_size: usize,
}

impl MemoryTransport {
    /// Creates an empty transport; unknown URLs answer 404.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            piece_size: 16 * 1024,
        }
    }

    fn insert(&self, url: &str, resource: Resource) {
        self.lock().resources.insert(url.to_string(), resource);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test thread panicked mid-update.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Serves `text` at `url`.
    #[must_use]
    pub fn with_page(self, url: &str, text: impl Into<String>) -> Self {
        self.insert(url, Resource::Page(text.into()));
        self
    }

    /// Serves `body` at `url`, optionally honouring byte ranges.
    #[must_use]
    pub fn with_file(self, url: &str, body: impl Into<Bytes>, accepts_ranges: bool) -> Self {
        self.insert(
            url,
            Resource::File {
                body: body.into(),
                advertise_ranges: accepts_ranges,
                honour_ranges: accepts_ranges,
                advertise_size: true,
            },
        );
        self
    }

    /// Serves `body` at `url` from a server whose probe answers `206` but
    /// whose body requests ignore `Range` and return everything.
    #[must_use]
    pub fn with_file_ignoring_ranges(self, url: &str, body: impl Into<Bytes>) -> Self {
        self.insert(
            url,
            Resource::File {
                body: body.into(),
                advertise_ranges: true,
                honour_ranges: false,
                advertise_size: true,
            },
        );
        self
    }

    /// Serves `body` without disclosing its size or supporting ranges.
    #[must_use]
    pub fn with_unsized_file(self, url: &str, body: impl Into<Bytes>) -> Self {
        self.insert(
            url,
            Resource::File {
                body: body.into(),
                advertise_ranges: false,
                honour_ranges: false,
                advertise_size: false,
            },
        );
        self
    }

    /// Answers every request for `url` with `status`.
    #[must_use]
    pub fn with_status(self, url: &str, status: u16) -> Self {
        self.lock().statuses.insert(url.to_string(), status);
        self
    }

    /// Queues a failure for the next body request on `url`.
    #[must_use]
    pub fn fail_next(self, url: &str, failure: Failure) -> Self {
        self.lock()
            .failures
            .entry(url.to_string())
            .or_default()
            .push_back(failure);
        self
    }

    /// Number of requests (of any kind) made for `url`.
    #[must_use]
    pub fn request_count(&self, url: &str) -> usize {
        self.lock().requests.iter().filter(|(u, _)| u == url).count()
    }

    /// Ranges requested for `url`, in order. The probe shows up as `0-0`.
    #[must_use]
    pub fn ranges_requested(&self, url: &str) -> Vec<Option<ByteRange>> {
        self.lock()
            .requests
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, r)| *r)
            .collect()
    }

    fn lookup(&self, url: &str, range: Option<ByteRange>) -> Result<Resource> {
        let mut state = self.lock();
        state.requests.push((url.to_string(), range));
        let status = state.statuses.get(url).copied();
        match (status, state.resources.get(url)) {
            (Some(status), _) => Err(Error::Status {
                url: url.to_string(),
                status,
            }),
            (None, Some(resource)) => Ok(resource.clone()),
            (None, None) => Err(Error::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }

    fn take_failure(&self, url: &str) -> Option<Failure> {
        self.lock().failures.get_mut(url).and_then(VecDeque::pop_front)
    }

    fn pieces(&self, body: Bytes) -> Vec<Result<Bytes>> {
        let size = self.piece_size.max(1);
        (0..body.len())
            .step_by(size)
            .map(|offset| Ok(body.slice(offset..(offset + size).min(body.len()))))
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn get_text(&self, url: &str) -> Result<String> {
        match self.lookup(url, None)? {
            Resource::Page(text) => Ok(text),
            Resource::File { body, .. } => Ok(String::from_utf8_lossy(&body).into_owned()),
        }
    }

    async fn probe(&self, url: &str) -> Result<Probe> {
        match self.lookup(url, Some(ByteRange { start: 0, end: Some(0) }))? {
            Resource::Page(text) => Ok(Probe {
                total_bytes: Some(text.len() as u64),
                accepts_ranges: false,
            }),
            Resource::File {
                body,
                advertise_ranges,
                advertise_size,
                ..
            } => Ok(Probe {
                total_bytes: advertise_size.then_some(body.len() as u64),
                accepts_ranges: advertise_ranges,
            }),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    async fn get_range(&self, url: &str, range: Option<ByteRange>) -> Result<BodyStream> {
        let (body, honour_ranges) = match self.lookup(url, range)? {
            Resource::Page(text) => (Bytes::from(text), false),
            Resource::File {
                body,
                honour_ranges,
                ..
            } => (body, honour_ranges),
        };

        let body = match range {
            Some(r) if honour_ranges => {
                let len = body.len() as u64;
                let start = r.start.min(len) as usize;
                let end = r.end.map_or(len, |e| (e + 1).min(len)) as usize;
                body.slice(start..end.max(start))
            }
            Some(r) if r.start > 0 => return Err(ignored_range(url)),
            _ => body,
        };

        match self.take_failure(url) {
            None => Ok(stream::iter(self.pieces(body)).boxed()),
            Some(Failure::Status(status)) => Err(Error::Status {
                url: url.to_string(),
                status,
            }),
            Some(Failure::Unreachable) => Err(Error::SourceUnreachable {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            }),
            Some(Failure::Reset) => {
                let half = body.slice(..body.len() / 2);
                let mut pieces = self.pieces(half);
                pieces.push(Err(Error::SourceUnreachable {
                    url: url.to_string(),
                    reason: "connection reset".to_string(),
                }));
                Ok(stream::iter(pieces).boxed())
            }
        }
    }
}
