//! # RustKit Net
//!
//! HTTP transport for the RustKit AppCache engine.
//!
//! ## Design Goals
//!
//! 1. **Async HTTP**: Non-blocking GET requests with caller-supplied
//!    (conditional) headers
//! 2. **Streamed bodies**: Responses hand out body chunks as they arrive so
//!    callers can write them straight to storage
//! 3. **Redirect policy**: Redirects are either surfaced to the caller or
//!    followed only while they stay on the original origin

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use mime::Mime;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// A GET request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            headers: HeaderMap::new(),
            timeout: None,
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Merge a set of headers, replacing existing values.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

/// Response body variants.
enum ResponseBody {
    /// Full body already loaded.
    Full(Bytes),
    /// Streaming body.
    Stream(BoxStream<'static, Result<Bytes, NetError>>),
    /// Empty, or fully drained.
    Empty,
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Full(b) => write!(f, "Full({} bytes)", b.len()),
            ResponseBody::Stream(_) => f.write_str("Stream"),
            ResponseBody::Empty => f.write_str("Empty"),
        }
    }
}

/// HTTP response.
#[derive(Debug)]
pub struct Response {
    pub request_id: RequestId,
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_type: Option<Mime>,
    pub content_length: Option<u64>,
    body: ResponseBody,
}

impl Response {
    /// Build a response with a fully buffered body.
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let mut response = Self::from_head(RequestId::new(), url, status, headers);
        response.body = if body.is_empty() {
            ResponseBody::Empty
        } else {
            ResponseBody::Full(body)
        };
        response
    }

    /// Build a response whose body arrives as a stream of chunks.
    pub fn streaming(
        url: Url,
        status: StatusCode,
        headers: HeaderMap,
        body: BoxStream<'static, Result<Bytes, NetError>>,
    ) -> Self {
        let mut response = Self::from_head(RequestId::new(), url, status, headers);
        response.body = ResponseBody::Stream(body);
        response
    }

    fn from_head(request_id: RequestId, url: Url, status: StatusCode, headers: HeaderMap) -> Self {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok());

        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        Self {
            request_id,
            url,
            status,
            headers,
            content_type,
            content_length,
            body: ResponseBody::Empty,
        }
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Check if this is a redirect the loader did not follow.
    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection() && self.status != StatusCode::NOT_MODIFIED
    }

    /// Resolved `Location` target of a redirect.
    pub fn location(&self) -> Option<Url> {
        let location = self.headers.get(header::LOCATION)?.to_str().ok()?;
        self.url.join(location).ok()
    }

    /// First value of a header as a string.
    pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Next body chunk, `None` once the body is exhausted.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, NetError> {
        match std::mem::replace(&mut self.body, ResponseBody::Empty) {
            ResponseBody::Full(b) => Ok(Some(b)),
            ResponseBody::Stream(mut stream) => match stream.next().await {
                Some(Ok(chunk)) => {
                    self.body = ResponseBody::Stream(stream);
                    Ok(Some(chunk))
                }
                Some(Err(e)) => Err(e),
                None => Ok(None),
            },
            ResponseBody::Empty => Ok(None),
        }
    }

    /// Get the whole body as bytes.
    pub async fn bytes(mut self) -> Result<Bytes, NetError> {
        if let ResponseBody::Full(ref b) = self.body {
            return Ok(b.clone());
        }
        let mut chunks = Vec::new();
        while let Some(chunk) = self.chunk().await? {
            chunks.push(chunk);
        }
        Ok(chunks.concat().into())
    }
}

/// How the loader treats 3xx responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedirectPolicy {
    /// Never follow; the 3xx response is returned to the caller.
    #[default]
    None,
    /// Follow while every hop stays on the original origin.
    SameOrigin,
}

/// Resource loader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Redirect handling.
    pub redirect: RedirectPolicy,
    /// Maximum redirects followed under `SameOrigin`.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: "RustKit/1.0".to_string(),
            default_timeout: Duration::from_secs(30),
            redirect: RedirectPolicy::None,
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

/// Check whether two URLs share a tuple origin. Opaque origins never match.
pub fn same_origin(a: &Url, b: &Url) -> bool {
    let (a, b) = (a.origin(), b.origin());
    a.is_tuple() && a == b
}

fn redirect_policy(config: &LoaderConfig) -> reqwest::redirect::Policy {
    match config.redirect {
        RedirectPolicy::None => reqwest::redirect::Policy::none(),
        RedirectPolicy::SameOrigin => {
            let max = config.max_redirects;
            reqwest::redirect::Policy::custom(move |attempt| {
                let stays = attempt
                    .previous()
                    .first()
                    .map_or(false, |origin| same_origin(origin, attempt.url()));
                if !stays {
                    attempt.stop()
                } else if attempt.previous().len() > max {
                    attempt.error("too many redirects")
                } else {
                    attempt.follow()
                }
            })
        }
    }
}

/// Resource loader for fetching URLs.
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(redirect_policy(&config))
            .cookie_store(config.cookies_enabled)
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(redirect = ?config.redirect, "ResourceLoader initialized");

        Ok(Self { client, config })
    }

    /// Loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Fetch a URL. The body is not read; drain it with [`Response::chunk`].
    pub async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, "Fetching resource");

        let mut req_builder = self.client.get(request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(request.timeout.unwrap_or(self.config.default_timeout))
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        trace!(url = %url, status = %status, "Response head received");

        let body = response.bytes_stream().map_err(NetError::from).boxed();
        let mut response = Response::from_head(request.id, url, status, headers);
        response.body = ResponseBody::Stream(body);
        Ok(response)
    }
}
