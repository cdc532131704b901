//! Resource fetching for update jobs.
//!
//! One fetch operation serves all four purposes; they differ only in what
//! happens to the body. Manifest bodies are buffered for parsing, resource
//! and master-entry bodies stream straight into a storage writer.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{header, StatusCode};
use thiserror::Error;
use tracing::{debug, trace, warn};
use url::Url;

use rustkit_common::{parse_retry_after, retry_with_policy, RetryConfig, RetryDecision};
use rustkit_net::{NetError, Request, ResourceLoader, Response};

use crate::cache::{AppCacheEntry, GroupId, ResponseId};
use crate::http_cache::{can_reuse_without_fetch, conditional_headers, refresh_from_not_modified};
use crate::storage::{CacheGroupStore, ResponseInfo, StorageError};

// ==================== Errors ====================

/// Why a single fetch failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {status}")]
    Http { status: u16 },

    #[error("Service unavailable")]
    ServiceUnavailable { retry_after: Option<Duration> },

    #[error("Redirect to {location:?} not allowed")]
    RedirectDisallowed { location: Option<Url> },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// HTTP status behind the failure, if there was a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Http { status } => Some(*status),
            FetchError::ServiceUnavailable { .. } => Some(503),
            _ => None,
        }
    }

    /// 404 or 410: the resource is gone rather than temporarily unreachable.
    pub fn is_gone(&self) -> bool {
        matches!(self.status(), Some(404) | Some(410))
    }
}

// ==================== Types ====================

/// What a fetch is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchPurpose {
    Manifest,
    Resource,
    MasterEntry,
    ManifestRefetch,
}

impl FetchPurpose {
    fn buffers_body(self) -> bool {
        matches!(self, FetchPurpose::Manifest | FetchPurpose::ManifestRefetch)
    }
}

/// A previously stored response for the URL being fetched.
#[derive(Debug, Clone)]
pub struct ExistingResponse {
    pub entry: AppCacheEntry,
    pub info: ResponseInfo,
}

/// One unit of fetch work.
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub url: Url,
    pub purpose: FetchPurpose,
    pub existing: Option<ExistingResponse>,
}

impl FetchTask {
    pub fn new(url: Url, purpose: FetchPurpose) -> Self {
        Self {
            url,
            purpose,
            existing: None,
        }
    }

    pub fn with_existing(mut self, existing: Option<ExistingResponse>) -> Self {
        self.existing = existing;
        self
    }
}

/// Where the fetched body ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchBody {
    /// Held in memory (manifest purposes).
    Buffered(Bytes),
    /// Written to a new stored response.
    Stored { response_id: ResponseId, size: u64 },
    /// The previously stored response is still valid.
    Reused { response_id: ResponseId, size: u64 },
}

impl FetchBody {
    /// Stored response id, if the body lives in storage.
    pub fn response_id(&self) -> Option<ResponseId> {
        match self {
            FetchBody::Stored { response_id, .. } | FetchBody::Reused { response_id, .. } => {
                Some(*response_id)
            }
            FetchBody::Buffered(_) => None,
        }
    }

}

/// A successful fetch.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub info: ResponseInfo,
    pub body: FetchBody,
}

/// Completion record handed back to the job.
#[derive(Debug)]
pub struct FetchResult {
    pub url: Url,
    pub purpose: FetchPurpose,
    pub outcome: Result<FetchedResponse, FetchError>,
}

// ==================== Network seam ====================

/// The HTTP stack the fetcher talks to.
#[async_trait]
pub trait NetworkFetcher: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

#[async_trait]
impl NetworkFetcher for ResourceLoader {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        ResourceLoader::fetch(self, request).await
    }
}

// ==================== ResourceFetcher ====================

/// Performs fetches on behalf of one update job.
#[derive(Clone)]
pub struct ResourceFetcher {
    network: Arc<dyn NetworkFetcher>,
    store: Arc<dyn CacheGroupStore>,
    group_id: GroupId,
    retry: RetryConfig,
}

impl ResourceFetcher {
    /// Create a fetcher writing responses into `group_id`.
    pub fn new(
        network: Arc<dyn NetworkFetcher>,
        store: Arc<dyn CacheGroupStore>,
        group_id: GroupId,
        retry: RetryConfig,
    ) -> Self {
        Self {
            network,
            store,
            group_id,
            retry,
        }
    }

    /// Stored response for `url` in the group's newest cache.
    ///
    /// Lookup failures count as a miss.
    pub async fn existing_response(&self, manifest_url: &Url, url: &Url) -> Option<ExistingResponse> {
        let entry = match self.store.find_response(manifest_url, url).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                debug!(url = %url, error = %e, "Response lookup failed");
                return None;
            }
        };
        self.load_existing(entry).await
    }

    /// Read the stored headers for an entry.
    pub async fn load_existing(&self, entry: AppCacheEntry) -> Option<ExistingResponse> {
        let response_id = entry.response_id?;
        let mut reader = self.store.create_response_reader(response_id).await.ok()?;
        let info = reader.read_info().await.ok()?;
        Some(ExistingResponse { entry, info })
    }

    /// Run one fetch to completion.
    pub async fn fetch(&self, task: FetchTask) -> FetchResult {
        let outcome = self.run(&task).await;
        match outcome {
            Ok(ref fetched) => {
                trace!(url = %task.url, purpose = ?task.purpose, status = %fetched.status, "Fetch completed")
            }
            Err(ref e) => debug!(url = %task.url, purpose = ?task.purpose, error = %e, "Fetch failed"),
        }
        FetchResult {
            url: task.url,
            purpose: task.purpose,
            outcome,
        }
    }

    async fn run(&self, task: &FetchTask) -> Result<FetchedResponse, FetchError> {
        if !task.purpose.buffers_body() {
            if let Some(reused) = task.existing.as_ref().and_then(reuse_fresh) {
                debug!(url = %task.url, "Reusing fresh stored response");
                return Ok(reused);
            }
        }

        let conditional = task
            .existing
            .as_ref()
            .map(|e| conditional_headers(&e.info))
            .unwrap_or_default();

        let mut response = retry_with_policy(
            &self.retry,
            |attempt| {
                let network = self.network.clone();
                let request = Request::get(task.url.clone()).headers(conditional.clone());
                async move {
                    if attempt > 1 {
                        debug!(url = %request.url, attempt, "Retrying after 503");
                    }
                    let response = network
                        .fetch(request)
                        .await
                        .map_err(|e| FetchError::Network(e.to_string()))?;
                    if response.status == StatusCode::SERVICE_UNAVAILABLE {
                        let retry_after = response
                            .header_str(&header::RETRY_AFTER)
                            .and_then(|v| parse_retry_after(v, SystemTime::now()));
                        return Err(FetchError::ServiceUnavailable { retry_after });
                    }
                    Ok(response)
                }
            },
            |e| match e {
                FetchError::ServiceUnavailable {
                    retry_after: Some(delay),
                } => RetryDecision::RetryAfter(*delay),
                FetchError::ServiceUnavailable { retry_after: None } => RetryDecision::Retry,
                _ => RetryDecision::Stop,
            },
        )
        .await?;

        let status = response.status;
        let info = ResponseInfo::new(status, response.headers.clone());

        if status.is_success() {
            let body = if task.purpose.buffers_body() {
                FetchBody::Buffered(read_body(&mut response).await?)
            } else {
                self.store_body(&mut response, info.clone()).await?
            };
            return Ok(FetchedResponse { status, info, body });
        }

        if status == StatusCode::NOT_MODIFIED {
            if task.purpose.buffers_body() {
                return Ok(FetchedResponse {
                    status,
                    info,
                    body: FetchBody::Buffered(Bytes::new()),
                });
            }
            if let Some(existing) = task.existing.as_ref() {
                if let Some(response_id) = existing.entry.response_id {
                    let info =
                        refresh_from_not_modified(&existing.info, &response.headers, SystemTime::now());
                    if let Err(e) = self.store.update_response_info(response_id, info.clone()).await {
                        warn!(url = %task.url, error = %e, "Failed to refresh stored headers");
                    }
                    return Ok(FetchedResponse {
                        status,
                        info,
                        body: FetchBody::Reused {
                            response_id,
                            size: existing.entry.response_size,
                        },
                    });
                }
            }
            warn!(url = %task.url, "304 without a stored response");
            return Err(FetchError::Http { status: 304 });
        }

        if response.is_redirect() {
            return Err(FetchError::RedirectDisallowed {
                location: response.location(),
            });
        }

        Err(FetchError::Http {
            status: status.as_u16(),
        })
    }

    async fn store_body(
        &self,
        response: &mut Response,
        info: ResponseInfo,
    ) -> Result<FetchBody, FetchError> {
        let mut writer = self.store.create_response_writer(self.group_id).await?;
        let response_id = writer.response_id();
        writer.write_info(info).await?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?
        {
            writer.write_data(chunk).await?;
        }
        let size = writer.commit().await?;
        Ok(FetchBody::Stored { response_id, size })
    }
}

fn reuse_fresh(existing: &ExistingResponse) -> Option<FetchedResponse> {
    let response_id = existing.entry.response_id?;
    if !can_reuse_without_fetch(&existing.info, SystemTime::now()) {
        return None;
    }
    Some(FetchedResponse {
        status: existing.info.status,
        info: existing.info.clone(),
        body: FetchBody::Reused {
            response_id,
            size: existing.entry.response_size,
        },
    })
}

async fn read_body(response: &mut Response) -> Result<Bytes, FetchError> {
    let mut body = BytesMut::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| FetchError::Network(e.to_string()))?
    {
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntryType;
    use crate::storage::MemoryStorage;
    use http::{HeaderMap, HeaderValue};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays canned responses in order, recording request headers.
    struct Canned {
        responses: Mutex<Vec<(u16, Vec<(&'static str, &'static str)>, &'static str)>>,
        calls: AtomicU32,
        seen: Mutex<Vec<HeaderMap>>,
    }

    impl Canned {
        fn new(responses: Vec<(u16, Vec<(&'static str, &'static str)>, &'static str)>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NetworkFetcher for Canned {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.headers.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(NetError::RequestFailed("connection refused".into()));
            }
            let (status, headers, body) = responses.remove(0);
            let mut map = HeaderMap::new();
            for (name, value) in headers {
                map.insert(
                    header::HeaderName::from_static(name),
                    HeaderValue::from_static(value),
                );
            }
            Ok(Response::new(
                request.url,
                StatusCode::from_u16(status).unwrap(),
                map,
                Bytes::from_static(body.as_bytes()),
            ))
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn fetcher(network: Arc<Canned>, store: Arc<MemoryStorage>) -> ResourceFetcher {
        ResourceFetcher::new(network, store, GroupId(1), RetryConfig::once())
    }

    #[tokio::test]
    async fn test_manifest_body_is_buffered() {
        let store = Arc::new(MemoryStorage::new());
        let network = Canned::new(vec![(200, vec![], "CACHE MANIFEST\n")]);
        let result = fetcher(network, store.clone())
            .fetch(FetchTask::new(url("https://a.com/m"), FetchPurpose::Manifest))
            .await;
        let fetched = result.outcome.unwrap();
        assert_eq!(fetched.body, FetchBody::Buffered(Bytes::from_static(b"CACHE MANIFEST\n")));
        assert_eq!(store.response_count().await, 0);
    }

    #[tokio::test]
    async fn test_resource_body_is_stored() {
        let store = Arc::new(MemoryStorage::new());
        let network = Canned::new(vec![(200, vec![], "body")]);
        let result = fetcher(network, store.clone())
            .fetch(FetchTask::new(url("https://a.com/a.js"), FetchPurpose::Resource))
            .await;
        let fetched = result.outcome.unwrap();
        let id = fetched.body.response_id().unwrap();
        assert!(matches!(fetched.body, FetchBody::Stored { .. }));
        assert_eq!(store.response_data(id).await.unwrap(), Bytes::from_static(b"body"));
    }

    #[tokio::test]
    async fn test_http_error_and_redirect() {
        let store = Arc::new(MemoryStorage::new());
        let network = Canned::new(vec![
            (404, vec![], ""),
            (302, vec![("location", "/elsewhere")], ""),
        ]);
        let fetcher = fetcher(network, store);

        let result = fetcher
            .fetch(FetchTask::new(url("https://a.com/x"), FetchPurpose::Resource))
            .await;
        let err = result.outcome.unwrap_err();
        assert_eq!(err, FetchError::Http { status: 404 });
        assert!(err.is_gone());

        let result = fetcher
            .fetch(FetchTask::new(url("https://a.com/x"), FetchPurpose::Resource))
            .await;
        assert_eq!(
            result.outcome.unwrap_err(),
            FetchError::RedirectDisallowed {
                location: Some(url("https://a.com/elsewhere"))
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_503_retried_once() {
        let store = Arc::new(MemoryStorage::new());
        let network = Canned::new(vec![(503, vec![("retry-after", "2")], ""), (200, vec![], "ok")]);
        let result = fetcher(network.clone(), store)
            .fetch(FetchTask::new(url("https://a.com/a.js"), FetchPurpose::Resource))
            .await;
        assert!(result.outcome.is_ok());
        assert_eq!(network.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_503_gives_up_after_retry() {
        let store = Arc::new(MemoryStorage::new());
        let network = Canned::new(vec![(503, vec![], ""), (503, vec![], ""), (200, vec![], "late")]);
        let result = fetcher(network.clone(), store)
            .fetch(FetchTask::new(url("https://a.com/a.js"), FetchPurpose::Resource))
            .await;
        assert_eq!(result.outcome.unwrap_err().status(), Some(503));
        assert_eq!(network.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_not_retried() {
        let store = Arc::new(MemoryStorage::new());
        let network = Canned::new(vec![(500, vec![], ""), (200, vec![], "ok")]);
        let result = fetcher(network.clone(), store)
            .fetch(FetchTask::new(url("https://a.com/a.js"), FetchPurpose::Resource))
            .await;
        assert_eq!(result.outcome.unwrap_err(), FetchError::Http { status: 500 });
        assert_eq!(network.calls.load(Ordering::SeqCst), 1);
    }

    fn existing(headers: &[(header::HeaderName, &'static str)]) -> ExistingResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(name.clone(), HeaderValue::from_static(value));
        }
        ExistingResponse {
            entry: AppCacheEntry::with_response(
                url("https://a.com/a.js"),
                EntryType::EXPLICIT,
                ResponseId(42),
                7,
            ),
            info: ResponseInfo::new(StatusCode::OK, map),
        }
    }

    #[tokio::test]
    async fn test_304_reuses_existing_response() {
        let store = Arc::new(MemoryStorage::new());
        let network = Canned::new(vec![(304, vec![], "")]);
        let task = FetchTask::new(url("https://a.com/a.js"), FetchPurpose::Resource)
            .with_existing(Some(existing(&[(header::ETAG, "\"v1\"")])));
        let result = fetcher(network.clone(), store).fetch(task).await;

        assert_eq!(
            result.outcome.unwrap().body,
            FetchBody::Reused {
                response_id: ResponseId(42),
                size: 7
            }
        );
        let seen = network.seen.lock().unwrap();
        assert_eq!(seen[0].get(header::IF_NONE_MATCH).unwrap(), "\"v1\"");
    }

    #[tokio::test]
    async fn test_304_refreshes_stored_headers() {
        let store = Arc::new(MemoryStorage::new());
        let mut writer = store.create_response_writer(GroupId(1)).await.unwrap();
        let response_id = writer.response_id();
        let mut headers = HeaderMap::new();
        headers.insert(header::ETAG, HeaderValue::from_static("\"v1\""));
        writer
            .write_info(ResponseInfo::new(StatusCode::OK, headers))
            .await
            .unwrap();
        writer.write_data(Bytes::from_static(b"js")).await.unwrap();
        let size = writer.commit().await.unwrap();

        let network = Canned::new(vec![(304, vec![("cache-control", "max-age=600")], "")]);
        let fetcher = fetcher(network, store.clone());
        let previous = fetcher
            .load_existing(AppCacheEntry::with_response(
                url("https://a.com/a.js"),
                EntryType::EXPLICIT,
                response_id,
                size,
            ))
            .await
            .unwrap();
        assert!(reuse_fresh(&previous).is_none());

        let task = FetchTask::new(url("https://a.com/a.js"), FetchPurpose::Resource)
            .with_existing(Some(previous.clone()));
        let fetched = fetcher.fetch(task).await.outcome.unwrap();
        assert_eq!(fetched.body.response_id(), Some(response_id));
        assert!(fetched.info.headers.contains_key(header::CACHE_CONTROL));

        let refreshed = fetcher.load_existing(previous.entry).await.unwrap();
        assert_eq!(refreshed.info.headers.get(header::ETAG).unwrap(), "\"v1\"");
        assert!(reuse_fresh(&refreshed).is_some());
        assert_eq!(store.response_data(response_id).await.unwrap(), "js");
    }

    #[tokio::test]
    async fn test_fresh_response_skips_network() {
        let store = Arc::new(MemoryStorage::new());
        let network = Canned::new(vec![]);
        let task = FetchTask::new(url("https://a.com/a.js"), FetchPurpose::Resource)
            .with_existing(Some(existing(&[(header::CACHE_CONTROL, "max-age=3600")])));
        let result = fetcher(network.clone(), store).fetch(task).await;

        assert!(matches!(result.outcome.unwrap().body, FetchBody::Reused { .. }));
        assert_eq!(network.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_manifest_never_reuses_fresh_response() {
        let store = Arc::new(MemoryStorage::new());
        let network = Canned::new(vec![(200, vec![], "CACHE MANIFEST\n")]);
        let task = FetchTask::new(url("https://a.com/m"), FetchPurpose::ManifestRefetch)
            .with_existing(Some(existing(&[(header::CACHE_CONTROL, "max-age=3600")])));
        let result = fetcher(network.clone(), store).fetch(task).await;
        assert!(matches!(result.outcome.unwrap().body, FetchBody::Buffered(_)));
        assert_eq!(network.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_network_error() {
        let store = Arc::new(MemoryStorage::new());
        let network = Canned::new(vec![]);
        let result = fetcher(network, store)
            .fetch(FetchTask::new(url("https://a.com/a.js"), FetchPurpose::MasterEntry))
            .await;
        assert!(matches!(result.outcome, Err(FetchError::Network(_))));
    }
}
