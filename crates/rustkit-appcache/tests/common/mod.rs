//! Shared harness: a scripted network and event helpers.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use rustkit_appcache::storage::{GroupRecord, ResponseInfo, ResponseReader, ResponseWriter};
use rustkit_appcache::{
    AppCache, AppCacheEntry, AppCacheEvent, AppCacheService, CacheGroupStore, CacheId, EventKind,
    GroupId, MemoryStorage, NetworkFetcher, ResponseId, StorageError, UpdateConfig,
};
use rustkit_net::{NetError, Request, Response};
use tokio::sync::{mpsc, Notify};
use url::Url;

/// One canned reply.
#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    headers: Vec<(&'static str, &'static str)>,
    body: &'static str,
}

impl Reply {
    pub fn ok(body: &'static str) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: "",
        }
    }

    pub fn header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers.push((name, value));
        self
    }
}

/// Serves scripted replies per path.
///
/// Each path plays its replies in order and then repeats the last one.
/// Unscripted paths answer 404.
#[derive(Default)]
pub struct ScriptedNetwork {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    requests: Mutex<Vec<(String, HeaderMap)>>,
}

impl ScriptedNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, path: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(path.to_string(), replies.into());
    }

    /// Hold the first request for `path` until the returned gate is notified.
    pub fn gate(&self, path: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(path.to_string(), gate.clone());
        gate
    }

    pub fn requests_for(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .count()
    }

    /// Headers of the `n`th request for `path`.
    pub fn request_headers(&self, path: &str, n: usize) -> Option<HeaderMap> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .nth(n)
            .map(|(_, h)| h.clone())
    }

    fn next_reply(&self, path: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(path) {
            Some(replies) if replies.len() > 1 => replies.pop_front().unwrap(),
            Some(replies) => replies.front().cloned().unwrap_or_else(|| Reply::status(404)),
            None => Reply::status(404),
        }
    }
}

#[async_trait]
impl NetworkFetcher for ScriptedNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let path = request.url.path().to_string();
        self.requests
            .lock()
            .unwrap()
            .push((path.clone(), request.headers.clone()));

        let gate = self.gates.lock().unwrap().remove(&path);
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let reply = self.next_reply(&path);
        let mut headers = HeaderMap::new();
        for (name, value) in reply.headers {
            headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        Ok(Response::new(
            request.url,
            StatusCode::from_u16(reply.status).unwrap(),
            headers,
            Bytes::from_static(reply.body.as_bytes()),
        ))
    }
}

/// Store operations a test can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    LoadGroup,
    Commit,
}

/// `MemoryStorage` whose operations can be held on a gate.
///
/// A gate holds only the first matching call.
pub struct GatedStore {
    inner: Arc<MemoryStorage>,
    gates: Mutex<HashMap<(StoreOp, Url), Arc<Notify>>>,
    reached: Mutex<Vec<(StoreOp, Url)>>,
}

impl GatedStore {
    pub fn new(inner: Arc<MemoryStorage>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gates: Mutex::new(HashMap::new()),
            reached: Mutex::new(Vec::new()),
        })
    }

    pub fn gate(&self, op: StoreOp, manifest_url: &Url) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert((op, manifest_url.clone()), gate.clone());
        gate
    }

    /// Whether a call for `op` on `manifest_url` has started.
    pub fn reached(&self, op: StoreOp, manifest_url: &Url) -> bool {
        self.reached
            .lock()
            .unwrap()
            .iter()
            .any(|(o, u)| *o == op && u == manifest_url)
    }

    async fn pass(&self, op: StoreOp, manifest_url: &Url) {
        self.reached.lock().unwrap().push((op, manifest_url.clone()));
        let gate = self.gates.lock().unwrap().remove(&(op, manifest_url.clone()));
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }
}

#[async_trait]
impl CacheGroupStore for GatedStore {
    async fn load_or_create_group(&self, manifest_url: &Url) -> Result<GroupRecord, StorageError> {
        self.pass(StoreOp::LoadGroup, manifest_url).await;
        self.inner.load_or_create_group(manifest_url).await
    }

    async fn new_cache_id(&self) -> Result<CacheId, StorageError> {
        self.inner.new_cache_id().await
    }

    async fn store_group_and_newest_cache(
        &self,
        group_id: GroupId,
        manifest_url: &Url,
        cache: Arc<AppCache>,
    ) -> Result<(), StorageError> {
        self.pass(StoreOp::Commit, manifest_url).await;
        self.inner
            .store_group_and_newest_cache(group_id, manifest_url, cache)
            .await
    }

    async fn make_group_obsolete(&self, manifest_url: &Url) -> Result<(), StorageError> {
        self.inner.make_group_obsolete(manifest_url).await
    }

    async fn delete_group(&self, manifest_url: &Url) -> Result<(), StorageError> {
        self.inner.delete_group(manifest_url).await
    }

    async fn newest_cache(&self, manifest_url: &Url) -> Result<Option<Arc<AppCache>>, StorageError> {
        self.inner.newest_cache(manifest_url).await
    }

    async fn find_response(
        &self,
        manifest_url: &Url,
        url: &Url,
    ) -> Result<Option<AppCacheEntry>, StorageError> {
        self.inner.find_response(manifest_url, url).await
    }

    async fn create_response_writer(
        &self,
        group_id: GroupId,
    ) -> Result<Box<dyn ResponseWriter>, StorageError> {
        self.inner.create_response_writer(group_id).await
    }

    async fn create_response_reader(
        &self,
        response_id: ResponseId,
    ) -> Result<Box<dyn ResponseReader>, StorageError> {
        self.inner.create_response_reader(response_id).await
    }

    async fn update_response_info(
        &self,
        response_id: ResponseId,
        info: ResponseInfo,
    ) -> Result<(), StorageError> {
        self.inner.update_response_info(response_id, info).await
    }

    async fn delete_responses(&self, ids: &[ResponseId]) -> Result<(), StorageError> {
        self.inner.delete_responses(ids).await
    }
}

pub fn url(path: &str) -> Url {
    Url::parse("https://example.com/").unwrap().join(path).unwrap()
}

pub fn manifest_url() -> Url {
    url("/app.manifest")
}

pub fn service_with(
    network: Arc<ScriptedNetwork>,
    store: Arc<MemoryStorage>,
    config: UpdateConfig,
) -> AppCacheService {
    service_over(network, store, config)
}

pub fn service_over(
    network: Arc<ScriptedNetwork>,
    store: Arc<dyn CacheGroupStore>,
    config: UpdateConfig,
) -> AppCacheService {
    rustkit_common::init_test_logging();
    AppCacheService::new(store, network, config)
}

pub fn service(network: Arc<ScriptedNetwork>) -> (AppCacheService, Arc<MemoryStorage>) {
    let store = Arc::new(MemoryStorage::new());
    let service = service_with(network, store.clone(), UpdateConfig::default());
    (service, store)
}

/// Everything delivered to a host so far.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<AppCacheEvent>) -> Vec<EventKind> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.kind);
    }
    events
}

pub fn names(events: &[EventKind]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}

/// Let spawned jobs run until `cond` holds.
pub async fn until(mut cond: impl FnMut() -> bool) {
    while !cond() {
        tokio::task::yield_now().await;
    }
}
