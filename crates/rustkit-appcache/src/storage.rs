//! Cache group storage.
//!
//! [`CacheGroupStore`] is the transactional surface the update engine
//! consumes. [`MemoryStorage`] implements it in memory: the newest cache of
//! every group is an `Arc` swapped under one lock, so readers observe either
//! the old cache or the new one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hashbrown::{HashMap, HashSet};
use http::{HeaderMap, StatusCode};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{AppCache, AppCacheEntry, CacheId, GroupId, ResponseId};

// ==================== Errors ====================

/// Storage backend errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage quota exceeded")]
    QuotaExceeded,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage failure: {0}")]
    Failed(String),
}

// ==================== Responses ====================

/// Status and headers of a stored response.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// When the response was received.
    pub response_time: SystemTime,
}

impl ResponseInfo {
    /// Create info stamped with the current time.
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            headers,
            response_time: SystemTime::now(),
        }
    }
}

/// Sink for one response body. Nothing is visible until [`commit`](Self::commit).
#[async_trait]
pub trait ResponseWriter: Send {
    /// Id the response will be stored under.
    fn response_id(&self) -> ResponseId;

    async fn write_info(&mut self, info: ResponseInfo) -> Result<(), StorageError>;

    async fn write_data(&mut self, chunk: Bytes) -> Result<(), StorageError>;

    /// Persist the response, returning the body size.
    async fn commit(self: Box<Self>) -> Result<u64, StorageError>;
}

/// Reader for a stored response.
#[async_trait]
pub trait ResponseReader: Send {
    async fn read_info(&mut self) -> Result<ResponseInfo, StorageError>;

    async fn read_data(&mut self) -> Result<Bytes, StorageError>;
}

// ==================== Store Interface ====================

/// A group as loaded from storage.
#[derive(Debug, Clone)]
pub struct GroupRecord {
    pub group_id: GroupId,
    pub manifest_url: Url,
    pub obsolete: bool,
    pub newest_cache: Option<Arc<AppCache>>,
}

/// Persistent keyed storage for cache groups and response bodies.
#[async_trait]
pub trait CacheGroupStore: Send + Sync {
    /// Load the group for `manifest_url`, creating an empty one if absent.
    async fn load_or_create_group(&self, manifest_url: &Url) -> Result<GroupRecord, StorageError>;

    async fn new_cache_id(&self) -> Result<CacheId, StorageError>;

    /// Store `cache` as the group's newest cache in one transaction.
    async fn store_group_and_newest_cache(
        &self,
        group_id: GroupId,
        manifest_url: &Url,
        cache: Arc<AppCache>,
    ) -> Result<(), StorageError>;

    async fn make_group_obsolete(&self, manifest_url: &Url) -> Result<(), StorageError>;

    /// Remove the group, its caches and their responses.
    async fn delete_group(&self, manifest_url: &Url) -> Result<(), StorageError>;

    async fn newest_cache(&self, manifest_url: &Url) -> Result<Option<Arc<AppCache>>, StorageError>;

    /// Entry for `url` in the group's newest cache.
    async fn find_response(
        &self,
        manifest_url: &Url,
        url: &Url,
    ) -> Result<Option<AppCacheEntry>, StorageError>;

    async fn create_response_writer(
        &self,
        group_id: GroupId,
    ) -> Result<Box<dyn ResponseWriter>, StorageError>;

    async fn create_response_reader(
        &self,
        response_id: ResponseId,
    ) -> Result<Box<dyn ResponseReader>, StorageError>;

    /// Replace the stored status and headers of a committed response.
    async fn update_response_info(
        &self,
        response_id: ResponseId,
        info: ResponseInfo,
    ) -> Result<(), StorageError>;

    /// Delete responses no committed cache references. Unknown ids are ignored.
    async fn delete_responses(&self, ids: &[ResponseId]) -> Result<(), StorageError>;
}

// ==================== MemoryStorage ====================

#[derive(Debug, Clone)]
struct StoredResponse {
    group_id: GroupId,
    info: ResponseInfo,
    data: Bytes,
}

#[derive(Debug)]
struct StoredGroup {
    group_id: GroupId,
    obsolete: bool,
    newest: Option<Arc<AppCache>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    groups: HashMap<Url, StoredGroup>,
    responses: HashMap<ResponseId, StoredResponse>,
}

impl MemoryState {
    fn is_referenced(&self, id: ResponseId) -> bool {
        self.groups.values().any(|g| {
            g.newest
                .as_ref()
                .map_or(false, |cache| cache.response_ids().contains(&id))
        })
    }
}

/// In-memory [`CacheGroupStore`].
#[derive(Debug)]
pub struct MemoryStorage {
    state: Arc<RwLock<MemoryState>>,
    next_group_id: AtomicU64,
    next_cache_id: AtomicU64,
    next_response_id: AtomicU64,
    quota: Option<u64>,
    fail_commits: AtomicBool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            next_group_id: AtomicU64::new(1),
            next_cache_id: AtomicU64::new(1),
            next_response_id: AtomicU64::new(1),
            quota: None,
            fail_commits: AtomicBool::new(false),
        }
    }

    /// Create a store that rejects caches larger than `bytes`.
    pub fn with_quota(bytes: u64) -> Self {
        Self {
            quota: Some(bytes),
            ..Self::new()
        }
    }

    /// Make every following group commit fail with a backend error.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Number of stored responses.
    pub async fn response_count(&self) -> usize {
        self.state.read().await.responses.len()
    }

    /// Body of a stored response.
    pub async fn response_data(&self, id: ResponseId) -> Option<Bytes> {
        self.state
            .read()
            .await
            .responses
            .get(&id)
            .map(|r| r.data.clone())
    }

    pub async fn group_count(&self) -> usize {
        self.state.read().await.groups.len()
    }

    pub async fn is_obsolete(&self, manifest_url: &Url) -> bool {
        self.state
            .read()
            .await
            .groups
            .get(manifest_url)
            .map_or(false, |g| g.obsolete)
    }
}

#[async_trait]
impl CacheGroupStore for MemoryStorage {
    async fn load_or_create_group(&self, manifest_url: &Url) -> Result<GroupRecord, StorageError> {
        let mut state = self.state.write().await;
        let group = state.groups.entry(manifest_url.clone()).or_insert_with(|| {
            let group_id = GroupId(self.next_group_id.fetch_add(1, Ordering::Relaxed));
            debug!(manifest_url = %manifest_url, %group_id, "Created group");
            StoredGroup {
                group_id,
                obsolete: false,
                newest: None,
            }
        });

        Ok(GroupRecord {
            group_id: group.group_id,
            manifest_url: manifest_url.clone(),
            obsolete: group.obsolete,
            newest_cache: group.newest.clone(),
        })
    }

    async fn new_cache_id(&self) -> Result<CacheId, StorageError> {
        Ok(CacheId(self.next_cache_id.fetch_add(1, Ordering::Relaxed)))
    }

    async fn store_group_and_newest_cache(
        &self,
        group_id: GroupId,
        manifest_url: &Url,
        cache: Arc<AppCache>,
    ) -> Result<(), StorageError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StorageError::Failed("commit rejected".to_string()));
        }
        if !cache.is_complete() {
            return Err(StorageError::Failed(format!("{} is not complete", cache.id())));
        }
        if let Some(quota) = self.quota {
            if cache.total_size() > quota {
                warn!(manifest_url = %manifest_url, size = cache.total_size(), quota, "Quota exceeded");
                return Err(StorageError::QuotaExceeded);
            }
        }

        let mut state = self.state.write().await;

        for id in cache.response_ids() {
            if !state.responses.contains_key(&id) {
                return Err(StorageError::NotFound(id.to_string()));
            }
        }

        let group = state
            .groups
            .entry(manifest_url.clone())
            .or_insert_with(|| StoredGroup {
                group_id,
                obsolete: false,
                newest: None,
            });
        if group.group_id != group_id {
            return Err(StorageError::NotFound(group_id.to_string()));
        }
        if group.obsolete {
            return Err(StorageError::Failed(format!("{} is obsolete", group_id)));
        }

        let keep: HashSet<ResponseId> = cache.response_ids().into_iter().collect();
        let previous = group.newest.replace(cache.clone());

        // Responses only the replaced cache used are garbage now.
        if let Some(previous) = previous {
            for id in previous.response_ids() {
                if !keep.contains(&id) && !state.is_referenced(id) {
                    state.responses.remove(&id);
                }
            }
        }

        info!(
            manifest_url = %manifest_url,
            cache_id = %cache.id(),
            entries = cache.entry_count(),
            "Stored newest cache"
        );
        Ok(())
    }

    async fn make_group_obsolete(&self, manifest_url: &Url) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let group = state
            .groups
            .get_mut(manifest_url)
            .ok_or_else(|| StorageError::NotFound(manifest_url.to_string()))?;
        group.obsolete = true;
        let previous = group.newest.take();

        if let Some(previous) = previous {
            for id in previous.response_ids() {
                state.responses.remove(&id);
            }
        }
        info!(manifest_url = %manifest_url, "Group made obsolete");
        Ok(())
    }

    async fn delete_group(&self, manifest_url: &Url) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let Some(group) = state.groups.remove(manifest_url) else {
            return Ok(());
        };
        state.responses.retain(|_, r| r.group_id != group.group_id);
        info!(manifest_url = %manifest_url, group_id = %group.group_id, "Group deleted");
        Ok(())
    }

    async fn newest_cache(&self, manifest_url: &Url) -> Result<Option<Arc<AppCache>>, StorageError> {
        Ok(self
            .state
            .read()
            .await
            .groups
            .get(manifest_url)
            .and_then(|g| g.newest.clone()))
    }

    async fn find_response(
        &self,
        manifest_url: &Url,
        url: &Url,
    ) -> Result<Option<AppCacheEntry>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .groups
            .get(manifest_url)
            .and_then(|g| g.newest.as_ref())
            .and_then(|cache| cache.get_entry(url))
            .filter(|entry| entry.response_id.is_some())
            .cloned())
    }

    async fn create_response_writer(
        &self,
        group_id: GroupId,
    ) -> Result<Box<dyn ResponseWriter>, StorageError> {
        let response_id = ResponseId(self.next_response_id.fetch_add(1, Ordering::Relaxed));
        Ok(Box::new(MemoryResponseWriter {
            state: self.state.clone(),
            group_id,
            response_id,
            info: None,
            data: BytesMut::new(),
        }))
    }

    async fn create_response_reader(
        &self,
        response_id: ResponseId,
    ) -> Result<Box<dyn ResponseReader>, StorageError> {
        let state = self.state.read().await;
        let response = state
            .responses
            .get(&response_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(response_id.to_string()))?;
        Ok(Box::new(MemoryResponseReader { response }))
    }

    async fn update_response_info(
        &self,
        response_id: ResponseId,
        info: ResponseInfo,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let response = state
            .responses
            .get_mut(&response_id)
            .ok_or_else(|| StorageError::NotFound(response_id.to_string()))?;
        response.info = info;
        Ok(())
    }

    async fn delete_responses(&self, ids: &[ResponseId]) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let mut deleted = 0;
        for &id in ids {
            if state.is_referenced(id) {
                continue;
            }
            if state.responses.remove(&id).is_some() {
                deleted += 1;
            }
        }
        debug!(requested = ids.len(), deleted, "Deleted responses");
        Ok(())
    }
}

struct MemoryResponseWriter {
    state: Arc<RwLock<MemoryState>>,
    group_id: GroupId,
    response_id: ResponseId,
    info: Option<ResponseInfo>,
    data: BytesMut,
}

#[async_trait]
impl ResponseWriter for MemoryResponseWriter {
    fn response_id(&self) -> ResponseId {
        self.response_id
    }

    async fn write_info(&mut self, info: ResponseInfo) -> Result<(), StorageError> {
        self.info = Some(info);
        Ok(())
    }

    async fn write_data(&mut self, chunk: Bytes) -> Result<(), StorageError> {
        self.data.extend_from_slice(&chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<u64, StorageError> {
        let info = self
            .info
            .ok_or_else(|| StorageError::Failed("response info not written".to_string()))?;
        let data = self.data.freeze();
        let size = data.len() as u64;
        self.state.write().await.responses.insert(
            self.response_id,
            StoredResponse {
                group_id: self.group_id,
                info,
                data,
            },
        );
        Ok(size)
    }
}

struct MemoryResponseReader {
    response: StoredResponse,
}

#[async_trait]
impl ResponseReader for MemoryResponseReader {
    async fn read_info(&mut self) -> Result<ResponseInfo, StorageError> {
        Ok(self.response.info.clone())
    }

    async fn read_data(&mut self) -> Result<Bytes, StorageError> {
        Ok(self.response.data.clone())
    }
}
