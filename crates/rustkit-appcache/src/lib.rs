//! # RustKit AppCache
//!
//! Offline application cache update engine for the RustKit browser engine.
//!
//! ## Features
//!
//! - **Manifests**: `CACHE:`, `FALLBACK:`, `NETWORK:` and `SETTINGS:` sections
//! - **Update jobs**: checking, downloading, manifest re-check and atomic commit
//! - **HTTP reuse**: conditional requests and freshness-based reuse of stored responses
//! - **Hosts**: per-host lifecycle events (`checking`, `progress`, `cached`, ...)
//! - **Storage**: pluggable group/response store with an in-memory implementation
//!
//! ## Architecture
//!
//! ```text
//! AppCacheService
//!     │
//!     ├── HostRegistry ──────────► host event channels
//!     │
//!     └── GroupTable
//!             └── AppCacheGroup (manifest URL)
//!                     ├── newest_complete (Arc<AppCache>)
//!                     └── UpdateJob
//!                             ├── ResourceFetcher ──► NetworkFetcher
//!                             │        └── http_cache (freshness, validators)
//!                             ├── Manifest::parse
//!                             └── CacheGroupStore (commit)
//! ```
//!
//! A job never mutates a published cache. It builds a fresh [`AppCache`] and
//! swaps it into storage in one step, so readers see either the old cache or
//! the new one.

use thiserror::Error;
use url::Url;

pub mod cache;
pub mod config;
pub mod fetcher;
pub mod group;
pub mod host;
pub mod http_cache;
pub mod job;
pub mod manifest;
pub mod service;
pub mod storage;

pub use cache::{AppCache, AppCacheEntry, CacheId, EntryType, GroupId, ResponseId};
pub use config::UpdateConfig;
pub use fetcher::{FetchError, NetworkFetcher};
pub use group::GroupStatus;
pub use host::{AppCacheEvent, EventKind, HostId};
pub use job::{JobId, JobState, UpdateHandle, UpdateOutcome};
pub use manifest::{Manifest, Namespace, NamespaceType, ParseMode};
pub use service::AppCacheService;
pub use storage::{CacheGroupStore, MemoryStorage, StorageError};

// ==================== Errors ====================

/// Errors returned by service operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppCacheError {
    #[error("Group is obsolete: {0}")]
    GroupObsolete(String),

    #[error("Group is being deleted: {0}")]
    GroupBeingDeleted(String),

    #[error("Invalid manifest URL: {0}")]
    InvalidManifestUrl(String),

    #[error("Master entry is not same-origin with its manifest: {0}")]
    CrossOriginMaster(String),

    #[error("Service is shut down")]
    ServiceShutDown,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Why an update failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// Manifest could not be fetched.
    Manifest,
    /// Manifest signature was missing.
    Signature,
    /// A required resource failed.
    Resource,
    /// Manifest kept changing during the update.
    Changed,
    Quota,
    Storage,
    Unknown,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Manifest => "manifest",
            FailureReason::Signature => "signature",
            FailureReason::Resource => "resource",
            FailureReason::Changed => "changed",
            FailureReason::Quota => "quota",
            FailureReason::Storage => "storage",
            FailureReason::Unknown => "unknown",
        }
    }
}

/// Details carried by an `error` event and a failed outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} error: {message}", .reason.as_str())]
pub struct UpdateFailure {
    pub reason: FailureReason,
    pub message: String,
    pub resource_url: Option<Url>,
    pub status: Option<u16>,
}

impl UpdateFailure {
    /// Create a new failure with no resource attached.
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            resource_url: None,
            status: None,
        }
    }

    pub fn with_resource(mut self, url: &Url) -> Self {
        self.resource_url = Some(url.clone());
        self
    }

    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.status = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_failure_display() {
        let url = Url::parse("https://example.com/a.js").unwrap();
        let failure = UpdateFailure::new(FailureReason::Resource, "Fetch failed")
            .with_resource(&url)
            .with_status(Some(404));
        assert_eq!(failure.to_string(), "resource error: Fetch failed");
        assert_eq!(failure.resource_url, Some(url));
        assert_eq!(failure.status, Some(404));
    }

    #[test]
    fn test_storage_error_converts() {
        let err: AppCacheError = StorageError::QuotaExceeded.into();
        assert!(matches!(err, AppCacheError::Storage(StorageError::QuotaExceeded)));
    }
}
