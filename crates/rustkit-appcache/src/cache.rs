//! Cache data model: entries, caches and their namespace tables.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::SystemTime;

use hashbrown::HashMap;
use url::Url;

use crate::manifest::{Fingerprint, Manifest, Namespace};
use crate::storage::ResponseInfo;

// ==================== Ids ====================

/// Storage-assigned cache id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheId(pub u64);

/// Storage-assigned group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

/// Storage-assigned response id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResponseId(pub u64);

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache#{}", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "response#{}", self.0)
    }
}

// ==================== Entry Types ====================

/// Why a URL is in a cache. Flags combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntryType(u8);

impl EntryType {
    pub const MASTER: EntryType = EntryType(1 << 0);
    pub const MANIFEST: EntryType = EntryType(1 << 1);
    pub const EXPLICIT: EntryType = EntryType(1 << 2);
    pub const FALLBACK: EntryType = EntryType(1 << 3);
    pub const INTERCEPT: EntryType = EntryType(1 << 4);

    pub const fn empty() -> Self {
        EntryType(0)
    }

    pub const fn contains(self, other: EntryType) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: EntryType) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Only the master flag is set.
    pub const fn is_master_only(self) -> bool {
        self.0 == Self::MASTER.0
    }

    /// Explicit, fallback or intercept: failing to fetch it fails the update.
    pub const fn is_required(self) -> bool {
        self.intersects(EntryType(Self::EXPLICIT.0 | Self::FALLBACK.0 | Self::INTERCEPT.0))
    }
}

impl BitOr for EntryType {
    type Output = EntryType;

    fn bitor(self, rhs: EntryType) -> EntryType {
        EntryType(self.0 | rhs.0)
    }
}

impl BitOrAssign for EntryType {
    fn bitor_assign(&mut self, rhs: EntryType) {
        self.0 |= rhs.0;
    }
}

// ==================== Entries ====================

/// One resource within a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCacheEntry {
    pub url: Url,
    pub types: EntryType,
    /// Assigned once the response is stored.
    pub response_id: Option<ResponseId>,
    pub response_size: u64,
}

impl AppCacheEntry {
    /// Create an entry with no stored response yet.
    pub fn new(url: Url, types: EntryType) -> Self {
        Self {
            url,
            types,
            response_id: None,
            response_size: 0,
        }
    }

    /// Create an entry backed by a stored response.
    pub fn with_response(url: Url, types: EntryType, response_id: ResponseId, size: u64) -> Self {
        Self {
            url,
            types,
            response_id: Some(response_id),
            response_size: size,
        }
    }
}

/// The stored manifest of a cache.
#[derive(Debug, Clone)]
pub struct ManifestRecord {
    pub response_id: ResponseId,
    pub size: u64,
    pub info: ResponseInfo,
    pub fingerprint: Fingerprint,
}

// ==================== AppCache ====================

/// One cache version.
///
/// Built by a single update job, then frozen behind an `Arc` once complete.
#[derive(Debug, Clone)]
pub struct AppCache {
    id: CacheId,
    entries: HashMap<Url, AppCacheEntry>,
    pub online_whitelist: Vec<Namespace>,
    pub online_whitelist_all: bool,
    pub fallback_namespaces: Vec<Namespace>,
    pub intercept_namespaces: Vec<Namespace>,
    pub prefer_online: bool,
    manifest: Option<ManifestRecord>,
    complete: bool,
    update_time: Option<SystemTime>,
}

impl AppCache {
    /// Create an empty in-construction cache.
    pub fn new(id: CacheId) -> Self {
        Self {
            id,
            entries: HashMap::new(),
            online_whitelist: Vec::new(),
            online_whitelist_all: false,
            fallback_namespaces: Vec::new(),
            intercept_namespaces: Vec::new(),
            prefer_online: false,
            manifest: None,
            complete: false,
            update_time: None,
        }
    }

    /// Start a new in-construction cache from this one's entries and tables.
    pub fn derive(&self, id: CacheId) -> AppCache {
        AppCache {
            id,
            complete: false,
            update_time: None,
            ..self.clone()
        }
    }

    pub fn id(&self) -> CacheId {
        self.id
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn update_time(&self) -> Option<SystemTime> {
        self.update_time
    }

    /// Add an entry, OR-ing type flags into an existing entry for the same URL.
    ///
    /// An existing response id is kept unless the existing entry has none.
    pub fn add_entry(&mut self, entry: AppCacheEntry) {
        match self.entries.get_mut(&entry.url) {
            Some(existing) => {
                existing.types |= entry.types;
                if existing.response_id.is_none() {
                    existing.response_id = entry.response_id;
                    existing.response_size = entry.response_size;
                }
            }
            None => {
                self.entries.insert(entry.url.clone(), entry);
            }
        }
    }

    /// OR additional flags into an existing entry. Returns false if absent.
    pub fn add_entry_types(&mut self, url: &Url, types: EntryType) -> bool {
        match self.entries.get_mut(url) {
            Some(entry) => {
                entry.types |= types;
                true
            }
            None => false,
        }
    }

    pub fn get_entry(&self, url: &Url) -> Option<&AppCacheEntry> {
        self.entries.get(url)
    }

    pub fn entries(&self) -> impl Iterator<Item = &AppCacheEntry> {
        self.entries.values()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Entries carrying the master flag.
    pub fn master_entries(&self) -> impl Iterator<Item = &AppCacheEntry> {
        self.entries
            .values()
            .filter(|e| e.types.contains(EntryType::MASTER))
    }

    /// Copy namespace tables from a parsed manifest.
    pub fn initialize_with_manifest(&mut self, manifest: &Manifest) {
        self.online_whitelist = manifest.online_whitelist.clone();
        self.online_whitelist_all = manifest.online_whitelist_all;
        self.fallback_namespaces = manifest.fallback_namespaces.clone();
        self.intercept_namespaces = manifest.intercept_namespaces.clone();
        self.prefer_online = manifest.prefer_online;
    }

    pub fn set_manifest(&mut self, record: ManifestRecord) {
        self.manifest = Some(record);
    }

    pub fn manifest(&self) -> Option<&ManifestRecord> {
        self.manifest.as_ref()
    }

    /// Freeze the cache.
    pub fn mark_complete(&mut self, at: SystemTime) {
        self.complete = true;
        self.update_time = Some(at);
    }

    /// Every response id referenced by this cache, manifest included.
    pub fn response_ids(&self) -> Vec<ResponseId> {
        let mut ids: Vec<ResponseId> = self.entries.values().filter_map(|e| e.response_id).collect();
        if let Some(ref manifest) = self.manifest {
            ids.push(manifest.response_id);
        }
        ids.sort();
        ids.dedup();
        ids
    }

    /// Total bytes of stored responses, manifest included.
    pub fn total_size(&self) -> u64 {
        let entries: u64 = self.entries.values().map(|e| e.response_size).sum();
        entries + self.manifest.as_ref().map_or(0, |m| m.size)
    }

    /// Fallback namespace with the longest match for `url`.
    pub fn find_fallback(&self, url: &Url) -> Option<&Namespace> {
        longest_match(&self.fallback_namespaces, url)
    }

    /// Intercept namespace with the longest match for `url`.
    pub fn find_intercept(&self, url: &Url) -> Option<&Namespace> {
        longest_match(&self.intercept_namespaces, url)
    }

    /// Whether `url` may bypass the cache and go to the network.
    pub fn is_in_network_namespace(&self, url: &Url) -> bool {
        self.online_whitelist_all || self.online_whitelist.iter().any(|ns| ns.matches(url))
    }
}

fn longest_match<'a>(namespaces: &'a [Namespace], url: &Url) -> Option<&'a Namespace> {
    namespaces
        .iter()
        .filter(|ns| ns.matches(url))
        .max_by_key(|ns| ns.namespace_url.as_str().len())
}
