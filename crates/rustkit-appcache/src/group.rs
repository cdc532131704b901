//! In-memory view of cache groups.

use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::{RwLock, RwLockWriteGuard};
use url::Url;

use crate::cache::{AppCache, GroupId};
use crate::host::HostId;
use crate::job::{JobCommand, UpdateHandle};
use crate::storage::GroupRecord;
use crate::AppCacheError;

/// Coarse group status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Idle,
    Updating,
    Obsolete,
    BeingDeleted,
}

/// The versioning root for one manifest URL.
#[derive(Debug)]
pub struct AppCacheGroup {
    pub group_id: GroupId,
    pub manifest_url: Url,
    pub hosts: Vec<HostId>,
    pub newest_complete: Option<Arc<AppCache>>,
    pub obsolete: bool,
    pub being_deleted: bool,
    pub update_job: Option<UpdateHandle>,
    /// Joins waiting for the running job to finish.
    pub parked_joins: Vec<JobCommand>,
}

impl AppCacheGroup {
    /// Create a group from its stored record.
    pub fn from_record(record: &GroupRecord) -> Self {
        Self {
            group_id: record.group_id,
            manifest_url: record.manifest_url.clone(),
            hosts: Vec::new(),
            newest_complete: record.newest_cache.clone(),
            obsolete: record.obsolete,
            being_deleted: false,
            update_job: None,
            parked_joins: Vec::new(),
        }
    }

    /// Snapshot for handing to a new job.
    pub fn record(&self) -> GroupRecord {
        GroupRecord {
            group_id: self.group_id,
            manifest_url: self.manifest_url.clone(),
            obsolete: self.obsolete,
            newest_cache: self.newest_complete.clone(),
        }
    }

    pub fn status(&self) -> GroupStatus {
        if self.being_deleted {
            GroupStatus::BeingDeleted
        } else if self.obsolete {
            GroupStatus::Obsolete
        } else if self.active_job().is_some() {
            GroupStatus::Updating
        } else {
            GroupStatus::Idle
        }
    }

    /// Running job, if any.
    pub fn active_job(&self) -> Option<&UpdateHandle> {
        self.update_job.as_ref().filter(|handle| !handle.is_finished())
    }

    /// Check whether a new update may start.
    pub fn check_can_update(&self) -> Result<(), AppCacheError> {
        if self.being_deleted {
            return Err(AppCacheError::GroupBeingDeleted(self.manifest_url.to_string()));
        }
        if self.obsolete {
            return Err(AppCacheError::GroupObsolete(self.manifest_url.to_string()));
        }
        Ok(())
    }

    pub fn add_host(&mut self, host: HostId) {
        if !self.hosts.contains(&host) {
            self.hosts.push(host);
        }
    }

    pub fn remove_host(&mut self, host: HostId) -> bool {
        let before = self.hosts.len();
        self.hosts.retain(|h| *h != host);
        self.hosts.len() != before
    }
}

/// All groups known to a service, keyed by manifest URL.
#[derive(Debug, Default)]
pub struct GroupTable {
    groups: RwLock<HashMap<Url, AppCacheGroup>>,
}

impl GroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access for multi-step operations.
    pub(crate) async fn lock(&self) -> RwLockWriteGuard<'_, HashMap<Url, AppCacheGroup>> {
        self.groups.write().await
    }

    /// Run `f` on the group for `manifest_url`.
    pub async fn with_group<F, R>(&self, manifest_url: &Url, f: F) -> Option<R>
    where
        F: FnOnce(&mut AppCacheGroup) -> R,
    {
        let mut groups = self.groups.write().await;
        groups.get_mut(manifest_url).map(f)
    }

    pub async fn status(&self, manifest_url: &Url) -> Option<GroupStatus> {
        self.groups.read().await.get(manifest_url).map(|g| g.status())
    }

    pub async fn remove(&self, manifest_url: &Url) -> Option<AppCacheGroup> {
        self.groups.write().await.remove(manifest_url)
    }

    /// Drop `host` from every group.
    pub async fn remove_host(&self, host: HostId) {
        for group in self.groups.write().await.values_mut() {
            group.remove_host(host);
        }
    }

    /// Handles of every running job.
    pub async fn active_jobs(&self) -> Vec<UpdateHandle> {
        self.groups
            .read()
            .await
            .values()
            .filter_map(|g| g.active_job().cloned())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.groups.read().await.is_empty()
    }
}
