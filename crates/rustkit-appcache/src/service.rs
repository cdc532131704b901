//! The AppCache service: hosts, groups and the jobs that update them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use rustkit_net::same_origin;

use crate::cache::AppCache;
use crate::config::UpdateConfig;
use crate::fetcher::NetworkFetcher;
use crate::group::{AppCacheGroup, GroupStatus, GroupTable};
use crate::host::{AppCacheEvent, EventKind, HostId, HostRegistry};
use crate::job::{JobCommand, JobContext, JobReport, UpdateHandle, UpdateJob, UpdateOutcome};
use crate::storage::CacheGroupStore;
use crate::{AppCacheError, FailureReason, UpdateFailure};

struct ServiceShared {
    store: Arc<dyn CacheGroupStore>,
    network: Arc<dyn NetworkFetcher>,
    registry: Arc<HostRegistry>,
    groups: GroupTable,
    config: UpdateConfig,
    shut_down: AtomicBool,
}

impl ServiceShared {
    fn context(&self) -> JobContext {
        JobContext {
            store: self.store.clone(),
            network: self.network.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
        }
    }

    /// Record a finished job and hand its late joiners on.
    ///
    /// Joins go to the group's live job when another one already took over;
    /// otherwise they seed a follow-up job. Joins the live job no longer
    /// accepts are parked on the group for that job's own finish. The outcome
    /// is published under the group lock, so parked joins are never missed.
    async fn finish_job(&self, report: JobReport) -> Option<UpdateJob> {
        let mut follow_up = None;
        let mut groups = self.groups.lock().await;

        let Some(group) = groups.get_mut(&report.manifest_url) else {
            report.publish();
            return None;
        };
        if let Some(ref cache) = report.new_cache {
            group.newest_complete = Some(cache.clone());
        }
        if report.outcome == UpdateOutcome::Obsolete {
            group.obsolete = true;
            group.newest_complete = None;
        }
        if group
            .update_job
            .as_ref()
            .map_or(false, |h| h.job_id() == report.job_id)
        {
            group.update_job = None;
        }

        let mut joins = std::mem::take(&mut group.parked_joins);
        joins.extend(report.deferred.iter().cloned());

        if joins.is_empty() {
            report.publish();
            return None;
        }

        if let Some(successor) = group.active_job().cloned() {
            debug!(
                manifest_url = %report.manifest_url,
                job = successor.job_id().raw(),
                joins = joins.len(),
                "Handing late joiners to running update"
            );
            for command in joins {
                let JobCommand::Join { host, master } = command;
                if !successor.try_join(host, master.clone()) {
                    group.parked_joins.push(JobCommand::Join { host, master });
                }
            }
        } else if group.check_can_update().is_ok() && !self.shut_down.load(Ordering::SeqCst) {
            let (hosts, masters) = split_joins(&joins);
            debug!(
                manifest_url = %report.manifest_url,
                hosts = hosts.len(),
                "Starting follow-up update"
            );
            let (job, handle) = UpdateJob::new(self.context(), &group.record(), hosts, masters);
            group.update_job = Some(handle);
            follow_up = Some(job);
        } else if group.obsolete {
            for host in split_joins(&joins).0 {
                self.registry
                    .send(
                        host,
                        AppCacheEvent {
                            manifest_url: report.manifest_url.clone(),
                            kind: EventKind::Obsolete,
                        },
                    )
                    .await;
            }
        }

        report.publish();
        follow_up
    }
}

fn split_joins(commands: &[JobCommand]) -> (Vec<HostId>, Vec<(HostId, Url)>) {
    let mut hosts = Vec::new();
    let mut masters = Vec::new();
    for command in commands {
        let JobCommand::Join { host, master } = command;
        if !hosts.contains(host) {
            hosts.push(*host);
        }
        if let Some(url) = master {
            masters.push((*host, url.clone()));
        }
    }
    (hosts, masters)
}

/// Front door of the AppCache engine.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct AppCacheService {
    shared: Arc<ServiceShared>,
}

impl AppCacheService {
    /// Create a service over the given storage and network.
    pub fn new(
        store: Arc<dyn CacheGroupStore>,
        network: Arc<dyn NetworkFetcher>,
        config: UpdateConfig,
    ) -> Self {
        info!(
            max_concurrent_fetches = config.max_concurrent_fetches,
            max_manifest_restarts = config.max_manifest_restarts,
            "AppCacheService created"
        );
        Self {
            shared: Arc::new(ServiceShared {
                store,
                network,
                registry: Arc::new(HostRegistry::new()),
                groups: GroupTable::new(),
                config,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.shared.config
    }

    /// Register a host; its lifecycle events arrive on the receiver.
    pub async fn register_host(&self) -> (HostId, mpsc::UnboundedReceiver<AppCacheEvent>) {
        self.shared.registry.register().await
    }

    /// Unregister a host. Pending events for it are dropped.
    pub async fn unregister_host(&self, host: HostId) -> bool {
        let removed = self.shared.registry.unregister(host).await;
        self.shared.groups.remove_host(host).await;
        removed
    }

    /// Start an update for `manifest_url`, or join the one already running.
    ///
    /// `new_master` is the URL of a page that references the manifest and
    /// should become a master entry.
    pub async fn start_update(
        &self,
        host: HostId,
        manifest_url: &Url,
        new_master: Option<Url>,
    ) -> Result<UpdateHandle, AppCacheError> {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return Err(AppCacheError::ServiceShutDown);
        }
        if !matches!(manifest_url.scheme(), "http" | "https") {
            return Err(AppCacheError::InvalidManifestUrl(manifest_url.to_string()));
        }
        let mut manifest_url = manifest_url.clone();
        manifest_url.set_fragment(None);

        let new_master = new_master.map(|mut url| {
            url.set_fragment(None);
            url
        });
        if let Some(ref master) = new_master {
            if !same_origin(&manifest_url, master) {
                warn!(manifest_url = %manifest_url, master = %master, "Cross-origin master entry");
                let failure = UpdateFailure::new(
                    FailureReason::Manifest,
                    "Master entry must be same-origin with its manifest",
                )
                .with_resource(master);
                self.shared
                    .registry
                    .send(
                        host,
                        AppCacheEvent {
                            manifest_url: manifest_url.clone(),
                            kind: EventKind::Error(failure),
                        },
                    )
                    .await;
                return Err(AppCacheError::CrossOriginMaster(master.to_string()));
            }
        }

        let mut groups = self.shared.groups.lock().await;
        if !groups.contains_key(&manifest_url) {
            let record = self.shared.store.load_or_create_group(&manifest_url).await?;
            groups.insert(manifest_url.clone(), AppCacheGroup::from_record(&record));
        }
        let Some(group) = groups.get_mut(&manifest_url) else {
            return Err(AppCacheError::InvalidManifestUrl(manifest_url.to_string()));
        };

        group.check_can_update()?;
        group.add_host(host);

        if let Some(handle) = group.active_job() {
            if handle.try_join(host, new_master.clone()) {
                debug!(manifest_url = %manifest_url, host = host.raw(), "Joined running update");
                return Ok(handle.clone());
            }
        }

        // The previous job may have committed after this group was loaded.
        let record = self.shared.store.load_or_create_group(&manifest_url).await?;
        if record.obsolete {
            group.obsolete = true;
            group.newest_complete = None;
            return Err(AppCacheError::GroupObsolete(manifest_url.to_string()));
        }
        if record.group_id != group.group_id {
            group.group_id = record.group_id;
        }
        group.newest_complete = record.newest_cache.clone();

        let masters = new_master.map(|url| vec![(host, url)]).unwrap_or_default();
        let (job, handle) = UpdateJob::new(self.shared.context(), &group.record(), vec![host], masters);
        group.update_job = Some(handle.clone());
        drop(groups);

        info!(manifest_url = %manifest_url, job = handle.job_id().raw(), "Update scheduled");
        self.spawn(job);
        Ok(handle)
    }

    fn spawn(&self, job: UpdateJob) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut next = Some(job);
            while let Some(job) = next.take() {
                let report = job.run().await;
                next = shared.finish_job(report).await;
            }
        });
    }

    /// Delete a group: cancel its job, drop it from storage, tell its hosts.
    pub async fn delete_group(&self, manifest_url: &Url) -> Result<(), AppCacheError> {
        let running = self
            .shared
            .groups
            .with_group(manifest_url, |group| {
                group.being_deleted = true;
                group.obsolete = true;
                group.update_job.clone()
            })
            .await
            .flatten();

        if let Some(handle) = running {
            handle.cancel();
            let outcome = handle.wait().await;
            debug!(manifest_url = %manifest_url, outcome = ?outcome, "Job stopped for deletion");
        }

        self.shared.store.delete_group(manifest_url).await?;
        let removed = self.shared.groups.remove(manifest_url).await;

        if let Some(group) = removed {
            for host in group.hosts {
                self.shared
                    .registry
                    .send(
                        host,
                        AppCacheEvent {
                            manifest_url: manifest_url.clone(),
                            kind: EventKind::Obsolete,
                        },
                    )
                    .await;
            }
        }
        info!(manifest_url = %manifest_url, "Group deleted");
        Ok(())
    }

    /// Newest complete cache, read from storage.
    pub async fn newest_cache(&self, manifest_url: &Url) -> Result<Option<Arc<AppCache>>, AppCacheError> {
        Ok(self.shared.store.newest_cache(manifest_url).await?)
    }

    pub async fn group_status(&self, manifest_url: &Url) -> Option<GroupStatus> {
        self.shared.groups.status(manifest_url).await
    }

    /// Cancel every running job and refuse new updates.
    pub async fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let jobs = self.shared.groups.active_jobs().await;
        info!(jobs = jobs.len(), "Shutting down AppCacheService");
        for handle in &jobs {
            handle.cancel();
        }
        for handle in jobs {
            handle.wait().await;
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }
}
