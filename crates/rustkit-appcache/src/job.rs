//! Update jobs.
//!
//! One [`UpdateJob`] drives one update attempt for a cache group:
//!
//! ```text
//! FetchManifest ──┬── NoUpdate ─────┐
//!                 │                 ├── RefetchManifest ──┬── Completed
//!                 └── Downloading ──┘         │           ├── CacheFailure
//!                                             │           └── Cancelled
//!                                             └── (manifest changed) ─► FetchManifest
//! ```
//!
//! The job runs as a single task. Fetches are futures polled concurrently in
//! a `FuturesUnordered` bounded by `max_concurrent_fetches`; the phase only
//! advances once all of them have completed. Hosts that join a running job
//! arrive as [`JobCommand`]s over a channel.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use hashbrown::{HashMap, HashSet};
use http::StatusCode;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{AppCache, AppCacheEntry, EntryType, GroupId, ManifestRecord, ResponseId};
use crate::config::UpdateConfig;
use crate::fetcher::{
    ExistingResponse, FetchBody, FetchError, FetchPurpose, FetchResult, FetchTask,
    NetworkFetcher, ResourceFetcher,
};
use crate::host::{EventKind, HostId, HostNotifier, HostRegistry};
use crate::manifest::{Fingerprint, Manifest, ManifestError};
use crate::storage::{CacheGroupStore, GroupRecord, ResponseInfo, StorageError};
use crate::{FailureReason, UpdateFailure};

// ==================== Types ====================

/// Unique identifier for an update job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl JobId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Observable job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    FetchManifest,
    NoUpdate,
    Downloading,
    RefetchManifest,
    CacheFailure,
    Cancelled,
    Completed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::CacheFailure | JobState::Cancelled | JobState::Completed
        )
    }
}

/// How an update ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// First cache for the group was stored.
    Cached,
    /// A newer cache replaced the previous one.
    UpdateReady,
    /// Manifest unchanged.
    NoUpdate,
    /// Manifest is gone; the group is obsolete.
    Obsolete,
    Failed(UpdateFailure),
    Cancelled,
}

/// Requests delivered to a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCommand {
    /// A host joins, optionally bringing a new master entry.
    Join { host: HostId, master: Option<Url> },
}

/// Collaborators injected into every job.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn CacheGroupStore>,
    pub network: Arc<dyn NetworkFetcher>,
    pub registry: Arc<HostRegistry>,
    pub config: UpdateConfig,
}

// ==================== Handle ====================

/// Handle to a running (or finished) job.
#[derive(Clone)]
pub struct UpdateHandle {
    job_id: JobId,
    manifest_url: Url,
    commands: mpsc::UnboundedSender<JobCommand>,
    cancel: Arc<watch::Sender<bool>>,
    outcome: watch::Receiver<Option<UpdateOutcome>>,
    state: watch::Receiver<JobState>,
}

impl std::fmt::Debug for UpdateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateHandle")
            .field("job_id", &self.job_id)
            .field("manifest_url", &self.manifest_url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl UpdateHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn manifest_url(&self) -> &Url {
        &self.manifest_url
    }

    /// Wait for the job to finish.
    pub async fn wait(&self) -> UpdateOutcome {
        let mut outcome = self.outcome.clone();
        let result = match outcome.wait_for(|o| o.is_some()).await {
            Ok(done) => done.clone(),
            Err(_) => None,
        };
        result.unwrap_or(UpdateOutcome::Cancelled)
    }

    /// Request cancellation. A commit already in progress still completes.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Hand a host to the job. Fails once the job stopped accepting hosts.
    pub(crate) fn try_join(&self, host: HostId, master: Option<Url>) -> bool {
        self.commands.send(JobCommand::Join { host, master }).is_ok()
    }
}

/// What a finished job leaves behind for the service.
pub struct JobReport {
    pub job_id: JobId,
    pub manifest_url: Url,
    pub outcome: UpdateOutcome,
    /// The cache stored by this job, if any.
    pub new_cache: Option<Arc<AppCache>>,
    pub hosts: Vec<HostId>,
    /// Joins that arrived too late to be part of this attempt.
    pub deferred: Vec<JobCommand>,
    outcome_tx: watch::Sender<Option<UpdateOutcome>>,
}

impl JobReport {
    /// Release waiters.
    pub(crate) fn publish(&self) {
        self.outcome_tx.send_replace(Some(self.outcome.clone()));
    }
}

// ==================== Phases ====================

/// The manifest a download is built from.
enum ManifestSource {
    Fetched { data: Bytes, info: ResponseInfo },
    Existing(ManifestRecord),
}

impl ManifestSource {
    fn bytes(&self) -> &[u8] {
        match self {
            ManifestSource::Fetched { data, .. } => data,
            ManifestSource::Existing(record) => record.fingerprint.as_bytes(),
        }
    }

    fn info(&self) -> &ResponseInfo {
        match self {
            ManifestSource::Fetched { info, .. } => info,
            ManifestSource::Existing(record) => &record.info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitKind {
    /// No previous cache.
    CacheAttempt,
    /// Manifest changed; replace the previous cache.
    Upgrade,
    /// Manifest unchanged; add new master entries to a copy of the previous cache.
    MasterOnly,
}

struct Download {
    kind: CommitKind,
    manifest: ManifestSource,
    cache: AppCache,
    entry_types: HashMap<Url, EntryType>,
    worklist: VecDeque<Url>,
    finished: HashSet<Url>,
    added_master_hosts: HashSet<HostId>,
    total: usize,
    completed: usize,
}

enum Phase {
    FetchManifest,
    NoUpdate,
    Downloading(Download),
    RefetchManifest(Download),
    Commit(Download),
    Obsolete,
    CacheFailure(UpdateFailure),
    Cancelled,
    Done(UpdateOutcome),
}

impl Phase {
    fn state(&self) -> JobState {
        match self {
            Phase::FetchManifest => JobState::FetchManifest,
            Phase::NoUpdate => JobState::NoUpdate,
            Phase::Downloading(_) => JobState::Downloading,
            Phase::RefetchManifest(_) => JobState::RefetchManifest,
            Phase::Commit(_) | Phase::Obsolete | Phase::Done(_) => JobState::Completed,
            Phase::CacheFailure(_) => JobState::CacheFailure,
            Phase::Cancelled => JobState::Cancelled,
        }
    }

    fn is_cancellable(&self) -> bool {
        matches!(
            self,
            Phase::FetchManifest
                | Phase::NoUpdate
                | Phase::Downloading(_)
                | Phase::RefetchManifest(_)
        )
    }
}

enum DownloadEvent {
    Cancelled,
    Command(Option<JobCommand>),
    Fetched(FetchResult),
}

/// Await `fut` unless the job is cancelled first.
async fn until_cancelled<F: Future>(cancel: &mut watch::Receiver<bool>, fut: F) -> Option<F::Output> {
    if *cancel.borrow() {
        return None;
    }
    tokio::select! {
        biased;
        Ok(_) = cancel.wait_for(|c| *c) => None,
        out = fut => Some(out),
    }
}

// ==================== UpdateJob ====================

/// One update attempt for one cache group.
pub struct UpdateJob {
    id: JobId,
    ctx: JobContext,
    group_id: GroupId,
    manifest_url: Url,
    newest: Option<Arc<AppCache>>,
    hosts: Vec<HostId>,
    pending_masters: HashMap<Url, Vec<HostId>>,
    failed_hosts: HashSet<HostId>,
    commands: mpsc::UnboundedReceiver<JobCommand>,
    commands_open: bool,
    deferred: Vec<JobCommand>,
    cancel: watch::Receiver<bool>,
    state_tx: watch::Sender<JobState>,
    outcome_tx: watch::Sender<Option<UpdateOutcome>>,
    notifier: HostNotifier,
    fetcher: ResourceFetcher,
    written: Vec<ResponseId>,
    restarts: u32,
    new_cache: Option<Arc<AppCache>>,
}

impl UpdateJob {
    /// Create a job for `group` with its initial participants.
    pub fn new(
        ctx: JobContext,
        group: &GroupRecord,
        hosts: Vec<HostId>,
        masters: Vec<(HostId, Url)>,
    ) -> (Self, UpdateHandle) {
        let id = JobId::new();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (cancel_tx, cancel) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(JobState::FetchManifest);
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let fetcher = ResourceFetcher::new(
            ctx.network.clone(),
            ctx.store.clone(),
            group.group_id,
            ctx.config.retry.clone(),
        );
        let notifier = HostNotifier::new(ctx.registry.clone(), group.manifest_url.clone());

        let mut job = Self {
            id,
            ctx,
            group_id: group.group_id,
            manifest_url: group.manifest_url.clone(),
            newest: group.newest_cache.clone(),
            hosts: Vec::new(),
            pending_masters: HashMap::new(),
            failed_hosts: HashSet::new(),
            commands,
            commands_open: true,
            deferred: Vec::new(),
            cancel,
            state_tx,
            outcome_tx,
            notifier,
            fetcher,
            written: Vec::new(),
            restarts: 0,
            new_cache: None,
        };
        for host in hosts {
            if !job.hosts.contains(&host) {
                job.hosts.push(host);
            }
        }
        for (host, url) in masters {
            if !job.hosts.contains(&host) {
                job.hosts.push(host);
            }
            let wanting = job.pending_masters.entry(url).or_default();
            if !wanting.contains(&host) {
                wanting.push(host);
            }
        }

        let handle = UpdateHandle {
            job_id: id,
            manifest_url: group.manifest_url.clone(),
            commands: command_tx,
            cancel: Arc::new(cancel_tx),
            outcome: outcome_rx,
            state: state_rx,
        };
        (job, handle)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Drive the job to a terminal state.
    pub async fn run(mut self) -> JobReport {
        info!(
            job = self.id.raw(),
            manifest_url = %self.manifest_url,
            upgrade = self.newest.is_some(),
            "Update job started"
        );

        let mut phase = Phase::FetchManifest;
        let outcome = loop {
            if phase.is_cancellable() && *self.cancel.borrow() {
                phase = Phase::Cancelled;
            }
            if !matches!(phase, Phase::Done(_)) {
                self.state_tx.send_replace(phase.state());
            }

            phase = match phase {
                Phase::FetchManifest => self.fetch_manifest().await,
                Phase::NoUpdate => self.no_update().await,
                Phase::Downloading(download) => self.download(download).await,
                Phase::RefetchManifest(download) => self.refetch_manifest(download).await,
                Phase::Commit(download) => self.commit(download).await,
                Phase::Obsolete => self.make_obsolete().await,
                Phase::CacheFailure(failure) => self.cache_failure(failure).await,
                Phase::Cancelled => self.cancelled().await,
                Phase::Done(outcome) => break outcome,
            };
        };

        self.commands.close();
        self.defer_commands();

        info!(
            job = self.id.raw(),
            manifest_url = %self.manifest_url,
            outcome = ?outcome,
            deferred = self.deferred.len(),
            "Update job finished"
        );

        JobReport {
            job_id: self.id,
            manifest_url: self.manifest_url,
            outcome,
            new_cache: self.new_cache,
            hosts: self.hosts,
            deferred: self.deferred,
            outcome_tx: self.outcome_tx,
        }
    }

    // ---------- FetchManifest ----------

    async fn fetch_manifest(&mut self) -> Phase {
        if self.restarts == 0 {
            self.queue_all(EventKind::Checking);
            self.notifier.flush().await;
        }

        let existing = self
            .newest
            .as_ref()
            .and_then(|cache| cache.manifest())
            .map(|record| ExistingResponse {
                entry: AppCacheEntry::with_response(
                    self.manifest_url.clone(),
                    EntryType::MANIFEST,
                    record.response_id,
                    record.size,
                ),
                info: record.info.clone(),
            });
        let task = FetchTask::new(self.manifest_url.clone(), FetchPurpose::Manifest).with_existing(existing);

        let fetcher = self.fetcher.clone();
        let mut cancel = self.cancel.clone();
        let Some(result) = until_cancelled(&mut cancel, fetcher.fetch(task)).await else {
            return Phase::Cancelled;
        };
        self.absorb_commands(None);

        let fetched = match result.outcome {
            Ok(fetched) => fetched,
            Err(e) if e.is_gone() && self.newest.is_some() => return Phase::Obsolete,
            Err(e) => {
                return Phase::CacheFailure(
                    UpdateFailure::new(
                        FailureReason::Manifest,
                        format!("Manifest fetch failed: {}", e),
                    )
                    .with_resource(&self.manifest_url)
                    .with_status(e.status()),
                )
            }
        };

        if fetched.status == StatusCode::NOT_MODIFIED {
            if self.newest.is_some() {
                debug!(manifest_url = %self.manifest_url, "Manifest not modified");
                return Phase::NoUpdate;
            }
            return Phase::CacheFailure(
                UpdateFailure::new(FailureReason::Manifest, "Unexpected 304 for manifest")
                    .with_resource(&self.manifest_url)
                    .with_status(Some(304)),
            );
        }

        let FetchBody::Buffered(data) = fetched.body else {
            return Phase::CacheFailure(UpdateFailure::new(
                FailureReason::Unknown,
                "Manifest body was not buffered",
            ));
        };

        let unchanged = self
            .newest
            .as_ref()
            .and_then(|cache| cache.manifest())
            .map_or(false, |record| record.fingerprint.matches(&data));
        if unchanged {
            debug!(manifest_url = %self.manifest_url, "Manifest bytes unchanged");
            return Phase::NoUpdate;
        }

        let manifest = match Manifest::parse(&self.manifest_url, &data, self.ctx.config.parse_mode) {
            Ok(manifest) => manifest,
            Err(ManifestError::InvalidSignature) => {
                return Phase::CacheFailure(
                    UpdateFailure::new(FailureReason::Signature, "Invalid manifest signature")
                        .with_resource(&self.manifest_url),
                )
            }
        };

        let kind = if self.newest.is_some() {
            CommitKind::Upgrade
        } else {
            CommitKind::CacheAttempt
        };
        let source = ManifestSource::Fetched {
            data,
            info: fetched.info,
        };
        match self.build_download(kind, Some(&manifest), source).await {
            Ok(download) => {
                if self.restarts == 0 {
                    self.queue_all(EventKind::Downloading);
                    self.notifier.flush().await;
                }
                Phase::Downloading(download)
            }
            Err(failure) => Phase::CacheFailure(failure),
        }
    }

    // ---------- NoUpdate ----------

    async fn no_update(&mut self) -> Phase {
        self.absorb_commands(None);

        if self.pending_masters.is_empty() {
            self.queue_all(EventKind::NoUpdate);
            self.notifier.flush().await;
            return Phase::Done(UpdateOutcome::NoUpdate);
        }

        let record = self
            .newest
            .as_ref()
            .and_then(|cache| cache.manifest())
            .cloned();
        let Some(record) = record else {
            return Phase::CacheFailure(UpdateFailure::new(
                FailureReason::Unknown,
                "Newest cache has no manifest",
            ));
        };

        match self
            .build_download(CommitKind::MasterOnly, None, ManifestSource::Existing(record))
            .await
        {
            Ok(download) => Phase::Downloading(download),
            Err(failure) => Phase::CacheFailure(failure),
        }
    }

    async fn build_download(
        &mut self,
        kind: CommitKind,
        manifest: Option<&Manifest>,
        source: ManifestSource,
    ) -> Result<Download, UpdateFailure> {
        let cache_id = self.ctx.store.new_cache_id().await.map_err(storage_failure)?;

        let mut download = Download {
            kind,
            manifest: source,
            cache: AppCache::new(cache_id),
            entry_types: HashMap::new(),
            worklist: VecDeque::new(),
            finished: HashSet::new(),
            added_master_hosts: HashSet::new(),
            total: 0,
            completed: 0,
        };

        match (kind, manifest, self.newest.as_ref()) {
            (CommitKind::MasterOnly, _, Some(newest)) => {
                download.cache = newest.derive(cache_id);
                for (url, hosts) in self.pending_masters.iter() {
                    if download.cache.add_entry_types(url, EntryType::MASTER) {
                        download.added_master_hosts.extend(hosts.iter().copied());
                    } else {
                        download.schedule(url.clone(), EntryType::MASTER);
                    }
                }
            }
            (_, Some(manifest), _) => {
                download.cache.initialize_with_manifest(manifest);
                for url in &manifest.explicit_urls {
                    download.schedule(url.clone(), EntryType::EXPLICIT);
                }
                for url in manifest.fallback_targets() {
                    download.schedule(url.clone(), EntryType::FALLBACK);
                }
                for url in manifest.intercept_targets() {
                    download.schedule(url.clone(), EntryType::INTERCEPT);
                }
                if let Some(types) = download.entry_types.get_mut(&self.manifest_url) {
                    *types |= EntryType::MANIFEST;
                }
                if let Some(newest) = self.newest.as_ref() {
                    for entry in newest.master_entries() {
                        download.schedule(entry.url.clone(), EntryType::MASTER);
                    }
                }
                for url in self.pending_masters.keys() {
                    download.schedule(url.clone(), EntryType::MASTER);
                }
            }
            _ => {
                return Err(UpdateFailure::new(
                    FailureReason::Unknown,
                    "No manifest to build the cache from",
                ))
            }
        }

        debug!(
            manifest_url = %self.manifest_url,
            kind = ?kind,
            fetches = download.total,
            "Worklist built"
        );
        Ok(download)
    }

    // ---------- Downloading ----------

    async fn download(&mut self, mut download: Download) -> Phase {
        let limit = self.ctx.config.fetch_limit();
        let mut in_flight: FuturesUnordered<BoxFuture<'static, FetchResult>> = FuturesUnordered::new();
        let mut cancel = self.cancel.clone();

        loop {
            while in_flight.len() < limit {
                let Some(url) = download.worklist.pop_front() else {
                    break;
                };
                let types = download
                    .entry_types
                    .get(&url)
                    .copied()
                    .unwrap_or(EntryType::MASTER);
                in_flight.push(self.spawn_fetch(url, types));
            }
            if in_flight.is_empty() {
                break;
            }

            let commands_open = self.commands_open;
            let event = tokio::select! {
                biased;
                Ok(_) = cancel.wait_for(|c| *c) => DownloadEvent::Cancelled,
                command = self.commands.recv(), if commands_open => DownloadEvent::Command(command),
                Some(result) = in_flight.next() => DownloadEvent::Fetched(result),
            };

            match event {
                DownloadEvent::Cancelled => return Phase::Cancelled,
                DownloadEvent::Command(Some(command)) => {
                    self.apply_command(command, Some(&mut download));
                    self.notifier.flush().await;
                }
                DownloadEvent::Command(None) => self.commands_open = false,
                DownloadEvent::Fetched(result) => {
                    if let Err(failure) = self.record_fetch(&mut download, result).await {
                        return Phase::CacheFailure(failure);
                    }
                    if download.completed % self.ctx.config.progress_interval() == 0 {
                        self.notifier.flush().await;
                    }
                }
            }
        }
        self.absorb_commands(Some(&mut download));
        self.notifier.flush().await;

        if download.kind == CommitKind::MasterOnly && download.added_master_hosts.is_empty() {
            debug!(manifest_url = %self.manifest_url, "No master entries added");
            self.queue_all(EventKind::NoUpdate);
            self.notifier.flush().await;
            return Phase::Done(UpdateOutcome::NoUpdate);
        }

        Phase::RefetchManifest(download)
    }

    fn spawn_fetch(&self, url: Url, types: EntryType) -> BoxFuture<'static, FetchResult> {
        let fetcher = self.fetcher.clone();
        let manifest_url = self.manifest_url.clone();
        let has_previous = self.newest.is_some();
        let purpose = if types.is_master_only() {
            FetchPurpose::MasterEntry
        } else {
            FetchPurpose::Resource
        };

        async move {
            let existing = if has_previous {
                fetcher.existing_response(&manifest_url, &url).await
            } else {
                None
            };
            fetcher
                .fetch(FetchTask::new(url, purpose).with_existing(existing))
                .await
        }
        .boxed()
    }

    async fn record_fetch(
        &mut self,
        download: &mut Download,
        result: FetchResult,
    ) -> Result<(), UpdateFailure> {
        let url = result.url;
        download.finished.insert(url.clone());
        let types = download
            .entry_types
            .get(&url)
            .copied()
            .unwrap_or(EntryType::MASTER);
        let wanting = self.pending_masters.get(&url).cloned().unwrap_or_default();

        match result.outcome {
            Ok(fetched) => {
                let (response_id, size) = match fetched.body {
                    FetchBody::Stored { response_id, size } => {
                        self.written.push(response_id);
                        (response_id, size)
                    }
                    FetchBody::Reused { response_id, size } => (response_id, size),
                    FetchBody::Buffered(_) => {
                        return Err(UpdateFailure::new(
                            FailureReason::Unknown,
                            "Resource body was not stored",
                        )
                        .with_resource(&url))
                    }
                };

                let mut keep = true;
                if types.is_master_only() && !self.is_carried_forward(&url) {
                    keep = false;
                    for host in &wanting {
                        if self.ctx.registry.is_live(*host).await {
                            keep = true;
                            break;
                        }
                    }
                }

                if keep {
                    download
                        .cache
                        .add_entry(AppCacheEntry::with_response(url.clone(), types, response_id, size));
                    download.added_master_hosts.extend(wanting);
                } else {
                    debug!(url = %url, "Dropping master entry without live hosts");
                }
            }
            Err(e) => {
                if types.is_required() {
                    return Err(UpdateFailure::new(
                        FailureReason::Resource,
                        format!("Resource fetch failed for {}: {}", url, e),
                    )
                    .with_resource(&url)
                    .with_status(e.status()));
                }

                for host in wanting {
                    self.fail_master(host, &url, &e);
                }
                self.pending_masters.remove(&url);

                let previous = self
                    .newest
                    .as_ref()
                    .and_then(|cache| cache.get_entry(&url))
                    .filter(|entry| entry.types.contains(EntryType::MASTER))
                    .cloned();
                match previous {
                    Some(mut entry) if !e.is_gone() => {
                        debug!(url = %url, error = %e, "Keeping previous master entry");
                        entry.types = EntryType::MASTER;
                        download.cache.add_entry(entry);
                    }
                    Some(_) => debug!(url = %url, "Master entry gone, dropping it"),
                    None => {}
                }
            }
        }

        download.completed += 1;
        self.queue_all(EventKind::Progress {
            url: Some(url),
            completed: download.completed,
            total: download.total,
        });
        Ok(())
    }

    fn is_carried_forward(&self, url: &Url) -> bool {
        self.newest
            .as_ref()
            .and_then(|cache| cache.get_entry(url))
            .map_or(false, |entry| entry.types.contains(EntryType::MASTER))
    }

    fn fail_master(&mut self, host: HostId, url: &Url, error: &FetchError) {
        warn!(host = host.raw(), url = %url, error = %error, "Master entry fetch failed");
        self.failed_hosts.insert(host);
        let failure = UpdateFailure::new(
            FailureReason::Resource,
            format!("Master entry fetch failed for {}: {}", url, error),
        )
        .with_resource(url)
        .with_status(error.status());
        self.notifier.queue(&[host], EventKind::Error(failure));
    }

    // ---------- RefetchManifest ----------

    async fn refetch_manifest(&mut self, download: Download) -> Phase {
        self.defer_commands();

        let existing = ExistingResponse {
            entry: AppCacheEntry::new(self.manifest_url.clone(), EntryType::MANIFEST),
            info: download.manifest.info().clone(),
        };
        let task = FetchTask::new(self.manifest_url.clone(), FetchPurpose::ManifestRefetch)
            .with_existing(Some(existing));

        let fetcher = self.fetcher.clone();
        let mut cancel = self.cancel.clone();
        let Some(result) = until_cancelled(&mut cancel, fetcher.fetch(task)).await else {
            return Phase::Cancelled;
        };
        self.defer_commands();

        let fetched = match result.outcome {
            Ok(fetched) => fetched,
            Err(e) => {
                return Phase::CacheFailure(
                    UpdateFailure::new(
                        FailureReason::Manifest,
                        format!("Manifest refetch failed: {}", e),
                    )
                    .with_resource(&self.manifest_url)
                    .with_status(e.status()),
                )
            }
        };

        let unchanged = fetched.status == StatusCode::NOT_MODIFIED
            || matches!(fetched.body, FetchBody::Buffered(ref data) if data.as_ref() == download.manifest.bytes());
        if unchanged {
            return Phase::Commit(download);
        }

        self.restarts += 1;
        if self.restarts > self.ctx.config.max_manifest_restarts {
            return Phase::CacheFailure(
                UpdateFailure::new(FailureReason::Changed, "Manifest changed during update")
                    .with_resource(&self.manifest_url),
            );
        }

        warn!(
            manifest_url = %self.manifest_url,
            restart = self.restarts,
            "Manifest changed during update, restarting"
        );
        self.discard_written().await;
        self.absorb_deferred();
        Phase::FetchManifest
    }

    // ---------- Completed ----------

    async fn commit(&mut self, download: Download) -> Phase {
        let Download {
            kind,
            manifest,
            mut cache,
            added_master_hosts,
            total,
            completed,
            ..
        } = download;

        let record = match manifest {
            ManifestSource::Existing(record) => record,
            ManifestSource::Fetched { data, info } => match self.write_manifest(data, info).await {
                Ok(record) => record,
                Err(e) => return Phase::CacheFailure(storage_failure(e)),
            },
        };
        cache.set_manifest(record);
        cache.mark_complete(SystemTime::now());
        let cache = Arc::new(cache);

        if let Err(e) = self
            .ctx
            .store
            .store_group_and_newest_cache(self.group_id, &self.manifest_url, cache.clone())
            .await
        {
            return Phase::CacheFailure(storage_failure(e));
        }

        let referenced = cache.response_ids();
        let orphans: Vec<ResponseId> = self
            .written
            .drain(..)
            .filter(|id| !referenced.contains(id))
            .collect();
        if !orphans.is_empty() {
            if let Err(e) = self.ctx.store.delete_responses(&orphans).await {
                warn!(error = %e, "Failed to delete unused responses");
            }
        }

        info!(
            manifest_url = %self.manifest_url,
            cache_id = %cache.id(),
            entries = cache.entry_count(),
            kind = ?kind,
            "Update committed"
        );
        self.new_cache = Some(cache);

        let outcome = match kind {
            CommitKind::CacheAttempt | CommitKind::Upgrade => {
                self.queue_all(EventKind::Progress {
                    url: None,
                    completed,
                    total,
                });
                if kind == CommitKind::CacheAttempt {
                    self.queue_all(EventKind::Cached);
                    UpdateOutcome::Cached
                } else {
                    self.queue_all(EventKind::UpdateReady);
                    UpdateOutcome::UpdateReady
                }
            }
            CommitKind::MasterOnly => {
                let (added, others): (Vec<HostId>, Vec<HostId>) = self
                    .live_hosts()
                    .into_iter()
                    .partition(|host| added_master_hosts.contains(host));
                self.notifier.queue(&added, EventKind::Cached);
                self.notifier.queue(&others, EventKind::NoUpdate);
                UpdateOutcome::NoUpdate
            }
        };
        self.notifier.flush().await;
        Phase::Done(outcome)
    }

    async fn write_manifest(&mut self, data: Bytes, info: ResponseInfo) -> Result<ManifestRecord, StorageError> {
        let mut writer = self.ctx.store.create_response_writer(self.group_id).await?;
        let response_id = writer.response_id();
        writer.write_info(info.clone()).await?;
        writer.write_data(data.clone()).await?;
        let size = writer.commit().await?;
        self.written.push(response_id);
        Ok(ManifestRecord {
            response_id,
            size,
            info,
            fingerprint: Fingerprint::of(data),
        })
    }

    async fn make_obsolete(&mut self) -> Phase {
        if let Err(e) = self.ctx.store.make_group_obsolete(&self.manifest_url).await {
            return Phase::CacheFailure(storage_failure(e));
        }
        info!(manifest_url = %self.manifest_url, "Manifest gone, group is obsolete");

        let master_hosts: HashSet<HostId> = self
            .pending_masters
            .values()
            .flat_map(|hosts| hosts.iter().copied())
            .collect();
        let (masters, others): (Vec<HostId>, Vec<HostId>) = self
            .live_hosts()
            .into_iter()
            .partition(|host| master_hosts.contains(host));
        let failure = UpdateFailure::new(FailureReason::Manifest, "Manifest was removed")
            .with_resource(&self.manifest_url);
        self.notifier.queue(&masters, EventKind::Error(failure));
        self.notifier.queue(&others, EventKind::Obsolete);
        self.notifier.flush().await;
        Phase::Done(UpdateOutcome::Obsolete)
    }

    // ---------- CacheFailure / Cancelled ----------

    async fn cache_failure(&mut self, failure: UpdateFailure) -> Phase {
        warn!(
            manifest_url = %self.manifest_url,
            reason = ?failure.reason,
            error = %failure.message,
            "Update failed"
        );
        self.discard_written().await;
        self.queue_all(EventKind::Error(failure.clone()));
        self.notifier.flush().await;
        Phase::Done(UpdateOutcome::Failed(failure))
    }

    async fn cancelled(&mut self) -> Phase {
        info!(manifest_url = %self.manifest_url, "Update cancelled");
        self.notifier.discard();
        self.discard_written().await;
        Phase::Done(UpdateOutcome::Cancelled)
    }

    async fn discard_written(&mut self) {
        if self.written.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut self.written);
        debug!(count = ids.len(), "Discarding responses from abandoned attempt");
        if let Err(e) = self.ctx.store.delete_responses(&ids).await {
            warn!(error = %e, "Failed to delete abandoned responses");
        }
    }

    // ---------- Hosts and commands ----------

    fn live_hosts(&self) -> Vec<HostId> {
        self.hosts
            .iter()
            .filter(|host| !self.failed_hosts.contains(*host))
            .copied()
            .collect()
    }

    fn queue_all(&mut self, kind: EventKind) {
        let hosts = self.live_hosts();
        self.notifier.queue(&hosts, kind);
    }

    fn apply_command(&mut self, command: JobCommand, mut download: Option<&mut Download>) {
        let JobCommand::Join { host, master } = command;

        if !self.hosts.contains(&host) {
            debug!(host = host.raw(), "Host joined running update");
            self.hosts.push(host);
            self.notifier.queue(&[host], EventKind::Checking);
            if matches!(download.as_deref(), Some(d) if d.kind != CommitKind::MasterOnly) {
                self.notifier.queue(&[host], EventKind::Downloading);
            }
        }

        let Some(url) = master else {
            return;
        };
        let wanting = self.pending_masters.entry(url.clone()).or_default();
        if wanting.contains(&host) {
            return;
        }
        wanting.push(host);

        let Some(download) = download.as_deref_mut() else {
            return;
        };
        if !download.entry_types.contains_key(&url) {
            download.schedule(url, EntryType::MASTER);
            return;
        }
        if let Some(types) = download.entry_types.get_mut(&url) {
            *types |= EntryType::MASTER;
        }
        if download.finished.contains(&url) {
            if download.cache.add_entry_types(&url, EntryType::MASTER) {
                download.added_master_hosts.insert(host);
            } else {
                self.fail_master(
                    host,
                    &url,
                    &FetchError::Network("earlier fetch of this entry failed".to_string()),
                );
            }
        }
    }

    /// Apply joins that are already queued.
    fn absorb_commands(&mut self, mut download: Option<&mut Download>) {
        while self.commands_open {
            match self.commands.try_recv() {
                Ok(command) => self.apply_command(command, download.as_deref_mut()),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.commands_open = false,
            }
        }
    }

    /// Park queued joins for a follow-up update.
    fn defer_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.deferred.push(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.commands_open = false;
                    break;
                }
            }
        }
    }

    /// Take parked joins back when the attempt restarts.
    fn absorb_deferred(&mut self) {
        for command in std::mem::take(&mut self.deferred) {
            self.apply_command(command, None);
        }
    }
}

impl Download {
    fn schedule(&mut self, url: Url, types: EntryType) {
        match self.entry_types.get_mut(&url) {
            Some(existing) => *existing |= types,
            None => {
                self.entry_types.insert(url.clone(), types);
                self.worklist.push_back(url);
                self.total += 1;
            }
        }
    }
}

fn storage_failure(error: StorageError) -> UpdateFailure {
    let reason = match error {
        StorageError::QuotaExceeded => FailureReason::Quota,
        _ => FailureReason::Storage,
    };
    UpdateFailure::new(reason, format!("Failed to store cache: {}", error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use rustkit_net::{NetError, Request, Response};
    use std::sync::Mutex;

    /// Serves fixed bodies per path; unknown paths 404.
    struct StaticNetwork {
        routes: Mutex<HashMap<String, (u16, &'static str)>>,
    }

    impl StaticNetwork {
        fn new(routes: &[(&str, u16, &'static str)]) -> Arc<Self> {
            Arc::new(Self {
                routes: Mutex::new(
                    routes
                        .iter()
                        .map(|(path, status, body)| (path.to_string(), (*status, *body)))
                        .collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl NetworkFetcher for StaticNetwork {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            let route = self.routes.lock().unwrap().get(request.url.path()).copied();
            let (status, body) = route.unwrap_or((404, ""));
            Ok(Response::new(
                request.url,
                StatusCode::from_u16(status).unwrap(),
                http::HeaderMap::new(),
                Bytes::from_static(body.as_bytes()),
            ))
        }
    }

    fn manifest_url() -> Url {
        Url::parse("https://example.com/app.manifest").unwrap()
    }

    async fn setup(
        network: Arc<StaticNetwork>,
    ) -> (Arc<MemoryStorage>, Arc<HostRegistry>, JobContext, GroupRecord) {
        let store = Arc::new(MemoryStorage::new());
        let registry = Arc::new(HostRegistry::new());
        let ctx = JobContext {
            store: store.clone(),
            network,
            registry: registry.clone(),
            config: UpdateConfig::default(),
        };
        let group = store.load_or_create_group(&manifest_url()).await.unwrap();
        (store, registry, ctx, group)
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::CacheFailure.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Downloading.is_terminal());
        assert!(!JobState::RefetchManifest.is_terminal());
    }

    #[test]
    fn test_storage_failure_reason() {
        assert_eq!(storage_failure(StorageError::QuotaExceeded).reason, FailureReason::Quota);
        assert_eq!(
            storage_failure(StorageError::Failed("disk".into())).reason,
            FailureReason::Storage
        );
    }

    #[test]
    fn test_schedule_merges_types() {
        let mut download = Download {
            kind: CommitKind::CacheAttempt,
            manifest: ManifestSource::Fetched {
                data: Bytes::new(),
                info: ResponseInfo::new(StatusCode::OK, http::HeaderMap::new()),
            },
            cache: AppCache::new(crate::cache::CacheId(1)),
            entry_types: HashMap::new(),
            worklist: VecDeque::new(),
            finished: HashSet::new(),
            added_master_hosts: HashSet::new(),
            total: 0,
            completed: 0,
        };
        let url = Url::parse("https://example.com/index.html").unwrap();
        download.schedule(url.clone(), EntryType::EXPLICIT);
        download.schedule(url.clone(), EntryType::MASTER);
        assert_eq!(download.total, 1);
        assert_eq!(download.worklist.len(), 1);
        assert_eq!(download.entry_types[&url], EntryType::EXPLICIT | EntryType::MASTER);
    }

    #[tokio::test]
    async fn test_clean_install() {
        let network = StaticNetwork::new(&[
            ("/app.manifest", 200, "CACHE MANIFEST\n/a.js\n/b.css\n"),
            ("/a.js", 200, "js"),
            ("/b.css", 200, "css"),
        ]);
        let (store, registry, ctx, group) = setup(network).await;
        let (host, mut events) = registry.register().await;

        let (job, handle) = UpdateJob::new(ctx, &group, vec![host], vec![]);
        let report = job.run().await;
        report.publish();

        assert_eq!(report.outcome, UpdateOutcome::Cached);
        assert_eq!(handle.wait().await, UpdateOutcome::Cached);
        assert_eq!(handle.state(), JobState::Completed);
        let cache = report.new_cache.unwrap();
        assert_eq!(cache.entry_count(), 2);
        assert!(cache.is_complete());
        assert!(store.newest_cache(&manifest_url()).await.unwrap().is_some());

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.kind.name());
        }
        assert_eq!(
            names,
            ["checking", "downloading", "progress", "progress", "progress", "cached"]
        );
    }

    #[tokio::test]
    async fn test_bad_signature_fails() {
        let network = StaticNetwork::new(&[("/app.manifest", 200, "NOT A MANIFEST\n")]);
        let (_store, registry, ctx, group) = setup(network).await;
        let (host, _events) = registry.register().await;

        let (job, _handle) = UpdateJob::new(ctx, &group, vec![host], vec![]);
        let report = job.run().await;
        match report.outcome {
            UpdateOutcome::Failed(failure) => assert_eq!(failure.reason, FailureReason::Signature),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let network = StaticNetwork::new(&[("/app.manifest", 200, "CACHE MANIFEST\n")]);
        let (store, registry, ctx, group) = setup(network).await;
        let (host, mut events) = registry.register().await;

        let (job, handle) = UpdateJob::new(ctx, &group, vec![host], vec![]);
        handle.cancel();
        let report = job.run().await;
        report.publish();

        assert_eq!(report.outcome, UpdateOutcome::Cancelled);
        assert_eq!(handle.wait().await, UpdateOutcome::Cancelled);
        assert!(events.try_recv().is_err());
        assert_eq!(store.response_count().await, 0);
    }

    #[tokio::test]
    async fn test_late_join_is_deferred() {
        let network = StaticNetwork::new(&[("/app.manifest", 200, "CACHE MANIFEST\n")]);
        let (_store, registry, ctx, group) = setup(network).await;
        let (host, _events) = registry.register().await;

        let (job, handle) = UpdateJob::new(ctx, &group, vec![host], vec![]);
        let report = job.run().await;
        assert!(!handle.try_join(host, None));
        assert!(report.deferred.is_empty());
    }
}
