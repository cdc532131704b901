//! Hosts (tabs or frames) observing cache groups.
//!
//! Hosts are tracked as `HostId -> token` pairs. Unregistering a host
//! invalidates its token, and every delivery checks the token first, so
//! events for a host that went away mid-update are dropped silently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};
use url::Url;

use crate::UpdateFailure;

/// Unique identifier for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(u64);

impl HostId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Liveness flag, cleared when the host unregisters.
#[derive(Debug, Clone)]
struct HostToken(Arc<AtomicBool>);

impl HostToken {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    fn is_valid(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Lifecycle event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Checking,
    Downloading,
    /// `url` is `None` for the final progress event.
    Progress {
        url: Option<Url>,
        completed: usize,
        total: usize,
    },
    NoUpdate,
    UpdateReady,
    Cached,
    Obsolete,
    Error(UpdateFailure),
}

impl EventKind {
    /// DOM-style event name.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Checking => "checking",
            EventKind::Downloading => "downloading",
            EventKind::Progress { .. } => "progress",
            EventKind::NoUpdate => "noupdate",
            EventKind::UpdateReady => "updateready",
            EventKind::Cached => "cached",
            EventKind::Obsolete => "obsolete",
            EventKind::Error(_) => "error",
        }
    }
}

/// An event delivered to one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCacheEvent {
    pub manifest_url: Url,
    pub kind: EventKind,
}

struct HostSlot {
    token: HostToken,
    sender: mpsc::UnboundedSender<AppCacheEvent>,
}

/// Registry of live hosts.
#[derive(Default)]
pub struct HostRegistry {
    hosts: RwLock<HashMap<HostId, HostSlot>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host; its events arrive on the returned receiver.
    pub async fn register(&self) -> (HostId, mpsc::UnboundedReceiver<AppCacheEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = HostId::new();
        self.hosts.write().await.insert(
            id,
            HostSlot {
                token: HostToken::new(),
                sender,
            },
        );
        debug!(host = id.raw(), "Host registered");
        (id, receiver)
    }

    /// Drop a host. Returns false if it was not registered.
    pub async fn unregister(&self, id: HostId) -> bool {
        match self.hosts.write().await.remove(&id) {
            Some(slot) => {
                slot.token.invalidate();
                debug!(host = id.raw(), "Host unregistered");
                true
            }
            None => false,
        }
    }

    pub async fn is_live(&self, id: HostId) -> bool {
        self.hosts
            .read()
            .await
            .get(&id)
            .map_or(false, |slot| slot.token.is_valid() && !slot.sender.is_closed())
    }

    /// Deliver one event. Returns false if the host is gone.
    pub async fn send(&self, id: HostId, event: AppCacheEvent) -> bool {
        let hosts = self.hosts.read().await;
        let Some(slot) = hosts.get(&id) else {
            return false;
        };
        if !slot.token.is_valid() {
            return false;
        }
        slot.sender.send(event).is_ok()
    }

    pub async fn len(&self) -> usize {
        self.hosts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.hosts.read().await.is_empty()
    }
}

/// Buffers events for the hosts of one group and delivers them in batches.
pub struct HostNotifier {
    registry: Arc<HostRegistry>,
    manifest_url: Url,
    pending: Vec<(HostId, EventKind)>,
}

impl HostNotifier {
    /// Create a notifier for the group at `manifest_url`.
    pub fn new(registry: Arc<HostRegistry>, manifest_url: Url) -> Self {
        Self {
            registry,
            manifest_url,
            pending: Vec::new(),
        }
    }

    /// Buffer `kind` for each host, once per host.
    pub fn queue<'a>(&mut self, hosts: impl IntoIterator<Item = &'a HostId>, kind: EventKind) {
        let mut seen: Vec<HostId> = Vec::new();
        for &host in hosts {
            if seen.contains(&host) {
                continue;
            }
            seen.push(host);
            self.pending.push((host, kind.clone()));
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop everything buffered.
    pub fn discard(&mut self) {
        self.pending.clear();
    }

    /// Deliver buffered events in order. Events for dead hosts are dropped.
    pub async fn flush(&mut self) -> usize {
        let mut delivered = 0;
        for (host, kind) in self.pending.drain(..) {
            let name = kind.name();
            let event = AppCacheEvent {
                manifest_url: self.manifest_url.clone(),
                kind,
            };
            if self.registry.send(host, event).await {
                delivered += 1;
            } else {
                trace!(host = host.raw(), event = name, "Dropped event for departed host");
            }
        }
        delivered
    }
}
