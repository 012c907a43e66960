//! Linux namespaces shared by the containers of a sandbox
//!
//! A sandbox decides, for each namespace kind, whether its containers stay in
//! the host's namespace, get a namespace owned by the sandbox, or join a
//! namespace owned by another sandbox. Owned network, IPC, and UTS namespaces
//! are pinned to a path so they exist before any process does; owned user
//! and PID namespaces are created by the runtime along with the infra
//! process.

mod pin;

pub use pin::{BindMountPinner, NamespacePinner};

use crate::{
    cleanup::{UndoAction, UndoError},
    errors::NamespaceError,
    lock::lock,
    spec::builder::SpecBuilder,
};
use nix::sched::CloneFlags;
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::task;

/// The namespace kinds a sandbox can share
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    Network,
    Ipc,
    Uts,
    User,
    Pid,
}

impl NamespaceKind {
    /// Every kind, in creation order
    ///
    /// The network namespace comes first; its path must exist before the
    /// network adapter is invoked.
    pub const ALL: [NamespaceKind; 5] = [
        NamespaceKind::Network,
        NamespaceKind::Ipc,
        NamespaceKind::Uts,
        NamespaceKind::User,
        NamespaceKind::Pid,
    ];

    /// Name under `/proc/<pid>/ns/`
    pub fn proc_name(self) -> &'static str {
        match self {
            NamespaceKind::Network => "net",
            NamespaceKind::Ipc => "ipc",
            NamespaceKind::Uts => "uts",
            NamespaceKind::User => "user",
            NamespaceKind::Pid => "pid",
        }
    }

    /// Namespace type string in a runtime spec
    pub fn spec_type(self) -> &'static str {
        match self {
            NamespaceKind::Network => "network",
            other => other.proc_name(),
        }
    }

    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NamespaceKind::Network => CloneFlags::CLONE_NEWNET,
            NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
            NamespaceKind::Uts => CloneFlags::CLONE_NEWUTS,
            NamespaceKind::User => CloneFlags::CLONE_NEWUSER,
            NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
        }
    }

    /// Kinds that can be pinned without a process living in them
    pub fn is_pinnable(self) -> bool {
        matches!(
            self,
            NamespaceKind::Network | NamespaceKind::Ipc | NamespaceKind::Uts
        )
    }

    /// Path of this namespace for a running process
    pub fn proc_path(self, pid: u32) -> PathBuf {
        PathBuf::from(format!("/proc/{}/ns/{}", pid, self.proc_name()))
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.spec_type())
    }
}

/// One value for each namespace kind
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerKind<T> {
    pub network: T,
    pub ipc: T,
    pub uts: T,
    pub user: T,
    pub pid: T,
}

impl<T> PerKind<T> {
    pub fn get(&self, kind: NamespaceKind) -> &T {
        match kind {
            NamespaceKind::Network => &self.network,
            NamespaceKind::Ipc => &self.ipc,
            NamespaceKind::Uts => &self.uts,
            NamespaceKind::User => &self.user,
            NamespaceKind::Pid => &self.pid,
        }
    }

    pub fn get_mut(&mut self, kind: NamespaceKind) -> &mut T {
        match kind {
            NamespaceKind::Network => &mut self.network,
            NamespaceKind::Ipc => &mut self.ipc,
            NamespaceKind::Uts => &mut self.uts,
            NamespaceKind::User => &mut self.user,
            NamespaceKind::Pid => &mut self.pid,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (NamespaceKind, &T)> {
        NamespaceKind::ALL.iter().map(move |kind| (*kind, self.get(*kind)))
    }
}

/// Requested sharing policy for one namespace kind
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceMode {
    /// stay in the host's namespace
    Host,
    /// one namespace shared by the whole sandbox
    Pod,
    /// a namespace per container
    Private,
    /// join the namespace of another sandbox (or container, for PID)
    Target(String),
}

impl Default for NamespaceMode {
    fn default() -> Self {
        NamespaceMode::Pod
    }
}

/// Namespace modes requested for a sandbox or container
pub type NamespaceOptions = PerKind<NamespaceMode>;

impl NamespaceOptions {
    /// Pod-shared network, IPC, and UTS; per-container PID; host user
    pub fn standard() -> Self {
        PerKind {
            network: NamespaceMode::Pod,
            ipc: NamespaceMode::Pod,
            uts: NamespaceMode::Pod,
            user: NamespaceMode::Host,
            pid: NamespaceMode::Private,
        }
    }

    /// A persistent infra process is needed when containers share its PID
    /// or user namespace
    pub fn needs_infra(&self) -> bool {
        self.pid == NamespaceMode::Pod
            || matches!(self.user, NamespaceMode::Pod | NamespaceMode::Private)
    }
}

/// Resolved namespace for one kind
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum Namespace {
    /// the host's namespace
    Host,
    /// created and released by this sandbox
    ///
    /// Without a path, the runtime creates it for the infra process.
    Owned { path: Option<PathBuf> },
    /// another sandbox's namespace, never released by this one
    Joined { path: PathBuf, owner: String },
}

impl Default for Namespace {
    fn default() -> Self {
        Namespace::Host
    }
}

impl Namespace {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Namespace::Host => None,
            Namespace::Owned { path } => path.as_deref(),
            Namespace::Joined { path, .. } => Some(path),
        }
    }

    pub fn is_host(&self) -> bool {
        *self == Namespace::Host
    }
}

/// The resolved namespaces of a sandbox
pub type NamespaceSet = PerKind<Namespace>;

impl NamespaceSet {
    /// Path to the sandbox's network namespace, if it has its own
    pub fn network_path(&self) -> Option<&Path> {
        self.network.path()
    }

    /// Namespace path a joiner would use, given the infra process if any
    pub fn join_path(&self, kind: NamespaceKind, infra_pid: Option<u32>) -> Option<PathBuf> {
        match self.get(kind) {
            Namespace::Host => None,
            Namespace::Owned { path: Some(path) } | Namespace::Joined { path, .. } => {
                Some(path.clone())
            }
            Namespace::Owned { path: None } => infra_pid.map(|pid| kind.proc_path(pid)),
        }
    }

    /// Namespaces for a container of a sandbox with these namespaces
    ///
    /// Network, IPC, and UTS always follow the sandbox. PID and user follow
    /// `options`: `pod` joins the infra process, `private` gets a fresh
    /// namespace, `target` joins the process given by `target_pid`.
    pub fn for_container(
        &self,
        sandbox_id: &str,
        options: &NamespaceOptions,
        infra_pid: Option<u32>,
        target_pid: Option<u32>,
    ) -> Result<NamespaceSet, NamespaceError> {
        let mut set = NamespaceSet::default();
        for (kind, namespace) in self.iter() {
            let resolved = match (kind, namespace) {
                (_, Namespace::Host) => Namespace::Host,
                (NamespaceKind::Pid, _) | (NamespaceKind::User, _) => {
                    match options.get(kind) {
                        NamespaceMode::Host => Namespace::Host,
                        NamespaceMode::Private => Namespace::Owned { path: None },
                        NamespaceMode::Pod => match self.join_path(kind, infra_pid) {
                            Some(path) => Namespace::Joined {
                                path,
                                owner: sandbox_id.to_string(),
                            },
                            None => Namespace::Owned { path: None },
                        },
                        NamespaceMode::Target(target) => match target_pid {
                            Some(pid) => Namespace::Joined {
                                path: kind.proc_path(pid),
                                owner: target.clone(),
                            },
                            None => {
                                return Err(NamespaceError::NoTarget {
                                    kind,
                                    target: target.clone(),
                                })
                            }
                        },
                    }
                }
                (kind, _) => match self.join_path(kind, infra_pid) {
                    Some(path) => Namespace::Joined {
                        path,
                        owner: sandbox_id.to_string(),
                    },
                    None => Namespace::Owned { path: None },
                },
            };
            *set.get_mut(kind) = resolved;
        }
        Ok(set)
    }

    /// Inject namespace references into a spec
    ///
    /// Host namespaces are left out, owned namespaces without a path ask the
    /// runtime for a new one, everything else is joined by path. A host UTS
    /// namespace also clears the spec hostname, which the runtime would
    /// otherwise apply to the host.
    pub fn apply_to_spec(&self, builder: &mut SpecBuilder) {
        for (kind, namespace) in self.iter() {
            match namespace {
                Namespace::Host => builder.remove_namespace(kind),
                other => builder.add_namespace(kind, other.path().map(Path::to_path_buf)),
            };
        }
        if self.uts.is_host() {
            builder.hostname("");
        }
    }
}

/// How a new sandbox gets its namespace of one kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamespaceRequest {
    Host,
    New,
    Join { owner: String, path: PathBuf },
}

impl Default for NamespaceRequest {
    fn default() -> Self {
        NamespaceRequest::Host
    }
}

#[derive(Debug)]
struct LiveNamespace {
    kind: NamespaceKind,
    owner: String,
    joiners: usize,
    released: bool,
}

/// Creates, tracks, and releases the namespaces owned by sandboxes
///
/// Clones share state.
#[derive(Clone)]
pub struct NamespaceManager {
    pinner: Arc<dyn NamespacePinner>,
    live: Arc<Mutex<HashMap<PathBuf, LiveNamespace>>>,
}

impl NamespaceManager {
    pub fn new(pinner: Arc<dyn NamespacePinner>) -> Self {
        NamespaceManager {
            pinner,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolve the namespaces for a new sandbox
    ///
    /// Undo actions for everything created or joined so far come back even
    /// when a later kind fails, in creation order.
    pub async fn new_pod_namespaces(
        &self,
        sandbox_id: &str,
        requests: &PerKind<NamespaceRequest>,
    ) -> (Result<NamespaceSet, NamespaceError>, Vec<UndoAction>) {
        let mut set = NamespaceSet::default();
        let mut undo = Vec::new();
        for (kind, request) in requests.iter() {
            let namespace = match request {
                NamespaceRequest::Host => Namespace::Host,
                NamespaceRequest::New if kind.is_pinnable() => {
                    match self.create(kind, sandbox_id).await {
                        Ok(path) => {
                            undo.push(self.release_action(kind, &path));
                            Namespace::Owned { path: Some(path) }
                        }
                        Err(err) => return (Err(err), undo),
                    }
                }
                NamespaceRequest::New => Namespace::Owned { path: None },
                NamespaceRequest::Join { owner, path } => match self.join(kind, path) {
                    Ok(counted) => {
                        if counted {
                            undo.push(self.detach_action(path));
                        }
                        Namespace::Joined {
                            path: path.clone(),
                            owner: owner.clone(),
                        }
                    }
                    Err(err) => return (Err(err), undo),
                },
            };
            log::debug!("sandbox {} {} namespace: {:?}", sandbox_id, kind, namespace);
            *set.get_mut(kind) = namespace;
        }
        (Ok(set), undo)
    }

    async fn create(&self, kind: NamespaceKind, owner: &str) -> Result<PathBuf, NamespaceError> {
        let pinner = self.pinner.clone();
        let name = owner.to_string();
        let path = task::spawn_blocking(move || pinner.pin(kind, &name)).await??;
        lock(&self.live).insert(
            path.clone(),
            LiveNamespace {
                kind,
                owner: owner.to_string(),
                joiners: 0,
                released: false,
            },
        );
        Ok(path)
    }

    /// Count a joiner on a namespace we own, or check that a foreign path
    /// exists. Returns true if a join reference was taken.
    fn join(&self, kind: NamespaceKind, path: &Path) -> Result<bool, NamespaceError> {
        let mut live = lock(&self.live);
        match live.get_mut(path) {
            Some(entry) if !entry.released => {
                entry.joiners += 1;
                Ok(true)
            }
            Some(_) => Err(NamespaceError::Closed {
                kind,
                path: path.to_path_buf(),
            }),
            None if path.exists() => Ok(false),
            None => Err(NamespaceError::Closed {
                kind,
                path: path.to_path_buf(),
            }),
        }
    }

    fn release_action(&self, kind: NamespaceKind, path: &Path) -> UndoAction {
        let manager = self.clone();
        let path = path.to_path_buf();
        UndoAction::new(
            format!("releasing {} namespace {:?}", kind, path),
            async move { manager.release(&path).await.map_err(UndoError::from) },
        )
    }

    fn detach_action(&self, path: &Path) -> UndoAction {
        let manager = self.clone();
        let path = path.to_path_buf();
        UndoAction::new(
            format!("detaching from joined namespace {:?}", path),
            async move { manager.detach(&path).await.map_err(UndoError::from) },
        )
    }

    /// Release a namespace owned by a sandbox
    ///
    /// If other sandboxes still join it, it is destroyed when the last one
    /// detaches. Releasing an unknown path does nothing.
    ///
    /// The entry is marked released before anything is destroyed and stays
    /// until the pin is gone, so a concurrent join is refused instead of
    /// joining a namespace about to disappear.
    pub async fn release(&self, path: &Path) -> Result<(), NamespaceError> {
        let kind = {
            let mut live = lock(&self.live);
            match live.get_mut(path) {
                None => return Ok(()),
                Some(entry) => {
                    entry.released = true;
                    if entry.joiners > 0 {
                        log::debug!(
                            "deferring release of {:?}, {} joiners remain",
                            path,
                            entry.joiners
                        );
                        return Ok(());
                    }
                    entry.kind
                }
            }
        };
        self.destroy(kind, path).await
    }

    /// Drop a joiner reference taken when a sandbox joined a namespace
    pub async fn detach(&self, path: &Path) -> Result<(), NamespaceError> {
        let kind = {
            let mut live = lock(&self.live);
            match live.get_mut(path) {
                None => return Ok(()),
                Some(entry) => {
                    entry.joiners = entry.joiners.saturating_sub(1);
                    if entry.joiners > 0 || !entry.released {
                        return Ok(());
                    }
                    entry.kind
                }
            }
        };
        self.destroy(kind, path).await
    }

    /// Unpin a released namespace, then forget it
    ///
    /// If unpinning fails the entry stays released, so joins are still
    /// refused and a later release can try again.
    async fn destroy(&self, kind: NamespaceKind, path: &Path) -> Result<(), NamespaceError> {
        let pinner = self.pinner.clone();
        let pinned = path.to_path_buf();
        task::spawn_blocking(move || pinner.unpin(kind, &pinned)).await??;
        lock(&self.live).remove(path);
        Ok(())
    }

    /// Release everything a sandbox holds: owned namespaces are released,
    /// joined ones are detached
    ///
    /// Every namespace is attempted; the first error is returned.
    pub async fn release_set(&self, set: &NamespaceSet) -> Result<(), NamespaceError> {
        let mut first_error = None;
        for (_, namespace) in set.iter() {
            let result = match namespace {
                Namespace::Owned { path: Some(path) } => self.release(path).await,
                Namespace::Joined { path, .. } => self.detach(path).await,
                _ => Ok(()),
            };
            if let Err(err) = result {
                log::warn!("releasing namespace: {}", err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Re-register the namespaces of a sandbox recovered from disk
    ///
    /// Owned namespaces must go first across all sandboxes, then joins.
    pub fn restore_owned(&self, owner: &str, set: &NamespaceSet) -> Result<(), NamespaceError> {
        let mut live = lock(&self.live);
        for (kind, namespace) in set.iter() {
            if let Namespace::Owned { path: Some(path) } = namespace {
                if !path.exists() {
                    return Err(NamespaceError::Closed {
                        kind,
                        path: path.clone(),
                    });
                }
                live.entry(path.clone()).or_insert(LiveNamespace {
                    kind,
                    owner: owner.to_string(),
                    joiners: 0,
                    released: false,
                });
            }
        }
        Ok(())
    }

    pub fn restore_joins(&self, set: &NamespaceSet) -> Result<(), NamespaceError> {
        for (kind, namespace) in set.iter() {
            if let Namespace::Joined { path, .. } = namespace {
                self.join(kind, path)?;
            }
        }
        Ok(())
    }

    /// Owner of a live namespace path
    pub fn owner_of(&self, path: &Path) -> Option<String> {
        lock(&self.live).get(path).map(|entry| entry.owner.clone())
    }

    /// Number of sandboxes joined to a live namespace path
    pub fn joiners(&self, path: &Path) -> usize {
        lock(&self.live)
            .get(path)
            .map(|entry| entry.joiners)
            .unwrap_or(0)
    }

    pub fn live_count(&self) -> usize {
        lock(&self.live).len()
    }
}

#[cfg(test)]
mod tests;
