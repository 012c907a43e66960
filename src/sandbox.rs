//! Sandboxes: the shared environment containers run in

use crate::{
    adapters::StorageInfo,
    errors::ServerError,
    lock::lock,
    namespace::{NamespaceKind, NamespaceOptions, NamespaceSet},
    request::Metadata,
};
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::PathBuf,
    sync::Mutex,
};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Creating,
    Ready,
    Stopping,
    Stopped,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            SandboxState::Creating => "creating",
            SandboxState::Ready => "ready",
            SandboxState::Stopping => "stopping",
            SandboxState::Stopped => "stopped",
        })
    }
}

/// The process anchoring a sandbox's namespaces
///
/// A spoofed infra has no process at all; it exists only as a record, and
/// runtime calls for it are skipped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfraContainer {
    pub id: String,
    pub name: String,
    pub spoofed: bool,
    pub pid: Option<u32>,
}

#[derive(Debug)]
struct SandboxInner {
    state: SandboxState,
    members: BTreeSet<String>,
    ips: Vec<String>,
    infra_pid: Option<u32>,
}

#[derive(Debug)]
pub struct Sandbox {
    pub id: String,
    pub name: String,
    pub metadata: Metadata,
    pub namespaces: NamespaceSet,
    pub namespace_options: NamespaceOptions,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub mount_label: Option<String>,
    pub process_label: Option<String>,
    pub infra: InfraContainer,
    pub storage: StorageInfo,
    pub hostname: String,
    pub resolv_path: Option<PathBuf>,
    pub hostname_path: Option<PathBuf>,
    pub cgroup_parent: String,
    pub privileged: bool,
    pub created: DateTime<Utc>,
    inner: Mutex<SandboxInner>,
    stop_lock: RwLock<()>,
}

/// Snapshot of a sandbox for status queries
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SandboxStatus {
    pub id: String,
    pub name: String,
    pub metadata: Metadata,
    pub state: SandboxState,
    pub created: DateTime<Utc>,
    pub ips: Vec<String>,
    pub namespaces: NamespaceSet,
    pub infra: InfraContainer,
    pub members: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Everything needed to make a [Sandbox]
#[derive(Clone, Debug)]
pub struct SandboxParts {
    pub id: String,
    pub name: String,
    pub metadata: Metadata,
    pub namespaces: NamespaceSet,
    pub namespace_options: NamespaceOptions,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub mount_label: Option<String>,
    pub process_label: Option<String>,
    pub infra: InfraContainer,
    pub storage: StorageInfo,
    pub hostname: String,
    pub resolv_path: Option<PathBuf>,
    pub hostname_path: Option<PathBuf>,
    pub cgroup_parent: String,
    pub privileged: bool,
    pub created: DateTime<Utc>,
    pub ips: Vec<String>,
}

impl Sandbox {
    pub fn new(parts: SandboxParts, state: SandboxState) -> Self {
        Sandbox {
            inner: Mutex::new(SandboxInner {
                state,
                members: BTreeSet::new(),
                ips: parts.ips,
                infra_pid: parts.infra.pid,
            }),
            stop_lock: RwLock::new(()),
            id: parts.id,
            name: parts.name,
            metadata: parts.metadata,
            namespaces: parts.namespaces,
            namespace_options: parts.namespace_options,
            labels: parts.labels,
            annotations: parts.annotations,
            mount_label: parts.mount_label,
            process_label: parts.process_label,
            infra: parts.infra,
            storage: parts.storage,
            hostname: parts.hostname,
            resolv_path: parts.resolv_path,
            hostname_path: parts.hostname_path,
            cgroup_parent: parts.cgroup_parent,
            privileged: parts.privileged,
            created: parts.created,
        }
    }

    pub fn state(&self) -> SandboxState {
        lock(&self.inner).state
    }

    pub fn set_state(&self, state: SandboxState) {
        let mut inner = lock(&self.inner);
        if inner.state != state {
            log::debug!("sandbox {} {} -> {}", self.id, inner.state, state);
            inner.state = state;
        }
    }

    pub fn ips(&self) -> Vec<String> {
        lock(&self.inner).ips.clone()
    }

    /// Pid of the infra process, if it is running
    pub fn infra_pid(&self) -> Option<u32> {
        lock(&self.inner).infra_pid
    }

    pub fn set_infra_pid(&self, pid: Option<u32>) {
        lock(&self.inner).infra_pid = pid;
    }

    /// Where a container would join this sandbox's namespace of `kind`
    pub fn join_path(&self, kind: NamespaceKind) -> Option<PathBuf> {
        self.namespaces.join_path(kind, self.infra_pid())
    }

    pub fn add_member(&self, id: &str) {
        lock(&self.inner).members.insert(id.to_string());
    }

    pub fn remove_member(&self, id: &str) -> bool {
        lock(&self.inner).members.remove(id)
    }

    pub fn members(&self) -> Vec<String> {
        lock(&self.inner).members.iter().cloned().collect()
    }

    /// Hold off stops while a container is created
    ///
    /// Fails right away if a stop holds the lock or already finished.
    pub fn creation_guard(&self) -> Result<RwLockReadGuard<'_, ()>, ServerError> {
        let guard = self
            .stop_lock
            .try_read()
            .map_err(|_| ServerError::SandboxStopping(self.id.clone()))?;
        match self.state() {
            SandboxState::Stopping | SandboxState::Stopped => {
                Err(ServerError::SandboxStopping(self.id.clone()))
            }
            _ => Ok(guard),
        }
    }

    /// Exclusive access for stopping or removing, after in-progress creates
    /// finish
    pub async fn stop_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.stop_lock.write().await
    }

    pub fn status(&self) -> SandboxStatus {
        let inner = lock(&self.inner);
        let mut infra = self.infra.clone();
        infra.pid = inner.infra_pid;
        SandboxStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            metadata: self.metadata.clone(),
            state: inner.state,
            created: self.created,
            ips: inner.ips.clone(),
            namespaces: self.namespaces.clone(),
            infra,
            members: inner.members.iter().cloned().collect(),
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
        }
    }
}
