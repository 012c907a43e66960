//! Interfaces to the subsystems the orchestrators drive
//!
//! Storage, networking, the OCI runtime, security policy, and extension
//! hooks all live behind traits here. Teardown calls (`stop`, `delete`,
//! `detach`, the hook undo calls) run during rollback and must succeed on
//! objects that were never fully created.

pub mod hooks;
pub mod network;
pub mod policy;
pub mod runtime;
pub mod storage;

pub use hooks::{NoHooks, NoWorkloadPolicy};
pub use network::CniNetwork;
pub use policy::{DefaultAppArmor, DefaultSeccomp, StaticSelinux};
pub use runtime::OciRuntime;
pub use storage::DirectoryStorage;

use crate::{
    errors::AdapterError,
    request::{ContainerRequest, SecurityProfile, SelinuxOptions},
    spec::{IdMapping, SpecDocument},
};
use async_trait::async_trait;
use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

/// What storage needs to lay out a root filesystem
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootfsRequest {
    pub id: String,
    pub name: String,
    /// the sandbox this rootfs belongs to; its own id for a sandbox
    pub sandbox_id: String,
    /// image reference; for a sandbox, the infra image
    pub image: String,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
    pub selinux: Option<SelinuxOptions>,
}

/// Directories and labels storage assigned to a rootfs
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    /// persistent directory; holds the template spec copy
    pub dir: PathBuf,
    /// runtime directory; holds the running spec copy and is the bundle
    pub run_dir: PathBuf,
    pub mount_label: Option<String>,
    pub process_label: Option<String>,
}

/// Configuration an image carries for containers made from it
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ImageConfig {
    pub env: Vec<String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub user: String,
    pub volumes: Vec<String>,
    pub stop_signal: String,
}

/// An image resolved to a content identifier
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub reference: String,
    pub config: ImageConfig,
}

/// Something storage holds on disk, listed during restore
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub id: String,
    pub name: String,
    pub sandbox_id: String,
    pub info: StorageInfo,
}

impl StoredEntry {
    pub fn is_sandbox(&self) -> bool {
        self.id == self.sandbox_id
    }
}

/// An artifact's files, listed relative to its root
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub reference: String,
    pub root: PathBuf,
    pub paths: Vec<String>,
}

/// Root filesystem storage
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn create_sandbox_rootfs(&self, request: &RootfsRequest) -> Result<StorageInfo, AdapterError>;

    async fn resolve_image(&self, reference: &str) -> Result<ImageInfo, AdapterError>;

    async fn create_container_rootfs(
        &self,
        request: &RootfsRequest,
        image: &ImageInfo,
    ) -> Result<StorageInfo, AdapterError>;

    /// Mount the rootfs, returning the mount point
    async fn start(&self, id: &str) -> Result<PathBuf, AdapterError>;

    async fn stop(&self, id: &str) -> Result<(), AdapterError>;

    async fn delete(&self, id: &str) -> Result<(), AdapterError>;

    async fn list(&self) -> Result<Vec<StoredEntry>, AdapterError>;

    async fn artifact(&self, reference: &str) -> Result<ArtifactInfo, AdapterError>;
}

/// Result of attaching a sandbox to the network
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkResult {
    pub ips: Vec<String>,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    async fn attach(&self, sandbox_id: &str, netns: &std::path::Path) -> Result<NetworkResult, AdapterError>;

    async fn detach(&self, sandbox_id: &str, netns: &std::path::Path) -> Result<(), AdapterError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Creating,
    Created,
    Running,
    Paused,
    Stopped,
}

/// What the runtime reports about one process
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessState {
    pub status: ProcessStatus,
    #[serde(default)]
    pub pid: Option<u32>,
}

/// The OCI runtime that runs workload processes
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Create the process described by the spec in `bundle`, without
    /// starting it, and return its pid
    async fn create_process(&self, id: &str, bundle: &std::path::Path) -> Result<u32, AdapterError>;

    async fn start(&self, id: &str) -> Result<(), AdapterError>;

    /// Stop gracefully, killing after `timeout`
    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), AdapterError>;

    async fn delete(&self, id: &str) -> Result<(), AdapterError>;

    /// None if the runtime doesn't know the id
    async fn state(&self, id: &str) -> Result<Option<ProcessState>, AdapterError>;
}

/// Third-party hooks that may adjust specs around creation
#[async_trait]
pub trait HookAdapter: Send + Sync {
    async fn on_pod_create(&self, sandbox_id: &str, spec: SpecDocument) -> Result<SpecDocument, AdapterError>;

    async fn on_pod_remove(&self, sandbox_id: &str) -> Result<(), AdapterError>;

    async fn on_container_create(
        &self,
        container_id: &str,
        spec: SpecDocument,
    ) -> Result<SpecDocument, AdapterError>;

    /// Undo a successful `on_container_create` after a later failure
    async fn undo_container_create(&self, container_id: &str) -> Result<(), AdapterError>;

    async fn on_container_remove(&self, container_id: &str) -> Result<(), AdapterError>;
}

/// Spec changes for special workload classes, selected by annotations
pub trait WorkloadPolicy: Send + Sync {
    fn mutate(
        &self,
        request: &ContainerRequest,
        sandbox_annotations: &BTreeMap<String, String>,
        spec: &mut SpecDocument,
    ) -> Result<(), AdapterError>;
}

pub trait SeccompPolicy: Send + Sync {
    /// The profile to install, or None to run unconfined
    fn resolve(
        &self,
        profile: &SecurityProfile,
        privileged: bool,
    ) -> Result<Option<serde_json::Value>, AdapterError>;
}

pub trait AppArmorPolicy: Send + Sync {
    fn resolve(&self, profile: &SecurityProfile, privileged: bool) -> Result<Option<String>, AdapterError>;
}

/// Process and mount labels
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelinuxLabels {
    pub process: Option<String>,
    pub mount: Option<String>,
}

pub trait SelinuxPolicy: Send + Sync {
    fn labels(&self, options: Option<&SelinuxOptions>, privileged: bool) -> Result<SelinuxLabels, AdapterError>;
}

/// The policy adapters, bundled
#[derive(Clone)]
pub struct Policies {
    pub seccomp: Arc<dyn SeccompPolicy>,
    pub apparmor: Arc<dyn AppArmorPolicy>,
    pub selinux: Arc<dyn SelinuxPolicy>,
}

impl Default for Policies {
    fn default() -> Self {
        Policies {
            seccomp: Arc::new(DefaultSeccomp::default()),
            apparmor: Arc::new(DefaultAppArmor::default()),
            selinux: Arc::new(StaticSelinux),
        }
    }
}
