//! Containers: one workload process inside a sandbox

use crate::{
    adapters::{ImageInfo, StorageInfo},
    lock::lock,
    request::Metadata,
    spec::{mounts::Volume, SpecDocument},
};
use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
        })
    }
}

#[derive(Debug)]
struct ContainerInner {
    state: ContainerState,
    pid: Option<u32>,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub sandbox_id: String,
    pub metadata: Metadata,
    pub image: ImageInfo,
    /// the finalized spec, as persisted
    pub spec: SpecDocument,
    pub mount_point: PathBuf,
    pub storage: StorageInfo,
    pub volumes: Vec<Volume>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created: DateTime<Utc>,
    inner: Mutex<ContainerInner>,
}

/// Snapshot of a container for status queries
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContainerStatus {
    pub id: String,
    pub name: String,
    pub sandbox_id: String,
    pub metadata: Metadata,
    pub image: String,
    pub image_id: String,
    pub state: ContainerState,
    pub pid: Option<u32>,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub mount_point: PathBuf,
    pub volumes: Vec<Volume>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Everything needed to make a [Container]
#[derive(Clone, Debug)]
pub struct ContainerParts {
    pub id: String,
    pub name: String,
    pub sandbox_id: String,
    pub metadata: Metadata,
    pub image: ImageInfo,
    pub spec: SpecDocument,
    pub mount_point: PathBuf,
    pub storage: StorageInfo,
    pub volumes: Vec<Volume>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created: DateTime<Utc>,
}

impl Container {
    pub fn new(parts: ContainerParts, state: ContainerState, pid: Option<u32>) -> Self {
        Container {
            id: parts.id,
            name: parts.name,
            sandbox_id: parts.sandbox_id,
            metadata: parts.metadata,
            image: parts.image,
            spec: parts.spec,
            mount_point: parts.mount_point,
            storage: parts.storage,
            volumes: parts.volumes,
            labels: parts.labels,
            annotations: parts.annotations,
            created: parts.created,
            inner: Mutex::new(ContainerInner {
                state,
                pid,
                started: None,
                finished: None,
            }),
        }
    }

    pub fn state(&self) -> ContainerState {
        lock(&self.inner).state
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.inner).pid
    }

    pub fn set_running(&self) {
        let mut inner = lock(&self.inner);
        inner.state = ContainerState::Running;
        inner.started = Some(Utc::now());
    }

    /// Record that the process is gone; the first call sets the finish time
    pub fn set_stopped(&self) {
        let mut inner = lock(&self.inner);
        if inner.state != ContainerState::Stopped {
            inner.state = ContainerState::Stopped;
            inner.finished = Some(Utc::now());
        }
        inner.pid = None;
    }

    pub fn status(&self) -> ContainerStatus {
        let inner = lock(&self.inner);
        ContainerStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            sandbox_id: self.sandbox_id.clone(),
            metadata: self.metadata.clone(),
            image: self.image.reference.clone(),
            image_id: self.image.id.clone(),
            state: inner.state,
            pid: inner.pid,
            created: self.created,
            started: inner.started,
            finished: inner.finished,
            mount_point: self.mount_point.clone(),
            volumes: self.volumes.clone(),
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
        }
    }
}
