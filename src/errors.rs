//! Error types you might see while creating or tearing down sandboxes and
//! containers

use crate::namespace::NamespaceKind;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the name and id reservation registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    /// name is already reserved
    #[error("name {name:?} is already reserved for id {id}")]
    NameInUse { name: String, id: String },

    /// id is already reserved
    #[error("id {id} is already reserved for name {name:?}")]
    IdInUse { id: String, name: String },

    /// name is not reserved
    #[error("name {0:?} is not reserved")]
    NotFound(String),

    /// names and ids must not be empty
    #[error("names and ids must not be empty")]
    Empty,
}

/// Errors while selecting mount paths out of an artifact
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubPathError {
    /// no artifact path matches the sub path
    #[error("no artifact paths match sub path {0:?}")]
    NoMatch(String),

    /// sub path must stay inside the artifact
    #[error("sub path {0:?} must be relative and stay inside the artifact")]
    Escapes(String),
}

/// Errors found while assembling a runtime spec
#[derive(Error, Debug)]
pub enum SpecError {
    /// mount container path must not be empty
    #[error("mount container path must not be empty")]
    EmptyContainerPath,

    /// mount host path must not be empty
    #[error("mount host path for {0:?} must not be empty")]
    EmptyHostPath(String),

    /// recursive read-only mount conflicts with read-write mount
    #[error("recursive read-only mount conflicts with read-write mount for hostPath {0:?}")]
    RecursiveReadOnlyReadWrite(String),

    /// recursive read-only mount requires private propagation
    #[error("recursive read-only mount requires private propagation for hostPath {host_path:?}, got {propagation}")]
    RecursiveReadOnlyPropagation {
        host_path: String,
        propagation: String,
    },

    /// recursive read-only mount support is not available
    #[error("recursive read-only mount support is not available for hostPath {0:?}")]
    RecursiveReadOnlyUnsupported(String),

    /// idmap mounts are not supported by the OCI runtime
    #[error("idmap mounts specified for {0:?} but OCI runtime does not support them")]
    IdMapUnsupported(String),

    /// a protected mount source does not exist
    #[error("cannot mount {0:?}: path does not exist and will cause issues as a directory")]
    ProtectedSourceMissing(PathBuf),

    /// no mount point could be found for a path
    #[error("could not find the mount point of {0:?}")]
    MountPointMissing(PathBuf),

    /// bidirectional propagation requires a shared host mount
    #[error("path {path:?} is mounted on {mount_point:?} but it is not a shared mount")]
    NotShared {
        path: PathBuf,
        mount_point: PathBuf,
    },

    /// host-to-container propagation requires a shared or slave host mount
    #[error("path {path:?} is mounted on {mount_point:?} but it is not a shared or slave mount")]
    NotSharedOrSlave {
        path: PathBuf,
        mount_point: PathBuf,
    },

    /// too many nested symbolic links
    #[error("too many levels of symbolic links while resolving {0:?}")]
    SymlinkLoop(PathBuf),

    /// artifact mount sub path selection failed
    #[error("artifact mount at {container_path:?}: {source}")]
    ArtifactSubPath {
        container_path: String,
        #[source]
        source: SubPathError,
    },

    /// invalid umask string
    #[error("invalid umask string {0:?}")]
    InvalidUmask(String),

    /// memory limit is below the minimum
    #[error("memory limit {limit} is too low, should be at least {minimum} bytes")]
    MemoryLimitTooLow { limit: i64, minimum: i64 },

    /// unknown capability name
    #[error("unknown capability {0:?}")]
    UnknownCapability(String),

    /// path is not a device node
    #[error("{0:?} is not a device node")]
    NotADevice(PathBuf),

    /// filesystem error while preparing a path
    #[error("error preparing {path:?}: {source}")]
    IO {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
}

impl SpecError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SpecError::IO {
            path: path.into(),
            source,
        }
    }

    /// True for errors that reject the request itself rather than reporting a
    /// host problem
    pub fn is_validation(&self) -> bool {
        !matches!(self, SpecError::IO { .. } | SpecError::JSON(_))
    }
}

/// Errors from creating, joining, or releasing namespaces
#[derive(Error, Debug)]
pub enum NamespaceError {
    /// kernel refused to create a namespace
    #[error("failed to create {kind} namespace: {source}")]
    Create {
        kind: NamespaceKind,
        #[source]
        source: nix::Error,
    },

    /// failed to bind mount a namespace to its pin path
    #[error("failed to pin {kind} namespace at {path:?}: {source}")]
    Pin {
        kind: NamespaceKind,
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    /// failed to unmount a pinned namespace
    #[error("failed to unpin namespace at {path:?}: {source}")]
    Unpin {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    /// namespace kind can't be pinned
    #[error("{0} namespaces cannot be pinned")]
    Unsupported(NamespaceKind),

    /// namespace pinning thread panicked
    #[error("namespace pinning thread panicked")]
    PinThread,

    /// the namespace to join no longer exists
    #[error("{kind} namespace at {path:?} is closed")]
    Closed { kind: NamespaceKind, path: PathBuf },

    /// join target has no namespace of this kind
    #[error("sandbox {target} has no {kind} namespace to join")]
    NoTarget { kind: NamespaceKind, target: String },

    /// io error
    #[error("namespace io error: {0}")]
    IO(#[from] std::io::Error),

    /// task join error
    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Errors reported by an external collaborator
#[derive(Error, Debug)]
pub enum AdapterError {
    /// storage failure
    #[error("storage: {0}")]
    Storage(String),

    /// image not known to storage
    #[error("image {0:?} not found")]
    ImageNotFound(String),

    /// artifact not known to storage
    #[error("artifact {0:?} not found")]
    ArtifactNotFound(String),

    /// network failure
    #[error("network: {0}")]
    Network(String),

    /// runtime failure
    #[error("runtime: {0}")]
    Runtime(String),

    /// security policy failure
    #[error("policy: {0}")]
    Policy(String),

    /// extension hook failure
    #[error("hook: {0}")]
    Hook(String),

    /// workload policy failure
    #[error("workload policy: {0}")]
    Workload(String),

    /// a helper command exited unsuccessfully
    #[error("command {command:?} failed, {status}\n{stderr}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    /// io error
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),

    /// task join error
    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Errors in the daemon configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// ulimit setting could not be parsed
    #[error("invalid ulimit {0:?}, expected name=soft:hard")]
    InvalidUlimit(String),

    /// secret mount setting could not be parsed
    #[error("invalid secret mount {0:?}, expected host_path:container_path")]
    InvalidSecretMount(String),

    /// io error while loading configuration
    #[error("config io error: {0}")]
    IO(#[from] std::io::Error),

    /// json error while loading configuration
    #[error("config json error: {0}")]
    JSON(#[from] serde_json::Error),
}

/// Errors returned by the sandbox and container operations
#[derive(Error, Debug)]
pub enum ServerError {
    /// request is missing or has malformed fields
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// reservation conflict
    #[error("{0}")]
    Reservation(#[from] ReservationError),

    /// runtime spec could not be assembled
    #[error("{0}")]
    Spec(#[from] SpecError),

    /// namespace error
    #[error("{0}")]
    Namespace(#[from] NamespaceError),

    /// external adapter error
    #[error("{0}")]
    Adapter(#[from] AdapterError),

    /// configuration error
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// no sandbox with this id
    #[error("sandbox {0} not found")]
    SandboxNotFound(String),

    /// no container with this id
    #[error("container {0} not found")]
    ContainerNotFound(String),

    /// sandbox is stopping or stopped
    #[error("sandbox {0} is stopped or being stopped, refusing to create containers in it")]
    SandboxStopping(String),

    /// namespaces of a sandbox that is not ready cannot be joined
    #[error("sandbox {id} is {state}, its namespaces cannot be joined")]
    SandboxNotReady { id: String, state: String },

    /// container is not in a state that allows this operation
    #[error("container {id} is {state}, expected {expected}")]
    InvalidState {
        id: String,
        state: String,
        expected: &'static str,
    },

    /// another request is still creating this object
    #[error("{kind} {name:?} is still being created by an earlier request, currently at stage {stage:?}")]
    StillInFlight {
        kind: &'static str,
        name: String,
        stage: String,
    },

    /// the request we waited for failed
    #[error("earlier request creating {kind} {name:?} failed: {reason}")]
    InFlightFailed {
        kind: &'static str,
        name: String,
        reason: String,
    },

    /// a pipeline stage failed, everything before it was rolled back
    #[error("failed while {stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<ServerError>,
    },

    /// calling context was cancelled
    #[error("context cancelled")]
    Cancelled,

    /// calling context deadline was exceeded
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// persisted state could not be trusted
    #[error("unusable persisted state at {path:?}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    /// io error
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),

    /// task join error
    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl ServerError {
    /// Attach the failing pipeline stage to an error
    pub fn at_stage(self, stage: &'static str) -> Self {
        match self {
            ServerError::Stage { .. } => self,
            other => ServerError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, without stage annotations
    pub fn root(&self) -> &ServerError {
        match self {
            ServerError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Stage name, for errors from a creation pipeline
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            ServerError::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Cancellation or deadline expiry of the calling context
    pub fn is_context_error(&self) -> bool {
        matches!(
            self.root(),
            ServerError::Cancelled | ServerError::DeadlineExceeded
        )
    }

    /// Rejected before any resource was acquired
    pub fn is_validation(&self) -> bool {
        match self.root() {
            ServerError::InvalidRequest(_) | ServerError::Config(_) => true,
            ServerError::Spec(err) => err.is_validation(),
            _ => false,
        }
    }

    /// Rejected because of another object or request with the same identity
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.root(),
            ServerError::Reservation(ReservationError::NameInUse { .. })
                | ServerError::Reservation(ReservationError::IdInUse { .. })
                | ServerError::SandboxStopping(_)
                | ServerError::StillInFlight { .. }
        )
    }
}
