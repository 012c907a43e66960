//! Creation requests for sandboxes and containers
//!
//! Requests are validated once, before any resource is acquired, and are
//! never modified afterward.

use crate::{
    errors::{ServerError, SpecError},
    namespace::NamespaceOptions,
    spec::{mounts::validate_recursive_read_only, IdMapping},
};
use std::{collections::BTreeMap, fmt, path::PathBuf};

/// Smallest memory limit a container may ask for
pub const MIN_MEMORY_LIMIT: i64 = 12 * 1024 * 1024;

/// Identity of a sandbox or container as the client knows it
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub name: String,
    pub uid: String,
    pub namespace: String,
    pub attempt: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub servers: Vec<String>,
    pub searches: Vec<String>,
    pub options: Vec<String>,
}

impl DnsConfig {
    /// Contents of a resolv.conf file
    pub fn to_resolv_conf(&self) -> String {
        let mut contents = String::new();
        if !self.searches.is_empty() {
            contents.push_str(&format!("search {}\n", self.searches.join(" ")));
        }
        for server in &self.servers {
            contents.push_str(&format!("nameserver {}\n", server));
        }
        if !self.options.is_empty() {
            contents.push_str(&format!("options {}\n", self.options.join(" ")));
        }
        contents
    }
}

/// Reference to a seccomp or AppArmor profile
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProfile {
    RuntimeDefault,
    Unconfined,
    Localhost(String),
}

impl Default for SecurityProfile {
    fn default() -> Self {
        SecurityProfile::RuntimeDefault
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelinuxOptions {
    pub user: String,
    pub role: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub level: String,
}

impl SelinuxOptions {
    pub fn label(&self) -> String {
        format!("{}:{}:{}:{}", self.user, self.role, self.kind, self.level)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityChanges {
    pub add: Vec<String>,
    pub drop: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityContext {
    pub privileged: bool,
    pub run_as_user: Option<u32>,
    pub run_as_group: Option<u32>,
    pub supplemental_groups: Vec<u32>,
    pub readonly_rootfs: bool,
    pub no_new_privileges: bool,
    pub capabilities: CapabilityChanges,
    pub seccomp: SecurityProfile,
    pub apparmor: SecurityProfile,
    pub selinux: Option<SelinuxOptions>,
    pub masked_paths: Option<Vec<String>>,
    pub readonly_paths: Option<Vec<String>>,
    pub umask: Option<String>,
}

impl SecurityContext {
    /// Parse the octal umask string, if one was given
    pub fn umask_value(&self) -> Result<Option<u32>, SpecError> {
        match &self.umask {
            None => Ok(None),
            Some(text) => match u32::from_str_radix(text, 8) {
                Ok(value) if value <= 0o777 => Ok(Some(value)),
                _ => Err(SpecError::InvalidUmask(text.clone())),
            },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpu_shares: Option<u64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<u64>,
    pub cpuset_cpus: Option<String>,
    pub cpuset_mems: Option<String>,
    pub memory_limit: Option<i64>,
    pub pids_limit: Option<i64>,
    pub oom_score_adj: Option<i32>,
}

impl Resources {
    pub fn validate(&self) -> Result<(), SpecError> {
        match self.memory_limit {
            Some(limit) if limit != 0 && limit < MIN_MEMORY_LIMIT => {
                Err(SpecError::MemoryLimitTooLow {
                    limit,
                    minimum: MIN_MEMORY_LIMIT,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Mount propagation between host and container
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Propagation {
    Private,
    HostToContainer,
    Bidirectional,
}

impl Default for Propagation {
    fn default() -> Self {
        Propagation::Private
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Propagation::Private => "PROPAGATION_PRIVATE",
            Propagation::HostToContainer => "PROPAGATION_HOST_TO_CONTAINER",
            Propagation::Bidirectional => "PROPAGATION_BIDIRECTIONAL",
        })
    }
}

/// Mount an artifact's files instead of a host path
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactMount {
    pub reference: String,
    pub sub_path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountRequest {
    pub container_path: String,
    pub host_path: String,
    pub readonly: bool,
    pub recursive_read_only: bool,
    pub propagation: Propagation,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
    pub artifact: Option<ArtifactMount>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceRequest {
    pub container_path: String,
    pub host_path: String,
    pub permissions: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

fn standard_namespaces() -> NamespaceOptions {
    NamespaceOptions::standard()
}

/// Request to create and start a sandbox
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxRequest {
    pub metadata: Metadata,
    pub hostname: String,
    pub log_directory: Option<PathBuf>,
    pub dns: Option<DnsConfig>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub cgroup_parent: String,
    pub sysctls: BTreeMap<String, String>,
    #[serde(default = "standard_namespaces")]
    pub namespaces: NamespaceOptions,
    pub security: SecurityContext,
    pub resources: Resources,
}

impl Default for SandboxRequest {
    fn default() -> Self {
        SandboxRequest {
            metadata: Default::default(),
            hostname: String::new(),
            log_directory: None,
            dns: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            cgroup_parent: String::new(),
            sysctls: BTreeMap::new(),
            namespaces: NamespaceOptions::standard(),
            security: Default::default(),
            resources: Default::default(),
        }
    }
}

impl SandboxRequest {
    /// Reservation name, unique per sandbox identity and attempt
    pub fn sandbox_name(&self) -> String {
        format!(
            "k8s_POD_{}_{}_{}_{}",
            self.metadata.name, self.metadata.namespace, self.metadata.uid, self.metadata.attempt
        )
    }

    /// Reservation name of the sandbox's infra container
    pub fn infra_name(&self) -> String {
        format!(
            "k8s_infra_{}_{}_{}_{}",
            self.metadata.name, self.metadata.namespace, self.metadata.uid, self.metadata.attempt
        )
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.metadata.name.is_empty() {
            return Err(ServerError::InvalidRequest(
                "sandbox metadata name should not be empty".to_string(),
            ));
        }
        if self.metadata.namespace.is_empty() {
            return Err(ServerError::InvalidRequest(
                "sandbox metadata namespace should not be empty".to_string(),
            ));
        }
        if self.metadata.uid.is_empty() {
            return Err(ServerError::InvalidRequest(
                "sandbox metadata uid should not be empty".to_string(),
            ));
        }
        if let Some(dir) = &self.log_directory {
            if !dir.is_absolute() {
                return Err(ServerError::InvalidRequest(format!(
                    "sandbox log directory {:?} is not absolute",
                    dir
                )));
            }
        }
        self.security.umask_value()?;
        self.resources.validate()?;
        Ok(())
    }
}

/// Request to create a container inside a running sandbox
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerRequest {
    pub metadata: Metadata,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub working_dir: String,
    pub env: Vec<EnvVar>,
    pub mounts: Vec<MountRequest>,
    pub devices: Vec<DeviceRequest>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub tty: bool,
    /// PID and user namespace choices; the sandbox's when absent
    pub namespaces: Option<NamespaceOptions>,
    pub security: SecurityContext,
    pub resources: Resources,
    /// Restoring from a checkpoint: missing bind mount sources are not
    /// created
    pub restoring: bool,
}

impl ContainerRequest {
    /// Reservation name, unique per container identity within a sandbox
    pub fn container_name(&self, sandbox: &Metadata) -> String {
        format!(
            "k8s_{}_{}_{}_{}_{}",
            self.metadata.name, sandbox.name, sandbox.namespace, sandbox.uid, self.metadata.attempt
        )
    }

    pub fn validate(&self, rro_supported: bool) -> Result<(), ServerError> {
        if self.metadata.name.is_empty() {
            return Err(ServerError::InvalidRequest(
                "container metadata name should not be empty".to_string(),
            ));
        }
        if self.image.is_empty() {
            return Err(ServerError::InvalidRequest(
                "container image should not be empty".to_string(),
            ));
        }
        for mount in &self.mounts {
            if mount.container_path.is_empty() {
                return Err(SpecError::EmptyContainerPath.into());
            }
            if mount.artifact.is_none() && mount.host_path.is_empty() {
                return Err(SpecError::EmptyHostPath(mount.container_path.clone()).into());
            }
            validate_recursive_read_only(mount, rro_supported)?;
        }
        for device in &self.devices {
            if device.host_path.is_empty() {
                return Err(ServerError::InvalidRequest(
                    "device host path should not be empty".to_string(),
                ));
            }
        }
        self.security.umask_value()?;
        self.resources.validate()?;
        Ok(())
    }
}
