use crate::{
    errors::SpecError,
    namespace::NamespaceKind,
    request::{CapabilityChanges, Resources},
    spec::{
        mounts::{clean_path, default_mounts, filter_default_mounts, sort_by_depth, Volume},
        Capabilities, CpuResources, DeviceRule, LinuxDevice, LinuxNamespace, LinuxResources,
        MemoryResources, Mount, PidsResources, Rlimit, SpecDocument, OCI_VERSION,
    },
};
use std::{
    collections::{BTreeMap, HashSet},
    path::PathBuf,
};

lazy_static! {
    static ref KNOWN_CAPABILITIES: HashSet<&'static str> = [
        "CAP_AUDIT_CONTROL",
        "CAP_AUDIT_READ",
        "CAP_AUDIT_WRITE",
        "CAP_BLOCK_SUSPEND",
        "CAP_BPF",
        "CAP_CHECKPOINT_RESTORE",
        "CAP_CHOWN",
        "CAP_DAC_OVERRIDE",
        "CAP_DAC_READ_SEARCH",
        "CAP_FOWNER",
        "CAP_FSETID",
        "CAP_IPC_LOCK",
        "CAP_IPC_OWNER",
        "CAP_KILL",
        "CAP_LEASE",
        "CAP_LINUX_IMMUTABLE",
        "CAP_MAC_ADMIN",
        "CAP_MAC_OVERRIDE",
        "CAP_MKNOD",
        "CAP_NET_ADMIN",
        "CAP_NET_BIND_SERVICE",
        "CAP_NET_BROADCAST",
        "CAP_NET_RAW",
        "CAP_PERFMON",
        "CAP_SETFCAP",
        "CAP_SETGID",
        "CAP_SETPCAP",
        "CAP_SETUID",
        "CAP_SYSLOG",
        "CAP_SYS_ADMIN",
        "CAP_SYS_BOOT",
        "CAP_SYS_CHROOT",
        "CAP_SYS_MODULE",
        "CAP_SYS_NICE",
        "CAP_SYS_PACCT",
        "CAP_SYS_PTRACE",
        "CAP_SYS_RAWIO",
        "CAP_SYS_RESOURCE",
        "CAP_SYS_TIME",
        "CAP_SYS_TTY_CONFIG",
        "CAP_WAKE_ALARM",
    ]
    .iter()
    .copied()
    .collect();
}

/// Canonical `CAP_` form of a capability name
pub fn normalize_capability(name: &str) -> Result<String, SpecError> {
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{}", upper)
    };
    if KNOWN_CAPABILITIES.contains(full.as_str()) {
        Ok(full)
    } else {
        Err(SpecError::UnknownCapability(name.to_string()))
    }
}

/// Daemon-wide defaults applied to every spec before request settings
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpecDefaults {
    pub env: Vec<String>,
    pub rlimits: Vec<Rlimit>,
    pub capabilities: Vec<String>,
    pub sysctls: BTreeMap<String, String>,
}

/// Accumulates a runtime spec
///
/// Default mounts are kept apart from everything else until
/// [finalize](SpecBuilder::finalize), where the ones replaced by other
/// mounts are dropped and the whole list is put in depth order.
#[derive(Clone, Debug)]
pub struct SpecBuilder {
    spec: SpecDocument,
    default_mounts: Vec<Mount>,
    mounts: Vec<Mount>,
    volumes: Vec<Volume>,
}

impl Default for SpecBuilder {
    fn default() -> Self {
        SpecBuilder::new()
    }
}

impl SpecBuilder {
    pub fn new() -> Self {
        let mut spec = SpecDocument::default();
        spec.oci_version = OCI_VERSION.to_string();
        spec.process.cwd = "/".to_string();
        spec.linux.masked_paths = [
            "/proc/acpi",
            "/proc/kcore",
            "/proc/keys",
            "/proc/latency_stats",
            "/proc/timer_list",
            "/proc/timer_stats",
            "/proc/sched_debug",
            "/proc/scsi",
            "/sys/firmware",
        ]
        .iter()
        .map(|path| path.to_string())
        .collect();
        spec.linux.readonly_paths = [
            "/proc/asound",
            "/proc/bus",
            "/proc/fs",
            "/proc/irq",
            "/proc/sys",
            "/proc/sysrq-trigger",
        ]
        .iter()
        .map(|path| path.to_string())
        .collect();
        SpecBuilder {
            spec,
            default_mounts: default_mounts(),
            mounts: Vec::new(),
            volumes: Vec::new(),
        }
    }

    /// A builder seeded with daemon defaults
    pub fn with_defaults(defaults: &SpecDefaults) -> Self {
        let mut builder = SpecBuilder::new();
        for entry in &defaults.env {
            if let Some((key, value)) = entry.split_once('=') {
                builder.env(key, value);
            }
        }
        builder.spec.process.rlimits = defaults.rlimits.clone();
        builder.spec.process.capabilities =
            Some(Capabilities::uniform(defaults.capabilities.clone()));
        builder.spec.linux.sysctl = defaults.sysctls.clone();
        builder
    }

    pub fn spec(&self) -> &SpecDocument {
        &self.spec
    }

    pub fn hostname(&mut self, hostname: &str) -> &mut Self {
        self.spec.hostname = hostname.to_string();
        self
    }

    pub fn args(&mut self, args: Vec<String>) -> &mut Self {
        self.spec.process.args = args;
        self
    }

    /// Set one environment variable, replacing an earlier value
    pub fn env(&mut self, key: &str, value: &str) -> &mut Self {
        let prefix = format!("{}=", key);
        let entry = format!("{}{}", prefix, value);
        match self
            .spec
            .process
            .env
            .iter_mut()
            .find(|existing| existing.starts_with(&prefix))
        {
            Some(existing) => *existing = entry,
            None => self.spec.process.env.push(entry),
        }
        self
    }

    pub fn cwd(&mut self, cwd: &str) -> &mut Self {
        if !cwd.is_empty() {
            self.spec.process.cwd = cwd.to_string();
        }
        self
    }

    pub fn user(&mut self, uid: u32, gid: u32, additional_gids: Vec<u32>) -> &mut Self {
        let user = &mut self.spec.process.user;
        user.uid = uid;
        user.gid = gid;
        user.additional_gids = additional_gids;
        self
    }

    pub fn umask(&mut self, umask: Option<u32>) -> &mut Self {
        self.spec.process.user.umask = umask;
        self
    }

    pub fn terminal(&mut self, terminal: bool) -> &mut Self {
        self.spec.process.terminal = terminal;
        self
    }

    pub fn root(&mut self, path: &str, readonly: bool) -> &mut Self {
        self.spec.root.path = path.to_string();
        self.spec.root.readonly = readonly;
        self
    }

    /// Apply capability changes on top of the current set
    ///
    /// `ALL` in the add list grants every known capability, `ALL` in the
    /// drop list clears the set before adds are applied. Privileged
    /// containers get everything.
    pub fn capabilities(
        &mut self,
        changes: &CapabilityChanges,
        privileged: bool,
    ) -> Result<&mut Self, SpecError> {
        let all = || {
            let mut caps: Vec<String> = KNOWN_CAPABILITIES.iter().map(|c| c.to_string()).collect();
            caps.sort();
            caps
        };
        let caps = if privileged {
            all()
        } else {
            let mut caps = self
                .spec
                .process
                .capabilities
                .as_ref()
                .map(|caps| caps.bounding.clone())
                .unwrap_or_default();
            let is_all = |name: &String| name.eq_ignore_ascii_case("ALL");
            if changes.drop.iter().any(is_all) {
                caps.clear();
            } else {
                for name in &changes.drop {
                    let name = normalize_capability(name)?;
                    caps.retain(|existing| *existing != name);
                }
            }
            if changes.add.iter().any(is_all) {
                caps = all();
            } else {
                for name in &changes.add {
                    let name = normalize_capability(name)?;
                    if !caps.contains(&name) {
                        caps.push(name);
                    }
                }
            }
            caps
        };
        self.spec.process.capabilities = Some(Capabilities::uniform(caps));
        Ok(self)
    }

    pub fn no_new_privileges(&mut self, enabled: bool) -> &mut Self {
        self.spec.process.no_new_privileges = enabled;
        self
    }

    /// Privileged containers see the host's /proc and /sys unmasked
    pub fn privileged(&mut self) -> &mut Self {
        self.spec.linux.masked_paths.clear();
        self.spec.linux.readonly_paths.clear();
        self
    }

    pub fn masked_paths(&mut self, paths: Vec<String>) -> &mut Self {
        self.spec.linux.masked_paths = paths;
        self
    }

    pub fn readonly_paths(&mut self, paths: Vec<String>) -> &mut Self {
        self.spec.linux.readonly_paths = paths;
        self
    }

    pub fn apparmor_profile(&mut self, profile: Option<String>) -> &mut Self {
        self.spec.process.apparmor_profile = profile;
        self
    }

    pub fn selinux_labels(&mut self, process: Option<String>, mount: Option<String>) -> &mut Self {
        self.spec.process.selinux_label = process;
        self.spec.linux.mount_label = mount;
        self
    }

    pub fn seccomp(&mut self, profile: Option<serde_json::Value>) -> &mut Self {
        self.spec.linux.seccomp = profile;
        self
    }

    pub fn cgroups_path(&mut self, path: &str) -> &mut Self {
        self.spec.linux.cgroups_path = path.to_string();
        self
    }

    pub fn sysctl(&mut self, key: &str, value: &str) -> &mut Self {
        self.spec
            .linux
            .sysctl
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn rootfs_propagation(&mut self, propagation: &str) -> &mut Self {
        self.spec.linux.rootfs_propagation = Some(propagation.to_string());
        self
    }

    /// Join the namespace at `path`, or ask the runtime for a new one
    pub fn add_namespace(&mut self, kind: NamespaceKind, path: Option<PathBuf>) -> &mut Self {
        self.remove_namespace(kind);
        self.spec.linux.namespaces.push(LinuxNamespace {
            kind: kind.spec_type().to_string(),
            path: path.map(|path| path.to_string_lossy().into_owned()),
        });
        self
    }

    pub fn remove_namespace(&mut self, kind: NamespaceKind) -> &mut Self {
        self.spec
            .linux
            .namespaces
            .retain(|ns| ns.kind != kind.spec_type());
        self
    }

    /// Add a mount, replacing any earlier non-default mount at the same
    /// destination
    pub fn add_mount(&mut self, mut mount: Mount) -> &mut Self {
        mount.destination = clean_path(&mount.destination);
        self.mounts
            .retain(|existing| existing.destination != mount.destination);
        self.mounts.push(mount);
        self
    }

    pub fn has_mount(&self, destination: &str) -> bool {
        let destination = clean_path(destination);
        self.mounts.iter().any(|m| m.destination == destination)
    }

    pub fn add_volume(&mut self, volume: Volume) -> &mut Self {
        self.volumes.push(volume);
        self
    }

    pub fn add_device(&mut self, device: LinuxDevice, rule: DeviceRule) -> &mut Self {
        self.spec.linux.devices.retain(|d| d.path != device.path);
        self.spec.linux.devices.push(device);
        self.resources_mut().devices.push(rule);
        self
    }

    pub fn resources(&mut self, resources: &Resources) -> &mut Self {
        if resources.cpu_shares.is_some()
            || resources.cpu_quota.is_some()
            || resources.cpu_period.is_some()
            || resources.cpuset_cpus.is_some()
            || resources.cpuset_mems.is_some()
        {
            self.resources_mut().cpu = Some(CpuResources {
                shares: resources.cpu_shares,
                quota: resources.cpu_quota,
                period: resources.cpu_period,
                cpus: resources.cpuset_cpus.clone(),
                mems: resources.cpuset_mems.clone(),
            });
        }
        if let Some(limit) = resources.memory_limit {
            self.resources_mut().memory = Some(MemoryResources {
                limit: Some(limit),
                swap: None,
            });
        }
        if let Some(limit) = resources.pids_limit {
            self.resources_mut().pids = Some(PidsResources { limit });
        }
        if resources.oom_score_adj.is_some() {
            self.spec.process.oom_score_adj = resources.oom_score_adj;
        }
        self
    }

    fn resources_mut(&mut self) -> &mut LinuxResources {
        self.spec
            .linux
            .resources
            .get_or_insert_with(LinuxResources::default)
    }

    pub fn annotation(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.spec.annotations.insert(key.to_string(), value.into());
        self
    }

    pub fn annotations<'a, I>(&mut self, entries: I) -> &mut Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in entries {
            self.spec.annotations.insert(key.clone(), value.clone());
        }
        self
    }

    /// The finished spec and the volumes it mounts
    pub fn finalize(self) -> (SpecDocument, Vec<Volume>) {
        let SpecBuilder {
            mut spec,
            default_mounts,
            mounts,
            volumes,
        } = self;
        let user_destinations: HashSet<String> =
            mounts.iter().map(|m| m.destination.clone()).collect();
        let mut all = filter_default_mounts(default_mounts, &user_destinations);
        all.extend(mounts);
        sort_by_depth(&mut all);
        spec.mounts = all;
        (spec, volumes)
    }
}
