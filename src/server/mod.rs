//! The sandbox and container orchestrators
//!
//! A [Server] owns the shared registries and the adapters, and runs every
//! lifecycle operation as an independent task. Creation runs as a pipeline
//! of named stages; each stage registers undo actions for whatever it
//! acquires, and a failure unwinds everything acquired so far.

mod container_create;
mod container_ops;
mod restore;
mod sandbox_run;
mod sandbox_stop;
mod undo;

pub use restore::{RestoreReport, UnusableRecord};

use crate::{
    adapters::{
        CniNetwork, DefaultAppArmor, DefaultSeccomp, DirectoryStorage, HookAdapter,
        NetworkAdapter, NoHooks, NoWorkloadPolicy, OciRuntime, Policies, RuntimeAdapter,
        StaticSelinux, StorageAdapter, WorkloadPolicy,
    },
    config::ServerConfig,
    container::{Container, ContainerStatus},
    context::Context,
    errors::{ConfigError, ServerError},
    inflight::InFlightCache,
    lock::lock,
    namespace::{BindMountPinner, NamespaceManager, NamespacePinner},
    reservation::ReservationRegistry,
    sandbox::{Sandbox, SandboxStatus},
    spec::{persist, volumes::SecretMount, SpecDefaults, SpecDocument},
};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

/// Every live sandbox and container, by id
#[derive(Debug, Default)]
pub(crate) struct Index {
    sandboxes: Mutex<HashMap<String, Arc<Sandbox>>>,
    containers: Mutex<HashMap<String, Arc<Container>>>,
}

impl Index {
    pub(crate) fn sandbox(&self, id: &str) -> Option<Arc<Sandbox>> {
        lock(&self.sandboxes).get(id).cloned()
    }

    pub(crate) fn container(&self, id: &str) -> Option<Arc<Container>> {
        lock(&self.containers).get(id).cloned()
    }

    pub(crate) fn insert_sandbox(&self, sandbox: Arc<Sandbox>) {
        lock(&self.sandboxes).insert(sandbox.id.clone(), sandbox);
    }

    pub(crate) fn insert_container(&self, container: Arc<Container>) {
        lock(&self.containers).insert(container.id.clone(), container);
    }

    pub(crate) fn remove_sandbox(&self, id: &str) -> Option<Arc<Sandbox>> {
        lock(&self.sandboxes).remove(id)
    }

    pub(crate) fn remove_container(&self, id: &str) -> Option<Arc<Container>> {
        lock(&self.containers).remove(id)
    }

    fn sandboxes(&self) -> Vec<Arc<Sandbox>> {
        lock(&self.sandboxes).values().cloned().collect()
    }

    fn containers(&self) -> Vec<Arc<Container>> {
        lock(&self.containers).values().cloned().collect()
    }
}

/// Stage bookkeeping for one creation attempt
///
/// Entering a stage checks the calling context, records the stage in the
/// in-flight cache, and remembers it so errors can be annotated.
pub(crate) struct Progress<'a> {
    kind: &'static str,
    id: &'a str,
    name: &'a str,
    cache: &'a InFlightCache,
    ctx: &'a Context,
    stage: &'static str,
}

impl<'a> Progress<'a> {
    pub(crate) fn new(
        kind: &'static str,
        id: &'a str,
        name: &'a str,
        cache: &'a InFlightCache,
        ctx: &'a Context,
    ) -> Self {
        Progress {
            kind,
            id,
            name,
            cache,
            ctx,
            stage: "requested",
        }
    }

    pub(crate) fn enter(&mut self, stage: &'static str) -> Result<(), ServerError> {
        self.ctx.check().map_err(|err| err.at_stage(stage))?;
        self.mark(stage);
        Ok(())
    }

    /// Record a stage without checking the context, for bookkeeping that
    /// follows the last blocking call
    pub(crate) fn mark(&mut self, stage: &'static str) {
        self.stage = stage;
        self.cache.set_stage(self.name, stage);
        log::debug!("{} {} ({}): {}", self.kind, self.id, self.name, stage);
    }

    /// Annotate an error with the current stage
    pub(crate) fn fail<E: Into<ServerError>>(&self, err: E) -> ServerError {
        err.into().at_stage(self.stage)
    }
}

/// Cgroup for a sandbox or container under `parent`
pub(crate) fn cgroups_path(parent: &str, id: &str) -> String {
    match parent.trim_end_matches('/') {
        "" => format!("/podvisor/{}", id),
        parent => format!("{}/podvisor-{}", parent, id),
    }
}

/// Write the template and running copies of a spec
pub(crate) async fn persist_spec(
    spec: &SpecDocument,
    template_dir: PathBuf,
    run_dir: PathBuf,
) -> Result<(), ServerError> {
    let spec = spec.clone();
    tokio::task::spawn_blocking(move || persist::save_both(&spec, &template_dir, &run_dir)).await??;
    Ok(())
}

pub(crate) struct Inner {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) spec_defaults: SpecDefaults,
    pub(crate) secrets: Vec<SecretMount>,
    pub(crate) storage: Arc<dyn StorageAdapter>,
    pub(crate) network: Option<Arc<dyn NetworkAdapter>>,
    pub(crate) runtime: Arc<dyn RuntimeAdapter>,
    pub(crate) hooks: Arc<dyn HookAdapter>,
    pub(crate) workload: Arc<dyn WorkloadPolicy>,
    pub(crate) policies: Policies,
    pub(crate) namespaces: NamespaceManager,
    pub(crate) pod_names: Arc<ReservationRegistry>,
    pub(crate) container_names: Arc<ReservationRegistry>,
    pub(crate) pod_in_flight: InFlightCache,
    pub(crate) container_in_flight: InFlightCache,
    pub(crate) index: Arc<Index>,
}

/// Runs sandbox and container lifecycle operations
///
/// Clones share all state. Every operation may run concurrently with any
/// other.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

/// Builder for a [Server]
///
/// Adapters left unset get the bundled implementations, configured from the
/// [ServerConfig].
pub struct ServerBuilder {
    config: ServerConfig,
    storage: Option<Arc<dyn StorageAdapter>>,
    network: Option<Arc<dyn NetworkAdapter>>,
    no_network: bool,
    runtime: Option<Arc<dyn RuntimeAdapter>>,
    hooks: Option<Arc<dyn HookAdapter>>,
    workload: Option<Arc<dyn WorkloadPolicy>>,
    policies: Option<Policies>,
    pinner: Option<Arc<dyn NamespacePinner>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        ServerBuilder::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        ServerBuilder {
            config: ServerConfig::default(),
            storage: None,
            network: None,
            no_network: false,
            runtime: None,
            hooks: None,
            workload: None,
            policies: None,
            pinner: None,
        }
    }

    /// Construct a Server using the parameters from this Builder
    pub fn build(self) -> Result<Server, ConfigError> {
        let config = self.config;
        config.validate()?;
        let spec_defaults = config.spec_defaults()?;
        let secrets = config.secrets()?;

        let storage = match self.storage {
            Some(storage) => storage,
            None => Arc::new(DirectoryStorage::new(&config.root, &config.run_root)),
        };
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Arc::new(
                OciRuntime::new(&config.runtime_path).state_root(config.run_root.join("runtime")),
            ),
        };
        let network = match (self.network, &config.cni_plugin, &config.cni_config) {
            _ if self.no_network => None,
            (Some(network), _, _) => Some(network),
            (None, Some(plugin), Some(net_config)) => {
                Some(Arc::new(CniNetwork::new(plugin, net_config)) as Arc<dyn NetworkAdapter>)
            }
            (None, _, _) => {
                log::info!("no network adapter configured, sandboxes will not be attached");
                None
            }
        };
        let policies = self.policies.unwrap_or_else(|| Policies {
            seccomp: Arc::new(DefaultSeccomp {
                default_profile: config.seccomp_default_profile.clone(),
                profile_root: config.root.join("seccomp"),
            }),
            apparmor: Arc::new(DefaultAppArmor {
                default_profile: config.apparmor_default_profile.clone(),
            }),
            selinux: Arc::new(StaticSelinux),
        });
        let pinner = match self.pinner {
            Some(pinner) => pinner,
            None => Arc::new(BindMountPinner::new(&config.namespaces_dir)),
        };

        Ok(Server {
            inner: Arc::new(Inner {
                spec_defaults,
                secrets,
                storage,
                network,
                runtime,
                hooks: self.hooks.unwrap_or_else(|| Arc::new(NoHooks)),
                workload: self.workload.unwrap_or_else(|| Arc::new(NoWorkloadPolicy)),
                policies,
                namespaces: NamespaceManager::new(pinner),
                pod_names: Arc::new(ReservationRegistry::new()),
                container_names: Arc::new(ReservationRegistry::new()),
                pod_in_flight: InFlightCache::new("sandbox"),
                container_in_flight: InFlightCache::new("container"),
                index: Arc::new(Index::default()),
                config: Arc::new(config),
            }),
        })
    }

    /// Daemon configuration
    ///
    /// Defaults to [ServerConfig::default()].
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Root filesystem storage
    ///
    /// Defaults to a [DirectoryStorage] under the configured `root` and
    /// `run_root`.
    pub fn storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sandbox networking
    ///
    /// By default a [CniNetwork] is used if both `cni_plugin` and
    /// `cni_config` are configured, and sandboxes are not attached to any
    /// network otherwise.
    pub fn network(mut self, network: Arc<dyn NetworkAdapter>) -> Self {
        self.network = Some(network);
        self.no_network = false;
        self
    }

    /// Never attach sandboxes to a network, even if one is configured
    pub fn without_network(mut self) -> Self {
        self.network = None;
        self.no_network = true;
        self
    }

    /// The OCI runtime
    ///
    /// Defaults to an [OciRuntime] running the configured `runtime_path`.
    pub fn runtime(mut self, runtime: Arc<dyn RuntimeAdapter>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Extension hooks invoked around sandbox and container creation
    pub fn hooks(mut self, hooks: Arc<dyn HookAdapter>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn workload_policy(mut self, workload: Arc<dyn WorkloadPolicy>) -> Self {
        self.workload = Some(workload);
        self
    }

    /// Seccomp, AppArmor, and SELinux policy
    pub fn policies(mut self, policies: Policies) -> Self {
        self.policies = Some(policies);
        self
    }

    /// How owned namespaces are created
    ///
    /// Defaults to a [BindMountPinner] under `namespaces_dir`, which needs
    /// `CAP_SYS_ADMIN`.
    pub fn pinner(mut self, pinner: Arc<dyn NamespacePinner>) -> Self {
        self.pinner = Some(pinner);
        self
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn sandbox(&self, id: &str) -> Result<SandboxStatus, ServerError> {
        self.inner
            .index
            .sandbox(id)
            .map(|sandbox| sandbox.status())
            .ok_or_else(|| ServerError::SandboxNotFound(id.to_string()))
    }

    pub fn container(&self, id: &str) -> Result<ContainerStatus, ServerError> {
        self.inner
            .index
            .container(id)
            .map(|container| container.status())
            .ok_or_else(|| ServerError::ContainerNotFound(id.to_string()))
    }

    /// Every sandbox, oldest first
    pub fn list_sandboxes(&self) -> Vec<SandboxStatus> {
        let mut list: Vec<SandboxStatus> = self
            .inner
            .index
            .sandboxes()
            .iter()
            .map(|sandbox| sandbox.status())
            .collect();
        list.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Every container, or only those in one sandbox, oldest first
    pub fn list_containers(&self, sandbox_id: Option<&str>) -> Vec<ContainerStatus> {
        let mut list: Vec<ContainerStatus> = self
            .inner
            .index
            .containers()
            .iter()
            .filter(|container| match sandbox_id {
                Some(id) => container.sandbox_id == id,
                None => true,
            })
            .map(|container| container.status())
            .collect();
        list.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Tear down sandboxes preserved after a cancelled creation that no
    /// retry adopted in time
    ///
    /// Returns how many were reclaimed.
    pub async fn reap_abandoned(&self) -> usize {
        let abandoned = self
            .inner
            .pod_in_flight
            .take_abandoned(self.inner.config.abandoned_after());
        let count = abandoned.len();
        for (name, id, cleanup) in abandoned {
            log::info!("reclaiming abandoned sandbox {:?} ({})", name, id);
            let failures = cleanup.unwind().await;
            if !failures.is_empty() {
                log::warn!(
                    "{} cleanup steps failed while reclaiming sandbox {}",
                    failures.len(),
                    id
                );
            }
        }
        count
    }

    /// Number of creation attempts still in progress or awaiting adoption
    pub fn in_flight(&self) -> usize {
        self.inner.pod_in_flight.len() + self.inner.container_in_flight.len()
    }
}
