#![allow(dead_code)]

//! Recording adapters for driving a [Server] without a kernel, a runtime,
//! or a network

use async_trait::async_trait;
use podvisor::{
    adapters::{
        ArtifactInfo, HookAdapter, ImageConfig, ImageInfo, NetworkAdapter, NetworkResult,
        ProcessState, ProcessStatus, RootfsRequest, RuntimeAdapter, StorageAdapter, StorageInfo,
        StoredEntry,
    },
    errors::{AdapterError, NamespaceError},
    namespace::{NamespaceKind, NamespacePinner},
    request::Metadata,
    spec::{persist::SPEC_FILE, SpecDocument},
    ContainerRequest, Context, SandboxRequest, Server, ServerConfig,
};
use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tempfile::TempDir;

/// Everything the fakes did, in order, as "<adapter>.<call> <id>"
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.all().iter().filter(|event| event.starts_with(prefix)).count()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.all().iter().any(|recorded| recorded == event)
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Calls that should fail, by "<adapter>.<call>"
#[derive(Clone, Default)]
pub struct Failures(Arc<Mutex<HashSet<String>>>);

impl Failures {
    pub fn set(&self, call: &str) {
        self.0.lock().unwrap().insert(call.to_string());
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    fn check<F: FnOnce(String) -> AdapterError>(&self, call: &str, err: F) -> Result<(), AdapterError> {
        if self.0.lock().unwrap().contains(call) {
            Err(err(format!("injected failure in {}", call)))
        } else {
            Ok(())
        }
    }
}

pub struct FakeStorage {
    root: PathBuf,
    events: Events,
    failures: Failures,
    entries: Mutex<HashMap<String, StoredEntry>>,
    mounted: Mutex<HashSet<String>>,
    images: Mutex<HashMap<String, ImageInfo>>,
    artifacts: Mutex<HashMap<String, ArtifactInfo>>,
    pub rootfs_delay: Mutex<Option<Duration>>,
}

impl FakeStorage {
    fn new(root: &Path, events: Events, failures: Failures) -> Self {
        let mut images = HashMap::new();
        images.insert(
            "busybox".to_string(),
            ImageInfo {
                id: "sha256:busybox".to_string(),
                reference: "busybox".to_string(),
                config: ImageConfig {
                    cmd: vec!["sh".to_string()],
                    env: vec!["PATH=/bin".to_string()],
                    stop_signal: "SIGTERM".to_string(),
                    ..Default::default()
                },
            },
        );
        FakeStorage {
            root: root.to_path_buf(),
            events,
            failures,
            entries: Mutex::new(HashMap::new()),
            mounted: Mutex::new(HashSet::new()),
            images: Mutex::new(images),
            artifacts: Mutex::new(HashMap::new()),
            rootfs_delay: Mutex::new(None),
        }
    }

    pub fn add_image(&self, image: ImageInfo) {
        self.images.lock().unwrap().insert(image.reference.clone(), image);
    }

    pub fn add_artifact(&self, artifact: ArtifactInfo) {
        self.artifacts
            .lock()
            .unwrap()
            .insert(artifact.reference.clone(), artifact);
    }

    pub fn has(&self, id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(id)
    }

    pub fn is_mounted(&self, id: &str) -> bool {
        self.mounted.lock().unwrap().contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn mount_point(&self, id: &str) -> PathBuf {
        self.root.join("rootfs").join(id)
    }

    fn create(&self, request: &RootfsRequest, sandbox_id: &str) -> Result<StorageInfo, AdapterError> {
        let info = StorageInfo {
            dir: self.root.join("storage").join(&request.id),
            run_dir: self.root.join("run").join(&request.id),
            mount_label: None,
            process_label: None,
        };
        for dir in [&info.dir, &info.run_dir, &self.mount_point(&request.id)].iter() {
            fs::create_dir_all(dir).map_err(|err| AdapterError::Storage(err.to_string()))?;
        }
        self.entries.lock().unwrap().insert(
            request.id.clone(),
            StoredEntry {
                id: request.id.clone(),
                name: request.name.clone(),
                sandbox_id: sandbox_id.to_string(),
                info: info.clone(),
            },
        );
        Ok(info)
    }
}

#[async_trait]
impl StorageAdapter for FakeStorage {
    async fn create_sandbox_rootfs(&self, request: &RootfsRequest) -> Result<StorageInfo, AdapterError> {
        self.events.push(format!("storage.create_sandbox {}", request.id));
        let delay = *self.rootfs_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.failures.check("storage.create_sandbox", AdapterError::Storage)?;
        self.create(request, &request.id)
    }

    async fn resolve_image(&self, reference: &str) -> Result<ImageInfo, AdapterError> {
        self.images
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| AdapterError::ImageNotFound(reference.to_string()))
    }

    async fn create_container_rootfs(
        &self,
        request: &RootfsRequest,
        _image: &ImageInfo,
    ) -> Result<StorageInfo, AdapterError> {
        self.events.push(format!("storage.create_container {}", request.id));
        self.failures.check("storage.create_container", AdapterError::Storage)?;
        self.create(request, &request.sandbox_id)
    }

    async fn start(&self, id: &str) -> Result<PathBuf, AdapterError> {
        self.events.push(format!("storage.start {}", id));
        self.failures.check("storage.start", AdapterError::Storage)?;
        self.mounted.lock().unwrap().insert(id.to_string());
        Ok(self.mount_point(id))
    }

    async fn stop(&self, id: &str) -> Result<(), AdapterError> {
        self.events.push(format!("storage.stop {}", id));
        self.mounted.lock().unwrap().remove(id);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), AdapterError> {
        self.events.push(format!("storage.delete {}", id));
        if let Some(entry) = self.entries.lock().unwrap().remove(id) {
            let _ = fs::remove_dir_all(&entry.info.dir);
            let _ = fs::remove_dir_all(&entry.info.run_dir);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredEntry>, AdapterError> {
        let mut entries: Vec<StoredEntry> = self.entries.lock().unwrap().values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn artifact(&self, reference: &str) -> Result<ArtifactInfo, AdapterError> {
        self.artifacts
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| AdapterError::ArtifactNotFound(reference.to_string()))
    }
}

pub struct FakeRuntime {
    events: Events,
    failures: Failures,
    next_pid: AtomicU32,
    processes: Mutex<HashMap<String, ProcessState>>,
    pub stop_delay: Mutex<Option<Duration>>,
    stopping: AtomicUsize,
    /// most stop calls ever in progress at once
    pub peak_stops: AtomicUsize,
}

impl FakeRuntime {
    fn new(events: Events, failures: Failures) -> Self {
        FakeRuntime {
            events,
            failures,
            next_pid: AtomicU32::new(1000),
            processes: Mutex::new(HashMap::new()),
            stop_delay: Mutex::new(None),
            stopping: AtomicUsize::new(0),
            peak_stops: AtomicUsize::new(0),
        }
    }

    pub fn status(&self, id: &str) -> Option<ProcessStatus> {
        self.processes.lock().unwrap().get(id).map(|process| process.status)
    }

    pub fn len(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    /// Forget every process, like a host reboot would
    pub fn reset(&self) {
        self.processes.lock().unwrap().clear();
    }
}

#[async_trait]
impl RuntimeAdapter for FakeRuntime {
    async fn create_process(&self, id: &str, bundle: &Path) -> Result<u32, AdapterError> {
        self.events.push(format!("runtime.create {}", id));
        self.failures.check("runtime.create", AdapterError::Runtime)?;
        if !bundle.join(SPEC_FILE).exists() {
            return Err(AdapterError::Runtime(format!("no spec in bundle {:?}", bundle)));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.processes.lock().unwrap().insert(
            id.to_string(),
            ProcessState {
                status: ProcessStatus::Created,
                pid: Some(pid),
            },
        );
        Ok(pid)
    }

    async fn start(&self, id: &str) -> Result<(), AdapterError> {
        self.events.push(format!("runtime.start {}", id));
        self.failures.check("runtime.start", AdapterError::Runtime)?;
        match self.processes.lock().unwrap().get_mut(id) {
            Some(process) => {
                process.status = ProcessStatus::Running;
                Ok(())
            }
            None => Err(AdapterError::Runtime(format!("no process {}", id))),
        }
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<(), AdapterError> {
        self.events.push(format!("runtime.stop {}", id));
        let delay = *self.stop_delay.lock().unwrap();
        let running = self.stopping.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_stops.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.stopping.fetch_sub(1, Ordering::SeqCst);
        // "runtime.halted" marks a stop call returning
        self.events.push(format!("runtime.halted {}", id));
        self.failures.check("runtime.stop", AdapterError::Runtime)?;
        self.failures
            .check(&format!("runtime.stop {}", id), AdapterError::Runtime)?;
        if let Some(process) = self.processes.lock().unwrap().get_mut(id) {
            process.status = ProcessStatus::Stopped;
            process.pid = None;
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), AdapterError> {
        self.events.push(format!("runtime.delete {}", id));
        self.processes.lock().unwrap().remove(id);
        Ok(())
    }

    async fn state(&self, id: &str) -> Result<Option<ProcessState>, AdapterError> {
        Ok(self.processes.lock().unwrap().get(id).cloned())
    }
}

pub struct FakeNetwork {
    events: Events,
    failures: Failures,
    attached: Mutex<HashSet<String>>,
}

impl FakeNetwork {
    pub fn is_attached(&self, id: &str) -> bool {
        self.attached.lock().unwrap().contains(id)
    }
}

#[async_trait]
impl NetworkAdapter for FakeNetwork {
    async fn attach(&self, sandbox_id: &str, netns: &Path) -> Result<NetworkResult, AdapterError> {
        self.events.push(format!("network.attach {}", sandbox_id));
        if !netns.exists() {
            return Err(AdapterError::Network(format!("no netns at {:?}", netns)));
        }
        // a failed ADD may still have configured something
        self.attached.lock().unwrap().insert(sandbox_id.to_string());
        self.failures.check("network.attach", AdapterError::Network)?;
        Ok(NetworkResult {
            ips: vec!["10.88.0.2".to_string()],
            raw: serde_json::Value::Null,
        })
    }

    async fn detach(&self, sandbox_id: &str, _netns: &Path) -> Result<(), AdapterError> {
        self.events.push(format!("network.detach {}", sandbox_id));
        self.attached.lock().unwrap().remove(sandbox_id);
        Ok(())
    }
}

pub struct FakeHooks {
    events: Events,
    failures: Failures,
    /// cancelled from inside the pod creation hook
    pub cancel_during_pod_create: Mutex<Option<Context>>,
}

#[async_trait]
impl HookAdapter for FakeHooks {
    async fn on_pod_create(&self, sandbox_id: &str, spec: SpecDocument) -> Result<SpecDocument, AdapterError> {
        self.events.push(format!("hooks.pod_create {}", sandbox_id));
        self.failures.check("hooks.pod_create", AdapterError::Hook)?;
        if let Some(ctx) = self.cancel_during_pod_create.lock().unwrap().take() {
            ctx.cancel();
        }
        Ok(spec)
    }

    async fn on_pod_remove(&self, sandbox_id: &str) -> Result<(), AdapterError> {
        self.events.push(format!("hooks.pod_remove {}", sandbox_id));
        Ok(())
    }

    async fn on_container_create(
        &self,
        container_id: &str,
        mut spec: SpecDocument,
    ) -> Result<SpecDocument, AdapterError> {
        self.events.push(format!("hooks.container_create {}", container_id));
        self.failures.check("hooks.container_create", AdapterError::Hook)?;
        spec.annotations
            .insert("test.hooked".to_string(), "true".to_string());
        Ok(spec)
    }

    async fn undo_container_create(&self, container_id: &str) -> Result<(), AdapterError> {
        self.events.push(format!("hooks.container_undo {}", container_id));
        Ok(())
    }

    async fn on_container_remove(&self, container_id: &str) -> Result<(), AdapterError> {
        self.events.push(format!("hooks.container_remove {}", container_id));
        Ok(())
    }
}

/// Stands in for pinned namespaces with plain files
pub struct FilePinner {
    root: PathBuf,
}

impl NamespacePinner for FilePinner {
    fn pin(&self, kind: NamespaceKind, name: &str) -> Result<PathBuf, NamespaceError> {
        if !kind.is_pinnable() {
            return Err(NamespaceError::Unsupported(kind));
        }
        let dir = self.root.join(kind.proc_name());
        fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        fs::File::create(&path)?;
        Ok(path)
    }

    fn unpin(&self, _kind: NamespaceKind, path: &Path) -> Result<(), NamespaceError> {
        match fs::remove_file(path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub config: ServerConfig,
    pub server: Server,
    pub events: Events,
    pub failures: Failures,
    pub storage: Arc<FakeStorage>,
    pub runtime: Arc<FakeRuntime>,
    pub network: Arc<FakeNetwork>,
    pub hooks: Arc<FakeHooks>,
}

impl Harness {
    pub fn new() -> Self {
        Harness::with_config(|_| {})
    }

    pub fn with_config<F: FnOnce(&mut ServerConfig)>(adjust: F) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            root: dir.path().join("root"),
            run_root: dir.path().join("run"),
            namespaces_dir: dir.path().join("ns"),
            storage_root_for_propagation: dir.path().join("storage"),
            pause_image: "pause".to_string(),
            stop_workers: 4,
            in_flight_wait_secs: 5,
            infra_stop_timeout_secs: 1,
            abandoned_after_secs: 0,
            ..ServerConfig::default()
        };
        adjust(&mut config);

        let events = Events::default();
        let failures = Failures::default();
        let storage = Arc::new(FakeStorage::new(dir.path(), events.clone(), failures.clone()));
        let runtime = Arc::new(FakeRuntime::new(events.clone(), failures.clone()));
        let network = Arc::new(FakeNetwork {
            events: events.clone(),
            failures: failures.clone(),
            attached: Mutex::new(HashSet::new()),
        });
        let hooks = Arc::new(FakeHooks {
            events: events.clone(),
            failures: failures.clone(),
            cancel_during_pod_create: Mutex::new(None),
        });

        let server = build_server(&config, dir.path(), &storage, &runtime, &network, &hooks);
        Harness {
            dir,
            config,
            server,
            events,
            failures,
            storage,
            runtime,
            network,
            hooks,
        }
    }

    /// A fresh server over the same storage, runtime, and network, like a
    /// daemon restart
    pub fn restart(&self) -> Server {
        build_server(
            &self.config,
            self.dir.path(),
            &self.storage,
            &self.runtime,
            &self.network,
            &self.hooks,
        )
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }
}

fn build_server(
    config: &ServerConfig,
    dir: &Path,
    storage: &Arc<FakeStorage>,
    runtime: &Arc<FakeRuntime>,
    network: &Arc<FakeNetwork>,
    hooks: &Arc<FakeHooks>,
) -> Server {
    Server::builder()
        .config(config.clone())
        .storage(storage.clone())
        .runtime(runtime.clone())
        .network(network.clone())
        .hooks(hooks.clone())
        .pinner(Arc::new(FilePinner {
            root: dir.join("ns"),
        }))
        .build()
        .unwrap()
}

pub fn sandbox_request(name: &str) -> SandboxRequest {
    SandboxRequest {
        metadata: Metadata {
            name: name.to_string(),
            uid: format!("uid-{}", name),
            namespace: "default".to_string(),
            attempt: 0,
        },
        hostname: format!("{}-host", name),
        ..Default::default()
    }
}

pub fn container_request(name: &str) -> ContainerRequest {
    ContainerRequest {
        metadata: Metadata {
            name: name.to_string(),
            ..Default::default()
        },
        image: "busybox".to_string(),
        ..Default::default()
    }
}
