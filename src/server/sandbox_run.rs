use super::{cgroups_path, persist_spec, undo, Progress, Server};
use crate::{
    adapters::RootfsRequest,
    cleanup::{CleanupStack, UndoError},
    context::Context,
    errors::{NamespaceError, ServerError},
    namespace::{Namespace, NamespaceKind, NamespaceMode, NamespaceOptions, NamespaceRequest, PerKind},
    request::SandboxRequest,
    reservation::generate_id,
    sandbox::{InfraContainer, Sandbox, SandboxParts, SandboxState},
    spec::{annotations, Mount, SpecBuilder},
};
use chrono::Utc;
use std::{path::PathBuf, sync::Arc};

impl Server {
    /// Create and start a sandbox, returning its id
    ///
    /// A request identical to one still in progress waits for that attempt
    /// and returns its id instead of creating a second sandbox. If `ctx`
    /// ends after every resource exists but before the sandbox is committed,
    /// the sandbox is kept for a retry of the same request to adopt; any
    /// other failure rolls back everything.
    pub async fn run_sandbox(&self, ctx: &Context, request: &SandboxRequest) -> Result<String, ServerError> {
        request.validate()?;
        ctx.check()?;
        let inner = &self.inner;
        let name = request.sandbox_name();
        let id = generate_id();

        let mut attempt = loop {
            match inner.pod_in_flight.claim(&name, &id) {
                Ok(attempt) => break attempt,
                Err(existing) => {
                    log::info!(
                        "sandbox {:?} is already being created as {}, waiting for it",
                        name,
                        existing
                    );
                    let wait = inner.config.in_flight_wait() + ctx.remaining().unwrap_or_default();
                    if let Some(adopted) = inner.pod_in_flight.get_or_wait(&name, ctx, wait).await? {
                        if let Some(sandbox) = inner.index.sandbox(&adopted) {
                            if sandbox.state() == SandboxState::Creating {
                                sandbox.set_state(SandboxState::Ready);
                            }
                        }
                        return Ok(adopted);
                    }
                }
            }
        };

        match self.create_sandbox(ctx, request, &name, &id, attempt.cleanup()).await {
            Ok(sandbox) => match ctx.err() {
                Some(err) => {
                    log::warn!(
                        "request for sandbox {} ended before it was committed ({}), keeping it for adoption",
                        id,
                        err
                    );
                    attempt.preserve();
                    Err(err.at_stage("committing"))
                }
                None => {
                    sandbox.set_state(SandboxState::Ready);
                    attempt.commit();
                    log::info!("sandbox {} ({:?}) is ready", id, name);
                    Ok(id)
                }
            },
            Err(err) => {
                log::warn!("creating sandbox {:?} failed, rolling back: {}", name, err);
                let failures = attempt.roll_back(&err.to_string()).await;
                if !failures.is_empty() {
                    log::warn!("{} cleanup steps failed for sandbox {}", failures.len(), id);
                }
                Err(err)
            }
        }
    }

    async fn create_sandbox(
        &self,
        ctx: &Context,
        request: &SandboxRequest,
        name: &str,
        id: &str,
        cleanup: &mut CleanupStack,
    ) -> Result<Arc<Sandbox>, ServerError> {
        let inner = &self.inner;
        let config = &inner.config;
        let created = Utc::now();
        let mut progress = Progress::new("sandbox", id, name, &inner.pod_in_flight, ctx);

        progress.enter("reserving name")?;
        inner
            .pod_names
            .reserve_with_id(name, id)
            .map_err(|err| progress.fail(err))?;
        cleanup.push(undo::release_name(&inner.pod_names, name));
        let infra_name = request.infra_name();
        inner
            .container_names
            .reserve_with_id(&infra_name, id)
            .map_err(|err| progress.fail(err))?;
        cleanup.push(undo::release_name(&inner.container_names, &infra_name));

        progress.enter("creating storage")?;
        let rootfs = RootfsRequest {
            id: id.to_string(),
            name: name.to_string(),
            sandbox_id: id.to_string(),
            image: config.pause_image.clone(),
            selinux: request.security.selinux.clone(),
            ..Default::default()
        };
        let storage = inner
            .storage
            .create_sandbox_rootfs(&rootfs)
            .await
            .map_err(|err| progress.fail(err))?;
        cleanup.push(undo::delete_storage(&inner.storage, id));
        let mount_point = inner.storage.start(id).await.map_err(|err| progress.fail(err))?;
        cleanup.push(undo::stop_storage(&inner.storage, id));

        progress.enter("initializing spec")?;
        let privileged = request.security.privileged;
        let hostname = match request.hostname.as_str() {
            "" => host_hostname().map_err(|err| progress.fail(err))?,
            hostname => hostname.to_string(),
        };
        if let Some(dir) = &request.log_directory {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|err| progress.fail(err))?;
        }
        tokio::fs::create_dir_all(&storage.run_dir)
            .await
            .map_err(|err| progress.fail(err))?;
        let resolv_path = match &request.dns {
            Some(dns) => {
                let path = storage.run_dir.join("resolv.conf");
                tokio::fs::write(&path, dns.to_resolv_conf())
                    .await
                    .map_err(|err| progress.fail(err))?;
                Some(path)
            }
            None => None,
        };
        let hostname_path = storage.run_dir.join("hostname");
        tokio::fs::write(&hostname_path, format!("{}\n", hostname))
            .await
            .map_err(|err| progress.fail(err))?;
        let labels = inner
            .policies
            .selinux
            .labels(request.security.selinux.as_ref(), privileged)
            .map_err(|err| progress.fail(err))?;
        let process_label = labels.process.or_else(|| storage.process_label.clone());
        let mount_label = labels.mount.or_else(|| storage.mount_label.clone());

        let mut builder = SpecBuilder::with_defaults(&inner.spec_defaults);
        builder
            .hostname(&hostname)
            .args(config.pause_command.clone())
            .root(&mount_point.to_string_lossy(), true);

        progress.enter("creating namespaces")?;
        let requests = self
            .namespace_requests(&request.namespaces)
            .map_err(|err| progress.fail(err))?;
        let (namespaces, undo_namespaces) = inner.namespaces.new_pod_namespaces(id, &requests).await;
        cleanup.extend(undo_namespaces);
        let namespaces = namespaces.map_err(|err| progress.fail(err))?;

        progress.enter("finalizing spec")?;
        namespaces.apply_to_spec(&mut builder);
        for (key, value) in &request.sysctls {
            builder.sysctl(key, value);
        }
        builder
            .cgroups_path(&cgroups_path(&request.cgroup_parent, id))
            .resources(&request.resources)
            .no_new_privileges(request.security.no_new_privileges)
            .selinux_labels(process_label.clone(), mount_label.clone());
        if privileged {
            builder.privileged();
        }
        let seccomp = inner
            .policies
            .seccomp
            .resolve(&request.security.seccomp, privileged)
            .map_err(|err| progress.fail(err))?;
        let apparmor = inner
            .policies
            .apparmor
            .resolve(&request.security.apparmor, privileged)
            .map_err(|err| progress.fail(err))?;
        builder.seccomp(seccomp).apparmor_profile(apparmor);
        if let Some(path) = &resolv_path {
            builder.add_mount(Mount::bind(
                "/etc/resolv.conf",
                &path.to_string_lossy(),
                &["ro", "rprivate"],
            ));
        }
        if !namespaces.uts.is_host() {
            builder.add_mount(Mount::bind(
                "/etc/hostname",
                &hostname_path.to_string_lossy(),
                &["ro", "rprivate"],
            ));
        }

        let spoofed = config.drop_infra && !config.vm_isolated_runtime && !request.namespaces.needs_infra();
        let json = |encoded: serde_json::Result<String>| encoded.map_err(|err| progress.fail(err));
        builder
            .annotations(&request.annotations)
            .annotation(annotations::CONTAINER_TYPE, annotations::TYPE_SANDBOX)
            .annotation(annotations::CONTAINER_NAME, infra_name.as_str())
            .annotation(annotations::CONTAINER_ID, id)
            .annotation(annotations::SANDBOX_ID, id)
            .annotation(annotations::SANDBOX_NAME, name)
            .annotation(annotations::NAME, name)
            .annotation(annotations::METADATA, json(serde_json::to_string(&request.metadata))?)
            .annotation(annotations::LABELS, json(serde_json::to_string(&request.labels))?)
            .annotation(annotations::ANNOTATIONS, json(serde_json::to_string(&request.annotations))?)
            .annotation(annotations::NAMESPACES, json(serde_json::to_string(&namespaces))?)
            .annotation(annotations::NAMESPACE_OPTIONS, json(serde_json::to_string(&request.namespaces))?)
            .annotation(annotations::CREATED, created.to_rfc3339())
            .annotation(annotations::MOUNT_POINT, mount_point.to_string_lossy())
            .annotation(annotations::HOSTNAME, hostname.as_str())
            .annotation(annotations::HOSTNAME_PATH, hostname_path.to_string_lossy())
            .annotation(annotations::CGROUP_PARENT, request.cgroup_parent.as_str())
            .annotation(annotations::PRIVILEGED, privileged.to_string())
            .annotation(annotations::SPOOFED, spoofed.to_string());
        if let Some(path) = &resolv_path {
            builder.annotation(annotations::RESOLV_PATH, path.to_string_lossy());
        }
        if let Some(label) = &mount_label {
            builder.annotation(annotations::MOUNT_LABEL, label.as_str());
        }
        if let Some(label) = &process_label {
            builder.annotation(annotations::PROCESS_LABEL, label.as_str());
        }
        let (mut spec, _) = builder.finalize();

        progress.enter("persisting spec")?;
        persist_spec(&spec, storage.dir.clone(), storage.run_dir.clone())
            .await
            .map_err(|err| progress.fail(err))?;
        cleanup.push(undo::remove_specs(&[&storage.dir, &storage.run_dir]));

        let mut infra_pid = None;
        if spoofed {
            log::debug!("sandbox {} does not need an infra process", id);
        } else {
            progress.enter("starting infra")?;
            // a failed create can leave a half-made process behind
            cleanup.push(undo::delete_process(&inner.runtime, id));
            let pid = inner
                .runtime
                .create_process(id, &storage.run_dir)
                .await
                .map_err(|err| progress.fail(err))?;
            inner.runtime.start(id).await.map_err(|err| progress.fail(err))?;
            cleanup.push(undo::stop_process(&inner.runtime, id, config.infra_stop_timeout()));
            infra_pid = Some(pid);
        }

        let mut ips = Vec::new();
        if let (Some(network), Namespace::Owned { path: Some(netns) }) = (&inner.network, &namespaces.network) {
            progress.enter("attaching network")?;
            // a failed ADD can leave partial state that only DEL removes
            cleanup.push(undo::detach_network(network, id, netns));
            let result = network.attach(id, netns).await.map_err(|err| progress.fail(err))?;
            ips = result.ips;
            spec.annotations.insert(annotations::IP.to_string(), ips.join(","));
            persist_spec(&spec, storage.dir.clone(), storage.run_dir.clone())
                .await
                .map_err(|err| progress.fail(err))?;
        }

        progress.enter("running pod hooks")?;
        let adjusted = inner
            .hooks
            .on_pod_create(id, spec.clone())
            .await
            .map_err(|err| progress.fail(err))?;
        cleanup.push(undo::pod_removed(&inner.hooks, id));
        if adjusted != spec {
            log::debug!("pod hooks adjusted the spec of sandbox {}", id);
            spec = adjusted;
            persist_spec(&spec, storage.dir.clone(), storage.run_dir.clone())
                .await
                .map_err(|err| progress.fail(err))?;
        }

        progress.mark("registering");
        let sandbox = Arc::new(Sandbox::new(
            SandboxParts {
                id: id.to_string(),
                name: name.to_string(),
                metadata: request.metadata.clone(),
                namespaces,
                namespace_options: request.namespaces.clone(),
                labels: request.labels.clone(),
                annotations: request.annotations.clone(),
                mount_label,
                process_label,
                infra: InfraContainer {
                    id: id.to_string(),
                    name: infra_name,
                    spoofed,
                    pid: infra_pid,
                },
                storage,
                hostname,
                resolv_path,
                hostname_path: Some(hostname_path),
                cgroup_parent: request.cgroup_parent.clone(),
                privileged,
                created,
                ips,
            },
            SandboxState::Creating,
        ));
        inner.index.insert_sandbox(sandbox.clone());
        let index = inner.index.clone();
        let owned = id.to_string();
        cleanup.add(format!("unregistering sandbox {}", id), async move {
            index.remove_sandbox(&owned);
            Ok::<_, UndoError>(())
        });
        Ok(sandbox)
    }

    /// How each namespace kind of a new sandbox is obtained
    fn namespace_requests(&self, options: &NamespaceOptions) -> Result<PerKind<NamespaceRequest>, ServerError> {
        let mut requests = PerKind::<NamespaceRequest>::default();
        for (kind, mode) in options.iter() {
            *requests.get_mut(kind) = match mode {
                NamespaceMode::Host => NamespaceRequest::Host,
                NamespaceMode::Pod | NamespaceMode::Private => NamespaceRequest::New,
                NamespaceMode::Target(target) => NamespaceRequest::Join {
                    owner: target.clone(),
                    path: self.target_path(kind, target)?,
                },
            };
        }
        Ok(requests)
    }

    /// Namespace path of a join target: a ready sandbox, or for PID also a
    /// container
    pub(crate) fn target_path(&self, kind: NamespaceKind, target: &str) -> Result<PathBuf, ServerError> {
        let index = &self.inner.index;
        if kind == NamespaceKind::Pid {
            if let Some(pid) = index.container(target).and_then(|container| container.pid()) {
                return Ok(kind.proc_path(pid));
            }
        }
        let sandbox = index
            .sandbox(target)
            .ok_or_else(|| ServerError::SandboxNotFound(target.to_string()))?;
        let state = sandbox.state();
        if state != SandboxState::Ready {
            return Err(ServerError::SandboxNotReady {
                id: target.to_string(),
                state: state.to_string(),
            });
        }
        sandbox.join_path(kind).ok_or_else(|| {
            NamespaceError::NoTarget {
                kind,
                target: target.to_string(),
            }
            .into()
        })
    }
}

fn host_hostname() -> Result<String, ServerError> {
    let name = nix::unistd::gethostname().map_err(std::io::Error::from)?;
    Ok(name.to_string_lossy().into_owned())
}
