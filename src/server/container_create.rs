use super::{cgroups_path, persist_spec, undo, Progress, Server};
use crate::{
    adapters::{ImageInfo, RootfsRequest},
    cleanup::{CleanupStack, UndoError},
    container::{Container, ContainerParts, ContainerState},
    context::Context,
    errors::{ServerError, SpecError},
    namespace::NamespaceMode,
    request::{ArtifactMount, ContainerRequest, Propagation},
    reservation::generate_id,
    sandbox::Sandbox,
    spec::{
        annotations,
        devices::host_device,
        mounts::{self, clean_path, resolve_bind_mount, MountContext, Volume},
        subpath::sub_path_entries,
        volumes::{add_image_volumes, add_secret_mounts},
        Mount, SpecBuilder,
    },
};
use chrono::Utc;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

impl Server {
    /// Create a container inside a running sandbox, returning its id
    ///
    /// The container's process exists when this returns but has not been
    /// started. Creation holds off any stop of the sandbox, and fails right
    /// away if the sandbox is already stopping.
    pub async fn create_container(
        &self,
        ctx: &Context,
        sandbox_id: &str,
        request: &ContainerRequest,
    ) -> Result<String, ServerError> {
        let inner = &self.inner;
        request.validate(inner.config.rro_supported)?;
        ctx.check()?;
        let sandbox = inner
            .index
            .sandbox(sandbox_id)
            .ok_or_else(|| ServerError::SandboxNotFound(sandbox_id.to_string()))?;
        let _creating = sandbox.creation_guard()?;
        let name = request.container_name(&sandbox.metadata);
        let id = generate_id();

        let mut attempt = loop {
            match inner.container_in_flight.claim(&name, &id) {
                Ok(attempt) => break attempt,
                Err(existing) => {
                    log::info!(
                        "container {:?} is already being created as {}, waiting for it",
                        name,
                        existing
                    );
                    let wait = inner.config.in_flight_wait() + ctx.remaining().unwrap_or_default();
                    if let Some(done) = inner.container_in_flight.get_or_wait(&name, ctx, wait).await? {
                        return Ok(done);
                    }
                }
            }
        };

        let result = match self
            .build_container(ctx, &sandbox, request, &name, &id, attempt.cleanup())
            .await
        {
            Ok(()) => match ctx.err() {
                Some(err) => Err(err.at_stage("committing")),
                None => Ok(()),
            },
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                attempt.commit();
                log::info!("container {} ({:?}) created in sandbox {}", id, name, sandbox.id);
                Ok(id)
            }
            Err(err) => {
                log::warn!("creating container {:?} failed, rolling back: {}", name, err);
                let failures = attempt.roll_back(&err.to_string()).await;
                if !failures.is_empty() {
                    log::warn!("{} cleanup steps failed for container {}", failures.len(), id);
                }
                Err(err)
            }
        }
    }

    async fn build_container(
        &self,
        ctx: &Context,
        sandbox: &Arc<Sandbox>,
        request: &ContainerRequest,
        name: &str,
        id: &str,
        cleanup: &mut CleanupStack,
    ) -> Result<(), ServerError> {
        let inner = &self.inner;
        let config = &inner.config;
        let created = Utc::now();
        let security = &request.security;
        let privileged = security.privileged;
        let mut progress = Progress::new("container", id, name, &inner.container_in_flight, ctx);

        progress.enter("reserving name")?;
        inner
            .container_names
            .reserve_with_id(name, id)
            .map_err(|err| progress.fail(err))?;
        cleanup.push(undo::release_name(&inner.container_names, name));

        progress.enter("resolving image")?;
        let image = inner
            .storage
            .resolve_image(&request.image)
            .await
            .map_err(|err| progress.fail(err))?;
        log::debug!("container {} image {:?} is {}", id, image.reference, image.id);

        progress.enter("creating storage")?;
        let rootfs = RootfsRequest {
            id: id.to_string(),
            name: name.to_string(),
            sandbox_id: sandbox.id.clone(),
            image: image.reference.clone(),
            selinux: security.selinux.clone(),
            ..Default::default()
        };
        let storage = inner
            .storage
            .create_container_rootfs(&rootfs, &image)
            .await
            .map_err(|err| progress.fail(err))?;
        cleanup.push(undo::delete_storage(&inner.storage, id));
        let mount_point = inner.storage.start(id).await.map_err(|err| progress.fail(err))?;
        cleanup.push(undo::stop_storage(&inner.storage, id));

        progress.enter("building spec")?;
        let mut builder = SpecBuilder::with_defaults(&inner.spec_defaults);
        builder.args(command_line(request, &image).map_err(|err| progress.fail(err))?);
        for entry in &image.config.env {
            if let Some((key, value)) = entry.split_once('=') {
                builder.env(key, value);
            }
        }
        for var in &request.env {
            builder.env(&var.key, &var.value);
        }
        let (uid, gid) = image_user(&mount_point, &image.config.user).map_err(|err| progress.fail(err))?;
        builder
            .cwd(&image.config.working_dir)
            .cwd(&request.working_dir)
            .user(
                security.run_as_user.unwrap_or(uid),
                security.run_as_group.unwrap_or(gid),
                security.supplemental_groups.clone(),
            )
            .umask(security.umask_value().map_err(|err| progress.fail(err))?)
            .terminal(request.tty)
            .root(&mount_point.to_string_lossy(), security.readonly_rootfs)
            .hostname(&sandbox.hostname)
            .no_new_privileges(security.no_new_privileges)
            .cgroups_path(&cgroups_path(&sandbox.cgroup_parent, id))
            .resources(&request.resources);
        builder
            .capabilities(&security.capabilities, privileged)
            .map_err(|err| progress.fail(err))?;
        if privileged {
            builder.privileged();
        } else {
            if let Some(paths) = &security.masked_paths {
                builder.masked_paths(paths.clone());
            }
            if let Some(paths) = &security.readonly_paths {
                builder.readonly_paths(paths.clone());
            }
        }

        let seccomp = inner
            .policies
            .seccomp
            .resolve(&security.seccomp, privileged)
            .map_err(|err| progress.fail(err))?;
        let apparmor = inner
            .policies
            .apparmor
            .resolve(&security.apparmor, privileged)
            .map_err(|err| progress.fail(err))?;
        let labels = inner
            .policies
            .selinux
            .labels(security.selinux.as_ref(), privileged)
            .map_err(|err| progress.fail(err))?;
        builder.seccomp(seccomp).apparmor_profile(apparmor).selinux_labels(
            labels.process.or_else(|| sandbox.process_label.clone()),
            labels.mount.or_else(|| sandbox.mount_label.clone()),
        );

        let options = request
            .namespaces
            .clone()
            .unwrap_or_else(|| sandbox.namespace_options.clone());
        let target_pid = match &options.pid {
            NamespaceMode::Target(target) => self.target_pid(target),
            _ => None,
        };
        let namespaces = sandbox
            .namespaces
            .for_container(&sandbox.id, &options, sandbox.infra_pid(), target_pid)
            .map_err(|err| progress.fail(err))?;
        namespaces.apply_to_spec(&mut builder);

        let mount_ctx = self.mount_context(request);
        let mut root_propagation: Option<&'static str> = None;
        for mount in &request.mounts {
            if let Some(artifact) = &mount.artifact {
                self.add_artifact_mount(&mut builder, &mount.container_path, artifact)
                    .await
                    .map_err(|err| progress.fail(err))?;
                continue;
            }
            let resolved = resolve_bind_mount(mount, &mount_ctx).map_err(|err| progress.fail(err))?;
            root_propagation = match (root_propagation, resolved.root_propagation) {
                (Some("rshared"), _) | (_, Some("rshared")) => Some("rshared"),
                (current, next) => next.or(current),
            };
            builder.add_mount(resolved.mount).add_volume(resolved.volume);
        }
        if let Some(propagation) = root_propagation {
            builder.rootfs_propagation(propagation);
        }

        let sandbox_files = [
            ("/etc/resolv.conf", &sandbox.resolv_path),
            ("/etc/hostname", &sandbox.hostname_path),
        ];
        for (destination, source) in sandbox_files.iter() {
            if let Some(source) = source {
                if !builder.has_mount(destination) {
                    let mode = if security.readonly_rootfs { "ro" } else { "rw" };
                    builder.add_mount(Mount::bind(destination, &source.to_string_lossy(), &[mode, "rprivate"]));
                }
            }
        }
        add_secret_mounts(&mut builder, &inner.secrets, &storage.run_dir).map_err(|err| progress.fail(err))?;
        add_image_volumes(
            &mut builder,
            &image.config.volumes,
            config.image_volumes,
            &mount_point,
            &storage.run_dir,
        )
        .map_err(|err| progress.fail(err))?;
        for device in &request.devices {
            let (device, rule) = host_device(device).map_err(|err| progress.fail(err))?;
            builder.add_device(device, rule);
        }

        let json = |encoded: serde_json::Result<String>| encoded.map_err(|err| progress.fail(err));
        builder
            .annotations(&request.annotations)
            .annotation(annotations::CONTAINER_TYPE, annotations::TYPE_CONTAINER)
            .annotation(annotations::CONTAINER_NAME, name)
            .annotation(annotations::CONTAINER_ID, id)
            .annotation(annotations::SANDBOX_ID, sandbox.id.as_str())
            .annotation(annotations::SANDBOX_NAME, sandbox.name.as_str())
            .annotation(annotations::NAME, name)
            .annotation(annotations::METADATA, json(serde_json::to_string(&request.metadata))?)
            .annotation(annotations::LABELS, json(serde_json::to_string(&request.labels))?)
            .annotation(annotations::ANNOTATIONS, json(serde_json::to_string(&request.annotations))?)
            .annotation(annotations::NAMESPACES, json(serde_json::to_string(&namespaces))?)
            .annotation(annotations::CREATED, created.to_rfc3339())
            .annotation(annotations::MOUNT_POINT, mount_point.to_string_lossy())
            .annotation(annotations::IMAGE, image.id.as_str())
            .annotation(annotations::IMAGE_NAME, image.reference.as_str())
            .annotation(annotations::HOSTNAME, sandbox.hostname.as_str())
            .annotation(annotations::IP, sandbox.ips().join(","))
            .annotation(annotations::PRIVILEGED, privileged.to_string());
        if !image.config.stop_signal.is_empty() {
            builder.annotation(annotations::STOP_SIGNAL, image.config.stop_signal.as_str());
        }
        let (mut spec, volumes) = builder.finalize();
        spec.annotations.insert(
            annotations::VOLUMES.to_string(),
            json(serde_json::to_string(&volumes))?,
        );

        progress.enter("applying workload policy")?;
        inner
            .workload
            .mutate(request, &sandbox.annotations, &mut spec)
            .map_err(|err| progress.fail(err))?;

        progress.enter("persisting spec")?;
        persist_spec(&spec, storage.dir.clone(), storage.run_dir.clone())
            .await
            .map_err(|err| progress.fail(err))?;
        cleanup.push(undo::remove_specs(&[&storage.dir, &storage.run_dir]));

        progress.enter("running container hooks")?;
        let adjusted = inner
            .hooks
            .on_container_create(id, spec.clone())
            .await
            .map_err(|err| progress.fail(err))?;
        cleanup.push(undo::container_create_undone(&inner.hooks, id));
        if adjusted != spec {
            log::debug!("container hooks adjusted the spec of container {}", id);
            spec = adjusted;
            persist_spec(&spec, storage.dir.clone(), storage.run_dir.clone())
                .await
                .map_err(|err| progress.fail(err))?;
        }

        progress.enter("creating process")?;
        // a failed create can leave a half-made process behind
        cleanup.push(undo::delete_process(&inner.runtime, id));
        let pid = inner
            .runtime
            .create_process(id, &storage.run_dir)
            .await
            .map_err(|err| progress.fail(err))?;

        progress.enter("registering")?;
        let container = Arc::new(Container::new(
            ContainerParts {
                id: id.to_string(),
                name: name.to_string(),
                sandbox_id: sandbox.id.clone(),
                metadata: request.metadata.clone(),
                image,
                spec,
                mount_point,
                storage,
                volumes,
                labels: request.labels.clone(),
                annotations: request.annotations.clone(),
                created,
            },
            ContainerState::Created,
            Some(pid),
        ));
        inner.index.insert_container(container);
        sandbox.add_member(id);
        let index = inner.index.clone();
        let member_of = sandbox.clone();
        let owned = id.to_string();
        cleanup.add(format!("unregistering container {}", id), async move {
            member_of.remove_member(&owned);
            index.remove_container(&owned);
            Ok::<_, UndoError>(())
        });
        Ok(())
    }

    /// Pid a container's PID namespace joins: another container's process,
    /// or another sandbox's infra process
    fn target_pid(&self, target: &str) -> Option<u32> {
        let index = &self.inner.index;
        index
            .container(target)
            .and_then(|container| container.pid())
            .or_else(|| index.sandbox(target).and_then(|sandbox| sandbox.infra_pid()))
    }

    fn mount_context(&self, request: &ContainerRequest) -> MountContext {
        let config = &self.inner.config;
        let needs_mountinfo = request
            .mounts
            .iter()
            .any(|mount| mount.artifact.is_none() && !mount.host_path.is_empty());
        let mount_infos = if needs_mountinfo {
            mounts::load_mountinfo().unwrap_or_else(|err| {
                log::warn!("could not read mountinfo: {}", err);
                Vec::new()
            })
        } else {
            Vec::new()
        };
        MountContext {
            storage_root: config.storage_root_for_propagation.clone(),
            bind_mount_prefix: config.bind_mount_prefix.clone(),
            protected_sources: config.absent_mount_sources_to_reject.clone(),
            rro_supported: config.rro_supported,
            idmap_supported: config.idmap_supported,
            restoring: request.restoring,
            mount_infos,
        }
    }

    /// Mount the files of an artifact, read-only, below `container_path`
    async fn add_artifact_mount(
        &self,
        builder: &mut SpecBuilder,
        container_path: &str,
        artifact: &ArtifactMount,
    ) -> Result<(), ServerError> {
        let info = self.inner.storage.artifact(&artifact.reference).await?;
        let entries = sub_path_entries(&info.paths, &artifact.sub_path).map_err(|source| {
            SpecError::ArtifactSubPath {
                container_path: container_path.to_string(),
                source,
            }
        })?;
        let base = clean_path(container_path);
        for (original, relative) in entries {
            let destination = format!("{}/{}", base.trim_end_matches('/'), relative);
            let source = info.root.join(original.strip_prefix("./").unwrap_or(&original));
            let source = source.to_string_lossy();
            builder
                .add_mount(Mount::bind(&destination, &source, &["ro", "rprivate"]))
                .add_volume(Volume {
                    container_path: clean_path(&destination),
                    host_path: source.into_owned(),
                    readonly: true,
                    recursive_read_only: false,
                    propagation: Propagation::Private,
                });
        }
        Ok(())
    }
}

/// The process arguments: the request's command, else the image
/// entrypoint, each followed by the request's args or else the image cmd
fn command_line(request: &ContainerRequest, image: &ImageInfo) -> Result<Vec<String>, ServerError> {
    let mut args = if request.command.is_empty() {
        image.config.entrypoint.clone()
    } else {
        request.command.clone()
    };
    if !request.args.is_empty() {
        args.extend(request.args.iter().cloned());
    } else if request.command.is_empty() {
        args.extend(image.config.cmd.iter().cloned());
    }
    if args.is_empty() {
        return Err(ServerError::InvalidRequest(format!(
            "no command specified and image {:?} has none",
            image.reference
        )));
    }
    Ok(args)
}

/// Resolve an image `user[:group]` to ids, using the rootfs's passwd and
/// group files for names
fn image_user(rootfs: &Path, user: &str) -> Result<(u32, u32), ServerError> {
    if user.is_empty() {
        return Ok((0, 0));
    }
    let (user, group) = match user.split_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (user, None),
    };
    let (uid, primary_gid) = match user.parse::<u32>() {
        Ok(uid) => {
            let gid = lookup(rootfs, "etc/passwd", |fields| {
                if fields.get(2) != Some(&user) {
                    return None;
                }
                fields.get(3)?.parse().ok()
            });
            (uid, gid.unwrap_or(0))
        }
        Err(_) => lookup(rootfs, "etc/passwd", |fields| {
            if fields.first() != Some(&user) {
                return None;
            }
            Some((fields.get(2)?.parse().ok()?, fields.get(3)?.parse().ok()?))
        })
        .ok_or_else(|| ServerError::InvalidRequest(format!("unable to find user {:?} in the image", user)))?,
    };
    let gid = match group {
        None => primary_gid,
        Some(group) => match group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => lookup(rootfs, "etc/group", |fields| {
                if fields.first() != Some(&group) {
                    return None;
                }
                fields.get(2)?.parse().ok()
            })
            .ok_or_else(|| ServerError::InvalidRequest(format!("unable to find group {:?} in the image", group)))?,
        },
    };
    Ok((uid, gid))
}

/// First match of `find` over the colon-separated lines of a file in the
/// rootfs; a missing file matches nothing
fn lookup<T, F>(rootfs: &Path, file: &str, find: F) -> Option<T>
where
    F: Fn(&[&str]) -> Option<T>,
{
    let path: PathBuf = mounts::secure_join(rootfs, Path::new(file)).ok()?;
    let contents = fs::read_to_string(path).ok()?;
    contents
        .lines()
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| find(&line.split(':').collect::<Vec<_>>()))
}
