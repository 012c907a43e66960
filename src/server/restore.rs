//! Rebuilding the in-memory state from what storage and the runtime still
//! hold after a restart

use super::Server;
use crate::{
    adapters::{ImageConfig, ImageInfo, ProcessStatus, StoredEntry},
    container::{Container, ContainerParts, ContainerState},
    errors::ServerError,
    namespace::{NamespaceOptions, NamespaceSet},
    sandbox::{InfraContainer, Sandbox, SandboxParts, SandboxState},
    spec::{annotations, persist, SpecDocument},
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// What a restore recovered, and what it had to give up on
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RestoreReport {
    pub sandboxes: Vec<String>,
    pub containers: Vec<String>,
    pub unusable: Vec<UnusableRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UnusableRecord {
    pub id: String,
    pub reason: String,
}

/// Typed access to the annotations of a persisted spec
struct Recorded<'a> {
    spec: &'a SpecDocument,
    path: &'a Path,
}

impl<'a> Recorded<'a> {
    fn corrupt(&self, reason: String) -> ServerError {
        ServerError::CorruptState {
            path: self.path.to_path_buf(),
            reason,
        }
    }

    fn optional(&self, key: &str) -> Option<&'a str> {
        self.spec.annotation(key).filter(|value| !value.is_empty())
    }

    fn required(&self, key: &str) -> Result<&'a str, ServerError> {
        self.spec
            .annotation(key)
            .ok_or_else(|| self.corrupt(format!("missing annotation {}", key)))
    }

    fn json<T: DeserializeOwned>(&self, key: &str) -> Result<T, ServerError> {
        serde_json::from_str(self.required(key)?)
            .map_err(|err| self.corrupt(format!("annotation {}: {}", key, err)))
    }

    fn created(&self) -> Result<DateTime<Utc>, ServerError> {
        DateTime::parse_from_rfc3339(self.required(annotations::CREATED)?)
            .map(|time| time.with_timezone(&Utc))
            .map_err(|err| self.corrupt(format!("annotation {}: {}", annotations::CREATED, err)))
    }

    fn flag(&self, key: &str) -> bool {
        self.optional(key) == Some("true")
    }
}

/// The running copy of a spec, or the template if that's gone
fn load_spec(entry: &StoredEntry) -> Result<(SpecDocument, PathBuf), ServerError> {
    match persist::load(&entry.info.run_dir) {
        Ok(spec) => Ok((spec, entry.info.run_dir.clone())),
        Err(err) => {
            log::debug!("no running spec for {}, trying the template: {}", entry.id, err);
            Ok((persist::load(&entry.info.dir)?, entry.info.dir.clone()))
        }
    }
}

impl Server {
    /// Recover sandboxes and containers after a restart
    ///
    /// Entries whose persisted state can't be read are reported as unusable
    /// and left alone. Sandboxes come back first, with every owned
    /// namespace registered before any join, then their containers.
    pub async fn restore(&self) -> Result<RestoreReport, ServerError> {
        let inner = &self.inner;
        let mut report = RestoreReport::default();
        let entries = inner.storage.list().await?;
        let (sandbox_entries, container_entries): (Vec<StoredEntry>, Vec<StoredEntry>) =
            entries.into_iter().partition(StoredEntry::is_sandbox);

        let mut loaded = Vec::new();
        for entry in &sandbox_entries {
            match self.load_sandbox(entry).await {
                Ok(sandbox) => loaded.push(sandbox),
                Err(err) => unusable(&mut report, &entry.id, err),
            }
        }
        for sandbox in loaded {
            let registered = inner
                .namespaces
                .restore_joins(&sandbox.namespaces)
                .map_err(ServerError::from)
                .and_then(|()| {
                    inner.pod_names.reserve_with_id(&sandbox.name, &sandbox.id)?;
                    inner
                        .container_names
                        .reserve_with_id(&sandbox.infra.name, &sandbox.id)?;
                    Ok(())
                });
            match registered {
                Ok(()) => {
                    log::info!("restored sandbox {} ({:?}), {}", sandbox.id, sandbox.name, sandbox.state());
                    report.sandboxes.push(sandbox.id.clone());
                    inner.index.insert_sandbox(Arc::new(sandbox));
                }
                Err(err) => {
                    inner.pod_names.release_id(&sandbox.id);
                    inner.container_names.release_id(&sandbox.id);
                    unusable(&mut report, &sandbox.id, err);
                }
            }
        }

        for entry in &container_entries {
            match self.load_container(entry).await {
                Ok(container) => {
                    log::info!("restored container {} ({:?}), {}", container.id, container.name, container.state());
                    report.containers.push(container.id.clone());
                }
                Err(err) => unusable(&mut report, &entry.id, err),
            }
        }
        Ok(report)
    }

    /// Read a sandbox back and register the namespaces it owns
    async fn load_sandbox(&self, entry: &StoredEntry) -> Result<Sandbox, ServerError> {
        let inner = &self.inner;
        let (spec, path) = load_spec(entry)?;
        let recorded = Recorded { spec: &spec, path: &path };
        if recorded.required(annotations::CONTAINER_TYPE)? != annotations::TYPE_SANDBOX {
            return Err(recorded.corrupt("not a sandbox spec".to_string()));
        }
        let namespaces: NamespaceSet = recorded.json(annotations::NAMESPACES)?;
        let namespace_options: NamespaceOptions = recorded.json(annotations::NAMESPACE_OPTIONS)?;
        inner.namespaces.restore_owned(&entry.id, &namespaces)?;

        let spoofed = recorded.flag(annotations::SPOOFED);
        let mut state = SandboxState::Stopped;
        let mut pid = None;
        if !spoofed {
            if let Some(process) = inner.runtime.state(&entry.id).await? {
                if process.status != ProcessStatus::Stopped {
                    state = SandboxState::Ready;
                    pid = process.pid;
                }
            }
        } else {
            state = SandboxState::Ready;
        }

        Ok(Sandbox::new(
            SandboxParts {
                id: entry.id.clone(),
                name: recorded.required(annotations::NAME)?.to_string(),
                metadata: recorded.json(annotations::METADATA)?,
                namespaces,
                namespace_options,
                labels: recorded.json(annotations::LABELS)?,
                annotations: recorded.json(annotations::ANNOTATIONS)?,
                mount_label: recorded.optional(annotations::MOUNT_LABEL).map(str::to_string),
                process_label: recorded.optional(annotations::PROCESS_LABEL).map(str::to_string),
                infra: InfraContainer {
                    id: entry.id.clone(),
                    name: recorded.required(annotations::CONTAINER_NAME)?.to_string(),
                    spoofed,
                    pid,
                },
                storage: entry.info.clone(),
                hostname: recorded.optional(annotations::HOSTNAME).unwrap_or_default().to_string(),
                resolv_path: recorded.optional(annotations::RESOLV_PATH).map(PathBuf::from),
                hostname_path: recorded.optional(annotations::HOSTNAME_PATH).map(PathBuf::from),
                cgroup_parent: recorded.optional(annotations::CGROUP_PARENT).unwrap_or_default().to_string(),
                privileged: recorded.flag(annotations::PRIVILEGED),
                created: recorded.created()?,
                ips: recorded
                    .optional(annotations::IP)
                    .map(|ips| ips.split(',').map(str::to_string).collect())
                    .unwrap_or_default(),
            },
            state,
        ))
    }

    /// Read a container back into its restored sandbox
    async fn load_container(&self, entry: &StoredEntry) -> Result<Arc<Container>, ServerError> {
        let inner = &self.inner;
        let (spec, path) = load_spec(entry)?;
        let recorded = Recorded { spec: &spec, path: &path };
        if recorded.required(annotations::CONTAINER_TYPE)? != annotations::TYPE_CONTAINER {
            return Err(recorded.corrupt("not a container spec".to_string()));
        }
        let sandbox_id = recorded.required(annotations::SANDBOX_ID)?;
        let sandbox = inner
            .index
            .sandbox(sandbox_id)
            .ok_or_else(|| ServerError::SandboxNotFound(sandbox_id.to_string()))?;

        let (state, pid) = match inner.runtime.state(&entry.id).await? {
            None => (ContainerState::Stopped, None),
            Some(process) => match process.status {
                ProcessStatus::Creating | ProcessStatus::Created => (ContainerState::Created, process.pid),
                ProcessStatus::Running | ProcessStatus::Paused => (ContainerState::Running, process.pid),
                ProcessStatus::Stopped => (ContainerState::Stopped, None),
            },
        };
        let name = recorded.required(annotations::CONTAINER_NAME)?.to_string();
        let image = ImageInfo {
            id: recorded.required(annotations::IMAGE)?.to_string(),
            reference: recorded.required(annotations::IMAGE_NAME)?.to_string(),
            config: ImageConfig {
                stop_signal: recorded.optional(annotations::STOP_SIGNAL).unwrap_or_default().to_string(),
                ..Default::default()
            },
        };
        let parts = ContainerParts {
            id: entry.id.clone(),
            name: name.clone(),
            sandbox_id: sandbox.id.clone(),
            metadata: recorded.json(annotations::METADATA)?,
            image,
            mount_point: PathBuf::from(recorded.required(annotations::MOUNT_POINT)?),
            storage: entry.info.clone(),
            volumes: recorded.json(annotations::VOLUMES)?,
            labels: recorded.json(annotations::LABELS)?,
            annotations: recorded.json(annotations::ANNOTATIONS)?,
            created: recorded.created()?,
            spec: spec.clone(),
        };

        inner.container_names.reserve_with_id(&name, &entry.id)?;
        let container = Arc::new(Container::new(parts, state, pid));
        inner.index.insert_container(container.clone());
        sandbox.add_member(&entry.id);
        Ok(container)
    }
}

fn unusable(report: &mut RestoreReport, id: &str, err: ServerError) {
    log::error!("cannot restore {}: {}", id, err);
    report.unusable.push(UnusableRecord {
        id: id.to_string(),
        reason: err.to_string(),
    });
}
