use super::Server;
use crate::{container::ContainerState, errors::ServerError};
use std::time::Duration;

impl Server {
    /// Start the process of a created container
    pub async fn start_container(&self, id: &str) -> Result<(), ServerError> {
        let container = self
            .inner
            .index
            .container(id)
            .ok_or_else(|| ServerError::ContainerNotFound(id.to_string()))?;
        let state = container.state();
        if state != ContainerState::Created {
            return Err(ServerError::InvalidState {
                id: id.to_string(),
                state: state.to_string(),
                expected: "created",
            });
        }
        self.inner.runtime.start(id).await?;
        container.set_running();
        log::info!("container {} started", id);
        Ok(())
    }

    /// Stop a container's process, waiting up to `timeout` before killing it
    ///
    /// Stopping a stopped or unknown container succeeds.
    pub async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), ServerError> {
        let container = match self.inner.index.container(id) {
            Some(container) => container,
            None => {
                log::debug!("container {} is already gone", id);
                return Ok(());
            }
        };
        if container.state() == ContainerState::Stopped {
            return Ok(());
        }
        self.inner.runtime.stop(id, timeout).await?;
        container.set_stopped();
        log::info!("container {} stopped", id);
        Ok(())
    }

    /// Stop and delete a container, releasing its storage and name
    ///
    /// Removing an unknown container succeeds.
    pub async fn remove_container(&self, id: &str) -> Result<(), ServerError> {
        let inner = &self.inner;
        let container = match inner.index.container(id) {
            Some(container) => container,
            None => {
                log::debug!("container {} is already gone", id);
                return Ok(());
            }
        };
        self.stop_container(id, inner.config.infra_stop_timeout()).await?;
        inner.hooks.on_container_remove(id).await?;
        inner.runtime.delete(id).await?;
        inner.storage.stop(id).await?;
        inner.storage.delete(id).await?;

        inner.index.remove_container(id);
        if let Some(sandbox) = inner.index.sandbox(&container.sandbox_id) {
            sandbox.remove_member(id);
        }
        inner.container_names.release(&container.name);
        log::info!("container {} ({:?}) removed", id, container.name);
        Ok(())
    }
}
