use super::Server;
use crate::{
    context::Context,
    errors::ServerError,
    namespace::Namespace,
    sandbox::{Sandbox, SandboxState},
};
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;

impl Server {
    /// Stop every container in a sandbox, then the sandbox itself
    ///
    /// Waits for container creations already under way in the sandbox, and
    /// refuses new ones from the moment it starts. Stopping a stopped or
    /// unknown sandbox succeeds.
    pub async fn stop_sandbox(&self, ctx: &Context, id: &str) -> Result<(), ServerError> {
        ctx.check()?;
        let sandbox = match self.inner.index.sandbox(id) {
            Some(sandbox) => sandbox,
            None => {
                log::debug!("sandbox {} is already gone", id);
                return Ok(());
            }
        };
        let _stopping = sandbox.stop_guard().await;
        self.stop_sandbox_locked(&sandbox).await
    }

    async fn stop_sandbox_locked(&self, sandbox: &Arc<Sandbox>) -> Result<(), ServerError> {
        let inner = &self.inner;
        if sandbox.state() == SandboxState::Stopped {
            return Ok(());
        }
        sandbox.set_state(SandboxState::Stopping);

        let timeout = inner.config.infra_stop_timeout();
        let results: Vec<Result<(), ServerError>> = stream::iter(sandbox.members())
            .map(|member| async move { self.stop_container(&member, timeout).await })
            .buffer_unordered(inner.config.stop_workers.max(1))
            .collect()
            .await;
        if let Some(err) = results.into_iter().find_map(Result::err) {
            log::warn!("stopping containers of sandbox {}: {}", sandbox.id, err);
            return Err(err);
        }

        if let (Some(network), Namespace::Owned { path: Some(netns) }) =
            (&inner.network, &sandbox.namespaces.network)
        {
            network.detach(&sandbox.id, netns).await?;
        }
        if !sandbox.infra.spoofed {
            inner.runtime.stop(&sandbox.id, timeout).await?;
            sandbox.set_infra_pid(None);
        }
        inner.storage.stop(&sandbox.id).await?;

        sandbox.set_state(SandboxState::Stopped);
        log::info!("sandbox {} ({:?}) stopped", sandbox.id, sandbox.name);
        Ok(())
    }

    /// Stop a sandbox if needed, then remove its containers and release
    /// everything it holds
    ///
    /// Removing an unknown sandbox succeeds.
    pub async fn remove_sandbox(&self, ctx: &Context, id: &str) -> Result<(), ServerError> {
        ctx.check()?;
        let inner = &self.inner;
        let sandbox = match inner.index.sandbox(id) {
            Some(sandbox) => sandbox,
            None => {
                log::debug!("sandbox {} is already gone", id);
                return Ok(());
            }
        };
        let _stopping = sandbox.stop_guard().await;
        let preserved = sandbox.state() == SandboxState::Creating;
        self.stop_sandbox_locked(&sandbox).await?;

        for member in sandbox.members() {
            self.remove_container(&member).await?;
        }
        inner.hooks.on_pod_remove(id).await?;
        if !sandbox.infra.spoofed {
            inner.runtime.delete(id).await?;
        }
        inner.namespaces.release_set(&sandbox.namespaces).await?;
        inner.storage.delete(id).await?;

        if preserved {
            // nobody adopted it; its teardown is done above
            if let Some(cleanup) = inner.pod_in_flight.delete(&sandbox.name) {
                cleanup.discard();
            }
        }
        inner.index.remove_sandbox(id);
        inner.pod_names.release(&sandbox.name);
        inner.container_names.release(&sandbox.infra.name);
        log::info!("sandbox {} ({:?}) removed", id, sandbox.name);
        Ok(())
    }
}
