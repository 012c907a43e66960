//! Undo actions shared by the creation pipelines
//!
//! Each captures only the collaborator it needs, never the server itself,
//! so a preserved cleanup stack doesn't keep the server alive.

use crate::{
    adapters::{HookAdapter, NetworkAdapter, RuntimeAdapter, StorageAdapter},
    cleanup::{UndoAction, UndoError},
    reservation::ReservationRegistry,
    spec::persist,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

pub(crate) fn release_name(registry: &Arc<ReservationRegistry>, name: &str) -> UndoAction {
    let registry = registry.clone();
    let name = name.to_string();
    UndoAction::new(format!("releasing name {:?}", name), async move {
        registry.release(&name);
        Ok::<_, UndoError>(())
    })
}

pub(crate) fn delete_storage(storage: &Arc<dyn StorageAdapter>, id: &str) -> UndoAction {
    let storage = storage.clone();
    let id = id.to_string();
    UndoAction::new(format!("deleting storage for {}", id), async move {
        storage.delete(&id).await.map_err(UndoError::from)
    })
}

pub(crate) fn stop_storage(storage: &Arc<dyn StorageAdapter>, id: &str) -> UndoAction {
    let storage = storage.clone();
    let id = id.to_string();
    UndoAction::new(format!("unmounting storage for {}", id), async move {
        storage.stop(&id).await.map_err(UndoError::from)
    })
}

pub(crate) fn remove_specs(dirs: &[&Path]) -> UndoAction {
    let dirs: Vec<PathBuf> = dirs.iter().map(|dir| dir.to_path_buf()).collect();
    UndoAction::new(format!("removing persisted specs in {:?}", dirs), async move {
        tokio::task::spawn_blocking(move || -> Result<(), UndoError> {
            for dir in &dirs {
                persist::remove(dir)?;
            }
            Ok(())
        })
        .await?
    })
}

pub(crate) fn delete_process(runtime: &Arc<dyn RuntimeAdapter>, id: &str) -> UndoAction {
    let runtime = runtime.clone();
    let id = id.to_string();
    UndoAction::new(format!("deleting process {}", id), async move {
        runtime.delete(&id).await.map_err(UndoError::from)
    })
}

pub(crate) fn stop_process(runtime: &Arc<dyn RuntimeAdapter>, id: &str, timeout: Duration) -> UndoAction {
    let runtime = runtime.clone();
    let id = id.to_string();
    UndoAction::new(format!("stopping process {}", id), async move {
        runtime.stop(&id, timeout).await.map_err(UndoError::from)
    })
}

pub(crate) fn detach_network(network: &Arc<dyn NetworkAdapter>, sandbox_id: &str, netns: &Path) -> UndoAction {
    let network = network.clone();
    let id = sandbox_id.to_string();
    let netns = netns.to_path_buf();
    UndoAction::new(format!("detaching sandbox {} from the network", id), async move {
        network.detach(&id, &netns).await.map_err(UndoError::from)
    })
}

pub(crate) fn pod_removed(hooks: &Arc<dyn HookAdapter>, sandbox_id: &str) -> UndoAction {
    let hooks = hooks.clone();
    let id = sandbox_id.to_string();
    UndoAction::new(format!("running pod removal hooks for {}", id), async move {
        hooks.on_pod_remove(&id).await.map_err(UndoError::from)
    })
}

pub(crate) fn container_create_undone(hooks: &Arc<dyn HookAdapter>, container_id: &str) -> UndoAction {
    let hooks = hooks.clone();
    let id = container_id.to_string();
    UndoAction::new(format!("undoing container creation hooks for {}", id), async move {
        hooks.undo_container_create(&id).await.map_err(UndoError::from)
    })
}
