use crate::{
    adapters::{HookAdapter, WorkloadPolicy},
    errors::AdapterError,
    request::ContainerRequest,
    spec::SpecDocument,
};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Hooks that accept every spec unchanged
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

#[async_trait]
impl HookAdapter for NoHooks {
    async fn on_pod_create(&self, _sandbox_id: &str, spec: SpecDocument) -> Result<SpecDocument, AdapterError> {
        Ok(spec)
    }

    async fn on_pod_remove(&self, _sandbox_id: &str) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn on_container_create(
        &self,
        _container_id: &str,
        spec: SpecDocument,
    ) -> Result<SpecDocument, AdapterError> {
        Ok(spec)
    }

    async fn undo_container_create(&self, _container_id: &str) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn on_container_remove(&self, _container_id: &str) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoWorkloadPolicy;

impl WorkloadPolicy for NoWorkloadPolicy {
    fn mutate(
        &self,
        _request: &ContainerRequest,
        _sandbox_annotations: &BTreeMap<String, String>,
        _spec: &mut SpecDocument,
    ) -> Result<(), AdapterError> {
        Ok(())
    }
}
