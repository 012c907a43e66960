//! Sandbox and container lifecycle core for a pod-oriented container
//! runtime daemon
//!
//! A [Server] creates sandboxes (pods: shared namespaces plus an optional
//! infra process) and the containers inside them, driving storage,
//! networking, and an OCI runtime through the traits in [adapters]. Every
//! creation is deduplicated by name, rolls back completely on failure, and
//! leaves a persisted spec behind that [Server::restore] can recover from
//! after a restart.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("podvisor only works on linux or android");

#[macro_use] extern crate lazy_static;
#[macro_use] extern crate serde;

pub mod adapters;
pub mod cleanup;
pub mod config;
pub mod container;
pub mod context;
pub mod errors;
pub mod inflight;
pub mod namespace;
pub mod request;
pub mod reservation;
pub mod sandbox;
pub mod server;
pub mod spec;

mod lock;

pub use crate::{
    config::ServerConfig,
    context::Context,
    errors::ServerError,
    request::{ContainerRequest, SandboxRequest},
    server::{RestoreReport, Server, ServerBuilder},
};
