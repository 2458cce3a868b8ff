//! # hotswap-registry
//!
//! Keep a gRPC service discoverable while its configuration changes under it.
//!
//! ## Overview
//!
//! `hotswap-registry` ties three pieces together:
//! - A [`ConfigStore`](core::ConfigStore) holding the current
//!   configuration snapshot, reloaded from layered sources (files, then
//!   environment) with lock-free reads using `arc-swap`, and notifying
//!   observers of each changed section
//! - An [`EndpointRegistry`](registry::EndpointRegistry) advertising
//!   `service/<name>/<address>` in an etcd-like coordination store under a
//!   lease that is renewed for as long as the endpoint is up
//! - A [`BoundServer`](server::BoundServer) that serves tonic routes and,
//!   when `server.addr` changes, binds the new address, advertises it, then
//!   withdraws and closes the old one without restarting the transport
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hotswap_registry::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store: ConfigStore<ServiceConfig> = ConfigStore::builder()
//!     .with_file("config/test/config.yaml")
//!     .with_env_overrides("APP", "__")
//!     .with_file_watch(Duration::from_millis(200))
//!     .build()?;
//!
//! let coordinator = MemoryCoordinator::new();
//! let server = BoundServer::new(
//!     ListenAddr::parse(&store.current().server.addr)?,
//!     Arc::new(coordinator.client()),
//!     NoServices,
//!     ServerOptions::new("task"),
//! );
//! store.add_observer(Arc::new(server.clone()));
//!
//! // Editing server.addr in the file now moves the listener and the record.
//! server.serve().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `file-watch` (default): reload when configuration files change
//! - `etcd`: `EtcdCoordinator` backed by a real etcd cluster

#![warn(missing_docs, rust_2024_compatibility)]
#![deny(unsafe_code)]

pub mod coordination;
pub mod core;
pub mod error;
pub mod notify;
pub mod registry;
pub mod server;
pub mod sources;
pub mod telemetry;

/// Convenient re-exports for common usage patterns.
pub mod prelude {
    pub use crate::coordination::{CoordinationClient, MemoryCoordinator};
    pub use crate::core::{ChangeKind, ConfigStore, ConfigStoreBuilder, ServiceConfig, Validate};
    pub use crate::error::{
        ConfigError, CoordinationError, RegistryError, Result, ServerError, ValidationError,
    };
    pub use crate::notify::Observer;
    pub use crate::registry::{EndpointRegistry, RegistryOptions};
    pub use crate::server::{BoundServer, ListenAddr, NoServices, ServerOptions};
}
