//! Configuration store, loading and snapshot types.

mod builder;
mod config_store;
mod loader;
mod snapshot;
mod validation;

pub use builder::ConfigStoreBuilder;
pub use config_store::ConfigStore;
pub(crate) use loader::ConfigLoader;
pub use snapshot::{
    ChangeKind, CoordinationSection, Facets, SecretSection, ServerSection, ServiceConfig,
    StorageSection,
};
pub use validation::Validate;
