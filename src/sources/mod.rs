//! Layered configuration sources merged by the loader.

mod config_source;
mod dotenv;
mod env;
mod file;

pub use config_source::ConfigSource;
pub use dotenv::DotenvSource;
pub use env::EnvSource;
pub use file::FileSource;
