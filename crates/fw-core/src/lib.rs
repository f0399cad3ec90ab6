//! Storage core for the flywheel todo list
//!
//! This crate keeps a JSON todo file durable and consistent while threads,
//! async tasks and other processes read and write it concurrently:
//!
//! - [`store::TodoStorage`] is the entry point: load, save, health checks
//! - [`io`] holds the locking, atomic write, retry and metrics machinery
//! - [`schema`] defines the versioned on-disk document
//! - [`config`] layers TOML files, environment variables and overrides
//!
//! All schema types preserve unknown fields so newer writers' data survives
//! a round trip through an older reader.

pub mod config;
pub mod home;
pub mod io;
pub mod logging;
pub mod schema;
pub mod store;

pub use config::{Config, ConfigOverrides, StorageConfig, resolve_config, resolve_user_config};
pub use io::{ErrorKind, StorageError};
pub use schema::{JsonFormat, Todo};
pub use store::{HealthReport, TodoStorage};

// Re-export toml for callers building config tables
pub use toml;
