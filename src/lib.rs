//! datastore-entry - YAML-configured database entries
//!
//! Each entry wraps one backend (MySQL, PostgreSQL, SQLite, SQL Server,
//! ClickHouse, MongoDB, Redis): it is selected by domain from the boot
//! file, registered by name, bootstrapped (optionally creating missing
//! databases), health-checked in the background and interrupted on
//! shutdown.

pub mod backend;
pub mod boot;
pub mod config;
pub mod entry;
pub mod error;
pub mod health;
pub mod logging;
pub mod registry;

pub use crate::backend::{BackendAdapter, BackendKind};
pub use crate::boot::register_entries;
pub use crate::config::{BootConfig, RuntimeEnv, Settings};
pub use crate::entry::{
    ClickHouseEntry, DatastoreEntry, Entry, LifecycleState, MongoEntry, MySqlEntry, PostgresEntry, RedisEntry,
    SqlServerEntry, SqliteEntry, SubDatabase,
};
pub use crate::error::{BackendError, ConfigError, EntryError};
pub use crate::registry::{get_entry, InMemoryRegistry, Registry};
