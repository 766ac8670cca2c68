//! Configuration module

pub mod boot;
pub mod domain;

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::ConfigError;

pub use boot::{
    BootConfig, CommonSection, DatabaseSection, HealthCheckSection, LoggerSection, MongoAuthSection,
    MongoSection, RawEntry, RedisSection, SqlSection, SqliteSection,
};
pub use domain::{select_by_domain, Locale, RuntimeEnv, Scope, Scoped};

/// Runner settings. The entries themselves come from the boot file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_boot_file")]
    pub boot_file: PathBuf,
    /// Overrides the `DOMAIN` environment variable.
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            boot_file: default_boot_file(),
            domain: None,
            log_filter: default_log_filter(),
        }
    }
}

fn default_boot_file() -> PathBuf {
    PathBuf::from("boot.yaml")
}

fn default_log_filter() -> String {
    "datastore_entry=info,sqlx=warn".to_string()
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name("config/default").required(false))
            .add_source(::config::Environment::with_prefix("DATASTORE").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn runtime_env(&self) -> RuntimeEnv {
        let mut env = RuntimeEnv::from_env();
        if let Some(domain) = self.domain.as_ref().filter(|d| !d.is_empty()) {
            env.domain = domain.clone();
        }
        env
    }
}
