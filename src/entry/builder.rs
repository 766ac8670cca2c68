use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use super::{ConnectionPlugin, DatastoreEntry, EntryCore, Lifecycle, LifecycleState, SubDatabase};
use crate::backend::BackendAdapter;
use crate::logging::EntryLogger;

/// Assembles a [`DatastoreEntry`] in the `Constructed` state.
pub struct EntryBuilder<A: BackendAdapter> {
    name: String,
    adapter: A,
    description: Option<String>,
    databases: Vec<SubDatabase<A::DbOptions>>,
    plugins: Vec<Arc<dyn ConnectionPlugin<A::Handle>>>,
    health_interval: Option<Duration>,
    logger: EntryLogger,
}

impl<A: BackendAdapter> EntryBuilder<A> {
    pub fn new(name: impl Into<String>, adapter: A) -> Self {
        Self {
            name: name.into(),
            adapter,
            description: None,
            databases: Vec::new(),
            plugins: Vec::new(),
            health_interval: None,
            logger: EntryLogger::default(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        self.description = (!description.is_empty()).then_some(description);
        self
    }

    /// Databases with an empty or repeated name are skipped. A database
    /// without params gets the backend defaults.
    pub fn database(mut self, mut db: SubDatabase<A::DbOptions>) -> Self {
        if db.name.is_empty() {
            tracing::warn!("Skipping database with empty name in entry {}", self.name);
            return self;
        }
        if self.databases.iter().any(|d| d.name == db.name) {
            tracing::warn!(
                "Duplicate database [{}] in entry {}, keeping the first",
                db.name,
                self.name
            );
            return self;
        }
        if db.params.is_empty() {
            db.params = self
                .adapter
                .default_params()
                .iter()
                .map(|p| p.to_string())
                .collect();
        }
        self.databases.push(db);
        self
    }

    pub fn databases<I>(self, databases: I) -> Self
    where
        I: IntoIterator<Item = SubDatabase<A::DbOptions>>,
    {
        databases.into_iter().fold(self, Self::database)
    }

    pub fn plugin(mut self, plugin: Arc<dyn ConnectionPlugin<A::Handle>>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// A zero period disables the checker.
    pub fn health_check(mut self, period: Duration) -> Self {
        self.health_interval = (!period.is_zero()).then_some(period);
        self
    }

    pub fn logger(mut self, logger: EntryLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn build(self) -> DatastoreEntry<A> {
        let description = self.description.unwrap_or_else(|| {
            format!(
                "{} entry with name of {}, addr:{}, user:{}",
                self.adapter.kind().entry_type(),
                self.name,
                self.adapter.address(),
                self.adapter.user().unwrap_or_default()
            )
        });

        DatastoreEntry {
            core: Arc::new(EntryCore {
                name: self.name,
                adapter: self.adapter,
                logger: self.logger,
                connections: RwLock::new(HashMap::new()),
            }),
            description,
            databases: self.databases,
            plugins: self.plugins,
            health_interval: self.health_interval,
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Constructed,
                monitor: None,
            }),
        }
    }
}
