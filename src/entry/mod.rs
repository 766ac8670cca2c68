//! Datastore entries
//!
//! A [`DatastoreEntry`] owns one backend adapter and the databases
//! declared under it. `bootstrap` provisions and opens every database and
//! starts the health checker; `interrupt` stops the checker and closes
//! everything.

mod builder;
mod plugin;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::backend::{
    BackendAdapter, BackendKind, ClickHouseAdapter, MongoAdapter, MySqlAdapter, PostgresAdapter,
    RedisAdapter, SqlServerAdapter, SqliteAdapter,
};
use crate::error::{BackendError, EntryError, Stage};
use crate::health::{HealthChecker, HealthMonitor, HealthReport, Probe, ProbeResult};
use crate::logging::EntryLogger;

pub use self::builder::EntryBuilder;
pub use self::plugin::{ConnectionPlugin, InitStatements};

pub type MySqlEntry = DatastoreEntry<MySqlAdapter>;
pub type PostgresEntry = DatastoreEntry<PostgresAdapter>;
pub type SqliteEntry = DatastoreEntry<SqliteAdapter>;
pub type SqlServerEntry = DatastoreEntry<SqlServerAdapter>;
pub type ClickHouseEntry = DatastoreEntry<ClickHouseAdapter>;
pub type MongoEntry = DatastoreEntry<MongoAdapter>;
pub type RedisEntry = DatastoreEntry<RedisAdapter>;

/// Placeholder for backends without per-database options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct NoOptions {}

/// One database under an entry.
#[derive(Debug, Clone, Default)]
pub struct SubDatabase<O = NoOptions> {
    pub name: String,
    /// Never touch the network for this database.
    pub dry_run: bool,
    pub auto_create: bool,
    pub params: Vec<String>,
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub options: O,
}

impl<O: Default> SubDatabase<O> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    pub fn params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn options(mut self, options: O) -> Self {
        self.options = options;
        self
    }
}

/// An opened database. Dry-run connections hold a lazy handle and are
/// never probed.
#[derive(Debug, Clone)]
pub struct Connection<H> {
    pub handle: H,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Constructed,
    Bootstrapped,
    Interrupted,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Constructed => "Constructed",
            LifecycleState::Bootstrapped => "Bootstrapped",
            LifecycleState::Interrupted => "Interrupted",
        };
        f.write_str(s)
    }
}

/// Type-erased view of an entry, as stored in a registry.
#[async_trait]
pub trait Entry: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    fn entry_type(&self) -> &'static str {
        self.kind().entry_type()
    }

    fn description(&self) -> &str;

    async fn state(&self) -> LifecycleState;

    /// Provision and open every database, then start health checks.
    /// Only valid once, from [`LifecycleState::Constructed`].
    async fn bootstrap(&self) -> Result<(), EntryError>;

    /// Stop health checks and close every database. Calling it again is a
    /// no-op.
    async fn interrupt(&self);

    async fn is_healthy(&self) -> bool;

    async fn health_report(&self) -> HealthReport;

    /// Summary without secrets.
    async fn describe(&self) -> serde_json::Value;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// State shared with the health checker task.
pub(crate) struct EntryCore<A: BackendAdapter> {
    name: String,
    adapter: A,
    logger: EntryLogger,
    connections: RwLock<HashMap<String, Connection<A::Handle>>>,
}

impl<A: BackendAdapter> EntryCore<A> {
    async fn probe_all(&self) -> Vec<ProbeResult> {
        let live: Vec<(String, A::Handle)> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, conn)| !conn.dry_run)
            .map(|(name, conn)| (name.clone(), conn.handle.clone()))
            .collect();

        let probes = live.iter().map(|(database, handle)| async move {
            let start = Instant::now();
            let outcome = self.adapter.ping(handle).await;
            ProbeResult {
                database: database.clone(),
                healthy: outcome.is_ok(),
                elapsed_ms: start.elapsed().as_millis() as u64,
                error: outcome.err().map(|e| e.to_string()),
            }
        });

        let mut results = join_all(probes).await;
        results.sort_by(|a, b| a.database.cmp(&b.database));
        results
    }

    async fn report(&self) -> HealthReport {
        HealthReport {
            entry: self.name.clone(),
            checked_at: Utc::now(),
            databases: self.probe_all().await,
        }
    }
}

#[async_trait]
impl<A: BackendAdapter> Probe for EntryCore<A> {
    fn entry_name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> HealthReport {
        self.logger
            .scope(&self.name, self.adapter.kind(), self.report())
            .await
    }
}

struct Lifecycle {
    state: LifecycleState,
    monitor: Option<HealthMonitor>,
}

/// Lifecycle controller for one backend entry.
pub struct DatastoreEntry<A: BackendAdapter> {
    core: Arc<EntryCore<A>>,
    description: String,
    databases: Vec<SubDatabase<A::DbOptions>>,
    plugins: Vec<Arc<dyn ConnectionPlugin<A::Handle>>>,
    health_interval: Option<Duration>,
    lifecycle: Mutex<Lifecycle>,
}

impl<A: BackendAdapter> DatastoreEntry<A> {
    pub fn builder(name: impl Into<String>, adapter: A) -> EntryBuilder<A> {
        EntryBuilder::new(name, adapter)
    }

    pub fn adapter(&self) -> &A {
        &self.core.adapter
    }

    pub fn databases(&self) -> &[SubDatabase<A::DbOptions>] {
        &self.databases
    }

    pub fn health_interval(&self) -> Option<Duration> {
        self.health_interval
    }

    pub fn logger(&self) -> &EntryLogger {
        &self.core.logger
    }

    /// Handle for `database`, if it was opened. Dry-run databases only
    /// have one when the driver supports lazy handles.
    pub async fn get_connection(&self, database: &str) -> Option<A::Handle> {
        self.core
            .connections
            .read()
            .await
            .get(database)
            .map(|conn| conn.handle.clone())
    }

    pub async fn is_dry_run(&self, database: &str) -> Option<bool> {
        self.core
            .connections
            .read()
            .await
            .get(database)
            .map(|conn| conn.dry_run)
    }

    pub async fn connection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.core.connections.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_health_check_running(&self) -> bool {
        self.lifecycle
            .lock()
            .await
            .monitor
            .as_ref()
            .is_some_and(HealthMonitor::is_running)
    }

    fn backend_error(&self, database: &str, stage: Stage, source: BackendError) -> EntryError {
        EntryError::Backend {
            entry: self.core.name.clone(),
            kind: self.core.adapter.kind(),
            database: database.to_string(),
            target: self.core.adapter.target(),
            stage,
            source,
        }
    }

    async fn bootstrap_inner(&self) -> Result<(), EntryError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != LifecycleState::Constructed {
            return Err(EntryError::InvalidTransition {
                entry: self.core.name.clone(),
                kind: self.core.adapter.kind(),
                action: "bootstrap",
                from: lifecycle.state,
            });
        }

        tracing::info!("Bootstrap {} {}", self.entry_type(), self.core.name);

        let mut opened: Vec<(String, Connection<A::Handle>)> = Vec::with_capacity(self.databases.len());
        for db in &self.databases {
            match self.open_database(db).await {
                Ok(Some(conn)) => opened.push((db.name.clone(), conn)),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("{}", e);
                    self.rollback(opened).await;
                    return Err(e);
                }
            }
        }

        *self.core.connections.write().await = opened.into_iter().collect();
        lifecycle.state = LifecycleState::Bootstrapped;

        if let Some(period) = self.health_interval {
            let target: Arc<dyn Probe> = self.core.clone();
            lifecycle.monitor = Some(HealthChecker::new(target, period).spawn());
        }

        tracing::info!("Bootstrap {} {} successful", self.entry_type(), self.core.name);
        Ok(())
    }

    async fn open_database(
        &self,
        db: &SubDatabase<A::DbOptions>,
    ) -> Result<Option<Connection<A::Handle>>, EntryError> {
        let adapter = &self.core.adapter;
        let spec = adapter
            .build_connection_spec(db)
            .map_err(|e| self.backend_error(&db.name, Stage::Spec, e))?;

        if db.dry_run {
            tracing::info!("Database [{}] is in dry-run mode, not connecting", db.name);
            let handle = adapter
                .open_offline(db, spec)
                .map_err(|e| self.backend_error(&db.name, Stage::Open, e))?;
            return Ok(handle.map(|handle| Connection {
                handle,
                dry_run: true,
            }));
        }

        if db.auto_create {
            tracing::info!("Creating database [{}] if missing", db.name);
            adapter
                .provision_if_missing(db, &spec)
                .await
                .map_err(|e| self.backend_error(&db.name, Stage::Provision, e))?;
            tracing::info!("Creating database [{}] if missing successful", db.name);
        }

        tracing::info!("Connecting to database [{}]", db.name);
        let handle = adapter
            .open(db, spec)
            .await
            .map_err(|e| self.backend_error(&db.name, Stage::Open, e))?;

        for plugin in &self.plugins {
            if let Err(e) = plugin.on_open(&db.name, &handle, &self.core.logger).await {
                if let Err(close_err) = adapter.close(handle.clone()).await {
                    tracing::warn!("Failed to close database [{}]: {}", db.name, close_err);
                }
                let source = BackendError::Plugin {
                    plugin: plugin.name().to_string(),
                    reason: e.to_string(),
                };
                return Err(self.backend_error(&db.name, Stage::Open, source));
            }
        }

        tracing::info!("Connecting to database [{}] successful", db.name);
        Ok(Some(Connection {
            handle,
            dry_run: false,
        }))
    }

    /// Undo a partial bootstrap.
    async fn rollback(&self, opened: Vec<(String, Connection<A::Handle>)>) {
        for (database, conn) in opened {
            if let Err(e) = self.core.adapter.close(conn.handle).await {
                tracing::warn!("Failed to close database [{}] during rollback: {}", database, e);
            }
        }
        if let Err(e) = self.core.adapter.shutdown().await {
            tracing::warn!("Failed to release {} {} during rollback: {}", self.entry_type(), self.core.name, e);
        }
    }

    async fn interrupt_inner(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == LifecycleState::Interrupted {
            tracing::debug!("{} {} already interrupted", self.entry_type(), self.core.name);
            return;
        }

        tracing::info!("Interrupt {} {}", self.entry_type(), self.core.name);

        if let Some(monitor) = lifecycle.monitor.take() {
            monitor.stop().await;
        }

        let connections = std::mem::take(&mut *self.core.connections.write().await);
        for (database, conn) in connections {
            match self.core.adapter.close(conn.handle).await {
                Ok(()) => tracing::info!("Closed database [{}]", database),
                Err(e) => {
                    let err = self.backend_error(&database, Stage::Close, e);
                    tracing::warn!("{}", err);
                }
            }
        }

        if let Err(e) = self.core.adapter.shutdown().await {
            tracing::warn!("Failed to release {} {}: {}", self.entry_type(), self.core.name, e);
        }

        lifecycle.state = LifecycleState::Interrupted;
    }
}

#[async_trait]
impl<A: BackendAdapter> Entry for DatastoreEntry<A> {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn kind(&self) -> BackendKind {
        self.core.adapter.kind()
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn state(&self) -> LifecycleState {
        self.lifecycle.lock().await.state
    }

    async fn bootstrap(&self) -> Result<(), EntryError> {
        self.core
            .logger
            .scope(&self.core.name, self.kind(), self.bootstrap_inner())
            .await
    }

    async fn interrupt(&self) {
        self.core
            .logger
            .scope(&self.core.name, self.kind(), self.interrupt_inner())
            .await
    }

    async fn is_healthy(&self) -> bool {
        self.core.probe_all().await.iter().all(|r| r.healthy)
    }

    async fn health_report(&self) -> HealthReport {
        self.core.report().await
    }

    async fn describe(&self) -> serde_json::Value {
        let state = self.state().await;
        let databases: Vec<serde_json::Value> = self
            .databases
            .iter()
            .map(|db| {
                serde_json::json!({
                    "name": db.name,
                    "dryRun": db.dry_run,
                    "autoCreate": db.auto_create,
                    "params": db.params,
                })
            })
            .collect();

        serde_json::json!({
            "name": self.core.name,
            "type": self.entry_type(),
            "description": self.description,
            "state": state.to_string(),
            "address": self.core.adapter.address(),
            "user": self.core.adapter.user(),
            "target": self.core.adapter.target(),
            "healthCheckIntervalMs": self.health_interval.map(|d| d.as_millis() as u64),
            "databases": databases,
            "plugins": self.plugins.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
        })
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
