//! Redis backend
//!
//! An entry holds a single logical database, registered as `db<index>`.
//! A master name selects sentinel mode, several addresses select cluster
//! mode, otherwise a single managed connection is used.

use std::time::Duration;

use ::redis::aio::{ConnectionLike, ConnectionManager, ConnectionManagerConfig, MultiplexedConnection};
use ::redis::cluster::ClusterClient;
use ::redis::cluster_async::ClusterConnection;
use ::redis::sentinel::{Sentinel, SentinelNodeConnectionInfo};
use ::redis::{Arg, Cmd, ConnectionAddr, ConnectionInfo, Pipeline, RedisConnectionInfo, RedisFuture, Value};
use async_trait::async_trait;
use tracing::Instrument;

use super::{split_host_port, BackendAdapter, BackendKind};
use crate::config::RedisSection;
use crate::entry::{NoOptions, RedisEntry, SubDatabase};
use crate::error::BackendError;

pub const DEFAULT_ADDR: &str = "localhost:6379";
const DEFAULT_PORT: u16 = 6379;

#[derive(Debug, Clone)]
pub enum RedisMode {
    Single(ConnectionInfo),
    Cluster(Vec<ConnectionInfo>),
    Sentinel {
        sentinels: Vec<ConnectionInfo>,
        master: String,
        node: RedisConnectionInfo,
    },
}

#[derive(Debug, Clone)]
pub struct RedisSpec {
    pub mode: RedisMode,
}

/// Connection for any of the three modes. Implements
/// [`ConnectionLike`], so it works with `redis::cmd(..).query_async`
/// and `AsyncCommands`.
#[derive(Clone)]
pub enum RedisConnection {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
    Sentinel(MultiplexedConnection),
}

impl ConnectionLike for RedisConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        let span = command_span(&command_name(cmd));
        let fut = match self {
            RedisConnection::Single(conn) => conn.req_packed_command(cmd),
            RedisConnection::Cluster(conn) => conn.req_packed_command(cmd),
            RedisConnection::Sentinel(conn) => conn.req_packed_command(cmd),
        };
        traced(span, fut)
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        let span = command_span(&format!("PIPELINE({})", count));
        let fut = match self {
            RedisConnection::Single(conn) => conn.req_packed_commands(cmd, offset, count),
            RedisConnection::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
            RedisConnection::Sentinel(conn) => conn.req_packed_commands(cmd, offset, count),
        };
        traced(span, fut)
    }

    fn get_db(&self) -> i64 {
        match self {
            RedisConnection::Single(conn) => conn.get_db(),
            RedisConnection::Cluster(conn) => conn.get_db(),
            RedisConnection::Sentinel(conn) => conn.get_db(),
        }
    }
}

/// First argument of a command, upper-cased. Keys and values are never
/// recorded.
fn command_name(cmd: &Cmd) -> String {
    match cmd.args_iter().next() {
        Some(Arg::Simple(name)) => String::from_utf8_lossy(name).to_ascii_uppercase(),
        _ => "UNKNOWN".to_string(),
    }
}

fn command_span(statement: &str) -> tracing::Span {
    tracing::info_span!(
        "redis",
        db.system = "redis",
        db.statement = %statement,
        error = tracing::field::Empty
    )
}

/// Run `fut` inside `span`, recording the error on failure.
fn traced<'a, T: Send + 'a>(span: tracing::Span, fut: RedisFuture<'a, T>) -> RedisFuture<'a, T> {
    let recorder = span.clone();
    Box::pin(
        async move {
            let result = fut.await;
            if let Err(e) = &result {
                recorder.record("error", tracing::field::display(e));
            }
            result
        }
        .instrument(span),
    )
}

pub struct RedisAdapter {
    section: RedisSection,
}

impl RedisAdapter {
    pub fn new(section: RedisSection) -> Self {
        Self { section }
    }

    /// Name the single database is registered under.
    pub fn database_name(&self) -> String {
        format!("db{}", self.section.db)
    }

    pub fn dry_run(&self) -> bool {
        self.section.dry_run
    }

    fn addrs(&self) -> Vec<String> {
        if self.section.addrs.is_empty() {
            vec![DEFAULT_ADDR.to_string()]
        } else {
            self.section.addrs.clone()
        }
    }

    fn non_empty(value: &str) -> Option<String> {
        (!value.is_empty()).then(|| value.to_string())
    }

    fn node_info(&self, db: i64) -> RedisConnectionInfo {
        RedisConnectionInfo {
            db,
            username: Self::non_empty(&self.section.user),
            password: Self::non_empty(&self.section.pass),
            ..Default::default()
        }
    }

    fn connection_info(addr: &str, redis: RedisConnectionInfo) -> Result<ConnectionInfo, BackendError> {
        let (host, port) = split_host_port(addr, DEFAULT_PORT)?;
        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(host, port),
            redis,
        })
    }

    fn manager_config(&self) -> ConnectionManagerConfig {
        let mut config = ConnectionManagerConfig::new();
        if let Some(retries) = self.section.max_retries {
            config = config.set_number_of_retries(retries);
        }
        if let Some(ms) = self.section.dial_timeout_ms {
            config = config.set_connection_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.section.read_timeout_ms {
            config = config.set_response_timeout(Duration::from_millis(ms));
        }
        config
    }

    async fn connect(&self, mode: RedisMode) -> Result<RedisConnection, BackendError> {
        match mode {
            RedisMode::Single(info) => {
                let client = ::redis::Client::open(info)?;
                let manager = ConnectionManager::new_with_config(client, self.manager_config()).await?;
                Ok(RedisConnection::Single(manager))
            }
            RedisMode::Cluster(nodes) => {
                let mut builder = ClusterClient::builder(nodes);
                if let Some(retries) = self.section.max_retries {
                    builder = builder.retries(retries as u32);
                }
                if let Some(ms) = self.section.dial_timeout_ms {
                    builder = builder.connection_timeout(Duration::from_millis(ms));
                }
                if let Some(ms) = self.section.read_timeout_ms {
                    builder = builder.response_timeout(Duration::from_millis(ms));
                }
                let conn = builder.build()?.get_async_connection().await?;
                Ok(RedisConnection::Cluster(conn))
            }
            RedisMode::Sentinel {
                sentinels,
                master,
                node,
            } => {
                let mut sentinel = Sentinel::build(sentinels)?;
                let node_info = SentinelNodeConnectionInfo {
                    tls_mode: None,
                    redis_connection_info: Some(node),
                };
                let client = sentinel.async_master_for(&master, Some(&node_info)).await?;
                let conn = client.get_multiplexed_async_connection().await?;
                Ok(RedisConnection::Sentinel(conn))
            }
        }
    }
}

#[async_trait]
impl BackendAdapter for RedisAdapter {
    type DbOptions = NoOptions;
    type Spec = RedisSpec;
    type Handle = RedisConnection;

    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    fn address(&self) -> String {
        self.addrs().join(",")
    }

    fn user(&self) -> Option<&str> {
        Some(self.section.user.as_str()).filter(|u| !u.is_empty())
    }

    fn build_connection_spec(&self, _db: &SubDatabase) -> Result<RedisSpec, BackendError> {
        let addrs = self.addrs();

        let mode = if !self.section.master_name.is_empty() {
            let sentinel_auth = RedisConnectionInfo {
                password: Self::non_empty(&self.section.sentinel_pass),
                ..Default::default()
            };
            let sentinels = addrs
                .iter()
                .map(|addr| Self::connection_info(addr, sentinel_auth.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            RedisMode::Sentinel {
                sentinels,
                master: self.section.master_name.clone(),
                node: self.node_info(self.section.db),
            }
        } else if addrs.len() > 1 {
            if self.section.db != 0 {
                tracing::warn!("Redis cluster ignores db {}, using db 0", self.section.db);
            }
            let nodes = addrs
                .iter()
                .map(|addr| Self::connection_info(addr, self.node_info(0)))
                .collect::<Result<Vec<_>, _>>()?;
            RedisMode::Cluster(nodes)
        } else {
            RedisMode::Single(Self::connection_info(&addrs[0], self.node_info(self.section.db))?)
        };

        Ok(RedisSpec { mode })
    }

    async fn provision_if_missing(&self, _db: &SubDatabase, _spec: &RedisSpec) -> Result<(), BackendError> {
        Ok(())
    }

    async fn open(&self, _db: &SubDatabase, spec: RedisSpec) -> Result<RedisConnection, BackendError> {
        let span = tracing::info_span!("redis.dial", db.system = "redis", addr = %self.address());
        async move {
            let conn = match self.section.dial_timeout_ms {
                Some(ms) => {
                    let limit = Duration::from_millis(ms);
                    tokio::time::timeout(limit, self.connect(spec.mode))
                        .await
                        .map_err(|_| BackendError::Timeout(limit))??
                }
                None => self.connect(spec.mode).await?,
            };
            self.ping(&conn).await?;
            Ok(conn)
        }
        .instrument(span)
        .await
    }

    async fn ping(&self, conn: &RedisConnection) -> Result<(), BackendError> {
        let mut conn = conn.clone();
        conn.req_packed_command(&::redis::cmd("PING")).await?;
        Ok(())
    }

    async fn close(&self, _conn: RedisConnection) -> Result<(), BackendError> {
        Ok(())
    }
}

impl RedisEntry {
    /// The entry's connection, once bootstrapped.
    pub async fn client(&self) -> Option<RedisConnection> {
        self.get_connection(&self.adapter().database_name()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(addrs: &[&str]) -> RedisSection {
        RedisSection {
            addrs: addrs.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_single_mode() {
        let adapter = RedisAdapter::new(RedisSection {
            db: 3,
            pass: "secret".to_string(),
            ..section(&[])
        });
        assert_eq!(adapter.database_name(), "db3");
        assert_eq!(adapter.address(), "localhost:6379");
        assert_eq!(adapter.target(), "localhost:6379");

        let spec = adapter.build_connection_spec(&SubDatabase::new("db3")).unwrap();
        match spec.mode {
            RedisMode::Single(info) => {
                assert!(matches!(info.addr, ConnectionAddr::Tcp(ref host, 6379) if host == "localhost"));
                assert_eq!(info.redis.db, 3);
                assert_eq!(info.redis.password.as_deref(), Some("secret"));
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_cluster_mode() {
        let adapter = RedisAdapter::new(section(&["r1:7000", "r2:7001", "r3"]));
        let spec = adapter.build_connection_spec(&SubDatabase::new("db0")).unwrap();
        match spec.mode {
            RedisMode::Cluster(nodes) => assert_eq!(nodes.len(), 3),
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_sentinel_mode() {
        let adapter = RedisAdapter::new(RedisSection {
            master_name: "mymaster".to_string(),
            sentinel_pass: "sentinel-secret".to_string(),
            user: "app".to_string(),
            db: 1,
            ..section(&["s1:26379", "s2:26379"])
        });
        assert_eq!(adapter.target(), "app:****@s1:26379,s2:26379");

        let spec = adapter.build_connection_spec(&SubDatabase::new("db1")).unwrap();
        match spec.mode {
            RedisMode::Sentinel {
                sentinels,
                master,
                node,
            } => {
                assert_eq!(sentinels.len(), 2);
                assert_eq!(sentinels[0].redis.password.as_deref(), Some("sentinel-secret"));
                assert_eq!(master, "mymaster");
                assert_eq!(node.db, 1);
                assert_eq!(node.username.as_deref(), Some("app"));
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_bad_address() {
        let adapter = RedisAdapter::new(section(&["redis-host:port"]));
        assert!(adapter.build_connection_spec(&SubDatabase::new("db0")).is_err());
    }

    #[test]
    fn test_command_name() {
        assert_eq!(command_name(::redis::cmd("get").arg("session:42")), "GET");
        assert_eq!(command_name(&::redis::cmd("PING")), "PING");
        assert_eq!(command_name(&Cmd::new()), "UNKNOWN");
    }

    #[tokio::test]
    async fn test_failed_command_recorded_on_span() {
        use tracing_subscriber::fmt::format::FmtSpan;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("redis.log");
        let file = std::fs::File::create(&path).unwrap();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let failing: RedisFuture<'_, Value> = Box::pin(async {
            Err(::redis::RedisError::from((::redis::ErrorKind::IoError, "connection reset")))
        });
        assert!(traced(command_span("GET"), failing).await.is_err());

        let ok: RedisFuture<'_, Value> = Box::pin(async { Ok(Value::Okay) });
        assert!(traced(command_span("SET"), ok).await.is_ok());

        let written = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("db.system=\"redis\""));
        assert!(lines[0].contains("db.statement=GET"));
        assert!(lines[0].contains("connection reset"));
        assert!(lines[1].contains("db.statement=SET"));
        assert!(!lines[1].contains("error="));
    }
}
