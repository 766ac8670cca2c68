//! SQL Server backend
//!
//! tiberius has no pool; a database handle is a single client behind a
//! mutex.

use std::sync::Arc;

use async_trait::async_trait;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::{parse_bool, quote_ident, split_host_port, split_param, BackendAdapter, BackendKind, Credentials};
use crate::entry::{NoOptions, SubDatabase};
use crate::error::BackendError;

pub const DEFAULT_USER: &str = "sa";
pub const DEFAULT_PASS: &str = "pass";
pub const DEFAULT_ADDR: &str = "localhost:1433";
const DEFAULT_PORT: u16 = 1433;
const ADMIN_DATABASE: &str = "master";

pub type SqlServerClient = Arc<Mutex<Client<Compat<TcpStream>>>>;

#[derive(Debug, Clone)]
pub struct SqlServerSpec {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub encryption: Option<EncryptionLevel>,
    pub trust_cert: bool,
    pub application_name: Option<String>,
    pub ignored: Vec<String>,
}

pub struct SqlServerAdapter {
    credentials: Credentials,
}

impl SqlServerAdapter {
    pub fn new(user: &str, pass: &str, addr: &str) -> Self {
        Self {
            credentials: Credentials::with_defaults(user, pass, addr, (DEFAULT_USER, DEFAULT_PASS, DEFAULT_ADDR)),
        }
    }

    fn config(&self, spec: &SqlServerSpec, database: &str) -> Config {
        let mut config = Config::new();
        config.host(&spec.host);
        config.port(spec.port);
        config.database(database);
        config.authentication(AuthMethod::sql_server(
            &self.credentials.user,
            self.credentials.pass.expose(),
        ));
        if let Some(level) = spec.encryption {
            config.encryption(level);
        }
        if spec.trust_cert {
            config.trust_cert();
        }
        if let Some(name) = &spec.application_name {
            config.application_name(name);
        }
        config
    }

    /// Connect, following one routing redirect (Azure SQL gateways).
    async fn connect(&self, mut config: Config) -> Result<Client<Compat<TcpStream>>, BackendError> {
        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;

        match Client::connect(config.clone(), tcp.compat_write()).await {
            Ok(client) => Ok(client),
            Err(tiberius::error::Error::Routing { host, port }) => {
                tracing::info!("SQL Server redirected connection to {}:{}", host, port);
                config.host(&host);
                config.port(port);
                let tcp = TcpStream::connect(config.get_addr()).await?;
                tcp.set_nodelay(true)?;
                Ok(Client::connect(config, tcp.compat_write()).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_encryption(param: &str, value: &str) -> Result<EncryptionLevel, BackendError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "required" | "strict" => Ok(EncryptionLevel::Required),
        "on" => Ok(EncryptionLevel::On),
        "false" | "off" | "optional" => Ok(EncryptionLevel::Off),
        "disable" | "notsupported" => Ok(EncryptionLevel::NotSupported),
        _ => Err(BackendError::InvalidParam {
            param: param.to_string(),
            reason: format!("unknown encryption level {}", value),
        }),
    }
}

#[async_trait]
impl BackendAdapter for SqlServerAdapter {
    type DbOptions = NoOptions;
    type Spec = SqlServerSpec;
    type Handle = SqlServerClient;

    fn kind(&self) -> BackendKind {
        BackendKind::SqlServer
    }

    fn address(&self) -> String {
        self.credentials.addr.clone()
    }

    fn user(&self) -> Option<&str> {
        Some(&self.credentials.user)
    }

    fn build_connection_spec(&self, db: &SubDatabase) -> Result<SqlServerSpec, BackendError> {
        let (host, port) = split_host_port(&self.credentials.addr, DEFAULT_PORT)?;
        let mut spec = SqlServerSpec {
            host,
            port,
            database: db.name.clone(),
            encryption: None,
            trust_cert: false,
            application_name: None,
            ignored: Vec::new(),
        };

        for param in &db.params {
            let (key, value) = split_param(param)?;
            match key.to_ascii_lowercase().as_str() {
                "encrypt" => spec.encryption = Some(parse_encryption(param, value)?),
                "trustservercertificate" => spec.trust_cert = parse_bool(param, value)?,
                "app name" | "app_name" | "application name" => {
                    spec.application_name = Some(value.to_string())
                }
                _ => {
                    tracing::warn!("Ignoring unsupported SQL Server param {} for database [{}]", param, db.name);
                    spec.ignored.push(param.clone());
                }
            }
        }

        Ok(spec)
    }

    async fn provision_if_missing(&self, db: &SubDatabase, spec: &SqlServerSpec) -> Result<(), BackendError> {
        let ddl = format!(
            "IF NOT EXISTS (SELECT * FROM sys.databases WHERE name = @P1) CREATE DATABASE {}",
            quote_ident(&db.name, '[', ']')
        );

        let mut client = self.connect(self.config(spec, ADMIN_DATABASE)).await?;
        let created = client.execute(ddl.as_str(), &[&db.name.as_str()]).await;
        let closed = client.close().await;
        created?;
        closed?;
        Ok(())
    }

    async fn open(&self, _db: &SubDatabase, spec: SqlServerSpec) -> Result<SqlServerClient, BackendError> {
        let client = self.connect(self.config(&spec, &spec.database)).await?;
        let handle = Arc::new(Mutex::new(client));
        self.ping(&handle).await?;
        Ok(handle)
    }

    async fn ping(&self, client: &SqlServerClient) -> Result<(), BackendError> {
        let mut client = client.lock().await;
        client.simple_query("SELECT 1").await?.into_results().await?;
        Ok(())
    }

    async fn close(&self, client: SqlServerClient) -> Result<(), BackendError> {
        match release(client) {
            Some(client) => Ok(client.close().await?),
            None => Ok(()),
        }
    }
}

/// Take sole ownership of a shared client. Returns `None` and drops this
/// handle when clones are still alive, leaving the connection open.
fn release<T>(client: Arc<Mutex<T>>) -> Option<T> {
    match Arc::try_unwrap(client) {
        Ok(client) => Some(client.into_inner()),
        Err(shared) => {
            tracing::warn!(
                "SQL Server client still held by {} other handle(s), connection left open",
                Arc::strong_count(&shared) - 1
            );
            None
        }
    }
}
