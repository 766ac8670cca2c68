//! ClickHouse backend (HTTP interface)

use async_trait::async_trait;
use clickhouse::Client;

use super::{quote_ident, split_host_port, split_param, BackendAdapter, BackendKind, Credentials};
use crate::entry::{NoOptions, SubDatabase};
use crate::error::BackendError;

pub const DEFAULT_USER: &str = "default";
pub const DEFAULT_PASS: &str = "";
pub const DEFAULT_ADDR: &str = "localhost:8123";
const DEFAULT_PORT: u16 = 8123;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickHouseSpec {
    pub url: String,
    pub database: String,
    /// ClickHouse settings sent with every query.
    pub settings: Vec<(String, String)>,
}

pub struct ClickHouseAdapter {
    credentials: Credentials,
    scheme: String,
}

impl ClickHouseAdapter {
    pub fn new(user: &str, pass: &str, addr: &str) -> Self {
        Self {
            credentials: Credentials::with_defaults(user, pass, addr, (DEFAULT_USER, DEFAULT_PASS, DEFAULT_ADDR)),
            scheme: "http".to_string(),
        }
    }

    /// `http` (default) or `https`.
    pub fn with_protocol(mut self, protocol: &str) -> Self {
        if !protocol.is_empty() {
            self.scheme = protocol.to_ascii_lowercase();
        }
        self
    }

    fn client(&self, spec: &ClickHouseSpec, database: Option<&str>) -> Client {
        let mut client = Client::default()
            .with_url(&spec.url)
            .with_user(&self.credentials.user);
        if !self.credentials.pass.is_empty() {
            client = client.with_password(self.credentials.pass.expose());
        }
        if let Some(database) = database {
            client = client.with_database(database);
        }
        for (key, value) in &spec.settings {
            client = client.with_option(key, value);
        }
        client
    }
}

#[async_trait]
impl BackendAdapter for ClickHouseAdapter {
    type DbOptions = NoOptions;
    type Spec = ClickHouseSpec;
    type Handle = Client;

    fn kind(&self) -> BackendKind {
        BackendKind::ClickHouse
    }

    fn address(&self) -> String {
        self.credentials.addr.clone()
    }

    fn user(&self) -> Option<&str> {
        Some(&self.credentials.user)
    }

    fn build_connection_spec(&self, db: &SubDatabase) -> Result<ClickHouseSpec, BackendError> {
        let url = match self.credentials.addr.split_once("://") {
            Some(_) => self.credentials.addr.clone(),
            None => {
                if self.scheme != "http" && self.scheme != "https" {
                    return Err(BackendError::InvalidAddress {
                        addr: self.credentials.addr.clone(),
                        reason: format!("unsupported protocol {}", self.scheme),
                    });
                }
                let (host, port) = split_host_port(&self.credentials.addr, DEFAULT_PORT)?;
                if host.contains(':') {
                    format!("{}://[{}]:{}", self.scheme, host, port)
                } else {
                    format!("{}://{}:{}", self.scheme, host, port)
                }
            }
        };

        let settings = db
            .params
            .iter()
            .map(|p| split_param(p).map(|(k, v)| (k.to_string(), v.to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ClickHouseSpec {
            url,
            database: db.name.clone(),
            settings,
        })
    }

    async fn provision_if_missing(&self, db: &SubDatabase, spec: &ClickHouseSpec) -> Result<(), BackendError> {
        let ddl = format!("CREATE DATABASE IF NOT EXISTS {}", quote_ident(&db.name, '`', '`'));
        self.client(spec, None).query(&ddl).execute().await?;
        Ok(())
    }

    async fn open(&self, _db: &SubDatabase, spec: ClickHouseSpec) -> Result<Client, BackendError> {
        let client = self.client(&spec, Some(&spec.database));
        self.ping(&client).await?;
        Ok(client)
    }

    /// The HTTP client only connects when a query runs.
    fn open_offline(&self, _db: &SubDatabase, spec: ClickHouseSpec) -> Result<Option<Client>, BackendError> {
        Ok(Some(self.client(&spec, Some(&spec.database))))
    }

    async fn ping(&self, client: &Client) -> Result<(), BackendError> {
        client.query("SELECT 1").execute().await?;
        Ok(())
    }

    async fn close(&self, _client: Client) -> Result<(), BackendError> {
        Ok(())
    }
}
