//! Database and feed configuration

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::fmt;
use std::time::Duration;

use crate::error::{IngestError, Result};

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_DB_PORT: u16 = 5432;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_FEED_ENDPOINT: &str =
    "https://webapplicaties.agro.nl/DownloadMutationFile/EPBDDownloadMutationFile.asmx";
pub const DEFAULT_SOAP_ACTION: &str =
    "http://schemas.ep-online.nl/EpbdDownloadMutationFileService/DownloadMutationFile";
pub const DEFAULT_FEED_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_SECS: u64 = 2;
pub const DEFAULT_USER_AGENT: &str = concat!("EPBD-Ingest/", env!("CARGO_PKG_VERSION"));

/// Records per transaction in a full-refresh load
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Yesterday in local time. Today's mutation file is not published until tomorrow.
pub fn default_mutation_date() -> NaiveDate {
    let today = Local::now().date_naive();
    today.pred_opt().unwrap_or(today)
}

/// Whether `name` may be interpolated into SQL as a schema or table name
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ============================================================================
// Database
// ============================================================================

#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    /// Empty means no password (peer or trust authentication)
    pub password: String,
    pub schema: String,
    pub table: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_DB_PORT,
            dbname: String::new(),
            user: String::new(),
            password: String::new(),
            schema: "public".to_string(),
            table: String::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("schema", &self.schema)
            .field("table", &self.table)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn new(
        host: impl Into<String>,
        dbname: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            dbname: dbname.into(),
            schema: schema.into(),
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// `schema.table`
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(IngestError::Config("Database host cannot be empty".to_string()));
        }
        if self.dbname.is_empty() {
            return Err(IngestError::Config("Database name cannot be empty".to_string()));
        }
        if self.user.is_empty() {
            return Err(IngestError::Config("Database user cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(IngestError::Config("Database port must be greater than 0".to_string()));
        }
        if self.max_connections == 0 {
            return Err(IngestError::Config(
                "Database pool size must be greater than 0".to_string(),
            ));
        }
        for (what, name) in [("schema", &self.schema), ("table", &self.table)] {
            if !is_valid_identifier(name) {
                return Err(IngestError::Config(format!(
                    "Invalid {} name '{}': use letters, digits and underscores",
                    what, name
                )));
            }
        }
        Ok(())
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.dbname)
            .username(&self.user);

        if self.password.is_empty() {
            options
        } else {
            options.password(&self.password)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// ============================================================================
// Feed
// ============================================================================

#[derive(Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// SOAP endpoint of the download service
    pub endpoint: String,
    pub soap_action: String,
    pub username: String,
    pub password: String,
    /// HTTP timeout per request
    pub timeout_secs: u64,
    /// Attempts per request, including the first
    pub max_retries: u32,
    /// First backoff; doubles on every retry
    pub retry_backoff_secs: u64,
    pub user_agent: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_FEED_ENDPOINT.to_string(),
            soap_action: DEFAULT_SOAP_ACTION.to_string(),
            username: String::new(),
            password: String::new(),
            timeout_secs: DEFAULT_FEED_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_secs: DEFAULT_RETRY_BACKOFF_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedConfig")
            .field("endpoint", &self.endpoint)
            .field("soap_action", &self.soap_action)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_secs", &self.retry_backoff_secs)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl FeedConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff_secs(mut self, secs: u64) -> Self {
        self.retry_backoff_secs = secs;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(IngestError::Config("Feed endpoint cannot be empty".to_string()));
        }
        if self.username.is_empty() || self.password.is_empty() {
            return Err(IngestError::Config(
                "Feed username and password are required".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(IngestError::Config("Feed timeout must be greater than 0".to_string()));
        }
        if self.max_retries == 0 {
            return Err(IngestError::Config("Feed max_retries must be at least 1".to_string()));
        }
        Ok(())
    }
}
