//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (MySQL/MariaDB recorder database).
    #[serde(default)]
    pub source: SourceConfig,

    /// Target database configuration (PostgreSQL).
    #[serde(default)]
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Source database (MySQL/MariaDB) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database host.
    #[serde(default)]
    pub host: String,

    /// Database port (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Database name.
    #[serde(default)]
    pub database: String,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    #[serde(default)]
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    #[serde(default)]
    pub database: String,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Target schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode: disable, require, verify-ca or verify-full (default: "disable").
    #[serde(default = "default_disable")]
    pub ssl_mode: String,
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Rows fetched and written per batch (default: 20000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Tables migrated concurrently (default: 4).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Extra pooled connections beyond `max_concurrency` for sequence
    /// correction, validation and progress bookkeeping (default: 2).
    #[serde(default = "default_pool_reserve")]
    pub pool_reserve: usize,

    /// Attempts per batch step before a table is marked failed (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// First backoff delay in milliseconds (default: 250).
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Backoff ceiling in milliseconds (default: 5000).
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Progress file location (default: "migration_progress.json").
    #[serde(default = "default_progress_file")]
    pub progress_file: PathBuf,
}

impl MigrationConfig {
    /// Connections each pool needs for the configured concurrency.
    pub fn pool_size(&self) -> usize {
        self.max_concurrency + self.pool_reserve
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_mysql_port(),
            database: String::new(),
            user: String::new(),
            password: String::new(),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_pg_port(),
            database: String::new(),
            user: String::new(),
            password: String::new(),
            schema: default_public_schema(),
            ssl_mode: default_disable(),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            pool_reserve: default_pool_reserve(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            progress_file: default_progress_file(),
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

// Default value functions for serde
fn default_mysql_port() -> u16 {
    3306
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_disable() -> String {
    "disable".to_string()
}

fn default_batch_size() -> usize {
    20_000
}

fn default_max_concurrency() -> usize {
    4
}

fn default_pool_reserve() -> usize {
    2
}

fn default_max_retries() -> usize {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_progress_file() -> PathBuf {
    PathBuf::from("migration_progress.json")
}
