//! PostgreSQL target writer.
//!
//! Batches are written through a per-transaction staging table: rows are
//! COPYed in text format into a temp table that drops on commit, then moved
//! with `INSERT .. SELECT .. ON CONFLICT DO NOTHING`. The COPY row count is
//! what the target received; the INSERT row count is what it kept.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use futures::SinkExt;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use super::tls::{make_connector, SslMode};
use crate::config::TargetConfig;
use crate::core::{Row, SqlValue, TableSpec, TargetWriter, WriteOutcome};
use crate::error::{MigrateError, Result};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// PostgreSQL target writer.
pub struct PostgresWriter {
    pool: Pool,
    schema: String,
}

impl PostgresWriter {
    /// Connect a pool of at most `max_conns` connections and test it.
    pub async fn new(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("hass-pg-migrate");

        // Connection options for reliability
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match make_connector(SslMode::parse(&config.ssl_mode)?)? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
            }
        };
        let pool = Pool::builder(mgr)
            .max_size(max_conns)
            .build()
            .map_err(|e| MigrateError::pool(e, "creating PostgreSQL target pool"))?;

        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "testing PostgreSQL target connection"))?;
        client.simple_query("SELECT 1").await?;

        info!("Connected to PostgreSQL target: {}", config.describe());

        Ok(Self {
            pool,
            schema: config.schema.clone(),
        })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "getting PostgreSQL connection"))
    }

    /// Quote a PostgreSQL identifier.
    fn quote_ident(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn qualify(&self, table: &str) -> String {
        format!("{}.{}", Self::quote_ident(&self.schema), Self::quote_ident(table))
    }

    fn staging_name(table: &str) -> String {
        Self::quote_ident(&format!("_staging_{}", table))
    }

    fn column_list(spec: &TableSpec) -> String {
        spec.columns
            .iter()
            .map(|c| Self::quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn insert_ignore_sql(&self, spec: &TableSpec) -> String {
        let columns = Self::column_list(spec);
        format!(
            "INSERT INTO {} ({}) SELECT {} FROM {} ON CONFLICT ({}) DO NOTHING",
            self.qualify(&spec.name),
            columns,
            columns,
            Self::staging_name(&spec.name),
            Self::quote_ident(&spec.key_column)
        )
    }
}

#[async_trait]
impl TargetWriter for PostgresWriter {
    async fn insert_ignore(&self, spec: &TableSpec, rows: &[Row]) -> Result<WriteOutcome> {
        if rows.is_empty() {
            return Ok(WriteOutcome::default());
        }

        let mut client = self.client().await?;
        let tx = client.transaction().await?;

        // naive timestamps are UTC, also for timestamptz columns
        tx.batch_execute(&format!(
            "SET LOCAL TIME ZONE 'UTC'; \
             CREATE TEMP TABLE {} (LIKE {} INCLUDING DEFAULTS) ON COMMIT DROP",
            Self::staging_name(&spec.name),
            self.qualify(&spec.name)
        ))
        .await?;

        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT TEXT)",
            Self::staging_name(&spec.name),
            Self::column_list(spec)
        );
        let sink = tx.copy_in(&copy_sql).await?;
        tokio::pin!(sink);
        sink.send(bytes::Bytes::from(encode_copy_text(rows))).await?;
        let received = sink.as_mut().finish().await?;

        let inserted = tx.execute(&self.insert_ignore_sql(spec), &[]).await?;
        tx.commit().await?;

        debug!(
            "{}: copied {} rows, inserted {}",
            spec.name, received, inserted
        );
        Ok(WriteOutcome { received, inserted })
    }

    async fn max_value(&self, table: &str, column: &str) -> Result<Option<i64>> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT MAX({})::int8 FROM {}",
            Self::quote_ident(column),
            self.qualify(table)
        );
        let row = client.query_one(&sql, &[]).await?;
        Ok(row.get::<_, Option<i64>>(0))
    }

    async fn set_sequence(&self, table: &str, column: &str, next: i64) -> Result<Option<String>> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT pg_get_serial_sequence($1, $2)",
                &[&self.qualify(table), &column],
            )
            .await?;
        let Some(sequence) = row.get::<_, Option<String>>(0) else {
            debug!("{}.{}: no sequence", table, column);
            return Ok(None);
        };

        // is_called=false: the next nextval() returns exactly `next`
        client
            .query_one(
                "SELECT setval($1::text::regclass, $2::int8, false)",
                &[&sequence, &next],
            )
            .await?;
        Ok(Some(sequence))
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let client = self.client().await?;
        let sql = format!("SELECT COUNT(*)::int8 FROM {}", self.qualify(table));
        let row = client.query_one(&sql, &[]).await?;
        Ok(row.get::<_, i64>(0))
    }

    async fn truncate(&self, tables: &[String]) -> Result<()> {
        if tables.is_empty() {
            return Ok(());
        }
        let client = self.client().await?;
        let list = tables
            .iter()
            .map(|t| self.qualify(t))
            .collect::<Vec<_>>()
            .join(", ");
        client
            .batch_execute(&format!("TRUNCATE TABLE {} RESTART IDENTITY", list))
            .await?;
        info!("Truncated {} target tables", tables.len());
        Ok(())
    }

    async fn test_connection(&self) -> Result<()> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// Encode rows as COPY text: tab-separated, newline-terminated, `\N` for NULL.
fn encode_copy_text(rows: &[Row]) -> String {
    let mut buf = String::with_capacity(rows.len() * 128);
    for row in rows {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                buf.push('\t');
            }
            buf.push_str(&value_to_text(value));
        }
        buf.push('\n');
    }
    buf
}

/// Convert a value to its COPY text form.
fn value_to_text(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "\\N".to_string(),
        SqlValue::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        SqlValue::I16(i) => i.to_string(),
        SqlValue::I32(i) => i.to_string(),
        SqlValue::I64(i) => i.to_string(),
        SqlValue::F32(f) => float_to_text(f64::from(*f)),
        SqlValue::F64(f) => float_to_text(*f),
        SqlValue::Decimal(d) => d.to_string(),
        SqlValue::Text(s) => escape_copy_text(s),
        SqlValue::Bytes(b) => format!("\\\\x{}", hex::encode(b)),
        SqlValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        SqlValue::DateTimeOffset(dto) => dto.format("%Y-%m-%d %H:%M:%S%.f%:z").to_string(),
        SqlValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        SqlValue::Time(t) => t.format("%H:%M:%S%.f").to_string(),
    }
}

fn float_to_text(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        f.to_string()
    }
}

/// Escape text for PostgreSQL COPY.
fn escape_copy_text(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\t' => result.push_str("\\t"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            _ => result.push(c),
        }
    }
    result
}
