//! MySQL/MariaDB recorder reader.
//!
//! Implements the `SourceReader` trait for the recorder database using SQLx
//! for connection pooling and async query execution.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::query::Query;
use sqlx::{Column, MySql, Row as _, TypeInfo, ValueRef};
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::core::{KeyValue, Row, SourceReader, SqlValue, TableSpec};
use crate::error::{MigrateError, Result};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Recorder source reader.
pub struct MysqlReader {
    pool: MySqlPool,
}

impl MysqlReader {
    /// Connect a pool of at most `max_conns` connections and test it.
    pub async fn new(config: &SourceConfig, max_conns: usize) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(MySqlSslMode::Preferred)
            .charset("utf8mb4")
            // recorder datetimes are UTC
            .timezone(Some(String::from("+00:00")));

        let pool = MySqlPoolOptions::new()
            .max_connections(max_conns as u32)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::pool(e, "creating MySQL source pool"))?;

        sqlx::query("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| MigrateError::pool(e, "testing MySQL source connection"))?;

        info!("Connected to MySQL source: {}", config.describe());

        Ok(Self { pool })
    }

    /// Quote a MySQL identifier.
    fn quote_ident(name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn select_batch_sql(spec: &TableSpec, keyset: bool) -> String {
        let columns = spec
            .columns
            .iter()
            .map(|c| Self::quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        // text keys are paged in byte order, which the collation may not follow
        let key = if spec.text_key {
            format!("CAST({} AS BINARY)", Self::quote_ident(&spec.key_column))
        } else {
            Self::quote_ident(&spec.key_column)
        };
        let filter = if keyset {
            format!(" WHERE {} > ?", key)
        } else {
            String::new()
        };
        format!(
            "SELECT {} FROM {}{} ORDER BY {} LIMIT ?",
            columns,
            Self::quote_ident(&spec.name),
            filter,
            key
        )
    }

    fn bind_key<'q>(
        query: Query<'q, MySql, MySqlArguments>,
        key: &KeyValue,
    ) -> Query<'q, MySql, MySqlArguments> {
        match key {
            KeyValue::Int(v) => query.bind(*v),
            KeyValue::Text(s) => query.bind(s.clone()),
        }
    }

    /// Convert a MySQL row to values, dispatching on the reported column type.
    fn row_to_values(row: &MySqlRow) -> Result<Row> {
        row.columns()
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let is_null = row.try_get_raw(i).map(|r| r.is_null())?;
                if is_null {
                    return Ok(SqlValue::Null);
                }
                Self::decode(row, i, &column.type_info().name().to_lowercase())
            })
            .collect()
    }

    fn decode(row: &MySqlRow, i: usize, data_type: &str) -> Result<SqlValue> {
        let value = match data_type {
            // tinyint(1) is reported as boolean; the row transform decides
            // whether the stored value is a valid flag
            "boolean" | "bool" | "tinyint" => SqlValue::I16(i16::from(row.try_get::<i8, _>(i)?)),
            "tinyint unsigned" => SqlValue::I16(i16::from(row.try_get::<u8, _>(i)?)),
            "smallint" => SqlValue::I16(row.try_get::<i16, _>(i)?),
            "smallint unsigned" => SqlValue::I32(i32::from(row.try_get::<u16, _>(i)?)),
            "mediumint" | "int" | "integer" => SqlValue::I32(row.try_get::<i32, _>(i)?),
            "mediumint unsigned" | "int unsigned" | "integer unsigned" => {
                SqlValue::I64(i64::from(row.try_get::<u32, _>(i)?))
            }
            "bigint" => SqlValue::I64(row.try_get::<i64, _>(i)?),
            "bigint unsigned" => {
                let v = row.try_get::<u64, _>(i)?;
                SqlValue::I64(i64::try_from(v).map_err(|_| {
                    sqlx::Error::Decode(format!("unsigned value {} does not fit in bigint", v).into())
                })?)
            }
            "float" => SqlValue::F32(row.try_get::<f32, _>(i)?),
            "double" | "real" => SqlValue::F64(row.try_get::<f64, _>(i)?),
            "decimal" | "numeric" => SqlValue::Decimal(row.try_get::<rust_decimal::Decimal, _>(i)?),
            "bit" => {
                let bits = row.try_get::<u64, _>(i)?;
                SqlValue::Bool(bits != 0)
            }
            "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" => {
                SqlValue::Bytes(row.try_get::<Vec<u8>, _>(i)?)
            }
            "date" => SqlValue::Date(row.try_get::<chrono::NaiveDate, _>(i)?),
            "time" => SqlValue::Time(row.try_get::<chrono::NaiveTime, _>(i)?),
            "datetime" | "timestamp" => {
                SqlValue::DateTime(row.try_get::<chrono::NaiveDateTime, _>(i)?)
            }
            // char, varchar, the text family, enum, set and json
            _ => SqlValue::Text(row.try_get::<String, _>(i)?),
        };
        Ok(value)
    }
}

#[async_trait]
impl SourceReader for MysqlReader {
    async fn fetch_batch(
        &self,
        spec: &TableSpec,
        after: Option<&KeyValue>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let sql = Self::select_batch_sql(spec, after.is_some());
        let mut query = sqlx::query(&sql);
        if let Some(key) = after {
            query = Self::bind_key(query, key);
        }
        let rows = query.bind(limit as u64).fetch_all(&self.pool).await?;

        debug!(
            "{}: fetched {} rows after {}",
            spec.name,
            rows.len(),
            after.map_or_else(|| "start".to_string(), |k| k.to_string())
        );

        rows.iter().map(Self::row_to_values).collect()
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let query = format!("SELECT COUNT(*) AS cnt FROM {}", Self::quote_ident(table));
        let row: MySqlRow = sqlx::query(&query).fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("cnt")?)
    }

    async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "mysql"
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(MysqlReader::quote_ident("states"), "`states`");
        assert_eq!(MysqlReader::quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_select_batch_sql() {
        let spec = TableSpec::new("event_types", "event_type_id", &["event_type_id", "event_type"]);
        assert_eq!(
            MysqlReader::select_batch_sql(&spec, false),
            "SELECT `event_type_id`, `event_type` FROM `event_types` ORDER BY `event_type_id` LIMIT ?"
        );
        assert_eq!(
            MysqlReader::select_batch_sql(&spec, true),
            "SELECT `event_type_id`, `event_type` FROM `event_types` WHERE `event_type_id` > ? ORDER BY `event_type_id` LIMIT ?"
        );
    }

    #[test]
    fn test_text_key_pages_in_byte_order() {
        let spec = TableSpec::new("migration_changes", "migration_id", &["migration_id", "version"])
            .text_key();
        assert_eq!(
            MysqlReader::select_batch_sql(&spec, false),
            "SELECT `migration_id`, `version` FROM `migration_changes` ORDER BY CAST(`migration_id` AS BINARY) LIMIT ?"
        );
        assert_eq!(
            MysqlReader::select_batch_sql(&spec, true),
            "SELECT `migration_id`, `version` FROM `migration_changes` WHERE CAST(`migration_id` AS BINARY) > ? ORDER BY CAST(`migration_id` AS BINARY) LIMIT ?"
        );

        // the catalog marks its text-keyed table
        let catalog = crate::core::find_table("migration_changes").unwrap();
        assert!(catalog.text_key);
        assert!(!crate::core::find_table("states").unwrap().text_key);
    }
}
