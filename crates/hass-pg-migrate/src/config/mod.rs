//! Configuration loading and validation.
//!
//! Values come from a YAML file; the environment variables used by the
//! recorder tooling (`MYSQL_*`, `PG_*`) override individual fields.

mod types;
mod validation;

pub use types::*;

use crate::error::{MigrateError, Result};
use std::path::Path;
use std::str::FromStr;

impl Config {
    /// Load configuration from a YAML file, apply environment overrides and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Override fields from environment variables.
    ///
    /// `lookup` returns the value of a variable if set; non-empty values win
    /// over the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("MYSQL_HOST") {
            self.source.host = v;
        }
        if let Some(v) = get("MYSQL_PORT") {
            self.source.port = parse_env("MYSQL_PORT", &v)?;
        }
        if let Some(v) = get("MYSQL_USER") {
            self.source.user = v;
        }
        if let Some(v) = get("MYSQL_PASSWORD") {
            self.source.password = v;
        }
        if let Some(v) = get("MYSQL_DB") {
            self.source.database = v;
        }

        if let Some(v) = get("PG_HOST") {
            self.target.host = v;
        }
        if let Some(v) = get("PG_PORT") {
            self.target.port = parse_env("PG_PORT", &v)?;
        }
        if let Some(v) = get("PG_USER") {
            self.target.user = v;
        }
        if let Some(v) = get("PG_PASSWORD") {
            self.target.password = v;
        }
        if let Some(v) = get("PG_DB") {
            self.target.database = v;
        }
        if let Some(v) = get("PG_SCHEMA") {
            self.target.schema = v;
        }
        if let Some(v) = get("PG_SSLMODE") {
            self.target.ssl_mode = v;
        }

        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| MigrateError::Config(format!("{} has an invalid value '{}'", key, value)))
}

impl SourceConfig {
    /// Endpoint description for logs; never includes credentials.
    pub fn describe(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

impl TargetConfig {
    /// Endpoint description for logs; never includes credentials.
    pub fn describe(&self) -> String {
        format!(
            "{}:{}/{} (schema {})",
            self.host, self.port, self.database, self.schema
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const YAML: &str = r#"
source:
  host: mariadb.local
  database: homeassistant
  user: hass
  password: secret
target:
  host: pg.local
  database: homeassistant
  user: hass
  password: secret
migration:
  batch_size: 5000
"#;

    #[test]
    fn test_from_yaml_applies_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.port, 3306);
        assert_eq!(config.target.port, 5432);
        assert_eq!(config.target.schema, "public");
        assert_eq!(config.migration.batch_size, 5000);
        assert_eq!(config.migration.max_concurrency, 4);
        assert_eq!(config.migration.pool_size(), 6);
        assert_eq!(
            config.migration.progress_file,
            std::path::PathBuf::from("migration_progress.json")
        );
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config: Config = serde_yaml::from_str(YAML).unwrap();
        let env: HashMap<&str, &str> = [
            ("MYSQL_HOST", "10.0.0.5"),
            ("MYSQL_PORT", "3307"),
            ("PG_SCHEMA", "recorder"),
            ("PG_PASSWORD", ""),
        ]
        .into_iter()
        .collect();

        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.source.host, "10.0.0.5");
        assert_eq!(config.source.port, 3307);
        assert_eq!(config.target.schema, "recorder");
        // empty values do not clobber the file
        assert_eq!(config.target.password, "secret");
    }

    #[test]
    fn test_env_only_configuration() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            ("MYSQL_HOST", "mysql"),
            ("MYSQL_USER", "hass"),
            ("MYSQL_DB", "ha"),
            ("PG_HOST", "postgres"),
            ("PG_USER", "hass"),
            ("PG_DB", "ha"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_env_port() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(|k| (k == "PG_PORT").then(|| "fivefour".to_string()))
            .unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = Config::load("/nonexistent/hass-pg-migrate.yaml").unwrap_err();
        assert!(matches!(err, MigrateError::Io(_)));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "source: [unterminated").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_describe_hides_password() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.describe(), "mariadb.local:3306/homeassistant");
        assert!(!config.target.describe().contains("secret"));
    }
}
