//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

const SSL_MODES: [&str; 4] = ["disable", "require", "verify-ca", "verify-full"];

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }
    if config.source.port == 0 {
        return Err(MigrateError::Config("source.port must be non-zero".into()));
    }

    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }
    if config.target.port == 0 {
        return Err(MigrateError::Config("target.port must be non-zero".into()));
    }
    if config.target.schema.is_empty() {
        return Err(MigrateError::Config("target.schema is required".into()));
    }
    let ssl_mode = config.target.ssl_mode.to_lowercase();
    if !SSL_MODES.contains(&ssl_mode.as_str()) {
        return Err(MigrateError::Config(format!(
            "Invalid ssl_mode '{}'. Valid options: {}",
            config.target.ssl_mode,
            SSL_MODES.join(", ")
        )));
    }

    // Cannot migrate to the same server endpoint
    if config.source.host == config.target.host && config.source.port == config.target.port {
        return Err(MigrateError::Config(
            "source and target cannot be the same database server".into(),
        ));
    }

    let migration = &config.migration;
    if migration.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if migration.max_concurrency == 0 {
        return Err(MigrateError::Config(
            "migration.max_concurrency must be at least 1".into(),
        ));
    }
    if migration.max_retries == 0 {
        return Err(MigrateError::Config(
            "migration.max_retries must be at least 1".into(),
        ));
    }
    if migration.progress_file.as_os_str().is_empty() {
        return Err(MigrateError::Config(
            "migration.progress_file is required".into(),
        ));
    }

    Ok(())
}
