//! Target database backup with `pg_dump`.

use crate::config::TargetConfig;
use crate::error::{MigrateError, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

const PG_DUMP: &str = "pg_dump";

/// File the dump for `config` taken at `now` is written to.
pub fn backup_path(config: &TargetConfig, dir: &Path, now: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "{}_{}.dump",
        config.database,
        now.format("%Y%m%d_%H%M%S")
    ))
}

/// Arguments for a custom-format dump of the target schema into `file`.
pub fn pg_dump_args(config: &TargetConfig, file: &Path) -> Vec<String> {
    vec![
        format!("--host={}", config.host),
        format!("--port={}", config.port),
        format!("--username={}", config.user),
        format!("--dbname={}", config.database),
        "--format=custom".to_string(),
        format!("--schema={}", config.schema),
        "--no-password".to_string(),
        "--file".to_string(),
        file.to_string_lossy().into_owned(),
    ]
}

/// Dump the target database into `dir` and return the dump file.
///
/// The password is passed through `PGPASSWORD`. A missing `pg_dump`
/// binary or a non-zero exit status is an error.
pub async fn backup_target(config: &TargetConfig, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let file = backup_path(config, dir, Local::now());
    info!("Creating backup: {}", file.display());

    let output = Command::new(PG_DUMP)
        .args(pg_dump_args(config, &file))
        .env("PGPASSWORD", &config.password)
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        return Err(MigrateError::State(format!(
            "Backup failed ({}): {}",
            output.status,
            if stderr.is_empty() { "no output" } else { stderr }
        )));
    }

    info!("Backup created: {}", file.display());
    Ok(file)
}
