use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::config::Config;
use crate::error::{DbContext, Result};

/// Strip the `sqlite:` / `sqlite://` scheme from a database URI, leaving the
/// file path (or `:memory:`).
pub fn database_path(uri: &str) -> &str {
    uri.strip_prefix("sqlite://")
        .or_else(|| uri.strip_prefix("sqlite:"))
        .unwrap_or(uri)
}

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = database_path(&config.database.uri);

    if db_path != ":memory:" {
        // Ensure parent directory exists
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))
        .db_context("parse database uri")?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(options)
        .await
        .db_context("connect")?;

    tracing::debug!(path = db_path, "database pool ready");
    Ok(pool)
}
