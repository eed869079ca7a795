//! Dependency-ordered schema migration runner.
//!
//! Migrations are discovered from the static registry in
//! [`crate::migrations`], filtered by which modules are enabled, and ordered
//! topologically by `depends_on`. The runner exclusively owns the
//! `schema_migrations` ledger; a migration is executed only when its marker
//! is missing (or its artifacts fail verification), so `run()` is idempotent.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeSet, HashMap};

use crate::config::Config;
use crate::error::{ArielError, DbContext, Result};
use crate::migrations;

/// A single schema change.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Unique name recorded in the ledger.
    fn name(&self) -> &str;

    /// Names of migrations that must be applied first.
    fn depends_on(&self) -> Vec<&str> {
        Vec::new()
    }

    async fn up(&self, pool: &SqlitePool) -> Result<()>;

    /// Reverse `up()`. Migrations that cannot be reversed keep the default.
    async fn down(&self, _pool: &SqlitePool) -> Result<()> {
        Err(ArielError::RollbackNotImplemented(self.name().to_string()))
    }

    /// Check that an applied migration's artifacts still exist. Returning
    /// `false` makes the runner apply it again.
    async fn verify(&self, _pool: &SqlitePool) -> Result<bool> {
        Ok(true)
    }
}

/// Outcome of [`MigrationRunner::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    /// Populated only for dry runs.
    pub would_apply: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    RolledBack,
    NotApplied,
    /// The migration has no `down()`; distinct from a failure.
    NotImplemented,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub name: String,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
    pub depends_on: Vec<String>,
}

pub struct MigrationRunner {
    pool: SqlitePool,
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRunner {
    pub fn new(pool: SqlitePool, migrations: Vec<Box<dyn Migration>>) -> Self {
        Self { pool, migrations }
    }

    /// Runner over every migration enabled by `config`.
    pub fn from_config(pool: SqlitePool, config: &Config) -> Result<Self> {
        Ok(Self::new(pool, migrations::enabled_migrations(config)?))
    }

    /// Topological order (Kahn's algorithm), ties broken by registry order.
    ///
    /// Fails with a configuration error on an unknown dependency or a cycle.
    pub fn order(&self) -> Result<Vec<&dyn Migration>> {
        let index: HashMap<&str, usize> = self
            .migrations
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name(), i))
            .collect();

        let n = self.migrations.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, migration) in self.migrations.iter().enumerate() {
            for dep in migration.depends_on() {
                let Some(&d) = index.get(dep) else {
                    return Err(ArielError::Configuration(format!(
                        "Migration '{}' depends on '{}', which is not enabled",
                        migration.name(),
                        dep
                    )));
                };
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut ordered = Vec::with_capacity(n);

        while let Some(i) = ready.pop_first() {
            ordered.push(self.migrations[i].as_ref());
            for &j in &dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.insert(j);
                }
            }
        }

        if ordered.len() != n {
            let stuck: Vec<&str> = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.migrations[i].name())
                .collect();
            return Err(ArielError::Configuration(format!(
                "Migration dependency cycle detected among: {}",
                stuck.join(", ")
            )));
        }

        Ok(ordered)
    }

    async fn ensure_ledger(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .db_context("create schema_migrations")?;
        Ok(())
    }

    /// Applied markers, empty if the ledger does not exist yet.
    async fn applied_markers(&self) -> Result<HashMap<String, i64>> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_migrations'",
        )
        .fetch_one(&self.pool)
        .await
        .db_context("check schema_migrations")?;

        if !exists {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query("SELECT name, applied_at FROM schema_migrations")
            .fetch_all(&self.pool)
            .await
            .db_context("read schema_migrations")?;

        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("name"), r.get::<i64, _>("applied_at")))
            .collect())
    }

    /// Apply every unapplied migration in dependency order.
    ///
    /// An `up()` failure stops the run; migrations applied before it stay
    /// applied.
    pub async fn run(&self, dry_run: bool) -> Result<MigrationReport> {
        let ordered = self.order()?;
        if !dry_run {
            self.ensure_ledger().await?;
        }
        let markers = self.applied_markers().await?;
        let mut report = MigrationReport::default();

        for migration in ordered {
            let name = migration.name();
            let needs_apply = if markers.contains_key(name) {
                !migration.verify(&self.pool).await?
            } else {
                true
            };

            if !needs_apply {
                tracing::debug!(migration = name, "already applied");
                report.skipped.push(name.to_string());
                continue;
            }

            if dry_run {
                report.would_apply.push(name.to_string());
                continue;
            }

            tracing::info!(migration = name, "applying migration");
            migration
                .up(&self.pool)
                .await
                .map_err(|e| ArielError::Migration {
                    name: name.to_string(),
                    source: Box::new(e),
                })?;

            sqlx::query(
                "INSERT INTO schema_migrations (name, applied_at) VALUES (?, ?)
                 ON CONFLICT(name) DO UPDATE SET applied_at = excluded.applied_at",
            )
            .bind(name)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await
            .db_context("record migration")?;

            report.applied.push(name.to_string());
        }

        Ok(report)
    }

    /// Roll back a single named migration.
    pub async fn rollback(&self, name: &str) -> Result<RollbackOutcome> {
        let migration = self
            .migrations
            .iter()
            .find(|m| m.name() == name)
            .ok_or_else(|| {
                ArielError::Configuration(format!("Unknown migration '{}'", name))
            })?;

        let markers = self.applied_markers().await?;
        if !markers.contains_key(name) {
            return Ok(RollbackOutcome::NotApplied);
        }

        let applied_dependents: Vec<&str> = self
            .migrations
            .iter()
            .filter(|m| m.depends_on().contains(&name) && markers.contains_key(m.name()))
            .map(|m| m.name())
            .collect();
        if !applied_dependents.is_empty() {
            tracing::warn!(
                migration = name,
                dependents = ?applied_dependents,
                "rolling back a migration that applied migrations depend on"
            );
        }

        match migration.down(&self.pool).await {
            Ok(()) => {}
            Err(ArielError::RollbackNotImplemented(_)) => {
                return Ok(RollbackOutcome::NotImplemented)
            }
            Err(e) => {
                return Err(ArielError::Migration {
                    name: name.to_string(),
                    source: Box::new(e),
                })
            }
        }

        sqlx::query("DELETE FROM schema_migrations WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .db_context("remove migration marker")?;

        tracing::info!(migration = name, "rolled back");
        Ok(RollbackOutcome::RolledBack)
    }

    /// Applied state of every enabled migration, in dependency order.
    pub async fn status(&self) -> Result<Vec<MigrationStatus>> {
        let ordered = self.order()?;
        let markers = self.applied_markers().await?;

        Ok(ordered
            .into_iter()
            .map(|m| {
                let applied_at = markers
                    .get(m.name())
                    .and_then(|ts| Utc.timestamp_opt(*ts, 0).single());
                MigrationStatus {
                    name: m.name().to_string(),
                    applied: markers.contains_key(m.name()),
                    applied_at,
                    depends_on: m.depends_on().iter().map(|d| d.to_string()).collect(),
                }
            })
            .collect())
    }
}
