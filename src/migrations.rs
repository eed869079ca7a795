//! Concrete schema migrations and the static registry they are discovered
//! from.
//!
//! | name              | gated by                              | depends on    |
//! |-------------------|---------------------------------------|---------------|
//! | `core_schema`     | always                                | –             |
//! | `keyword_search`  | `search_modules.keyword.enabled`      | `core_schema` |
//! | `text_embeddings` | `enhancement_modules.text_embedding`  | `core_schema` |

use async_trait::async_trait;
use regex::Regex;
use sqlx::SqlitePool;
use std::sync::OnceLock;

use crate::config::{Capability, Config, EmbeddingModelConfig};
use crate::error::{ArielError, DbContext, Result};
use crate::migrate::Migration;

pub const CORE_SCHEMA: &str = "core_schema";
pub const KEYWORD_SEARCH: &str = "keyword_search";
pub const TEXT_EMBEDDINGS: &str = "text_embeddings";

const EMBEDDING_TABLE_PREFIX: &str = "text_embeddings_";

/// A registry slot: whether the migration applies to a config, and how to
/// build it.
pub struct RegisteredMigration {
    pub name: &'static str,
    pub enabled: fn(&Config) -> bool,
    pub build: fn(&Config) -> Result<Box<dyn Migration>>,
}

/// All known migrations in registry order (used to break ordering ties).
pub static REGISTRY: &[RegisteredMigration] = &[
    RegisteredMigration {
        name: CORE_SCHEMA,
        enabled: |_| true,
        build: |_| Ok(Box::new(CoreSchema)),
    },
    RegisteredMigration {
        name: KEYWORD_SEARCH,
        enabled: |c| Capability::KeywordSearch.is_enabled(c),
        build: |_| Ok(Box::new(KeywordSearch)),
    },
    RegisteredMigration {
        name: TEXT_EMBEDDINGS,
        enabled: |c| Capability::TextEmbedding.is_enabled(c),
        build: |c| Ok(Box::new(TextEmbeddings::from_config(c)?)),
    },
];

pub fn enabled_migrations(config: &Config) -> Result<Vec<Box<dyn Migration>>> {
    REGISTRY
        .iter()
        .filter(|m| (m.enabled)(config))
        .map(|m| (m.build)(config))
        .collect()
}

fn table_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]{0,62}$").expect("valid regex"))
}

/// Deterministic embedding table name for a model id.
///
/// Lower-cases the id and replaces every non-alphanumeric character with
/// `_`. The result is the only identifier ever interpolated into SQL, so it
/// is validated before use.
pub fn embedding_table_name(model: &str) -> Result<String> {
    let sanitized: String = model
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let name = format!("{}{}", EMBEDDING_TABLE_PREFIX, sanitized);
    if !table_name_re().is_match(&name) {
        return Err(ArielError::Configuration(format!(
            "Embedding model '{}' does not map to a valid table name ('{}')",
            model, name
        )));
    }
    Ok(name)
}

pub fn is_embedding_table(name: &str) -> bool {
    name.starts_with(EMBEDDING_TABLE_PREFIX) && table_name_re().is_match(name)
}

async fn table_exists(pool: &SqlitePool, name: &str) -> Result<bool> {
    sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sqlite_master WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .db_context("check table exists")
}

async fn execute_all(pool: &SqlitePool, statements: &[&str], operation: &str) -> Result<()> {
    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .db_context(operation)?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// core_schema
// ═══════════════════════════════════════════════════════════════════════

/// Entries and ingestion runs. Not reversible: dropping it loses data.
pub struct CoreSchema;

#[async_trait]
impl Migration for CoreSchema {
    fn name(&self) -> &str {
        CORE_SCHEMA
    }

    async fn up(&self, pool: &SqlitePool) -> Result<()> {
        execute_all(
            pool,
            &[
                r#"
                CREATE TABLE IF NOT EXISTS entries (
                    id INTEGER PRIMARY KEY,
                    entry_id TEXT NOT NULL UNIQUE,
                    source_system TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    author TEXT NOT NULL DEFAULT '',
                    raw_text TEXT NOT NULL,
                    attachments TEXT NOT NULL DEFAULT '[]',
                    metadata TEXT NOT NULL DEFAULT '{}',
                    enhancement_status TEXT NOT NULL DEFAULT '{}',
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON entries(timestamp)",
                "CREATE INDEX IF NOT EXISTS idx_entries_source_system ON entries(source_system)",
                "CREATE INDEX IF NOT EXISTS idx_entries_author ON entries(author)",
                r#"
                CREATE TABLE IF NOT EXISTS ingestion_runs (
                    id TEXT PRIMARY KEY,
                    source_system TEXT NOT NULL,
                    started_at INTEGER NOT NULL,
                    completed_at INTEGER,
                    status TEXT NOT NULL CHECK (status IN ('running', 'success', 'failed')),
                    entries_added INTEGER NOT NULL DEFAULT 0,
                    entries_updated INTEGER NOT NULL DEFAULT 0,
                    entries_failed INTEGER NOT NULL DEFAULT 0,
                    error_message TEXT
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_ingestion_runs_source ON ingestion_runs(source_system, started_at)",
            ],
            "core_schema up",
        )
        .await
    }

    async fn verify(&self, pool: &SqlitePool) -> Result<bool> {
        Ok(table_exists(pool, "entries").await? && table_exists(pool, "ingestion_runs").await?)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// keyword_search
// ═══════════════════════════════════════════════════════════════════════

/// FTS5 index over `entries.raw_text`, kept in sync by triggers.
pub struct KeywordSearch;

#[async_trait]
impl Migration for KeywordSearch {
    fn name(&self) -> &str {
        KEYWORD_SEARCH
    }

    fn depends_on(&self) -> Vec<&str> {
        vec![CORE_SCHEMA]
    }

    async fn up(&self, pool: &SqlitePool) -> Result<()> {
        // FTS5 CREATE is not idempotent natively, so we check first
        if !table_exists(pool, "entries_fts").await? {
            execute_all(
                pool,
                &[
                    "CREATE VIRTUAL TABLE entries_fts USING fts5(raw_text, tokenize = 'porter unicode61')",
                    "INSERT INTO entries_fts(rowid, raw_text) SELECT id, raw_text FROM entries",
                ],
                "keyword_search up",
            )
            .await?;
        }

        execute_all(
            pool,
            &[
                r#"
                CREATE TRIGGER IF NOT EXISTS entries_fts_insert AFTER INSERT ON entries BEGIN
                    INSERT INTO entries_fts(rowid, raw_text) VALUES (new.id, new.raw_text);
                END
                "#,
                r#"
                CREATE TRIGGER IF NOT EXISTS entries_fts_delete AFTER DELETE ON entries BEGIN
                    DELETE FROM entries_fts WHERE rowid = old.id;
                END
                "#,
                r#"
                CREATE TRIGGER IF NOT EXISTS entries_fts_update AFTER UPDATE OF raw_text ON entries BEGIN
                    UPDATE entries_fts SET raw_text = new.raw_text WHERE rowid = old.id;
                END
                "#,
            ],
            "keyword_search triggers",
        )
        .await
    }

    async fn down(&self, pool: &SqlitePool) -> Result<()> {
        execute_all(
            pool,
            &[
                "DROP TRIGGER IF EXISTS entries_fts_insert",
                "DROP TRIGGER IF EXISTS entries_fts_delete",
                "DROP TRIGGER IF EXISTS entries_fts_update",
                "DROP TABLE IF EXISTS entries_fts",
            ],
            "keyword_search down",
        )
        .await
    }

    async fn verify(&self, pool: &SqlitePool) -> Result<bool> {
        table_exists(pool, "entries_fts").await
    }
}

// ═══════════════════════════════════════════════════════════════════════
// text_embeddings
// ═══════════════════════════════════════════════════════════════════════

/// One embedding table per configured model.
pub struct TextEmbeddings {
    tables: Vec<(String, EmbeddingModelConfig)>,
}

impl TextEmbeddings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let tables = config
            .embedding_models()
            .iter()
            .map(|m| Ok((embedding_table_name(&m.name)?, m.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { tables })
    }
}

#[async_trait]
impl Migration for TextEmbeddings {
    fn name(&self) -> &str {
        TEXT_EMBEDDINGS
    }

    fn depends_on(&self) -> Vec<&str> {
        vec![CORE_SCHEMA]
    }

    async fn up(&self, pool: &SqlitePool) -> Result<()> {
        for (table, model) in &self.tables {
            // `table` is validated by embedding_table_name; dimension is an integer.
            let ddl = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    entry_id TEXT PRIMARY KEY REFERENCES entries(entry_id) ON DELETE CASCADE,
                    embedding BLOB NOT NULL,
                    dimension INTEGER NOT NULL CHECK (dimension = {dim}),
                    created_at INTEGER NOT NULL
                )
                "#,
                table = table,
                dim = model.dimension
            );
            sqlx::query(&ddl)
                .execute(pool)
                .await
                .db_context("text_embeddings up")?;
            tracing::info!(table = %table, model = %model.name, dimension = model.dimension, "embedding table ready");
        }
        Ok(())
    }

    async fn down(&self, pool: &SqlitePool) -> Result<()> {
        for (table, _) in &self.tables {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                .execute(pool)
                .await
                .db_context("text_embeddings down")?;
        }
        Ok(())
    }

    /// Re-apply when a newly configured model has no table yet.
    async fn verify(&self, pool: &SqlitePool) -> Result<bool> {
        for (table, _) in &self.tables {
            if !table_exists(pool, table).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
