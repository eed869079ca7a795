//! Typed data access over entries, embedding tables, and ingestion runs.
//!
//! [`EntryRepository`] exclusively owns entry, embedding, and run
//! persistence. Module-specific methods check their [`Capability`] before
//! any query executes.
//!
//! All values are bound parameters. Dynamic SQL is assembled only from
//! compile-time constant fragments ([`SqlFilter::clause`], repeated
//! placeholder fragments) plus embedding table names, which are validated
//! by [`embedding_table_name`].

use chrono::{DateTime, TimeZone, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::{Capability, Config};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{ArielError, DbContext, Result};
use crate::migrations::{embedding_table_name, is_embedding_table};
use crate::models::{
    EmbeddingTableInfo, EnhancementStatus, Entry, IngestionRun, RunCounts, RunStatus,
    ScoredEntry,
};
use crate::trigram::word_similarity;

const ENTRY_COLUMNS: &str = "e.entry_id, e.source_system, e.timestamp, e.author, e.raw_text, \
     e.attachments, e.metadata, e.enhancement_status";

const RUN_COLUMNS: &str = "id, source_system, started_at, completed_at, status, \
     entries_added, entries_updated, entries_failed, error_message";

/// Rows scored per round trip by [`EntryRepository::fuzzy_search`].
pub const FUZZY_SCAN_PAGE: i64 = 500;

/// One quoted FTS5 phrase built from a bound parameter.
const FTS_TERM: &str = r#"'"' || replace(?, '"', '""') || '"'"#;

/// A bound SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Integer(i64),
    Real(f64),
}

/// A WHERE-clause fragment. The clause is a compile-time constant; every
/// value it needs is carried in `params`.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFilter {
    pub clause: &'static str,
    pub params: Vec<SqlValue>,
}

impl SqlFilter {
    pub fn new(clause: &'static str, params: Vec<SqlValue>) -> Self {
        Self { clause, params }
    }

    /// `e.timestamp >= start` and `e.timestamp < end` for whichever bounds
    /// are present.
    pub fn time_range(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Vec<Self> {
        let mut filters = Vec::new();
        if let Some(start) = start {
            filters.push(Self::new(
                "e.timestamp >= ?",
                vec![SqlValue::Integer(start.timestamp())],
            ));
        }
        if let Some(end) = end {
            filters.push(Self::new(
                "e.timestamp < ?",
                vec![SqlValue::Integer(end.timestamp())],
            ));
        }
        filters
    }

    /// Case-insensitive substring match on author.
    pub fn author_contains(author: &str) -> Self {
        let escaped = author
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        Self::new(
            r"e.author LIKE ? ESCAPE '\'",
            vec![SqlValue::Text(format!("%{}%", escaped))],
        )
    }
}

fn and_clauses(filters: &[SqlFilter]) -> String {
    filters
        .iter()
        .map(|f| f.clause)
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::Integer(i) => query.bind(*i),
        SqlValue::Real(f) => query.bind(*f),
    }
}

fn bind_filters<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    filters: &[SqlFilter],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in filters.iter().flat_map(|f| f.params.iter()) {
        query = bind_value(query, value);
    }
    query
}

/// SQL for a keyword search over `term_count` FTS terms.
///
/// With no terms the query browses by filters, newest first.
pub fn keyword_sql(term_count: usize, filters: &[SqlFilter], include_highlights: bool) -> String {
    if term_count == 0 {
        let where_sql = if filters.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", and_clauses(filters))
        };
        return format!(
            "SELECT {ENTRY_COLUMNS}, 0.0 AS rank, NULL AS highlight \
             FROM entries e {where_sql} ORDER BY e.timestamp DESC LIMIT ?"
        );
    }

    let match_expr = vec![FTS_TERM; term_count].join(" || ' ' || ");
    let highlight = if include_highlights {
        "snippet(entries_fts, 0, '<mark>', '</mark>', '...', 24)"
    } else {
        "NULL"
    };
    let filter_sql = if filters.is_empty() {
        String::new()
    } else {
        format!("AND {}", and_clauses(filters))
    };
    format!(
        "SELECT {ENTRY_COLUMNS}, bm25(entries_fts) AS rank, {highlight} AS highlight \
         FROM entries_fts JOIN entries e ON e.id = entries_fts.rowid \
         WHERE entries_fts MATCH ({match_expr}) {filter_sql} \
         ORDER BY rank LIMIT ?"
    )
}

fn ts_to_datetime(ts: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| ArielError::Ingestion(format!("invalid stored timestamp {}", ts)))
}

fn row_to_entry(row: &SqliteRow) -> Result<Entry> {
    Ok(Entry {
        entry_id: row.get("entry_id"),
        source_system: row.get("source_system"),
        timestamp: ts_to_datetime(row.get("timestamp"))?,
        author: row.get("author"),
        raw_text: row.get("raw_text"),
        attachments: serde_json::from_str(row.get::<&str, _>("attachments"))?,
        metadata: serde_json::from_str(row.get::<&str, _>("metadata"))?,
        enhancement_status: serde_json::from_str(row.get::<&str, _>("enhancement_status"))?,
    })
}

fn row_to_run(row: &SqliteRow) -> Result<IngestionRun> {
    Ok(IngestionRun {
        id: row.get("id"),
        source_system: row.get("source_system"),
        started_at: ts_to_datetime(row.get("started_at"))?,
        completed_at: row
            .get::<Option<i64>, _>("completed_at")
            .map(ts_to_datetime)
            .transpose()?,
        status: row.get::<&str, _>("status").parse()?,
        entries_added: row.get("entries_added"),
        entries_updated: row.get("entries_updated"),
        entries_failed: row.get("entries_failed"),
        error_message: row.get("error_message"),
    })
}

fn status_path(module: &str) -> String {
    format!("$.\"{}\"", module)
}

/// Whether an upsert created a new row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated { content_changed: bool },
}

impl UpsertOutcome {
    /// New or changed text needs enhancement again.
    pub fn needs_enhancement(&self) -> bool {
        matches!(
            self,
            UpsertOutcome::Inserted
                | UpsertOutcome::Updated {
                    content_changed: true
                }
        )
    }
}

#[derive(Clone)]
pub struct EntryRepository {
    pool: SqlitePool,
    config: Arc<Config>,
}

impl EntryRepository {
    pub fn new(pool: SqlitePool, config: Arc<Config>) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .db_context("ping")?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Entries
    // ═══════════════════════════════════════════════════════════════════

    pub async fn get_entry(&self, entry_id: &str) -> Result<Option<Entry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries e WHERE e.entry_id = ?"
        ))
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .db_context("get_entry")?;

        row.as_ref().map(row_to_entry).transpose()
    }

    /// Entries for `ids` in input order; unknown ids are skipped.
    pub async fn get_entries_by_ids(&self, ids: &[String]) -> Result<Vec<Entry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries e WHERE e.entry_id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .db_context("get_entries_by_ids")?;

        let mut by_id: HashMap<String, Entry> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let entry = row_to_entry(row)?;
            by_id.insert(entry.entry_id.clone(), entry);
        }

        let mut ordered = Vec::with_capacity(by_id.len());
        for id in ids {
            if let Some(entry) = by_id.remove(id) {
                ordered.push(entry);
            }
        }
        Ok(ordered)
    }

    /// Insert or update by `entry_id`.
    ///
    /// New entries, and entries whose `raw_text` changed, get `pending`
    /// status for every enabled enhancement module. Unchanged entries keep
    /// their status (minus keys of modules no longer enabled).
    pub async fn upsert_entry(&self, entry: &Entry) -> Result<UpsertOutcome> {
        let now = Utc::now().timestamp();
        let enabled = self.config.enabled_enhancement_modules();

        let mut tx = self.pool.begin().await.db_context("begin upsert")?;

        let existing = sqlx::query(
            "SELECT raw_text, enhancement_status FROM entries WHERE entry_id = ?",
        )
        .bind(&entry.entry_id)
        .fetch_optional(&mut *tx)
        .await
        .db_context("upsert_entry lookup")?;

        let (outcome, status) = match existing {
            None => {
                let status: BTreeMap<String, EnhancementStatus> = enabled
                    .iter()
                    .map(|m| (m.to_string(), EnhancementStatus::pending()))
                    .collect();
                (UpsertOutcome::Inserted, status)
            }
            Some(row) => {
                let old_text: String = row.get("raw_text");
                let content_changed = old_text != entry.raw_text;
                let status = if content_changed {
                    enabled
                        .iter()
                        .map(|m| (m.to_string(), EnhancementStatus::pending()))
                        .collect()
                } else {
                    let mut status: BTreeMap<String, EnhancementStatus> =
                        serde_json::from_str(row.get::<&str, _>("enhancement_status"))?;
                    status.retain(|k, _| enabled.contains(&k.as_str()));
                    status
                };
                (UpsertOutcome::Updated { content_changed }, status)
            }
        };

        sqlx::query(
            r#"
            INSERT INTO entries (entry_id, source_system, timestamp, author, raw_text,
                                 attachments, metadata, enhancement_status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(entry_id) DO UPDATE SET
                source_system = excluded.source_system,
                timestamp = excluded.timestamp,
                author = excluded.author,
                raw_text = excluded.raw_text,
                attachments = excluded.attachments,
                metadata = excluded.metadata,
                enhancement_status = excluded.enhancement_status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.entry_id)
        .bind(&entry.source_system)
        .bind(entry.timestamp.timestamp())
        .bind(&entry.author)
        .bind(&entry.raw_text)
        .bind(serde_json::to_string(&entry.attachments)?)
        .bind(serde_json::to_string(&entry.metadata)?)
        .bind(serde_json::to_string(&status)?)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .db_context("upsert_entry")?;

        tx.commit().await.db_context("commit upsert")?;
        Ok(outcome)
    }

    /// Entries in `[start, end)`, newest first.
    pub async fn search_by_time_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Entry>> {
        let filters = SqlFilter::time_range(start, end);
        let where_sql = if filters.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", and_clauses(&filters))
        };
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries e {where_sql} ORDER BY e.timestamp DESC LIMIT ?"
        );
        let rows = bind_filters(sqlx::query(&sql), &filters)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .db_context("search_by_time_range")?;
        rows.iter().map(row_to_entry).collect()
    }

    pub async fn count_entries(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM entries")
            .fetch_one(&self.pool)
            .await
            .db_context("count_entries")
    }

    pub async fn count_entries_by_source(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT source_system, COUNT(*) AS n FROM entries GROUP BY source_system ORDER BY source_system",
        )
        .fetch_all(&self.pool)
        .await
        .db_context("count_entries_by_source")?;
        Ok(rows
            .iter()
            .map(|r| (r.get("source_system"), r.get("n")))
            .collect())
    }

    pub async fn distinct_source_systems(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT DISTINCT source_system FROM entries ORDER BY source_system")
            .fetch_all(&self.pool)
            .await
            .db_context("distinct_source_systems")
    }

    pub async fn distinct_authors(&self) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT DISTINCT author FROM entries WHERE author != '' ORDER BY author",
        )
        .fetch_all(&self.pool)
        .await
        .db_context("distinct_authors")
    }

    // ═══════════════════════════════════════════════════════════════════
    // Module-gated search primitives
    // ═══════════════════════════════════════════════════════════════════

    /// Full-text search. Each of `terms` is matched as one quoted FTS5
    /// phrase (all must match); score is the negated BM25 rank, so higher
    /// is better.
    pub async fn keyword_search(
        &self,
        terms: &[String],
        filters: &[SqlFilter],
        limit: usize,
        include_highlights: bool,
    ) -> Result<Vec<ScoredEntry>> {
        Capability::KeywordSearch.require(&self.config, "keyword_search")?;

        let sql = keyword_sql(terms.len(), filters, include_highlights);
        let mut query = sqlx::query(&sql);
        for term in terms {
            query = query.bind(term.clone());
        }
        let rows = bind_filters(query, filters)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .db_context("keyword_search")?;

        rows.iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                Ok(ScoredEntry {
                    entry: row_to_entry(row)?,
                    score: -rank,
                    highlight: row.get("highlight"),
                })
            })
            .collect()
    }

    /// Entries whose trigram word-similarity to `query_text` is at least
    /// `threshold`, best first.
    ///
    /// Scoring happens in process. Rows in the time range are scanned in
    /// pages of [`FUZZY_SCAN_PAGE`] by primary key, and only the best `limit`
    /// matches are kept between pages, so memory stays at one page plus
    /// `limit` entries. Scan time still grows with the number of rows in
    /// range.
    pub async fn fuzzy_search(
        &self,
        query_text: &str,
        threshold: f64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>> {
        Capability::KeywordSearch.require(&self.config, "fuzzy_search")?;

        let filters = SqlFilter::time_range(start, end);
        let mut where_sql = String::from("WHERE e.id > ?");
        if !filters.is_empty() {
            where_sql.push_str(" AND ");
            where_sql.push_str(&and_clauses(&filters));
        }
        let sql = format!(
            "SELECT e.id AS scan_id, {ENTRY_COLUMNS} FROM entries e {where_sql} ORDER BY e.id LIMIT ?"
        );

        let mut scored = Vec::new();
        let mut last_id: i64 = 0;
        loop {
            let rows = bind_filters(sqlx::query(&sql).bind(last_id), &filters)
                .bind(FUZZY_SCAN_PAGE)
                .fetch_all(&self.pool)
                .await
                .db_context("fuzzy_search")?;

            for row in &rows {
                let text: &str = row.get("raw_text");
                let score = word_similarity(query_text, text);
                if score >= threshold && score > 0.0 {
                    scored.push(ScoredEntry {
                        entry: row_to_entry(row)?,
                        score,
                        highlight: None,
                    });
                }
            }
            sort_and_truncate(&mut scored, limit);

            match rows.last() {
                Some(row) if rows.len() as i64 == FUZZY_SCAN_PAGE => last_id = row.get("scan_id"),
                _ => break,
            }
        }

        Ok(scored)
    }

    /// Cosine similarity against the active model's embedding table.
    pub async fn semantic_search(
        &self,
        query_vector: &[f32],
        threshold: f64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>> {
        Capability::SemanticSearch.require(&self.config, "semantic_search")?;

        let model = self.config.semantic_model().ok_or_else(|| {
            ArielError::Configuration("no embedding model configured for semantic search".to_string())
        })?;
        let table = embedding_table_name(&model.name)?;
        self.require_table(&table).await?;

        let filters = SqlFilter::time_range(start, end);
        let filter_sql = if filters.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", and_clauses(&filters))
        };
        let sql = format!(
            "SELECT {ENTRY_COLUMNS}, t.embedding FROM entries e \
             JOIN {table} t ON t.entry_id = e.entry_id {filter_sql}"
        );
        let rows = bind_filters(sqlx::query(&sql), &filters)
            .fetch_all(&self.pool)
            .await
            .db_context("semantic_search")?;

        let mut scored = Vec::new();
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let score = cosine_similarity(query_vector, &blob_to_vec(&blob)) as f64;
            if score >= threshold {
                scored.push(ScoredEntry {
                    entry: row_to_entry(row)?,
                    score,
                    highlight: None,
                });
            }
        }

        sort_and_truncate(&mut scored, limit);
        Ok(scored)
    }

    async fn require_table(&self, table: &str) -> Result<()> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?")
                .bind(table)
                .fetch_one(&self.pool)
                .await
                .db_context("check table")?;
        if exists {
            Ok(())
        } else {
            Err(ArielError::Configuration(format!(
                "table '{}' does not exist; run `ariel migrate run`",
                table
            )))
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Enhancement state and embeddings
    // ═══════════════════════════════════════════════════════════════════

    fn require_enhancement_module(&self, module: &str, operation: &str) -> Result<()> {
        if self.config.is_enhancement_module_enabled(module) {
            Ok(())
        } else {
            Err(ArielError::module_not_enabled(module, operation))
        }
    }

    /// Store (or replace) one entry's vector for `model`.
    pub async fn store_embedding(&self, model: &str, entry_id: &str, vector: &[f32]) -> Result<()> {
        Capability::TextEmbedding.require(&self.config, "store_embedding")?;

        let configured = self
            .config
            .embedding_models()
            .iter()
            .find(|m| m.name == model)
            .ok_or_else(|| {
                ArielError::Configuration(format!("embedding model '{}' is not configured", model))
            })?;
        if vector.len() != configured.dimension {
            return Err(ArielError::Embedding(format!(
                "model '{}' expects dimension {}, got {}",
                model,
                configured.dimension,
                vector.len()
            )));
        }

        let table = embedding_table_name(model)?;
        sqlx::query(&format!(
            "INSERT INTO {table} (entry_id, embedding, dimension, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(entry_id) DO UPDATE SET embedding = excluded.embedding, \
             dimension = excluded.dimension, created_at = excluded.created_at"
        ))
        .bind(entry_id)
        .bind(vec_to_blob(vector))
        .bind(vector.len() as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .db_context("store_embedding")?;
        Ok(())
    }

    /// Entries whose status for `module` is missing, pending, or failed,
    /// oldest first.
    pub async fn entries_pending_enhancement(&self, module: &str, limit: usize) -> Result<Vec<Entry>> {
        self.require_enhancement_module(module, "entries_pending_enhancement")?;

        let path = format!("{}.status", status_path(module));
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries e \
             WHERE json_extract(e.enhancement_status, ?) IS NULL \
                OR json_extract(e.enhancement_status, ?) != 'complete' \
             ORDER BY e.timestamp LIMIT ?"
        ))
        .bind(&path)
        .bind(&path)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .db_context("entries_pending_enhancement")?;
        rows.iter().map(row_to_entry).collect()
    }

    pub async fn mark_enhancement_complete(&self, entry_id: &str, module: &str) -> Result<()> {
        self.require_enhancement_module(module, "mark_enhancement_complete")?;
        self.set_enhancement_status(entry_id, module, &EnhancementStatus::complete(Utc::now()))
            .await
    }

    pub async fn mark_enhancement_failed(&self, entry_id: &str, module: &str, error: &str) -> Result<()> {
        self.require_enhancement_module(module, "mark_enhancement_failed")?;
        self.set_enhancement_status(entry_id, module, &EnhancementStatus::failed(Utc::now(), error))
            .await
    }

    /// Merge one module's status into the JSON map, leaving other keys alone.
    async fn set_enhancement_status(
        &self,
        entry_id: &str,
        module: &str,
        status: &EnhancementStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE entries SET enhancement_status = json_set(enhancement_status, ?, json(?)) \
             WHERE entry_id = ?",
        )
        .bind(status_path(module))
        .bind(serde_json::to_string(status)?)
        .bind(entry_id)
        .execute(&self.pool)
        .await
        .db_context("set_enhancement_status")?;

        if result.rows_affected() == 0 {
            return Err(ArielError::EntryNotFound(entry_id.to_string()));
        }
        Ok(())
    }

    /// Embedding tables that actually exist, with row counts and which one
    /// semantic search currently reads.
    pub async fn get_embedding_tables(&self) -> Result<Vec<EmbeddingTableInfo>> {
        let names: Vec<String> = sqlx::query_scalar(
            r"SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'text\_embeddings\_%' ESCAPE '\' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .db_context("list embedding tables")?;

        let active = if Capability::SemanticSearch.is_enabled(&self.config) {
            self.config
                .semantic_model()
                .and_then(|m| embedding_table_name(&m.name).ok())
        } else {
            None
        };

        let mut tables = Vec::new();
        for name in names.into_iter().filter(|n| is_embedding_table(n)) {
            let entry_count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", name))
                .fetch_one(&self.pool)
                .await
                .db_context("count embeddings")?;

            let configured = self
                .config
                .embedding_models()
                .iter()
                .find(|m| embedding_table_name(&m.name).ok().as_deref() == Some(name.as_str()))
                .map(|m| m.dimension as i64);
            let dimension = match configured {
                Some(d) => Some(d),
                None => sqlx::query_scalar(&format!("SELECT dimension FROM {} LIMIT 1", name))
                    .fetch_optional(&self.pool)
                    .await
                    .db_context("read embedding dimension")?,
            };

            tables.push(EmbeddingTableInfo {
                is_active: active.as_deref() == Some(name.as_str()),
                table_name: name,
                entry_count,
                dimension,
            });
        }
        Ok(tables)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Ingestion runs
    // ═══════════════════════════════════════════════════════════════════

    pub async fn create_ingestion_run(&self, source_system: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO ingestion_runs (id, source_system, started_at, status) VALUES (?, ?, ?, 'running')",
        )
        .bind(&id)
        .bind(source_system)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .db_context("create_ingestion_run")?;
        Ok(id)
    }

    /// Finalize a running run as successful. Returns `false` if the run was
    /// already finalized (or does not exist).
    pub async fn complete_ingestion_run(&self, id: &str, counts: RunCounts) -> Result<bool> {
        self.finalize_run(id, RunStatus::Success, counts, None).await
    }

    pub async fn fail_ingestion_run(&self, id: &str, error: &str, counts: RunCounts) -> Result<bool> {
        self.finalize_run(id, RunStatus::Failed, counts, Some(error)).await
    }

    async fn finalize_run(
        &self,
        id: &str,
        status: RunStatus,
        counts: RunCounts,
        error: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE ingestion_runs SET status = ?, completed_at = ?, entries_added = ?, \
             entries_updated = ?, entries_failed = ?, error_message = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(status.to_string())
        .bind(Utc::now().timestamp())
        .bind(counts.added)
        .bind(counts.updated)
        .bind(counts.failed)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .db_context("finalize_ingestion_run")?;

        let finalized = result.rows_affected() == 1;
        if !finalized {
            tracing::warn!(run_id = id, %status, "ingestion run already finalized");
        }
        Ok(finalized)
    }

    pub async fn get_ingestion_run(&self, id: &str) -> Result<Option<IngestionRun>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM ingestion_runs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .db_context("get_ingestion_run")?;
        row.as_ref().map(row_to_run).transpose()
    }

    pub async fn recent_ingestion_runs(&self, limit: usize) -> Result<Vec<IngestionRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM ingestion_runs ORDER BY started_at DESC, rowid DESC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .db_context("recent_ingestion_runs")?;
        rows.iter().map(row_to_run).collect()
    }

    pub async fn last_successful_run(&self, source_system: &str) -> Result<Option<IngestionRun>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM ingestion_runs \
             WHERE source_system = ? AND status = 'success' \
             ORDER BY started_at DESC, rowid DESC LIMIT 1"
        ))
        .bind(source_system)
        .fetch_optional(&self.pool)
        .await
        .db_context("last_successful_run")?;
        row.as_ref().map(row_to_run).transpose()
    }
}

/// Best score first, newest entry breaking ties.
fn sort_and_truncate(scored: &mut Vec<ScoredEntry>, limit: usize) {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.entry.timestamp.cmp(&a.entry.timestamp))
    });
    scored.truncate(limit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TEXT_EMBEDDING_MODULE;
    use crate::models::EnhancementState;
    use crate::test_support::{entry, full_config, keyword_config, migrated_repo, ts, TEST_MODEL};

    #[tokio::test]
    async fn test_upsert_reports_insert_then_update() {
        let (_dir, repo) = migrated_repo(full_config).await;
        let e = entry("a-1", ts(2024, 1, 10), "smith", "beam loss at injection");

        assert_eq!(repo.upsert_entry(&e).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(
            repo.upsert_entry(&e).await.unwrap(),
            UpsertOutcome::Updated { content_changed: false }
        );

        let mut changed = e.clone();
        changed.raw_text = "beam loss at extraction".to_string();
        let outcome = repo.upsert_entry(&changed).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated { content_changed: true });
        assert!(outcome.needs_enhancement());
        assert_eq!(repo.count_entries().await.unwrap(), 1);

        let stored = repo.get_entry("a-1").await.unwrap().unwrap();
        assert_eq!(stored.raw_text, "beam loss at extraction");
        assert_eq!(stored.timestamp, e.timestamp);
        assert_eq!(
            stored.enhancement_status[TEXT_EMBEDDING_MODULE].status,
            EnhancementState::Pending
        );
    }

    #[tokio::test]
    async fn test_status_only_for_enabled_modules() {
        let (_dir, repo) = migrated_repo(keyword_config).await;
        repo.upsert_entry(&entry("a-1", ts(2024, 1, 10), "smith", "rf trip"))
            .await
            .unwrap();
        let stored = repo.get_entry("a-1").await.unwrap().unwrap();
        assert!(stored.enhancement_status.is_empty());

        let err = repo
            .mark_enhancement_complete("a-1", TEXT_EMBEDDING_MODULE)
            .await
            .unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[tokio::test]
    async fn test_get_entries_by_ids_preserves_order() {
        let (_dir, repo) = migrated_repo(keyword_config).await;
        for (id, day) in [("a", 1), ("b", 2), ("c", 3)] {
            repo.upsert_entry(&entry(id, ts(2024, 1, day), "x", "text"))
                .await
                .unwrap();
        }
        let ids: Vec<String> = ["c", "missing", "a", "b"].iter().map(|s| s.to_string()).collect();
        let found: Vec<String> = repo
            .get_entries_by_ids(&ids)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.entry_id)
            .collect();
        assert_eq!(found, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_keyword_search_ranks_and_filters() {
        let (_dir, repo) = migrated_repo(keyword_config).await;
        repo.upsert_entry(&entry("1", ts(2024, 1, 5), "Jane Smith", "Beam loss in sector 4"))
            .await
            .unwrap();
        repo.upsert_entry(&entry("2", ts(2024, 2, 5), "Bob Jones", "beam loss again, beam dumped"))
            .await
            .unwrap();
        repo.upsert_entry(&entry("3", ts(2024, 1, 6), "Jane Smith", "vacuum pump restarted"))
            .await
            .unwrap();

        let terms = vec!["beam loss".to_string()];
        let hits = repo.keyword_search(&terms, &[], 10, true).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].highlight.as_deref().unwrap().contains("<mark>"));

        let filters = vec![SqlFilter::author_contains("smith")];
        let hits = repo.keyword_search(&terms, &filters, 10, false).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.entry_id, "1");
        assert!(hits[0].highlight.is_none());

        let browse = repo
            .keyword_search(&[], &SqlFilter::time_range(Some(ts(2024, 1, 1)), Some(ts(2024, 1, 31))), 10, true)
            .await
            .unwrap();
        let ids: Vec<&str> = browse.iter().map(|h| h.entry.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["3", "1"]);
    }

    #[tokio::test]
    async fn test_keyword_search_gated() {
        let (_dir, repo) = migrated_repo(|uri| {
            Config::from_toml_str(&format!("[database]\nuri = \"{uri}\"\n")).unwrap()
        })
        .await;
        let err = repo
            .keyword_search(&["beam".to_string()], &[], 10, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ArielError::ModuleNotEnabled { .. }));
        let err = repo.fuzzy_search("beam", 0.5, None, None, 10).await.unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[tokio::test]
    async fn test_fuzzy_search_threshold_and_time_range() {
        let (_dir, repo) = migrated_repo(keyword_config).await;
        repo.upsert_entry(&entry("1", ts(2024, 1, 5), "a", "the vacuum pump tripped"))
            .await
            .unwrap();
        repo.upsert_entry(&entry("2", ts(2024, 3, 5), "a", "vacuum leak in sector 2"))
            .await
            .unwrap();
        repo.upsert_entry(&entry("3", ts(2024, 1, 7), "a", "cryo plant nominal"))
            .await
            .unwrap();

        let hits = repo.fuzzy_search("vacum", 0.6, None, None, 10).await.unwrap();
        assert_eq!(hits.len(), 2);

        let hits = repo
            .fuzzy_search("vacum", 0.6, Some(ts(2024, 1, 1)), Some(ts(2024, 2, 1)), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.entry_id, "1");

        assert!(repo.fuzzy_search("vacum", 0.99, None, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fuzzy_search_scans_past_first_page() {
        let (_dir, repo) = migrated_repo(keyword_config).await;
        for i in 0..FUZZY_SCAN_PAGE {
            repo.upsert_entry(&entry(&format!("v{i}"), ts(2024, 1, 5), "a", "vacuum pump tripped"))
                .await
                .unwrap();
        }
        repo.upsert_entry(&entry("last", ts(2024, 1, 6), "a", "klystron swap"))
            .await
            .unwrap();

        let hits = repo.fuzzy_search("klystrom", 0.6, None, None, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.entry_id, "last");

        let hits = repo.fuzzy_search("vacum", 0.6, None, None, 3).await.unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn test_embeddings_and_semantic_search() {
        let (_dir, repo) = migrated_repo(full_config).await;
        repo.upsert_entry(&entry("1", ts(2024, 1, 5), "a", "beam loss")).await.unwrap();
        repo.upsert_entry(&entry("2", ts(2024, 1, 6), "a", "cryo trip")).await.unwrap();

        repo.store_embedding(TEST_MODEL, "1", &[1.0, 0.0, 0.0, 0.0]).await.unwrap();
        repo.store_embedding(TEST_MODEL, "2", &[0.0, 1.0, 0.0, 0.0]).await.unwrap();
        let err = repo.store_embedding(TEST_MODEL, "1", &[1.0, 0.0]).await.unwrap_err();
        assert!(matches!(err, ArielError::Embedding(_)));

        let hits = repo
            .semantic_search(&[0.9, 0.1, 0.0, 0.0], 0.7, None, None, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.entry_id, "1");

        let tables = repo.get_embedding_tables().await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].table_name, "text_embeddings_test_embed");
        assert_eq!(tables[0].entry_count, 2);
        assert_eq!(tables[0].dimension, Some(4));
        assert!(tables[0].is_active);
    }

    #[tokio::test]
    async fn test_enhancement_status_merge_is_scoped() {
        let (_dir, repo) = migrated_repo(full_config).await;
        repo.upsert_entry(&entry("1", ts(2024, 1, 5), "a", "beam loss")).await.unwrap();
        repo.upsert_entry(&entry("2", ts(2024, 1, 6), "a", "cryo trip")).await.unwrap();

        let pending = repo
            .entries_pending_enhancement(TEXT_EMBEDDING_MODULE, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);

        repo.mark_enhancement_complete("1", TEXT_EMBEDDING_MODULE).await.unwrap();
        repo.mark_enhancement_failed("2", TEXT_EMBEDDING_MODULE, "timeout").await.unwrap();

        let e1 = repo.get_entry("1").await.unwrap().unwrap();
        assert_eq!(e1.enhancement_status[TEXT_EMBEDDING_MODULE].status, EnhancementState::Complete);
        let e2 = repo.get_entry("2").await.unwrap().unwrap();
        let s2 = &e2.enhancement_status[TEXT_EMBEDDING_MODULE];
        assert_eq!(s2.status, EnhancementState::Failed);
        assert_eq!(s2.error.as_deref(), Some("timeout"));

        let pending = repo
            .entries_pending_enhancement(TEXT_EMBEDDING_MODULE, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entry_id, "2");

        assert!(matches!(
            repo.mark_enhancement_complete("nope", TEXT_EMBEDDING_MODULE).await,
            Err(ArielError::EntryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ingestion_run_finalized_once() {
        let (_dir, repo) = migrated_repo(keyword_config).await;
        let id = repo.create_ingestion_run("ALS").await.unwrap();
        let run = repo.get_ingestion_run(&id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);

        let counts = RunCounts { added: 3, updated: 1, failed: 0 };
        assert!(repo.complete_ingestion_run(&id, counts).await.unwrap());
        assert!(!repo.fail_ingestion_run(&id, "late", counts).await.unwrap());

        let run = repo.get_ingestion_run(&id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.entries_added, 3);
        assert!(run.error_message.is_none());
        assert!(run.completed_at.is_some());

        assert_eq!(repo.last_successful_run("ALS").await.unwrap().unwrap().id, id);
        assert!(repo.last_successful_run("other").await.unwrap().is_none());
        assert_eq!(repo.recent_ingestion_runs(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_counts_and_distincts() {
        let (_dir, repo) = migrated_repo(keyword_config).await;
        let mut a = entry("1", ts(2024, 1, 5), "smith", "x");
        a.source_system = "ALS".to_string();
        repo.upsert_entry(&a).await.unwrap();
        repo.upsert_entry(&entry("2", ts(2024, 1, 6), "jones", "y")).await.unwrap();
        repo.upsert_entry(&entry("3", ts(2024, 1, 7), "smith", "z")).await.unwrap();

        assert_eq!(
            repo.count_entries_by_source().await.unwrap(),
            vec![("ALS".to_string(), 1), ("test".to_string(), 2)]
        );
        assert_eq!(repo.distinct_source_systems().await.unwrap(), vec!["ALS", "test"]);
        assert_eq!(repo.distinct_authors().await.unwrap(), vec!["jones", "smith"]);

        let ranged = repo
            .search_by_time_range(Some(ts(2024, 1, 6)), None, 10)
            .await
            .unwrap();
        assert_eq!(ranged.len(), 2);
        assert_eq!(ranged[0].entry_id, "3");
    }

    #[test]
    fn test_keyword_sql_shape() {
        let filters = vec![SqlFilter::author_contains("'; DROP TABLE entries; --")];
        let sql = keyword_sql(2, &filters, true);
        assert!(!sql.contains("DROP"));
        assert_eq!(sql.matches("replace(?").count(), 2);
        assert!(sql.contains("e.author LIKE ?"));
        assert_eq!(filters[0].params, vec![SqlValue::Text("%'; DROP TABLE entries; --%".to_string())]);
    }
}
