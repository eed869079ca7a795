//! Shared fixtures for unit tests.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::TempDir;

use crate::config::Config;
use crate::db;
use crate::migrate::MigrationRunner;
use crate::models::Entry;
use crate::repository::EntryRepository;

pub const TEST_MODEL: &str = "test-embed";
pub const TEST_DIMENSION: usize = 4;

/// Config with keyword, semantic, and text_embedding enabled.
pub fn full_config(uri: &str) -> Config {
    Config::from_toml_str(&format!(
        r#"
[database]
uri = "{uri}"

[search_modules.keyword]
enabled = true

[search_modules.semantic]
enabled = true

[enhancement_modules.text_embedding]
enabled = true
settings = {{ models = [{{ name = "{TEST_MODEL}", dimension = {TEST_DIMENSION} }}] }}

[ingestion]
retry_delay_seconds = 0
"#
    ))
    .unwrap()
}

/// Config with only the keyword module enabled.
pub fn keyword_config(uri: &str) -> Config {
    Config::from_toml_str(&format!(
        r#"
[database]
uri = "{uri}"

[search_modules.keyword]
enabled = true

[ingestion]
retry_delay_seconds = 0
"#
    ))
    .unwrap()
}

/// Empty file-backed database in a temp dir.
pub async fn temp_pool() -> (TempDir, SqlitePool) {
    let dir = TempDir::new().unwrap();
    let uri = format!("sqlite:{}", dir.path().join("test.sqlite").display());
    let pool = db::connect(&keyword_config(&uri)).await.unwrap();
    (dir, pool)
}

/// Migrated repository for `make_config(uri)`.
pub async fn migrated_repo(make_config: fn(&str) -> Config) -> (TempDir, EntryRepository) {
    let dir = TempDir::new().unwrap();
    let uri = format!("sqlite:{}", dir.path().join("test.sqlite").display());
    let config = make_config(&uri);
    let pool = db::connect(&config).await.unwrap();
    MigrationRunner::from_config(pool.clone(), &config)
        .unwrap()
        .run(false)
        .await
        .unwrap();
    (dir, EntryRepository::new(pool, Arc::new(config)))
}

pub fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

pub fn entry(id: &str, at: DateTime<Utc>, author: &str, text: &str) -> Entry {
    Entry::new(id, "test", at, author, text)
}

/// Embedder returning the same vector for every text.
pub struct StaticEmbedder {
    vector: Vec<f32>,
    calls: std::sync::atomic::AtomicUsize,
}

impl StaticEmbedder {
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            vector,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl crate::embedding::EmbeddingProvider for StaticEmbedder {
    fn provider_name(&self) -> &str {
        "static"
    }

    async fn embed(&self, _model: &str, texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(texts.iter().map(|_| self.vector.clone()).collect())
    }
}
