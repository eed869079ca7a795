//! Local-file adapter for canonical entries.
//!
//! Reads a JSON array or JSON Lines file of [`Entry`] values from
//! `ingestion.source_url` (a path or `file://` URL) and returns the entries
//! whose timestamp falls in the requested window.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::config::IngestionConfig;
use crate::error::{ArielError, Result};
use crate::models::Entry;
use crate::traits::{FetchError, FetchWindow, IngestionAdapter};

const DEFAULT_SOURCE_SYSTEM: &str = "generic";

pub struct GenericJsonAdapter {
    path: PathBuf,
    source_system: String,
}

impl GenericJsonAdapter {
    pub const NAME: &'static str = "generic_json";

    pub fn new(path: impl Into<PathBuf>, source_system: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source_system: source_system.into(),
        }
    }

    pub fn from_config(config: &IngestionConfig) -> Result<Self> {
        let url = config.source_url.as_deref().ok_or_else(|| {
            ArielError::Configuration(
                "ingestion.source_url is required for the generic_json adapter".to_string(),
            )
        })?;
        let path = url.strip_prefix("file://").unwrap_or(url);
        Ok(Self::new(
            path,
            config
                .source_system
                .clone()
                .unwrap_or_else(|| DEFAULT_SOURCE_SYSTEM.to_string()),
        ))
    }
}

/// Parse a JSON array, or one entry per non-empty line.
pub fn parse_entries(content: &str) -> Result<Vec<Entry>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| {
                ArielError::Ingestion(format!("line {}: invalid entry: {}", i + 1, e))
            })
        })
        .collect()
}

async fn read_entries(path: &Path) -> Result<Vec<Entry>> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        ArielError::Ingestion(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_entries(&content)
}

#[async_trait]
impl IngestionAdapter for GenericJsonAdapter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn source_system(&self) -> &str {
        &self.source_system
    }

    async fn fetch_window(&self, window: &FetchWindow) -> std::result::Result<Vec<Entry>, FetchError> {
        let entries = read_entries(&self.path)
            .await
            .map_err(|e| FetchError::Fatal(e.to_string()))?;
        Ok(entries
            .into_iter()
            .filter(|e| window.contains(e.timestamp))
            .map(|mut e| {
                if e.source_system.is_empty() {
                    e.source_system = self.source_system.clone();
                }
                e
            })
            .collect())
    }
}
