//! Core data models used throughout ARIEL.
//!
//! These types represent the logbook entries, ingestion runs, and search
//! results that flow through the ingestion and retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ArielError;

/// A file attached to a logbook entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(rename = "type", default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnhancementState {
    Pending,
    Complete,
    Failed,
}

/// Per-module processing state stored in `entries.enhancement_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementStatus {
    pub status: EnhancementState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EnhancementStatus {
    pub fn pending() -> Self {
        Self {
            status: EnhancementState::Pending,
            completed_at: None,
            failed_at: None,
            error: None,
        }
    }

    pub fn complete(at: DateTime<Utc>) -> Self {
        Self {
            status: EnhancementState::Complete,
            completed_at: Some(at),
            failed_at: None,
            error: None,
        }
    }

    pub fn failed(at: DateTime<Utc>, error: &str) -> Self {
        Self {
            status: EnhancementState::Failed,
            completed_at: None,
            failed_at: Some(at),
            error: Some(error.to_string()),
        }
    }
}

/// One logbook record. `entry_id` is stable across re-ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub entry_id: String,
    pub source_system: String,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub raw_text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub enhancement_status: BTreeMap<String, EnhancementStatus>,
}

impl Entry {
    pub fn new(
        entry_id: impl Into<String>,
        source_system: impl Into<String>,
        timestamp: DateTime<Utc>,
        author: impl Into<String>,
        raw_text: impl Into<String>,
    ) -> Self {
        Self {
            entry_id: entry_id.into(),
            source_system: source_system.into(),
            timestamp,
            author: author.into(),
            raw_text: raw_text.into(),
            attachments: Vec::new(),
            metadata: serde_json::Map::new(),
            enhancement_status: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = ArielError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(ArielError::Ingestion(format!(
                "unknown ingestion run status '{}'",
                other
            ))),
        }
    }
}

/// A persisted ingestion run record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionRun {
    pub id: String,
    pub source_system: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub entries_added: i64,
    pub entries_updated: i64,
    pub entries_failed: i64,
    pub error_message: Option<String>,
}

/// Counters accumulated while an ingestion run is in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub added: i64,
    pub updated: i64,
    pub failed: i64,
}

/// A search strategy selectable by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Keyword,
    Fuzzy,
    Semantic,
    Rag,
    Agent,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Keyword => "keyword",
            SearchMode::Fuzzy => "fuzzy",
            SearchMode::Semantic => "semantic",
            SearchMode::Rag => "rag",
            SearchMode::Agent => "agent",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = ArielError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keyword" => Ok(SearchMode::Keyword),
            "fuzzy" => Ok(SearchMode::Fuzzy),
            "semantic" => Ok(SearchMode::Semantic),
            "rag" => Ok(SearchMode::Rag),
            "agent" => Ok(SearchMode::Agent),
            other => Err(ArielError::InvalidArguments(format!(
                "unknown search mode '{}'. Must be keyword, fuzzy, semantic, rag, or agent",
                other
            ))),
        }
    }
}

/// Per-call search options.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    pub max_results: usize,
    /// Overrides the configured threshold of the strategy that runs
    /// (similarity for semantic, word-similarity for fuzzy).
    pub similarity_threshold: Option<f64>,
    pub start_date: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub end_date: Option<DateTime<Utc>>,
    pub fuzzy_fallback: bool,
    pub include_highlights: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            max_results: 10,
            similarity_threshold: None,
            start_date: None,
            end_date: None,
            fuzzy_fallback: false,
            include_highlights: true,
        }
    }
}

/// An entry with its strategy-specific score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredEntry {
    pub entry: Entry,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlight: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub entries: Vec<ScoredEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub sources: Vec<String>,
    pub modes_used: Vec<SearchMode>,
    pub reasoning: String,
}

impl SearchResponse {
    pub fn from_entries(entries: Vec<ScoredEntry>, mode: SearchMode, reasoning: String) -> Self {
        let sources = entries.iter().map(|e| e.entry.entry_id.clone()).collect();
        Self {
            entries,
            answer: None,
            sources,
            modes_used: vec![mode],
            reasoning,
        }
    }
}

/// An embedding table found in the database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingTableInfo {
    pub table_name: String,
    pub entry_count: i64,
    pub dimension: Option<i64>,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_mode_parse() {
        assert_eq!("RAG".parse::<SearchMode>().unwrap(), SearchMode::Rag);
        assert_eq!(SearchMode::Fuzzy.to_string(), "fuzzy");
        assert!("vector".parse::<SearchMode>().is_err());
    }

    #[test]
    fn test_enhancement_status_json_shape() {
        let at = DateTime::parse_from_rfc3339("2024-01-15T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let json = serde_json::to_value(EnhancementStatus::complete(at)).unwrap();
        assert_eq!(json["status"], "complete");
        assert_eq!(json["completed_at"], "2024-01-15T10:00:00Z");
        assert!(json.get("failed_at").is_none());
    }

    #[test]
    fn test_attachment_type_field() {
        let att: Attachment =
            serde_json::from_str(r#"{"url": "https://x/a.png", "type": "image/png"}"#).unwrap();
        assert_eq!(att.content_type.as_deref(), Some("image/png"));
        assert!(att.filename.is_none());
    }
}
