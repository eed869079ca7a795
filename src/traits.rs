//! Extension traits for ingestion adapters and agent tools.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             AdapterRegistry              │
//! │   name → factory(&Config)                │
//! │  ┌─────────────┐ ┌────────────────────┐  │
//! │  │ als_logbook │ │ generic_json       │  │
//! │  └─────────────┘ └────────────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        ingest::run_ingestion() → EntryRepository
//! ```
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │               ToolRegistry               │
//! │   one tool per enabled search module     │
//! │  ┌────────────────┐ ┌─────────────────┐  │
//! │  │ keyword_search │ │ semantic_search │  │
//! │  └────────────────┘ └─────────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!          agent::run_agent() tool loop
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::adapter_als::AlsLogbookAdapter;
use crate::adapter_generic::GenericJsonAdapter;
use crate::config::{Capability, Config};
use crate::embedding::EmbeddingProvider;
use crate::error::{ArielError, Result};
use crate::models::{Entry, ScoredEntry, SearchMode, SearchParams};
use crate::query::parse_datetime_arg;
use crate::repository::EntryRepository;
use crate::search::{keyword, semantic};

// ═══════════════════════════════════════════════════════════════════════
// Ingestion Adapter Trait
// ═══════════════════════════════════════════════════════════════════════

/// A bounded fetch window: `[start, end)`. `start = None` means "from the
/// beginning of the source".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| ts >= s) && ts < self.end
    }
}

/// Fetch failure classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Timeouts, connection errors, 5xx, 408: retried.
    Transient(String),
    /// Everything else: fails the run on first occurrence.
    Fatal(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Transient(msg) => write!(f, "transient: {}", msg),
            FetchError::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

/// A source of logbook entries.
///
/// Adapters map a facility's wire format onto [`Entry`]; the orchestrator
/// owns windowing, retry, dedup, and persistence.
#[async_trait]
pub trait IngestionAdapter: Send + Sync {
    /// Registry name (e.g. `"als_logbook"`).
    fn name(&self) -> &str;

    /// Value written to `Entry::source_system` and used to find the last
    /// successful run.
    fn source_system(&self) -> &str;

    /// Entries whose timestamp falls in `window`.
    async fn fetch_window(&self, window: &FetchWindow) -> std::result::Result<Vec<Entry>, FetchError>;
}

pub type AdapterFactory = fn(&Config) -> Result<Box<dyn IngestionAdapter>>;

/// Maps adapter names to factories.
pub struct AdapterRegistry {
    factories: BTreeMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry pre-loaded with `als_logbook` and `generic_json`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(AlsLogbookAdapter::NAME, |c| {
            Ok(Box::new(AlsLogbookAdapter::from_config(&c.ingestion)?))
        });
        registry.register(GenericJsonAdapter::NAME, |c| {
            Ok(Box::new(GenericJsonAdapter::from_config(&c.ingestion)?))
        });
        registry
    }

    pub fn register(&mut self, name: &str, factory: AdapterFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Build the adapter `name`, or fail listing the available names.
    pub fn create(&self, name: &str, config: &Config) -> Result<Box<dyn IngestionAdapter>> {
        let factory = self.factories.get(name).ok_or_else(|| ArielError::AdapterNotFound {
            name: name.to_string(),
            available: self.names(),
        })?;
        factory(config)
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// A search capability exposed to the agent as a callable function.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Function name presented to the model.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Search mode recorded in `modes_used` when the tool is invoked.
    fn mode(&self) -> SearchMode;

    /// OpenAI function-calling JSON Schema for parameters.
    fn parameters_schema(&self) -> Value;

    /// Reject out-of-range or malformed arguments. Called before
    /// [`execute`](Tool::execute); a rejection never runs the tool.
    fn validate(&self, params: &Value) -> Result<()>;

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Bridge from tools to the repository and embedding provider.
#[derive(Clone)]
pub struct ToolContext {
    pub repo: EntryRepository,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
}

pub const TOOL_MAX_RESULTS: i64 = 50;
const DEFAULT_TOOL_RESULTS: i64 = 10;
const TOOL_TEXT_CHARS: usize = 800;

fn invalid(message: impl Into<String>) -> ArielError {
    ArielError::InvalidArguments(message.into())
}

fn check_query(query: &str) -> Result<()> {
    if query.trim().is_empty() {
        return Err(invalid("query must not be empty"));
    }
    Ok(())
}

fn check_max_results(max_results: Option<i64>) -> Result<usize> {
    let n = max_results.unwrap_or(DEFAULT_TOOL_RESULTS);
    if !(1..=TOOL_MAX_RESULTS).contains(&n) {
        return Err(invalid(format!(
            "max_results must be between 1 and {}, got {}",
            TOOL_MAX_RESULTS, n
        )));
    }
    Ok(n as usize)
}

fn check_date(field: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match value {
        None => Ok(None),
        Some(v) => parse_datetime_arg(v)
            .map(Some)
            .ok_or_else(|| invalid(format!("{} must be YYYY-MM-DD or RFC 3339, got '{}'", field, v))),
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(params: &Value) -> Result<T> {
    if !params.is_object() {
        return Err(invalid("arguments must be a JSON object"));
    }
    serde_json::from_value(params.clone()).map_err(|e| invalid(e.to_string()))
}

/// Compact JSON view of results handed back to the model.
fn results_json(results: &[ScoredEntry]) -> Value {
    let items: Vec<Value> = results
        .iter()
        .map(|r| {
            let text: String = r.entry.raw_text.chars().take(TOOL_TEXT_CHARS).collect();
            json!({
                "entry_id": r.entry.entry_id,
                "timestamp": r.entry.timestamp,
                "author": r.entry.author,
                "score": r.score,
                "text": text,
            })
        })
        .collect();
    json!({ "results": items })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawKeywordArgs {
    query: String,
    #[serde(default)]
    max_results: Option<i64>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
}

/// Validated `keyword_search` arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordSearchArgs {
    pub query: String,
    pub max_results: usize,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl KeywordSearchArgs {
    pub fn from_value(params: &Value) -> Result<Self> {
        let raw: RawKeywordArgs = parse_args(params)?;
        check_query(&raw.query)?;
        let args = Self {
            max_results: check_max_results(raw.max_results)?,
            start_date: check_date("start_date", raw.start_date.as_deref())?,
            end_date: check_date("end_date", raw.end_date.as_deref())?,
            query: raw.query,
        };
        if let (Some(s), Some(e)) = (args.start_date, args.end_date) {
            if s >= e {
                return Err(invalid("start_date must be before end_date"));
            }
        }
        Ok(args)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSemanticArgs {
    query: String,
    #[serde(default)]
    max_results: Option<i64>,
    #[serde(default)]
    similarity_threshold: Option<f64>,
}

/// Validated `semantic_search` arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticSearchArgs {
    pub query: String,
    pub max_results: usize,
    pub similarity_threshold: Option<f64>,
}

impl SemanticSearchArgs {
    pub fn from_value(params: &Value) -> Result<Self> {
        let raw: RawSemanticArgs = parse_args(params)?;
        check_query(&raw.query)?;
        if let Some(t) = raw.similarity_threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(invalid(format!(
                    "similarity_threshold must be between 0 and 1, got {}",
                    t
                )));
            }
        }
        Ok(Self {
            max_results: check_max_results(raw.max_results)?,
            similarity_threshold: raw.similarity_threshold,
            query: raw.query,
        })
    }
}

pub struct KeywordSearchTool;

#[async_trait]
impl Tool for KeywordSearchTool {
    fn name(&self) -> &str {
        "keyword_search"
    }

    fn description(&self) -> &str {
        "Full-text search over logbook entries. Supports \"exact phrases\", author:name and date:YYYY[-MM[-DD]] filters."
    }

    fn mode(&self) -> SearchMode {
        SearchMode::Keyword
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search terms" },
                "max_results": { "type": "integer", "minimum": 1, "maximum": TOOL_MAX_RESULTS, "default": DEFAULT_TOOL_RESULTS },
                "start_date": { "type": "string", "description": "Inclusive lower bound (YYYY-MM-DD or RFC 3339)" },
                "end_date": { "type": "string", "description": "Exclusive upper bound (YYYY-MM-DD or RFC 3339)" }
            },
            "required": ["query"]
        })
    }

    fn validate(&self, params: &Value) -> Result<()> {
        KeywordSearchArgs::from_value(params).map(|_| ())
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let args = KeywordSearchArgs::from_value(&params)?;
        let search_params = SearchParams {
            max_results: args.max_results,
            start_date: args.start_date,
            end_date: args.end_date,
            include_highlights: false,
            ..SearchParams::default()
        };
        let results = keyword::keyword_search(&ctx.repo, &args.query, &search_params).await?;
        Ok(results_json(&results))
    }
}

pub struct SemanticSearchTool;

#[async_trait]
impl Tool for SemanticSearchTool {
    fn name(&self) -> &str {
        "semantic_search"
    }

    fn description(&self) -> &str {
        "Find logbook entries by meaning using vector similarity. Use for conceptual questions."
    }

    fn mode(&self) -> SearchMode {
        SearchMode::Semantic
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Natural-language description" },
                "max_results": { "type": "integer", "minimum": 1, "maximum": TOOL_MAX_RESULTS, "default": DEFAULT_TOOL_RESULTS },
                "similarity_threshold": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
            },
            "required": ["query"]
        })
    }

    fn validate(&self, params: &Value) -> Result<()> {
        SemanticSearchArgs::from_value(params).map(|_| ())
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let args = SemanticSearchArgs::from_value(&params)?;
        let embedder = ctx.embedder.as_deref().ok_or_else(|| {
            ArielError::Configuration("semantic search requires an embedding provider".to_string())
        })?;
        let search_params = SearchParams {
            max_results: args.max_results,
            similarity_threshold: args.similarity_threshold,
            ..SearchParams::default()
        };
        let results =
            semantic::semantic_search(&ctx.repo, embedder, &args.query, &search_params).await?;
        Ok(results_json(&results))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Tool Registry
// ═══════════════════════════════════════════════════════════════════════

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// One tool per enabled search module.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        if Capability::KeywordSearch.is_enabled(config) {
            registry.register(Box::new(KeywordSearchTool));
        }
        if Capability::SemanticSearch.is_enabled(config) {
            registry.register(Box::new(SemanticSearchTool));
        }
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{full_config, keyword_config};

    #[test]
    fn test_adapter_registry_not_found_lists_names() {
        let registry = AdapterRegistry::with_builtins();
        let err = registry
            .create("jlab", &keyword_config("sqlite::memory:"))
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Unknown ingestion adapter 'jlab'. Available: als_logbook, generic_json"
        );
    }

    #[test]
    fn test_tools_follow_enabled_modules() {
        let tools = ToolRegistry::from_config(&keyword_config("sqlite::memory:"));
        assert_eq!(tools.len(), 1);
        assert!(tools.find("keyword_search").is_some());
        assert!(tools.find("semantic_search").is_none());

        let tools = ToolRegistry::from_config(&full_config("sqlite::memory:"));
        let names: Vec<&str> = tools.tools().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["keyword_search", "semantic_search"]);
    }

    #[test]
    fn test_keyword_args_validation() {
        let ok = KeywordSearchArgs::from_value(&json!({"query": "beam", "max_results": 50})).unwrap();
        assert_eq!(ok.max_results, 50);
        assert_eq!(KeywordSearchArgs::from_value(&json!({"query": "beam"})).unwrap().max_results, 10);

        for bad in [
            json!({"query": "beam", "max_results": 0}),
            json!({"query": "beam", "max_results": 51}),
            json!({"query": "beam", "max_results": "ten"}),
            json!({"query": "  "}),
            json!({"max_results": 5}),
            json!({"query": "beam", "start_date": "yesterday"}),
            json!({"query": "beam", "start_date": "2024-02-01", "end_date": "2024-01-01"}),
            json!({"query": "beam", "source": "x"}),
            json!("beam"),
        ] {
            let err = KeywordSearchArgs::from_value(&bad).unwrap_err();
            assert!(matches!(err, ArielError::InvalidArguments(_)), "{bad} → {err:?}");
        }
    }

    #[test]
    fn test_semantic_args_validation() {
        let ok = SemanticSearchArgs::from_value(&json!({"query": "rf", "similarity_threshold": 1.0})).unwrap();
        assert_eq!(ok.similarity_threshold, Some(1.0));
        assert!(SemanticSearchArgs::from_value(&json!({"query": "rf", "similarity_threshold": 1.5})).is_err());
        assert!(SemanticSearchArgs::from_value(&json!({"query": "rf", "similarity_threshold": -0.1})).is_err());
        assert!(SemanticSearchArgs::from_value(&json!({"query": "rf", "max_results": -3})).is_err());
    }

    #[test]
    fn test_fetch_window_is_half_open() {
        let start = Utc::now() - chrono::Duration::days(1);
        let end = Utc::now();
        let window = FetchWindow { start: Some(start), end };
        assert!(window.contains(start));
        assert!(!window.contains(end));
        let open = FetchWindow { start: None, end };
        assert!(open.contains(start - chrono::Duration::days(9999)));
    }
}
