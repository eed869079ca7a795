//! TOML configuration parsing and validation.
//!
//! Every section except `[database]` is optional; missing sections take the
//! defaults below. Module enablement lives here and is the single source of
//! truth consulted by [`Capability::is_enabled`].
//!
//! ```toml
//! [database]
//! uri = "sqlite:./data/ariel.sqlite"
//!
//! [search_modules.keyword]
//! enabled = true
//!
//! [search_modules.semantic]
//! enabled = true
//! settings = { model = "nomic-embed-text", similarity_threshold = 0.75 }
//!
//! [enhancement_modules.text_embedding]
//! enabled = true
//! settings = { provider = "ollama", models = [{ name = "nomic-embed-text", dimension = 768 }] }
//!
//! [ingestion]
//! adapter = "als_logbook"
//! source_url = "https://elog.example.org/api/entries"
//! chunk_days = 30
//!
//! [reasoning]
//! provider = "openai"
//! model_id = "gpt-4o-mini"
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::error::{ArielError, Result};

/// Name of the text-embedding enhancement module.
pub const TEXT_EMBEDDING_MODULE: &str = "text_embedding";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub search_modules: SearchModulesConfig,
    #[serde(default)]
    pub enhancement_modules: EnhancementModulesConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// `sqlite:<path>`, `sqlite://<path>`, or a bare file path.
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

// ============ Search modules ============

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SearchModulesConfig {
    #[serde(default)]
    pub keyword: KeywordModuleConfig,
    #[serde(default)]
    pub semantic: SemanticModuleConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct KeywordModuleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub settings: KeywordSettings,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct KeywordSettings {
    /// Default trigram word-similarity threshold for fuzzy search.
    #[serde(default)]
    pub fuzzy_threshold: Option<f64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SemanticModuleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub settings: SemanticSettings,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SemanticSettings {
    /// Embedding model queried by semantic search. Defaults to the first
    /// model configured under `enhancement_modules.text_embedding`.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub similarity_threshold: Option<f64>,
}

// ============ Enhancement modules ============

#[derive(Debug, Deserialize, Clone, Default)]
pub struct EnhancementModulesConfig {
    #[serde(default)]
    pub text_embedding: TextEmbeddingModuleConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TextEmbeddingModuleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub settings: EmbeddingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingSettings {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: Vec<EmbeddingModelConfig>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            base_url: None,
            models: Vec::new(),
            batch_size: default_batch_size(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EmbeddingModelConfig {
    pub name: String,
    pub dimension: usize,
}

fn default_embedding_provider() -> String {
    "ollama".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_embedding_timeout() -> u64 {
    30
}
fn default_embedding_retries() -> u32 {
    3
}

// ============ Ingestion ============

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_adapter")]
    pub adapter: String,
    #[serde(default)]
    pub source_url: Option<String>,
    /// Overrides the adapter's default `source_system` label.
    #[serde(default)]
    pub source_system: Option<String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_chunk_days")]
    pub chunk_days: u32,
    /// Each window after the first starts this many hours before the
    /// previous window's end.
    #[serde(default)]
    pub chunk_overlap_hours: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_ingest_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            adapter: default_adapter(),
            source_url: None,
            source_system: None,
            proxy_url: None,
            verify_ssl: true,
            chunk_days: default_chunk_days(),
            chunk_overlap_hours: 0,
            request_timeout_seconds: default_request_timeout(),
            max_retries: default_ingest_retries(),
            retry_delay_seconds: default_retry_delay(),
        }
    }
}

fn default_adapter() -> String {
    "als_logbook".to_string()
}
fn default_true() -> bool {
    true
}
fn default_chunk_days() -> u32 {
    365
}
fn default_request_timeout() -> u64 {
    60
}
fn default_ingest_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    5
}

// ============ Reasoning ============

#[derive(Debug, Deserialize, Clone)]
pub struct ReasoningConfig {
    #[serde(default = "default_reasoning_provider")]
    pub provider: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Number of retrieved entries placed in the RAG prompt.
    #[serde(default = "default_max_context_entries")]
    pub max_context_entries: usize,
    #[serde(default = "default_reasoning_timeout")]
    pub timeout_secs: u64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            provider: default_reasoning_provider(),
            model_id: None,
            base_url: None,
            temperature: default_temperature(),
            max_iterations: default_max_iterations(),
            max_context_entries: default_max_context_entries(),
            timeout_secs: default_reasoning_timeout(),
        }
    }
}

impl ReasoningConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_reasoning_provider() -> String {
    "disabled".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_iterations() -> usize {
    6
}
fn default_max_context_entries() -> usize {
    10
}
fn default_reasoning_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8085".to_string()
}

// ============ Capabilities ============

/// A gated capability. Each module-specific strategy or repository method
/// checks its capability before doing any I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    KeywordSearch,
    SemanticSearch,
    TextEmbedding,
}

impl Capability {
    /// Configuration key of the module backing this capability.
    pub fn module_name(&self) -> &'static str {
        match self {
            Capability::KeywordSearch => "keyword",
            Capability::SemanticSearch => "semantic",
            Capability::TextEmbedding => TEXT_EMBEDDING_MODULE,
        }
    }

    pub fn is_enabled(&self, config: &Config) -> bool {
        match self {
            Capability::KeywordSearch => config.search_modules.keyword.enabled,
            Capability::SemanticSearch => config.search_modules.semantic.enabled,
            Capability::TextEmbedding => config.enhancement_modules.text_embedding.enabled,
        }
    }

    /// Fail with [`ArielError::ModuleNotEnabled`] unless enabled.
    pub fn require(&self, config: &Config, operation: &str) -> Result<()> {
        if self.is_enabled(config) {
            Ok(())
        } else {
            Err(ArielError::module_not_enabled(self.module_name(), operation))
        }
    }
}

impl Config {
    /// Enabled search modules in a stable order (keyword, semantic).
    pub fn enabled_search_modules(&self) -> Vec<&'static str> {
        [Capability::KeywordSearch, Capability::SemanticSearch]
            .iter()
            .filter(|c| c.is_enabled(self))
            .map(|c| c.module_name())
            .collect()
    }

    pub fn enabled_enhancement_modules(&self) -> Vec<&'static str> {
        let mut modules = Vec::new();
        if self.enhancement_modules.text_embedding.enabled {
            modules.push(TEXT_EMBEDDING_MODULE);
        }
        modules
    }

    pub fn is_enhancement_module_enabled(&self, name: &str) -> bool {
        self.enabled_enhancement_modules().contains(&name)
    }

    /// Configured embedding models (empty when text embeddings are disabled).
    pub fn embedding_models(&self) -> &[EmbeddingModelConfig] {
        if self.enhancement_modules.text_embedding.enabled {
            &self.enhancement_modules.text_embedding.settings.models
        } else {
            &[]
        }
    }

    /// The model queried by semantic search.
    pub fn semantic_model(&self) -> Option<&EmbeddingModelConfig> {
        let models = self.embedding_models();
        match &self.search_modules.semantic.settings.model {
            Some(name) => models.iter().find(|m| &m.name == name),
            None => models.first(),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database.uri.trim().is_empty() {
            return Err(config_err("database.uri must not be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(config_err("database.max_connections must be >= 1"));
        }

        check_unit("search_modules.semantic.settings.similarity_threshold",
            self.search_modules.semantic.settings.similarity_threshold)?;
        check_unit("search_modules.keyword.settings.fuzzy_threshold",
            self.search_modules.keyword.settings.fuzzy_threshold)?;

        let embedding = &self.enhancement_modules.text_embedding;
        if embedding.enabled {
            if embedding.settings.models.is_empty() {
                return Err(config_err(
                    "enhancement_modules.text_embedding.settings.models must list at least one model",
                ));
            }
            for model in &embedding.settings.models {
                if model.dimension == 0 {
                    return Err(config_err(&format!(
                        "embedding model '{}' must have dimension > 0",
                        model.name
                    )));
                }
            }
            if embedding.settings.batch_size == 0 {
                return Err(config_err("text_embedding batch_size must be >= 1"));
            }
            match embedding.settings.provider.as_str() {
                "ollama" | "openai" => {}
                other => {
                    return Err(config_err(&format!(
                        "Unknown embedding provider: '{}'. Must be ollama or openai.",
                        other
                    )))
                }
            }
        }

        if self.search_modules.semantic.enabled {
            if !embedding.enabled {
                return Err(config_err(
                    "search_modules.semantic requires enhancement_modules.text_embedding to be enabled",
                ));
            }
            if self.semantic_model().is_none() {
                return Err(config_err(&format!(
                    "search_modules.semantic.settings.model '{}' is not a configured embedding model",
                    self.search_modules.semantic.settings.model.as_deref().unwrap_or("")
                )));
            }
        }

        if self.ingestion.chunk_days == 0 {
            return Err(config_err("ingestion.chunk_days must be >= 1"));
        }
        if u64::from(self.ingestion.chunk_overlap_hours) >= u64::from(self.ingestion.chunk_days) * 24 {
            return Err(config_err(
                "ingestion.chunk_overlap_hours must be shorter than one window",
            ));
        }

        match self.reasoning.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => {
                return Err(config_err(&format!(
                    "Unknown reasoning provider: '{}'. Must be disabled, openai, or ollama.",
                    other
                )))
            }
        }
        if self.reasoning.is_enabled() && self.reasoning.model_id.is_none() {
            return Err(config_err(&format!(
                "reasoning.model_id must be specified when provider is '{}'",
                self.reasoning.provider
            )));
        }
        if self.reasoning.max_iterations == 0 {
            return Err(config_err("reasoning.max_iterations must be >= 1"));
        }

        Ok(())
    }
}

fn config_err(message: &str) -> ArielError {
    ArielError::Configuration(message.to_string())
}

fn check_unit(key: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !(0.0..=1.0).contains(&v) => {
            Err(config_err(&format!("{} must be in [0.0, 1.0]", key)))
        }
        _ => Ok(()),
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ArielError::Configuration(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    Config::from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[database]
uri = "sqlite::memory:"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert!(config.enabled_search_modules().is_empty());
        assert!(config.enabled_enhancement_modules().is_empty());
        assert_eq!(config.ingestion.adapter, "als_logbook");
        assert_eq!(config.ingestion.chunk_days, 365);
        assert_eq!(config.ingestion.max_retries, 3);
        assert!(config.ingestion.verify_ssl);
        assert!(!config.reasoning.is_enabled());
    }

    #[test]
    fn test_semantic_requires_text_embedding() {
        let toml = r#"
[database]
uri = "sqlite::memory:"

[search_modules.semantic]
enabled = true
"#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_semantic_model_defaults_to_first_configured() {
        let toml = r#"
[database]
uri = "sqlite::memory:"

[search_modules.semantic]
enabled = true

[enhancement_modules.text_embedding]
enabled = true
settings = { models = [{ name = "nomic-embed-text", dimension = 768 }, { name = "mxbai", dimension = 1024 }] }
"#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.semantic_model().unwrap().name, "nomic-embed-text");
        assert_eq!(config.enabled_search_modules(), vec!["semantic"]);
        assert_eq!(config.enabled_enhancement_modules(), vec![TEXT_EMBEDDING_MODULE]);
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let toml = r#"
[database]
uri = "sqlite::memory:"

[search_modules.keyword]
enabled = true
settings = { fuzzy_threshold = 1.5 }
"#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_reasoning_requires_model_id() {
        let toml = r#"
[database]
uri = "sqlite::memory:"

[reasoning]
provider = "openai"
"#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_capability_require() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        let err = Capability::KeywordSearch
            .require(&config, "keyword_search")
            .unwrap_err();
        assert!(matches!(err, ArielError::ModuleNotEnabled { .. }));
    }
}
