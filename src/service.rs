//! Search entry point: routes a query to the strategy for its mode.
//!
//! Every mode checks its module requirements before any I/O, so a request
//! for a disabled capability fails fast with a configuration error.

use std::sync::Arc;

use crate::agent::run_agent;
use crate::cancel::CancelToken;
use crate::config::{Capability, Config};
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{ArielError, Result};
use crate::llm::{create_chat_model, ChatModel};
use crate::models::{SearchMode, SearchParams, SearchResponse};
use crate::rag;
use crate::repository::EntryRepository;
use crate::search::{fuzzy, keyword, semantic, should_fallback_to_fuzzy};
use crate::status::{get_status, ServiceStatus};
use crate::traits::{ToolContext, ToolRegistry};

#[derive(Clone)]
pub struct SearchService {
    repo: EntryRepository,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    chat: Option<Arc<dyn ChatModel>>,
}

impl SearchService {
    pub fn new(
        repo: EntryRepository,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        chat: Option<Arc<dyn ChatModel>>,
    ) -> Self {
        Self { repo, embedder, chat }
    }

    /// Connect to the database and build the configured providers.
    pub async fn from_config(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        let embedder = if Capability::TextEmbedding.is_enabled(&config) {
            Some(create_provider(&config.enhancement_modules.text_embedding.settings)?)
        } else {
            None
        };
        let chat = create_chat_model(&config.reasoning)?;
        Ok(Self::new(EntryRepository::new(pool, Arc::new(config)), embedder, chat))
    }

    pub fn repo(&self) -> &EntryRepository {
        &self.repo
    }

    pub fn config(&self) -> &Config {
        self.repo.config()
    }

    fn require_chat(&self, mode: SearchMode) -> Result<&dyn ChatModel> {
        self.chat.as_deref().ok_or_else(|| {
            ArielError::Configuration(format!(
                "{} mode requires a reasoning provider (reasoning.provider is 'disabled')",
                mode
            ))
        })
    }

    fn require_embedder(&self) -> Result<&dyn EmbeddingProvider> {
        self.embedder.as_deref().ok_or_else(|| {
            ArielError::Configuration("semantic search requires an embedding provider".to_string())
        })
    }

    fn require_any_search_module(&self, mode: SearchMode) -> Result<()> {
        if self.config().enabled_search_modules().is_empty() {
            return Err(ArielError::Configuration(format!(
                "{} mode requires the keyword or semantic search module",
                mode
            )));
        }
        Ok(())
    }

    /// Fail with a configuration error unless `mode` can run.
    pub fn ensure_mode_enabled(&self, mode: SearchMode) -> Result<()> {
        let config = self.config();
        match mode {
            SearchMode::Keyword | SearchMode::Fuzzy => {
                Capability::KeywordSearch.require(config, &format!("{} search", mode))
            }
            SearchMode::Semantic => {
                Capability::SemanticSearch.require(config, "semantic search")?;
                self.require_embedder().map(|_| ())
            }
            SearchMode::Rag | SearchMode::Agent => {
                self.require_any_search_module(mode)?;
                self.require_chat(mode).map(|_| ())
            }
        }
    }

    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        params: &SearchParams,
    ) -> Result<SearchResponse> {
        self.search_with_cancel(query, mode, params, &CancelToken::new())
            .await
    }

    pub async fn search_with_cancel(
        &self,
        query: &str,
        mode: SearchMode,
        params: &SearchParams,
        cancel: &CancelToken,
    ) -> Result<SearchResponse> {
        self.ensure_mode_enabled(mode)?;
        tracing::info!(%mode, query_len = query.len(), max_results = params.max_results, "search");

        match mode {
            SearchMode::Keyword => self.keyword_with_fallback(query, params).await,
            SearchMode::Fuzzy => {
                let hits = fuzzy::fuzzy_search(&self.repo, query, params).await?;
                let reasoning = format!(
                    "Fuzzy search (threshold {:.2}) found {} entries.",
                    fuzzy::fuzzy_threshold(&self.repo, params),
                    hits.len()
                );
                Ok(SearchResponse::from_entries(hits, SearchMode::Fuzzy, reasoning))
            }
            SearchMode::Semantic => {
                let hits =
                    semantic::semantic_search(&self.repo, self.require_embedder()?, query, params)
                        .await?;
                let reasoning = format!(
                    "Semantic search (threshold {:.2}) found {} entries.",
                    semantic::similarity_threshold(&self.repo, params),
                    hits.len()
                );
                Ok(SearchResponse::from_entries(hits, SearchMode::Semantic, reasoning))
            }
            SearchMode::Rag => {
                rag::answer(
                    &self.repo,
                    self.embedder.as_deref(),
                    self.require_chat(mode)?,
                    query,
                    params,
                )
                .await
            }
            SearchMode::Agent => {
                let ctx = ToolContext {
                    repo: self.repo.clone(),
                    embedder: self.embedder.clone(),
                };
                let tools = ToolRegistry::from_config(self.config());
                run_agent(
                    &ctx,
                    self.require_chat(mode)?,
                    &tools,
                    query,
                    self.config().reasoning.max_iterations,
                    cancel,
                )
                .await
            }
        }
    }

    async fn keyword_with_fallback(
        &self,
        query: &str,
        params: &SearchParams,
    ) -> Result<SearchResponse> {
        let hits = keyword::keyword_search(&self.repo, query, params).await?;
        if !should_fallback_to_fuzzy(hits.len(), params.fuzzy_fallback) {
            let reasoning = format!("Keyword search found {} entries.", hits.len());
            return Ok(SearchResponse::from_entries(hits, SearchMode::Keyword, reasoning));
        }

        tracing::debug!("keyword search empty, falling back to fuzzy");
        let hits = fuzzy::fuzzy_search(&self.repo, query, params).await?;
        let reasoning = format!(
            "Keyword search found nothing; fuzzy fallback found {} entries.",
            hits.len()
        );
        let mut response = SearchResponse::from_entries(hits, SearchMode::Keyword, reasoning);
        response.modes_used.push(SearchMode::Fuzzy);
        Ok(response)
    }

    /// `(healthy, message)` from a database round-trip.
    pub async fn health_check(&self) -> (bool, String) {
        match self.repo.count_entries().await {
            Ok(count) => (true, format!("database connected, {} entries", count)),
            Err(e) => (false, format!("database unavailable: {}", e)),
        }
    }

    pub async fn get_status(&self) -> ServiceStatus {
        get_status(&self.repo).await
    }
}
