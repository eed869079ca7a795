//! Semantic (vector similarity) search.

use crate::config::Capability;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::{ArielError, Result};
use crate::models::{ScoredEntry, SearchParams};
use crate::query::parse;
use crate::repository::EntryRepository;
use crate::search::{effective_time_range, resolve_threshold, DEFAULT_SIMILARITY_THRESHOLD};

/// Per-call, then `search_modules.semantic.settings.similarity_threshold`,
/// then the default.
pub fn similarity_threshold(repo: &EntryRepository, params: &SearchParams) -> f64 {
    resolve_threshold(
        params.similarity_threshold,
        repo.config().search_modules.semantic.settings.similarity_threshold,
        DEFAULT_SIMILARITY_THRESHOLD,
    )
}

/// Embed the query with the active model, then rank stored embeddings.
pub async fn semantic_search(
    repo: &EntryRepository,
    embedder: &dyn EmbeddingProvider,
    query: &str,
    params: &SearchParams,
) -> Result<Vec<ScoredEntry>> {
    Capability::SemanticSearch.require(repo.config(), "semantic search")?;

    let model = repo.config().semantic_model().ok_or_else(|| {
        ArielError::Configuration("no embedding model configured for semantic search".to_string())
    })?;

    let parsed = parse(query);
    let text = parsed.similarity_text();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let vector = embed_query(embedder, &model.name, &text).await?;
    if vector.len() != model.dimension {
        tracing::warn!(
            model = %model.name,
            expected = model.dimension,
            actual = vector.len(),
            "query embedding dimension mismatch; comparing shared prefix"
        );
    }

    let threshold = similarity_threshold(repo, params);
    let (start, end) = effective_time_range(&parsed, params);
    repo.semantic_search(&vector, threshold, start, end, params.max_results)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::test_support::{
        entry, full_config, keyword_config, migrated_repo, ts, StaticEmbedder, TEST_DIMENSION, TEST_MODEL,
    };

    fn configured_threshold(uri: &str) -> Config {
        Config::from_toml_str(&format!(
            r#"
[database]
uri = "{uri}"

[search_modules.semantic]
enabled = true
settings = {{ similarity_threshold = 0.8 }}

[enhancement_modules.text_embedding]
enabled = true
settings = {{ models = [{{ name = "{TEST_MODEL}", dimension = {TEST_DIMENSION} }}] }}
"#
        ))
        .unwrap()
    }

    fn explicit(threshold: f64) -> SearchParams {
        SearchParams {
            similarity_threshold: Some(threshold),
            ..SearchParams::default()
        }
    }

    #[tokio::test]
    async fn test_similarity_threshold_tiers() {
        let (_dir, repo) = migrated_repo(full_config).await;
        assert_eq!(
            similarity_threshold(&repo, &SearchParams::default()),
            DEFAULT_SIMILARITY_THRESHOLD
        );

        let (_dir2, repo) = migrated_repo(configured_threshold).await;
        assert_eq!(similarity_threshold(&repo, &SearchParams::default()), 0.8);
        assert_eq!(similarity_threshold(&repo, &explicit(0.5)), 0.5);
    }

    #[tokio::test]
    async fn test_configured_threshold_overridden_per_call() {
        let (_dir, repo) = migrated_repo(configured_threshold).await;
        repo.upsert_entry(&entry("1", ts(2024, 1, 5), "a", "beam loss")).await.unwrap();
        // cosine with the query below is about 0.75
        repo.store_embedding(TEST_MODEL, "1", &[0.75, 0.66, 0.0, 0.0]).await.unwrap();

        let embedder = StaticEmbedder::new(vec![1.0, 0.0, 0.0, 0.0]);
        assert!(semantic_search(&repo, &embedder, "losses", &SearchParams::default())
            .await
            .unwrap()
            .is_empty());

        let hits = semantic_search(&repo, &embedder, "losses", &explicit(0.5)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.75).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_semantic_search_ranks_by_similarity() {
        let (_dir, repo) = migrated_repo(full_config).await;
        repo.upsert_entry(&entry("1", ts(2024, 1, 5), "a", "beam loss")).await.unwrap();
        repo.upsert_entry(&entry("2", ts(2024, 1, 6), "a", "beam dump")).await.unwrap();
        repo.store_embedding(TEST_MODEL, "1", &[1.0, 0.0, 0.0, 0.0]).await.unwrap();
        repo.store_embedding(TEST_MODEL, "2", &[0.8, 0.6, 0.0, 0.0]).await.unwrap();

        let embedder = StaticEmbedder::new(vec![1.0, 0.0, 0.0, 0.0]);
        let hits = semantic_search(&repo, &embedder, "losses", &SearchParams::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.entry.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);

        let strict = SearchParams {
            similarity_threshold: Some(0.9),
            ..SearchParams::default()
        };
        let hits = semantic_search(&repo, &embedder, "losses", &strict).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_still_searches() {
        let (_dir, repo) = migrated_repo(full_config).await;
        repo.upsert_entry(&entry("1", ts(2024, 1, 5), "a", "beam loss")).await.unwrap();
        repo.store_embedding(TEST_MODEL, "1", &[1.0, 0.0, 0.0, 0.0]).await.unwrap();

        let embedder = StaticEmbedder::new(vec![1.0, 0.0]);
        let hits = semantic_search(&repo, &embedder, "beam", &SearchParams::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_module_fails_before_embedding() {
        let (_dir, repo) = migrated_repo(keyword_config).await;
        let embedder = StaticEmbedder::new(vec![1.0]);
        let err = semantic_search(&repo, &embedder, "beam", &SearchParams::default())
            .await
            .unwrap_err();
        assert!(err.is_configuration_error());
        assert_eq!(embedder.calls(), 0);
    }
}
