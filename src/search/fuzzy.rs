//! Fuzzy (trigram) search.

use crate::config::Capability;
use crate::error::Result;
use crate::models::{ScoredEntry, SearchParams};
use crate::query::parse;
use crate::repository::EntryRepository;
use crate::search::{effective_time_range, resolve_threshold, DEFAULT_FUZZY_THRESHOLD};

/// Word-similarity threshold for a call: per-call, then
/// `search_modules.keyword.settings.fuzzy_threshold`, then the default.
pub fn fuzzy_threshold(repo: &EntryRepository, params: &SearchParams) -> f64 {
    resolve_threshold(
        params.similarity_threshold,
        repo.config().search_modules.keyword.settings.fuzzy_threshold,
        DEFAULT_FUZZY_THRESHOLD,
    )
}

pub async fn fuzzy_search(
    repo: &EntryRepository,
    query: &str,
    params: &SearchParams,
) -> Result<Vec<ScoredEntry>> {
    Capability::KeywordSearch.require(repo.config(), "fuzzy search")?;

    let parsed = parse(query);
    let text = parsed.similarity_text();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let threshold = fuzzy_threshold(repo, params);
    let (start, end) = effective_time_range(&parsed, params);
    tracing::debug!(threshold, "fuzzy search");
    repo.fuzzy_search(&text, threshold, start, end, params.max_results)
        .await
}
