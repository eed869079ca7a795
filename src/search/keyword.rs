//! Keyword (full-text) search.

use crate::config::Capability;
use crate::error::Result;
use crate::models::{ScoredEntry, SearchParams};
use crate::query::{parse, ParsedQuery};
use crate::repository::{EntryRepository, SqlFilter};
use crate::search::effective_time_range;

/// FTS terms and WHERE filters derived from a parsed query.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordQuery {
    /// Bare terms then phrases; each is matched as one quoted FTS phrase.
    pub terms: Vec<String>,
    pub filters: Vec<SqlFilter>,
}

/// Tokens without any alphanumeric character cannot match an FTS token.
fn is_searchable(term: &str) -> bool {
    term.chars().any(char::is_alphanumeric)
}

pub fn build_keyword_query(parsed: &ParsedQuery, params: &SearchParams) -> KeywordQuery {
    let terms = parsed
        .terms()
        .into_iter()
        .map(str::to_string)
        .chain(parsed.phrases.iter().cloned())
        .filter(|t| is_searchable(t))
        .collect();

    let mut filters = Vec::new();
    if let Some(author) = parsed.author() {
        filters.push(SqlFilter::author_contains(author));
    }
    let (start, end) = effective_time_range(parsed, params);
    filters.extend(SqlFilter::time_range(start, end));

    KeywordQuery { terms, filters }
}

pub async fn keyword_search(
    repo: &EntryRepository,
    query: &str,
    params: &SearchParams,
) -> Result<Vec<ScoredEntry>> {
    Capability::KeywordSearch.require(repo.config(), "keyword search")?;

    let parsed = parse(query);
    let kq = build_keyword_query(&parsed, params);
    if kq.terms.is_empty() && kq.filters.is_empty() {
        return Ok(Vec::new());
    }

    tracing::debug!(terms = kq.terms.len(), filters = kq.filters.len(), "keyword search");
    repo.keyword_search(&kq.terms, &kq.filters, params.max_results, params.include_highlights)
        .await
}
