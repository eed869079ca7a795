//! Search strategies and the rules they share.
//!
//! Each strategy consumes [`crate::query::parse`] output plus the
//! [`EntryRepository`](crate::repository::EntryRepository) and returns
//! scored entries:
//!
//! - [`keyword`]: FTS5 match with BM25 rank and highlighted snippets.
//! - [`fuzzy`]: trigram word-similarity, typo-tolerant.
//! - [`semantic`]: cosine similarity against stored embeddings.
//!
//! Thresholds resolve in three tiers: per-call value, then the configured
//! module default, then the constant below.

pub mod fuzzy;
pub mod keyword;
pub mod semantic;

use chrono::{DateTime, Utc};

use crate::models::SearchParams;
use crate::query::ParsedQuery;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.6;

/// Per-call value, else configured default, else `fallback`.
pub fn resolve_threshold(per_call: Option<f64>, configured: Option<f64>, fallback: f64) -> f64 {
    per_call.or(configured).unwrap_or(fallback)
}

/// Keyword mode retries with fuzzy search only when keyword found nothing
/// and the caller opted in.
pub fn should_fallback_to_fuzzy(keyword_result_count: usize, fuzzy_fallback: bool) -> bool {
    keyword_result_count == 0 && fuzzy_fallback
}

/// Intersection of the caller's `[start_date, end_date)` and the query's
/// `date:` filter.
pub fn effective_time_range(
    parsed: &ParsedQuery,
    params: &SearchParams,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let mut start = params.start_date;
    let mut end = params.end_date;
    if let Some((from, to)) = parsed.date_range() {
        start = Some(start.map_or(from, |s| s.max(from)));
        end = Some(end.map_or(to, |e| e.min(to)));
    }
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse;
    use chrono::TimeZone;

    #[test]
    fn test_threshold_tiers() {
        assert_eq!(resolve_threshold(Some(0.9), Some(0.8), 0.7), 0.9);
        assert_eq!(resolve_threshold(None, Some(0.8), 0.7), 0.8);
        assert_eq!(resolve_threshold(None, None, 0.7), 0.7);
        assert_eq!(resolve_threshold(Some(0.0), None, 0.7), 0.0);
    }

    #[test]
    fn test_fuzzy_fallback_truth_table() {
        assert!(should_fallback_to_fuzzy(0, true));
        assert!(!should_fallback_to_fuzzy(0, false));
        assert!(!should_fallback_to_fuzzy(3, true));
        assert!(!should_fallback_to_fuzzy(3, false));
    }

    #[test]
    fn test_time_range_intersection() {
        let parsed = parse("date:2024-01");
        let params = SearchParams {
            start_date: Some(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()),
            ..SearchParams::default()
        };
        let (start, end) = effective_time_range(&parsed, &params);
        assert_eq!(start, Some(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()));
        assert_eq!(end, Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));

        let (start, end) = effective_time_range(&parse("beam"), &SearchParams::default());
        assert!(start.is_none() && end.is_none());
    }
}
