//! Query text parsing.
//!
//! Turns raw user input into search terms, exact phrases, and field filters.
//! Parsing never fails: malformed input is sanitized instead. The parsed
//! pieces are only ever bound as SQL parameters, never spliced into SQL.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Inputs longer than this many characters are truncated before parsing.
pub const MAX_QUERY_LENGTH: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedQuery {
    /// Free text with phrases and filters removed, whitespace-normalized.
    pub search_text: String,
    /// Lower-cased field name → value.
    pub filters: BTreeMap<String, String>,
    pub phrases: Vec<String>,
}

impl ParsedQuery {
    /// Bare search terms (whitespace-split `search_text`).
    pub fn terms(&self) -> Vec<&str> {
        self.search_text.split_whitespace().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.search_text.is_empty() && self.phrases.is_empty()
    }

    /// Text used for similarity scoring: terms followed by phrases.
    pub fn similarity_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if !self.search_text.is_empty() {
            parts.push(&self.search_text);
        }
        parts.extend(self.phrases.iter().map(String::as_str));
        parts.join(" ")
    }

    pub fn author(&self) -> Option<&str> {
        self.filters.get("author").map(String::as_str)
    }

    /// Half-open `[start, end)` range for the `date:` filter, if present and
    /// parseable. Unparseable values are ignored with a warning.
    pub fn date_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let value = self.filters.get("date")?;
        let range = date_range(value);
        if range.is_none() {
            tracing::warn!(value = %value, "ignoring unparseable date filter");
        }
        range
    }
}

fn quoted_filter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)\b(author|date):"([^"]*)""#).expect("valid regex"))
}

fn phrase_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""([^"]*)""#).expect("valid regex"))
}

fn bare_filter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(author|date):(.+)$").expect("valid regex"))
}

/// Parse raw query text. Never panics and never errors.
pub fn parse(text: &str) -> ParsedQuery {
    let mut text: String = text.chars().take(MAX_QUERY_LENGTH).collect();

    // Quote balancing: drop the last `"` when the count is odd.
    if text.matches('"').count() % 2 == 1 {
        if let Some(idx) = text.rfind('"') {
            text.remove(idx);
        }
    }

    let mut filters = BTreeMap::new();
    for cap in quoted_filter_re().captures_iter(&text) {
        let value = cap[2].trim();
        if !value.is_empty() {
            filters.insert(cap[1].to_lowercase(), value.to_string());
        }
    }
    let text = quoted_filter_re().replace_all(&text, " ");

    let phrases: Vec<String> = phrase_re()
        .captures_iter(&text)
        .map(|cap| cap[1].split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|p| !p.is_empty())
        .collect();
    let text = phrase_re().replace_all(&text, " ");

    let mut terms = Vec::new();
    for token in text.split_whitespace() {
        match bare_filter_re().captures(token) {
            Some(cap) => {
                filters.insert(cap[1].to_lowercase(), cap[2].to_string());
            }
            None => terms.push(token),
        }
    }

    ParsedQuery {
        search_text: terms.join(" "),
        filters,
        phrases,
    }
}

/// Resolve `YYYY`, `YYYY-MM`, or `YYYY-MM-DD` to a half-open UTC range.
pub fn date_range(value: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let parts: Vec<&str> = value.trim().split('-').collect();
    let nums: Vec<u32> = parts
        .iter()
        .map(|p| {
            if p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()) {
                None
            } else {
                p.parse().ok()
            }
        })
        .collect::<Option<Vec<u32>>>()?;

    let (start, end) = match nums.as_slice() {
        [y] if parts[0].len() == 4 => {
            let year = *y as i32;
            (
                NaiveDate::from_ymd_opt(year, 1, 1)?,
                NaiveDate::from_ymd_opt(year + 1, 1, 1)?,
            )
        }
        [y, m] if parts[0].len() == 4 => {
            let start = NaiveDate::from_ymd_opt(*y as i32, *m, 1)?;
            let end = if start.month() == 12 {
                NaiveDate::from_ymd_opt(start.year() + 1, 1, 1)?
            } else {
                NaiveDate::from_ymd_opt(start.year(), start.month() + 1, 1)?
            };
            (start, end)
        }
        [y, m, d] if parts[0].len() == 4 => {
            let start = NaiveDate::from_ymd_opt(*y as i32, *m, *d)?;
            (start, start.succ_opt()?)
        }
        _ => return None,
    };

    Some((
        Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0)?),
        Utc.from_utc_datetime(&end.and_hms_opt(0, 0, 0)?),
    ))
}

/// Parse a user-supplied instant: RFC 3339, or `YYYY[-MM[-DD]]` meaning
/// the start of that period (UTC).
pub fn parse_datetime_arg(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    date_range(value).map(|(start, _)| start)
}
