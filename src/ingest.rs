//! Ingestion pipeline orchestration.
//!
//! Coordinates one run: plan windows → fetch (with bounded retry) → dedup →
//! upsert → enhance. Each non-dry run is recorded in `ingestion_runs` before
//! the first fetch and finalized exactly once.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::IngestionConfig;
use crate::enhancement::{enhance_entries, EnhanceStats, Enhancer};
use crate::error::{ArielError, Result};
use crate::models::{Entry, RunCounts};
use crate::repository::{EntryRepository, UpsertOutcome};
use crate::traits::{FetchError, FetchWindow, IngestionAdapter};

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Inclusive lower bound. `None` resumes from the last successful run.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound. `None` means now.
    pub until: Option<DateTime<Utc>>,
    /// Cap on entries written after dedup.
    pub limit: Option<usize>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    /// `None` for dry runs.
    pub run_id: Option<String>,
    pub source_system: String,
    pub windows: usize,
    /// Unique entries after cross-window dedup (and limit).
    pub fetched: usize,
    pub counts: RunCounts,
    pub enhanced: usize,
    pub enhancement_failed: usize,
    pub dry_run: bool,
}

/// Fixed-delay retry for transient fetch errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &IngestionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: Duration::from_secs(config.retry_delay_seconds),
        }
    }
}

/// Split `[since, until)` into `chunk_days` windows. Every window after the
/// first starts `overlap_hours` before the previous window's end (clamped
/// to `since`). Without `since` the whole history is one window.
pub fn plan_windows(
    since: Option<DateTime<Utc>>,
    until: DateTime<Utc>,
    chunk_days: u32,
    overlap_hours: u32,
) -> Vec<FetchWindow> {
    let Some(since) = since else {
        return vec![FetchWindow { start: None, end: until }];
    };

    let step = ChronoDuration::days(i64::from(chunk_days.max(1)));
    let overlap = ChronoDuration::hours(i64::from(overlap_hours));

    let mut windows = Vec::new();
    let mut boundary = since;
    while boundary < until {
        let start = if windows.is_empty() {
            since
        } else {
            (boundary - overlap).max(since)
        };
        let end = (boundary + step).min(until);
        windows.push(FetchWindow {
            start: Some(start),
            end,
        });
        boundary = end;
    }
    windows
}

/// Fetch one window, retrying transient errors up to `policy.max_retries`
/// times. Fatal errors fail after a single attempt.
pub async fn fetch_with_retry(
    adapter: &dyn IngestionAdapter,
    window: &FetchWindow,
    policy: RetryPolicy,
    cancel: &CancelToken,
) -> Result<Vec<Entry>> {
    let mut attempt = 0u32;
    loop {
        cancel.check()?;
        attempt += 1;
        match adapter.fetch_window(window).await {
            Ok(entries) => return Ok(entries),
            Err(FetchError::Fatal(msg)) => {
                return Err(ArielError::Ingestion(format!(
                    "{} fetch failed: {}",
                    adapter.name(),
                    msg
                )))
            }
            Err(FetchError::Transient(msg)) if attempt > policy.max_retries => {
                return Err(ArielError::Ingestion(format!(
                    "{} fetch failed after {} attempts: {}",
                    adapter.name(),
                    attempt,
                    msg
                )))
            }
            Err(FetchError::Transient(msg)) => {
                tracing::warn!(
                    adapter = adapter.name(),
                    attempt,
                    max_retries = policy.max_retries,
                    error = %msg,
                    "transient fetch error, retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

/// Keep the first occurrence of each `entry_id`.
pub fn dedup_entries(entries: Vec<Entry>) -> Vec<Entry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert(e.entry_id.clone()))
        .collect()
}

/// Run one ingestion for `adapter`.
pub async fn run_ingestion(
    repo: &EntryRepository,
    adapter: &dyn IngestionAdapter,
    enhancers: &[Box<dyn Enhancer>],
    options: &IngestOptions,
    cancel: &CancelToken,
) -> Result<IngestionReport> {
    let config = &repo.config().ingestion;
    let source_system = adapter.source_system().to_string();

    let since = match options.since {
        Some(since) => Some(since),
        None if options.dry_run => None,
        None => repo
            .last_successful_run(&source_system)
            .await?
            .map(|run| run.started_at),
    };
    let until = options.until.unwrap_or_else(Utc::now);
    // A resumed range can be empty; only an explicit one is rejected.
    if let Some(since) = options.since {
        if since >= until {
            return Err(ArielError::InvalidArguments(format!(
                "since ({}) must be before until ({})",
                since.to_rfc3339(),
                until.to_rfc3339()
            )));
        }
    }
    let windows = plan_windows(since, until, config.chunk_days, config.chunk_overlap_hours);

    tracing::info!(
        adapter = adapter.name(),
        source_system = %source_system,
        since = ?since,
        until = %until,
        windows = windows.len(),
        dry_run = options.dry_run,
        "starting ingestion"
    );

    let run_id = if options.dry_run {
        None
    } else {
        Some(repo.create_ingestion_run(&source_system).await?)
    };

    let mut report = IngestionReport {
        run_id: run_id.clone(),
        source_system,
        windows: windows.len(),
        fetched: 0,
        counts: RunCounts::default(),
        enhanced: 0,
        enhancement_failed: 0,
        dry_run: options.dry_run,
    };

    let outcome = ingest_windows(repo, adapter, enhancers, options, cancel, &windows, &mut report).await;

    if let Some(id) = &run_id {
        match &outcome {
            Ok(()) => repo.complete_ingestion_run(id, report.counts).await?,
            Err(e) => repo.fail_ingestion_run(id, &e.to_string(), report.counts).await?,
        };
    }

    match outcome {
        Ok(()) => {
            tracing::info!(
                fetched = report.fetched,
                added = report.counts.added,
                updated = report.counts.updated,
                failed = report.counts.failed,
                "ingestion finished"
            );
            Ok(report)
        }
        Err(e) => {
            tracing::error!(error = %e, "ingestion failed");
            Err(e)
        }
    }
}

async fn ingest_windows(
    repo: &EntryRepository,
    adapter: &dyn IngestionAdapter,
    enhancers: &[Box<dyn Enhancer>],
    options: &IngestOptions,
    cancel: &CancelToken,
    windows: &[FetchWindow],
    report: &mut IngestionReport,
) -> Result<()> {
    let policy = RetryPolicy::from_config(&repo.config().ingestion);

    let mut fetched = Vec::new();
    for window in windows {
        cancel.check()?;
        let entries = fetch_with_retry(adapter, window, policy, cancel).await?;
        tracing::debug!(start = ?window.start, end = %window.end, count = entries.len(), "fetched window");
        fetched.extend(entries);
    }

    let mut entries = dedup_entries(fetched);
    if let Some(limit) = options.limit {
        entries.truncate(limit);
    }
    report.fetched = entries.len();

    if options.dry_run {
        return Ok(());
    }

    let mut to_enhance = Vec::new();
    for entry in entries {
        cancel.check()?;
        match repo.upsert_entry(&entry).await {
            Ok(outcome) => {
                if matches!(outcome, UpsertOutcome::Inserted) {
                    report.counts.added += 1;
                } else {
                    report.counts.updated += 1;
                }
                if outcome.needs_enhancement() {
                    to_enhance.push(entry);
                }
            }
            Err(e) => {
                tracing::warn!(entry_id = %entry.entry_id, error = %e, "failed to write entry");
                report.counts.failed += 1;
            }
        }
    }

    if !enhancers.is_empty() && !to_enhance.is_empty() {
        let stats: EnhanceStats = enhance_entries(repo, enhancers, &to_enhance).await;
        report.enhanced = stats.processed;
        report.enhancement_failed = stats.failed;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;
    use crate::test_support::{entry, keyword_config, migrated_repo, ts};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted results and records requested windows.
    struct ScriptedAdapter {
        script: Mutex<Vec<std::result::Result<Vec<Entry>, FetchError>>>,
        windows: Mutex<Vec<FetchWindow>>,
        attempts: AtomicUsize,
    }

    impl ScriptedAdapter {
        fn new(mut script: Vec<std::result::Result<Vec<Entry>, FetchError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                windows: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IngestionAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            "scripted"
        }

        fn source_system(&self) -> &str {
            "test"
        }

        async fn fetch_window(&self, window: &FetchWindow) -> std::result::Result<Vec<Entry>, FetchError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.windows.lock().unwrap().push(*window);
            self.script.lock().unwrap().pop().unwrap_or(Ok(Vec::new()))
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_plan_windows_chunks_and_overlap() {
        let windows = plan_windows(Some(ts(2024, 1, 1)), ts(2024, 1, 25), 10, 12);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].start, Some(ts(2024, 1, 1)));
        assert_eq!(windows[0].end, ts(2024, 1, 11));
        assert_eq!(windows[1].start, Some(ts(2024, 1, 11) - ChronoDuration::hours(12)));
        assert_eq!(windows[1].end, ts(2024, 1, 21));
        assert_eq!(windows[2].end, ts(2024, 1, 25));
    }

    #[test]
    fn test_plan_windows_without_since_is_single_unbounded() {
        let windows = plan_windows(None, ts(2024, 1, 1), 30, 0);
        assert_eq!(windows, vec![FetchWindow { start: None, end: ts(2024, 1, 1) }]);
    }

    #[tokio::test]
    async fn test_transient_then_success_takes_two_attempts() {
        let adapter = ScriptedAdapter::new(vec![
            Err(FetchError::Transient("503".to_string())),
            Ok(vec![entry("a", ts(2024, 1, 1), "x", "one")]),
        ]);
        let window = FetchWindow { start: None, end: ts(2024, 2, 1) };
        let entries = fetch_with_retry(&adapter, &window, policy(3), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_fails_after_one_attempt() {
        let adapter = ScriptedAdapter::new(vec![Err(FetchError::Fatal("404".to_string()))]);
        let window = FetchWindow { start: None, end: ts(2024, 2, 1) };
        let err = fetch_with_retry(&adapter, &window, policy(3), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArielError::Ingestion(_)));
        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust_retries() {
        let adapter = ScriptedAdapter::new(vec![
            Err(FetchError::Transient("timeout".to_string())),
            Err(FetchError::Transient("timeout".to_string())),
            Err(FetchError::Transient("timeout".to_string())),
        ]);
        let window = FetchWindow { start: None, end: ts(2024, 2, 1) };
        let err = fetch_with_retry(&adapter, &window, policy(2), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_overlapping_windows_dedup_first_wins() {
        let (_dir, repo) = migrated_repo(keyword_config).await;
        let adapter = ScriptedAdapter::new(vec![
            Ok(vec![entry("dup", ts(2024, 1, 5), "x", "first copy")]),
            Ok(vec![
                entry("dup", ts(2024, 1, 5), "x", "second copy"),
                entry("other", ts(2024, 1, 15), "y", "other"),
            ]),
        ]);
        let options = IngestOptions {
            since: Some(ts(2024, 1, 1)),
            until: Some(ts(2024, 1, 20)),
            ..IngestOptions::default()
        };
        let report = run_ingestion(&repo, &adapter, &[], &options, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.windows, 2);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.counts, RunCounts { added: 2, updated: 0, failed: 0 });
        assert_eq!(repo.count_entries().await.unwrap(), 2);
        assert_eq!(repo.get_entry("dup").await.unwrap().unwrap().raw_text, "first copy");

        let run = repo.get_ingestion_run(report.run_id.as_deref().unwrap()).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.entries_added, 2);
    }

    #[tokio::test]
    async fn test_failed_run_is_recorded_once() {
        let (_dir, repo) = migrated_repo(keyword_config).await;
        let adapter = ScriptedAdapter::new(vec![Err(FetchError::Fatal("HTTP 404".to_string()))]);
        let err = run_ingestion(&repo, &adapter, &[], &IngestOptions::default(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HTTP 404"));

        let runs = repo.recent_ingestion_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].error_message.as_deref().unwrap().contains("HTTP 404"));
        assert!(runs[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let (_dir, repo) = migrated_repo(keyword_config).await;
        let adapter = ScriptedAdapter::new(vec![Ok(vec![
            entry("a", ts(2024, 1, 1), "x", "one"),
            entry("b", ts(2024, 1, 2), "x", "two"),
        ])]);
        let options = IngestOptions {
            dry_run: true,
            limit: Some(1),
            ..IngestOptions::default()
        };
        let report = run_ingestion(&repo, &adapter, &[], &options, &CancelToken::new())
            .await
            .unwrap();
        assert!(report.run_id.is_none());
        assert_eq!(report.fetched, 1);
        assert_eq!(repo.count_entries().await.unwrap(), 0);
        assert!(repo.recent_ingestion_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_incremental_run_starts_from_last_success() {
        let (_dir, repo) = migrated_repo(keyword_config).await;
        let first = ScriptedAdapter::new(vec![Ok(vec![entry("a", ts(2024, 1, 1), "x", "one")])]);
        let report = run_ingestion(&repo, &first, &[], &IngestOptions::default(), &CancelToken::new())
            .await
            .unwrap();
        let previous = repo
            .get_ingestion_run(report.run_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();

        let second = ScriptedAdapter::new(vec![Ok(vec![entry("a", ts(2024, 1, 1), "x", "one")])]);
        let options = IngestOptions {
            until: Some(previous.started_at + ChronoDuration::hours(1)),
            ..IngestOptions::default()
        };
        let report = run_ingestion(&repo, &second, &[], &options, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(second.windows.lock().unwrap()[0].start, Some(previous.started_at));
        assert_eq!(report.counts.updated, 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_is_marked_failed() {
        let (_dir, repo) = migrated_repo(keyword_config).await;
        let adapter = ScriptedAdapter::new(vec![]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = run_ingestion(&repo, &adapter, &[], &IngestOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ArielError::Cancelled));
        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 0);
        let runs = repo.recent_ingestion_runs(1).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
    }
}
