use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ariel_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ariel");
    path
}

const ENTRIES: &str = r#"{"entry_id":"g-1","source_system":"","timestamp":"2024-01-05T10:00:00Z","author":"smith","raw_text":"Beam loss in sector 4 after RF trip"}
{"entry_id":"g-2","source_system":"","timestamp":"2024-02-11T03:15:00Z","author":"jones","raw_text":"Vacuum leak near the injector, valve closed"}
{"entry_id":"g-3","source_system":"","timestamp":"2024-03-20T22:40:00Z","author":"smith","raw_text":"Klystron swap completed, beam restored"}
"#;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    fs::write(root.join("entries.jsonl"), ENTRIES).unwrap();

    let config_content = format!(
        r#"[database]
uri = "sqlite:{root}/data/ariel.sqlite"

[search_modules.keyword]
enabled = true

[ingestion]
adapter = "generic_json"
source_url = "file://{root}/entries.jsonl"
source_system = "test-elog"
retry_delay_seconds = 0

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("ariel.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ariel(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ariel_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ariel binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn migrated_env() -> (TempDir, PathBuf) {
    let (tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_ariel(&config_path, &["migrate", "run"]);
    assert!(success, "migrate failed: stdout={}, stderr={}", stdout, stderr);
    (tmp, config_path)
}

#[test]
fn test_migrate_applies_in_order() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_ariel(&config_path, &["migrate", "run", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("would apply: core_schema, keyword_search"));

    let (stdout, stderr, success) = run_ariel(&config_path, &["migrate", "run"]);
    assert!(success, "migrate failed: {}", stderr);
    assert!(stdout.contains("applied: core_schema, keyword_search"));
}

#[test]
fn test_migrate_idempotent() {
    let (_tmp, config_path) = migrated_env();

    let (stdout, _, success) = run_ariel(&config_path, &["migrate", "run"]);
    assert!(success, "second migrate failed (not idempotent)");
    assert!(stdout.contains("applied: (none)"));
    assert!(stdout.contains("already applied: core_schema, keyword_search"));

    let (stdout, _, success) = run_ariel(&config_path, &["migrate", "status"]);
    assert!(success);
    assert!(!stdout.contains("pending"));
}

#[test]
fn test_ingest_generic_json() {
    let (_tmp, config_path) = migrated_env();

    let (stdout, stderr, success) = run_ariel(&config_path, &["ingest"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("source system: test-elog"));
    assert!(stdout.contains("fetched: 3"));
    assert!(stdout.contains("added: 3"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_ingest_incremental_resumes_from_last_run() {
    let (_tmp, config_path) = migrated_env();

    run_ariel(&config_path, &["ingest"]);

    // Entries predate the first run, so the resumed window is empty.
    let (stdout, _, success) = run_ariel(&config_path, &["ingest"]);
    assert!(success);
    assert!(stdout.contains("fetched: 0"), "got: {}", stdout);

    // An explicit --since refetches and updates in place.
    let (stdout, _, success) = run_ariel(&config_path, &["ingest", "--since", "2024-01-01"]);
    assert!(success);
    assert!(stdout.contains("added: 0"));
    assert!(stdout.contains("updated: 3"));

    let (stdout, _, success) = run_ariel(&config_path, &["runs"]);
    assert!(success);
    assert_eq!(stdout.lines().filter(|l| l.contains("success")).count(), 3);
}

#[test]
fn test_ingest_dry_run_writes_nothing() {
    let (_tmp, config_path) = migrated_env();

    let (stdout, _, success) = run_ariel(&config_path, &["ingest", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("dry-run"));
    assert!(stdout.contains("fetched: 3"));

    let (stdout, _, _) = run_ariel(&config_path, &["--json", "status"]);
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["entry_count"], 0);

    let (stdout, _, _) = run_ariel(&config_path, &["runs"]);
    assert!(stdout.trim().is_empty(), "dry run recorded a run: {}", stdout);
}

#[test]
fn test_ingest_rejects_inverted_range() {
    let (_tmp, config_path) = migrated_env();

    let (_, _, success) = run_ariel(
        &config_path,
        &["ingest", "--since", "2024-06-01", "--until", "2024-01-01"],
    );
    assert!(!success);
}

#[test]
fn test_search_keyword() {
    let (_tmp, config_path) = migrated_env();
    run_ariel(&config_path, &["ingest"]);

    let (stdout, stderr, success) = run_ariel(&config_path, &["search", "vacuum"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("[g-2]"), "got: {}", stdout);
    assert!(!stdout.contains("[g-1]"));
}

#[test]
fn test_search_author_filter_json() {
    let (_tmp, config_path) = migrated_env();
    run_ariel(&config_path, &["ingest"]);

    let (stdout, _, success) = run_ariel(&config_path, &["--json", "search", "beam author:smith"]);
    assert!(success);
    let response: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let mut sources: Vec<String> = response["sources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    sources.sort();
    assert_eq!(sources, vec!["g-1", "g-3"]);
    assert_eq!(response["modes_used"], serde_json::json!(["keyword"]));
}

#[test]
fn test_search_fuzzy_fallback() {
    let (_tmp, config_path) = migrated_env();
    run_ariel(&config_path, &["ingest"]);

    let (stdout, _, success) = run_ariel(&config_path, &["search", "klystrom"]);
    assert!(success);
    assert!(!stdout.contains("[g-3]"));

    let (stdout, _, success) =
        run_ariel(&config_path, &["search", "klystrom", "--fuzzy-fallback"]);
    assert!(success);
    assert!(stdout.contains("modes: keyword, fuzzy"));
    assert!(stdout.contains("[g-3]"), "got: {}", stdout);
}

#[test]
fn test_search_disabled_mode_fails() {
    let (_tmp, config_path) = migrated_env();

    let (_, stderr, success) = run_ariel(&config_path, &["search", "beam", "--mode", "semantic"]);
    assert!(!success);
    assert!(stderr.contains("semantic"));
}

#[test]
fn test_get_entry() {
    let (_tmp, config_path) = migrated_env();
    run_ariel(&config_path, &["ingest"]);

    let (stdout, _, success) = run_ariel(&config_path, &["get", "g-2"]);
    assert!(success);
    assert!(stdout.contains("author: jones"));
    assert!(stdout.contains("source: test-elog"));
    assert!(stdout.contains("Vacuum leak"));

    let (_, _, success) = run_ariel(&config_path, &["get", "nope"]);
    assert!(!success);
}

#[test]
fn test_status_reports_modules() {
    let (_tmp, config_path) = migrated_env();

    let (stdout, _, success) = run_ariel(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("connected"));
    assert!(stdout.contains("entries: 0"));
    assert!(stdout.contains("search modules: keyword"));
    assert!(stdout.contains("enhancement modules: (none)"));
}

#[test]
fn test_missing_config_fails() {
    let (tmp, _) = setup_test_env();
    let (_, _, success) = run_ariel(&tmp.path().join("missing.toml"), &["status"]);
    assert!(!success);
}
