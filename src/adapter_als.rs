//! ALS electronic logbook HTTP adapter.
//!
//! Issues `GET {source_url}?since=<unix>&until=<unix>` per window and maps
//! the JSON records onto [`Entry`]. The response may be a bare array or an
//! object with an `entries` array.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

use crate::config::IngestionConfig;
use crate::error::{ArielError, Result};
use crate::models::{Attachment, Entry};
use crate::traits::{FetchError, FetchWindow, IngestionAdapter};

const DEFAULT_SOURCE_SYSTEM: &str = "ALS eLog";

pub struct AlsLogbookAdapter {
    client: reqwest::Client,
    source_url: String,
    source_system: String,
}

impl AlsLogbookAdapter {
    pub const NAME: &'static str = "als_logbook";

    pub fn from_config(config: &IngestionConfig) -> Result<Self> {
        let source_url = config.source_url.clone().ok_or_else(|| {
            ArielError::Configuration(
                "ingestion.source_url is required for the als_logbook adapter".to_string(),
            )
        })?;

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .danger_accept_invalid_certs(!config.verify_ssl);
        if let Some(proxy_url) = &config.proxy_url {
            builder = builder.proxy(build_proxy(proxy_url)?);
        }

        Ok(Self {
            client: builder.build()?,
            source_url,
            source_system: config
                .source_system
                .clone()
                .unwrap_or_else(|| DEFAULT_SOURCE_SYSTEM.to_string()),
        })
    }
}

fn is_socks(proxy_url: &str) -> bool {
    proxy_url.to_ascii_lowercase().starts_with("socks")
}

fn build_proxy(proxy_url: &str) -> Result<reqwest::Proxy> {
    if is_socks(proxy_url) && !cfg!(feature = "socks") {
        return Err(ArielError::Ingestion(format!(
            "SOCKS proxy '{}' requires building ariel with the `socks` feature (cargo build --features socks)",
            proxy_url
        )));
    }
    reqwest::Proxy::all(proxy_url)
        .map_err(|e| ArielError::Configuration(format!("invalid ingestion.proxy_url: {}", e)))
}

/// 5xx and 408 (a timeout) are worth retrying. Every other 4xx, 429
/// included, fails the run on the first attempt.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        FetchError::Transient(err.to_string())
    } else {
        FetchError::Fatal(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AlsResponse {
    List(Vec<AlsRecord>),
    Wrapped { entries: Vec<AlsRecord> },
}

#[derive(Debug, Deserialize)]
struct AlsRecord {
    id: Value,
    timestamp: Value,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Integer/float unix seconds, `YYYY-MM-DD HH:MM:SS` (UTC), or RFC 3339.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_opt(secs, 0).single()
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(secs) = s.parse::<i64>() {
                return Utc.timestamp_opt(secs, 0).single();
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }
        _ => None,
    }
}

fn record_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl AlsRecord {
    fn into_entry(self, source_system: &str) -> Option<Entry> {
        let id = record_id(&self.id)?;
        let timestamp = parse_timestamp(&self.timestamp)?;

        let subject = self.subject.unwrap_or_default();
        let details = self.details.unwrap_or_default();
        let raw_text = match (subject.trim().is_empty(), details.trim().is_empty()) {
            (false, false) => format!("{}\n\n{}", subject.trim(), details.trim()),
            (false, true) => subject.trim().to_string(),
            _ => details.trim().to_string(),
        };

        let mut entry = Entry::new(
            format!("als-{}", id),
            source_system,
            timestamp,
            self.author.unwrap_or_default(),
            raw_text,
        );
        entry.attachments = self.attachments;
        entry.metadata = self.extra;
        entry.metadata.insert("als_id".to_string(), Value::String(id));
        if !subject.trim().is_empty() {
            entry
                .metadata
                .insert("subject".to_string(), Value::String(subject.trim().to_string()));
        }
        Some(entry)
    }
}

fn map_records(records: Vec<AlsRecord>, source_system: &str) -> Vec<Entry> {
    let total = records.len();
    let entries: Vec<Entry> = records
        .into_iter()
        .filter_map(|r| r.into_entry(source_system))
        .collect();
    if entries.len() < total {
        tracing::warn!(
            skipped = total - entries.len(),
            "skipped ALS records without a usable id or timestamp"
        );
    }
    entries
}

#[async_trait]
impl IngestionAdapter for AlsLogbookAdapter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn source_system(&self) -> &str {
        &self.source_system
    }

    async fn fetch_window(&self, window: &FetchWindow) -> std::result::Result<Vec<Entry>, FetchError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(start) = window.start {
            query.push(("since", start.timestamp().to_string()));
        }
        query.push(("until", window.end.timestamp().to_string()));

        let response = self
            .client
            .get(&self.source_url)
            .query(&query)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>());
            return Err(if is_transient_status(status) {
                FetchError::Transient(message)
            } else {
                FetchError::Fatal(message)
            });
        }

        let body: AlsResponse = response.json().await.map_err(|e| {
            if e.is_decode() {
                FetchError::Fatal(format!("malformed ALS response: {}", e))
            } else {
                classify(e)
            }
        })?;
        let records = match body {
            AlsResponse::List(records) => records,
            AlsResponse::Wrapped { entries } => entries,
        };
        Ok(map_records(records, &self.source_system))
    }
}
