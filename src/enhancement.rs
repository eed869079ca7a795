//! Post-ingestion enhancement modules.
//!
//! Each enabled entry of `[enhancement_modules]` maps to an [`Enhancer`].
//! Enhancement is never fatal to ingestion: per-entry failures are recorded
//! in `enhancement_status` and retried by [`enhance_pending`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{Config, TEXT_EMBEDDING_MODULE};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::Result;
use crate::models::Entry;
use crate::repository::EntryRepository;

/// Outcome counts for one enhancement pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnhanceStats {
    pub processed: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for EnhanceStats {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.failed += other.failed;
    }
}

#[async_trait]
pub trait Enhancer: Send + Sync {
    /// Module name; also the key in `enhancement_status`.
    fn name(&self) -> &str;

    /// Process `entries` and record per-entry status. Returns `Err` only
    /// for failures that prevent recording status at all.
    async fn enhance(&self, repo: &EntryRepository, entries: &[Entry]) -> Result<EnhanceStats>;
}

/// Embeds `raw_text` with every configured model.
pub struct TextEmbeddingEnhancer {
    provider: Arc<dyn EmbeddingProvider>,
    models: Vec<String>,
    batch_size: usize,
}

impl TextEmbeddingEnhancer {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, models: Vec<String>, batch_size: usize) -> Self {
        Self {
            provider,
            models,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let settings = &config.enhancement_modules.text_embedding.settings;
        Ok(Self::new(
            create_provider(settings)?,
            settings.models.iter().map(|m| m.name.clone()).collect(),
            settings.batch_size,
        ))
    }

    /// Embed and store one batch; returns the error (if any) per entry id.
    async fn embed_batch(
        &self,
        repo: &EntryRepository,
        batch: &[Entry],
    ) -> BTreeMap<String, String> {
        let mut errors = BTreeMap::new();
        let texts: Vec<String> = batch.iter().map(|e| e.raw_text.clone()).collect();

        for model in &self.models {
            let vectors = match self.provider.embed(model, &texts).await {
                Ok(v) if v.len() == batch.len() => v,
                Ok(v) => {
                    let message = format!("expected {} vectors, got {}", batch.len(), v.len());
                    tracing::warn!(model = %model, "{}", message);
                    for entry in batch {
                        errors
                            .entry(entry.entry_id.clone())
                            .or_insert_with(|| message.clone());
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!(model = %model, error = %e, "embedding batch failed");
                    for entry in batch {
                        errors
                            .entry(entry.entry_id.clone())
                            .or_insert_with(|| e.to_string());
                    }
                    continue;
                }
            };
            for (entry, vector) in batch.iter().zip(vectors.iter()) {
                if let Err(e) = repo.store_embedding(model, &entry.entry_id, vector).await {
                    errors
                        .entry(entry.entry_id.clone())
                        .or_insert_with(|| e.to_string());
                }
            }
        }
        errors
    }
}

#[async_trait]
impl Enhancer for TextEmbeddingEnhancer {
    fn name(&self) -> &str {
        TEXT_EMBEDDING_MODULE
    }

    async fn enhance(&self, repo: &EntryRepository, entries: &[Entry]) -> Result<EnhanceStats> {
        let mut stats = EnhanceStats::default();

        for batch in entries.chunks(self.batch_size) {
            let errors = self.embed_batch(repo, batch).await;
            for entry in batch {
                match errors.get(&entry.entry_id) {
                    None => {
                        repo.mark_enhancement_complete(&entry.entry_id, self.name())
                            .await?;
                        stats.processed += 1;
                    }
                    Some(err) => {
                        repo.mark_enhancement_failed(&entry.entry_id, self.name(), err)
                            .await?;
                        stats.failed += 1;
                    }
                }
            }
        }

        tracing::debug!(
            processed = stats.processed,
            failed = stats.failed,
            "text embedding pass finished"
        );
        Ok(stats)
    }
}

/// One enhancer per enabled module.
pub fn build_enhancers(config: &Config) -> Result<Vec<Box<dyn Enhancer>>> {
    let mut enhancers: Vec<Box<dyn Enhancer>> = Vec::new();
    if config.is_enhancement_module_enabled(TEXT_EMBEDDING_MODULE) {
        enhancers.push(Box::new(TextEmbeddingEnhancer::from_config(config)?));
    }
    Ok(enhancers)
}

/// Run every enhancer over `entries`, logging (not propagating) failures.
pub async fn enhance_entries(
    repo: &EntryRepository,
    enhancers: &[Box<dyn Enhancer>],
    entries: &[Entry],
) -> EnhanceStats {
    let mut total = EnhanceStats::default();
    if entries.is_empty() {
        return total;
    }
    for enhancer in enhancers {
        match enhancer.enhance(repo, entries).await {
            Ok(stats) => total += stats,
            Err(e) => {
                tracing::warn!(module = enhancer.name(), error = %e, "enhancement failed");
                total.failed += entries.len();
            }
        }
    }
    total
}

/// Backfill entries whose status is missing, pending, or failed, up to
/// `limit` per module.
pub async fn enhance_pending(
    repo: &EntryRepository,
    enhancers: &[Box<dyn Enhancer>],
    limit: usize,
) -> Result<EnhanceStats> {
    let mut total = EnhanceStats::default();
    for enhancer in enhancers {
        let pending = repo.entries_pending_enhancement(enhancer.name(), limit).await?;
        tracing::info!(module = enhancer.name(), count = pending.len(), "enhancing pending entries");
        if pending.is_empty() {
            continue;
        }
        total += enhancer.enhance(repo, &pending).await?;
    }
    Ok(total)
}
