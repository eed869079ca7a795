//! Retrieval-augmented answers.
//!
//! Retrieve with every enabled search module, fuse the ranked lists with
//! Reciprocal Rank Fusion, then ask the chat model to answer from the
//! top entries, citing them as `[#entry_id]`.
//!
//! ```text
//! score(entry) = Σ_list 1 / (K + rank + 1)      (rank 0-based, K = 60)
//! ```

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::config::Capability;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::llm::{ChatMessage, ChatModel};
use crate::models::{ScoredEntry, SearchMode, SearchParams, SearchResponse};
use crate::repository::EntryRepository;
use crate::search::{keyword, semantic};

pub const RRF_K: f64 = 60.0;
const CONTEXT_TEXT_CHARS: usize = 2000;

const SYSTEM_PROMPT: &str = "You answer questions about accelerator facility operations using only \
the logbook entries provided. Cite every entry you rely on with its marker, for example [#als-123]. \
If the entries do not contain the answer, say so.";

/// Fuse ranked lists. Entries appearing in several lists have their
/// contributions summed; ties break on `entry_id` for determinism.
pub fn rrf_fuse(lists: &[Vec<ScoredEntry>], limit: usize) -> Vec<ScoredEntry> {
    let mut fused: HashMap<String, ScoredEntry> = HashMap::new();
    for list in lists {
        for (rank, hit) in list.iter().enumerate() {
            let contribution = 1.0 / (RRF_K + rank as f64 + 1.0);
            fused
                .entry(hit.entry.entry_id.clone())
                .and_modify(|existing| {
                    existing.score += contribution;
                    if existing.highlight.is_none() {
                        existing.highlight = hit.highlight.clone();
                    }
                })
                .or_insert_with(|| ScoredEntry {
                    entry: hit.entry.clone(),
                    score: contribution,
                    highlight: hit.highlight.clone(),
                });
        }
    }

    let mut hits: Vec<ScoredEntry> = fused.into_values().collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entry.entry_id.cmp(&b.entry.entry_id))
    });
    hits.truncate(limit);
    hits
}

fn citation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[(?:#|(?i:entry)[\s#_-]*)?([A-Za-z0-9][A-Za-z0-9_\-.:]*)\]")
            .expect("valid regex")
    })
}

/// Ids cited as `[#id]`, `[id]`, or `[entry id]`, deduplicated in
/// first-seen order. The `entry` prefix may be joined by nothing, a space,
/// `#`, `-` or `_`, and is dropped from the returned id.
pub fn extract_citations(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    citation_re()
        .captures_iter(text)
        .map(|cap| cap[1].to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Numbered context block, one entry per section.
pub fn format_context(entries: &[ScoredEntry]) -> String {
    entries
        .iter()
        .map(|hit| {
            let e = &hit.entry;
            let text: String = e.raw_text.chars().take(CONTEXT_TEXT_CHARS).collect();
            format!(
                "[#{}] {} by {}\n{}",
                e.entry_id,
                e.timestamp.format("%Y-%m-%d %H:%M UTC"),
                if e.author.is_empty() { "unknown" } else { e.author.as_str() },
                text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

pub fn build_messages(question: &str, entries: &[ScoredEntry]) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Logbook entries:\n\n{}\n\nQuestion: {}",
            format_context(entries),
            question
        )),
    ]
}

/// Run every enabled retrieval strategy for `query`.
async fn retrieve(
    repo: &EntryRepository,
    embedder: Option<&dyn EmbeddingProvider>,
    query: &str,
    params: &SearchParams,
) -> Result<(Vec<Vec<ScoredEntry>>, Vec<SearchMode>)> {
    let mut lists = Vec::new();
    let mut modes = Vec::new();

    if Capability::KeywordSearch.is_enabled(repo.config()) {
        lists.push(keyword::keyword_search(repo, query, params).await?);
        modes.push(SearchMode::Keyword);
    }
    if Capability::SemanticSearch.is_enabled(repo.config()) {
        match embedder {
            Some(embedder) => {
                lists.push(semantic::semantic_search(repo, embedder, query, params).await?);
                modes.push(SearchMode::Semantic);
            }
            None => tracing::warn!("semantic search enabled but no embedding provider; skipping"),
        }
    }
    Ok((lists, modes))
}

/// Answer `query` from retrieved entries.
///
/// No retrieved entries means no model call: the response carries no answer.
pub async fn answer(
    repo: &EntryRepository,
    embedder: Option<&dyn EmbeddingProvider>,
    chat: &dyn ChatModel,
    query: &str,
    params: &SearchParams,
) -> Result<SearchResponse> {
    let context_size = repo.config().reasoning.max_context_entries.max(1);
    let retrieval_params = SearchParams {
        max_results: params.max_results.max(context_size),
        include_highlights: false,
        fuzzy_fallback: false,
        ..params.clone()
    };

    let (lists, mut modes_used) = retrieve(repo, embedder, query, &retrieval_params).await?;
    let context = rrf_fuse(&lists, context_size);
    modes_used.insert(0, SearchMode::Rag);

    if context.is_empty() {
        return Ok(SearchResponse {
            entries: Vec::new(),
            answer: None,
            sources: Vec::new(),
            modes_used,
            reasoning: "No relevant logbook entries were found.".to_string(),
        });
    }

    tracing::debug!(context = context.len(), model = chat.model_id(), "rag prompt");
    let reply = chat.chat(&build_messages(query, &context), &[]).await?;
    let answer_text = reply.text_content().unwrap_or_default().to_string();

    let in_context: HashSet<&str> = context.iter().map(|h| h.entry.entry_id.as_str()).collect();
    let sources: Vec<String> = extract_citations(&answer_text)
        .into_iter()
        .filter(|id| in_context.contains(id.as_str()))
        .collect();

    Ok(SearchResponse {
        reasoning: format!(
            "Answered from {} retrieved entries ({} cited).",
            context.len(),
            sources.len()
        ),
        entries: context,
        answer: Some(answer_text),
        sources,
        modes_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolSpec;
    use crate::test_support::{entry, full_config, keyword_config, migrated_repo, ts, StaticEmbedder, TEST_MODEL};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Returns a fixed reply and records the prompts it saw.
    struct CannedChat {
        reply: String,
        prompts: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl CannedChat {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for CannedChat {
        fn model_id(&self) -> &str {
            "canned"
        }

        async fn chat(&self, messages: &[ChatMessage], _tools: &[ToolSpec]) -> Result<ChatMessage> {
            self.prompts.lock().unwrap().push(messages.to_vec());
            Ok(ChatMessage::assistant(self.reply.clone()))
        }
    }

    fn hit(id: &str, score: f64) -> ScoredEntry {
        ScoredEntry {
            entry: entry(id, ts(2024, 1, 1), "a", "text"),
            score,
            highlight: None,
        }
    }

    #[test]
    fn test_rrf_boosts_entries_in_both_lists() {
        let keyword = vec![hit("a", 9.0), hit("b", 5.0), hit("c", 1.0)];
        let semantic = vec![hit("c", 0.9), hit("d", 0.8)];
        let fused = rrf_fuse(&[keyword, semantic], 10);
        let ids: Vec<&str> = fused.iter().map(|h| h.entry.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b", "d"]);
        assert!((fused[0].score - (1.0 / 63.0 + 1.0 / 61.0)).abs() < 1e-12);
    }

    #[test]
    fn test_rrf_limit_and_empty() {
        assert!(rrf_fuse(&[], 5).is_empty());
        assert_eq!(rrf_fuse(&[vec![hit("a", 1.0), hit("b", 1.0)]], 1).len(), 1);
    }

    #[test]
    fn test_extract_citations() {
        let text = "Loss at 3am [#als-12], again later [als-40] and [#als-12]. See [Figure 2]? [#]";
        assert_eq!(extract_citations(text), vec!["als-12", "als-40"]);
        assert_eq!(extract_citations("[#2024-01-05:a.b]"), vec!["2024-01-05:a.b"]);
        assert!(extract_citations("no markers").is_empty());
    }

    #[test]
    fn test_extract_entry_prefixed_citations() {
        for marker in ["[entry 42]", "[Entry #42]", "[entry-42]", "[entry42]", "[ENTRY_42]", "[#42]", "[42]"] {
            assert_eq!(extract_citations(marker), vec!["42"], "marker {marker:?}");
        }
        assert_eq!(
            extract_citations("see [entry als-7] and [#als-7], then [Entry #als-9]"),
            vec!["als-7", "als-9"]
        );
        assert_eq!(extract_citations("[entry]"), vec!["entry"]);
    }

    #[tokio::test]
    async fn test_answer_cites_context_entries() {
        let (_dir, repo) = migrated_repo(keyword_config).await;
        repo.upsert_entry(&entry("als-1", ts(2024, 1, 5), "smith", "beam loss in sector 3"))
            .await
            .unwrap();
        repo.upsert_entry(&entry("als-2", ts(2024, 1, 6), "jones", "vacuum leak repaired"))
            .await
            .unwrap();

        let chat = CannedChat::new("Beam was lost in sector 3 [#als-1]. Unrelated [#als-99].");
        let response = answer(&repo, None, &chat, "beam loss", &SearchParams::default())
            .await
            .unwrap();

        assert_eq!(response.sources, vec!["als-1"]);
        assert_eq!(response.modes_used, vec![SearchMode::Rag, SearchMode::Keyword]);
        assert_eq!(response.entries.len(), 1);
        assert!(response.answer.unwrap().contains("sector 3"));

        let prompts = chat.prompts.lock().unwrap();
        let user = prompts[0][1].content.as_deref().unwrap();
        assert!(user.contains("[#als-1]"));
        assert!(user.contains("Question: beam loss"));
    }

    #[tokio::test]
    async fn test_answer_fuses_keyword_and_semantic() {
        let (_dir, repo) = migrated_repo(full_config).await;
        repo.upsert_entry(&entry("k", ts(2024, 1, 5), "a", "magnet quench")).await.unwrap();
        repo.upsert_entry(&entry("s", ts(2024, 1, 6), "a", "superconducting coil event")).await.unwrap();
        repo.store_embedding(TEST_MODEL, "s", &[1.0, 0.0, 0.0, 0.0]).await.unwrap();

        let embedder = StaticEmbedder::new(vec![1.0, 0.0, 0.0, 0.0]);
        let chat = CannedChat::new("See [#k] and [#s].");
        let response = answer(&repo, Some(&embedder), &chat, "quench", &SearchParams::default())
            .await
            .unwrap();

        assert_eq!(
            response.modes_used,
            vec![SearchMode::Rag, SearchMode::Keyword, SearchMode::Semantic]
        );
        let mut ids: Vec<&str> = response.entries.iter().map(|h| h.entry.entry_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["k", "s"]);
        assert_eq!(response.sources, vec!["k", "s"]);
    }

    #[tokio::test]
    async fn test_no_context_skips_model() {
        let (_dir, repo) = migrated_repo(keyword_config).await;
        let chat = CannedChat::new("should not be called");
        let response = answer(&repo, None, &chat, "nothing matches", &SearchParams::default())
            .await
            .unwrap();
        assert!(response.answer.is_none());
        assert!(response.entries.is_empty());
        assert!(chat.prompts.lock().unwrap().is_empty());
    }
}
