//! Agent mode: a bounded tool-calling loop over the enabled search tools.
//!
//! The model sees one function per enabled search module. Each turn it may
//! call tools (results are appended to the transcript) or answer in text.
//! The final response is derived from the transcript alone.

use serde_json::{json, Value};
use std::collections::HashMap;

use crate::cancel::CancelToken;
use crate::error::{ArielError, Result};
use crate::llm::{ChatMessage, ChatModel, Role, ToolCall, ToolSpec};
use crate::models::{ScoredEntry, SearchMode, SearchResponse};
use crate::rag::extract_citations;
use crate::traits::{ToolContext, ToolRegistry};

const SYSTEM_PROMPT: &str = "You are an assistant for accelerator facility logbooks. Use the \
search tools to find relevant entries before answering. Answer concisely and cite every entry \
you rely on with its id in brackets, for example [#als-123].";

/// Tool specs in the shape the chat model expects.
pub fn tool_specs(tools: &ToolRegistry) -> Vec<ToolSpec> {
    tools
        .tools()
        .iter()
        .map(|t| ToolSpec {
            name: t.name().to_string(),
            description: t.description().to_string(),
            parameters: t.parameters_schema(),
        })
        .collect()
}

/// What the transcript says happened.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSummary {
    /// Text of the last assistant message that has any.
    pub answer: Option<String>,
    /// Cited ids in first-seen order.
    pub sources: Vec<String>,
    /// One mode per tool invocation, first-seen order, deduplicated.
    pub modes_used: Vec<SearchMode>,
}

pub fn summarize_transcript(messages: &[ChatMessage], tools: &ToolRegistry) -> TranscriptSummary {
    let answer = messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .find_map(|m| m.text_content())
        .map(str::to_string);

    let sources = answer.as_deref().map(extract_citations).unwrap_or_default();

    let mut modes_used = Vec::new();
    for call in messages.iter().flat_map(|m| m.tool_calls.iter()) {
        if let Some(tool) = tools.find(&call.name) {
            if !modes_used.contains(&tool.mode()) {
                modes_used.push(tool.mode());
            }
        }
    }

    TranscriptSummary {
        answer,
        sources,
        modes_used,
    }
}

/// Validate then run one tool call. Every failure becomes an `{"error"}`
/// result for the model; nothing here aborts the loop.
async fn invoke_tool(tools: &ToolRegistry, ctx: &ToolContext, call: &ToolCall) -> Value {
    let Some(tool) = tools.find(&call.name) else {
        return json!({ "error": format!("unknown tool '{}'", call.name) });
    };

    let params: Value = match serde_json::from_str(&call.arguments) {
        Ok(v) => v,
        Err(e) => return json!({ "error": format!("arguments are not valid JSON: {}", e) }),
    };
    if let Err(e) = tool.validate(&params) {
        tracing::debug!(tool = tool.name(), error = %e, "rejected tool arguments");
        return json!({ "error": e.to_string() });
    }

    match tool.execute(params, ctx).await {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(tool = tool.name(), error = %e, "tool failed");
            json!({ "error": e.to_string() })
        }
    }
}

/// Remember the best score each entry received in any tool result.
fn collect_scores(result: &Value, scores: &mut HashMap<String, f64>) {
    let Some(items) = result.get("results").and_then(Value::as_array) else {
        return;
    };
    for item in items {
        if let (Some(id), Some(score)) = (
            item.get("entry_id").and_then(Value::as_str),
            item.get("score").and_then(Value::as_f64),
        ) {
            let best = scores.entry(id.to_string()).or_insert(score);
            if score > *best {
                *best = score;
            }
        }
    }
}

/// Run the agent loop for `query`, at most `max_iterations` model turns.
pub async fn run_agent(
    ctx: &ToolContext,
    chat: &dyn ChatModel,
    tools: &ToolRegistry,
    query: &str,
    max_iterations: usize,
    cancel: &CancelToken,
) -> Result<SearchResponse> {
    if tools.is_empty() {
        return Err(ArielError::Configuration(
            "agent mode requires at least one enabled search module".to_string(),
        ));
    }

    let specs = tool_specs(tools);
    let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(query)];
    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut iterations = 0;
    let mut finished = false;

    while iterations < max_iterations {
        cancel.check()?;
        iterations += 1;

        let reply = chat.chat(&messages, &specs).await?;
        let calls = reply.tool_calls.clone();
        messages.push(reply);
        if calls.is_empty() {
            finished = true;
            break;
        }

        for call in &calls {
            cancel.check()?;
            tracing::debug!(tool = %call.name, iteration = iterations, "agent tool call");
            let result = invoke_tool(tools, ctx, call).await;
            collect_scores(&result, &mut scores);
            messages.push(ChatMessage::tool_result(&call.id, result.to_string()));
        }
    }

    if !finished {
        tracing::warn!(max_iterations, "agent stopped at iteration limit");
    }

    let summary = summarize_transcript(&messages, tools);
    let entries = ctx
        .repo
        .get_entries_by_ids(&summary.sources)
        .await?
        .into_iter()
        .map(|entry| ScoredEntry {
            score: scores.get(&entry.entry_id).copied().unwrap_or(0.0),
            entry,
            highlight: None,
        })
        .collect();

    let mut modes_used = vec![SearchMode::Agent];
    modes_used.extend(summary.modes_used);

    Ok(SearchResponse {
        entries,
        answer: summary.answer,
        sources: summary.sources,
        modes_used,
        reasoning: if finished {
            format!("Agent answered after {} model turn(s).", iterations)
        } else {
            format!("Agent stopped after the {}-turn limit.", max_iterations)
        },
    })
}
