//! Memory context assembly (§4.10): what `build_system_prompt` pulls out of
//! `vesper-memory` before composing the final prompt.

use uuid::Uuid;

use vesper_memory::{schema::USER_ID, MemoryStore, SearchOptions};

use crate::truncate_for_prompt;

const UNCONDITIONAL_FACTS_LIMIT: usize = 20;
const QUERY_FACTS_LIMIT: usize = 10;
const QUERY_FACTS_MIN_SCORE: f32 = 0.1;
const QUERY_FACTS_USER_SUBJECT_BOOST: f32 = 2.0;
const FACTS_CHAR_BUDGET: usize = 2000;

/// Default cap on recent-conversation snippets kept in the prompt.
pub const MAX_CONVERSATION_MESSAGES: usize = 6;
const CONVERSATION_MIN_SCORE: f32 = 0.05;
const CONVERSATION_SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    /// Formatted, char-budgeted fact lines, user facts first.
    pub fact_lines: Vec<String>,
    /// Formatted, truncated recent-conversation snippets, oldest first.
    pub conversation_lines: Vec<String>,
}

impl MemoryContext {
    pub fn is_empty(&self) -> bool {
        self.fact_lines.is_empty() && self.conversation_lines.is_empty()
    }
}

/// Runs the full §4.10 pipeline against `store` for the current `query` and
/// (optionally) the active `session_id`.
pub fn assemble(
    store: &MemoryStore,
    query: &str,
    query_embedding: Option<&[f32]>,
    session_id: Option<Uuid>,
) -> anyhow::Result<MemoryContext> {
    let user_facts = store.search(
        "",
        None,
        &SearchOptions {
            entry_type: Some("fact".to_string()),
            subject: Some(USER_ID.to_string()),
            limit: UNCONDITIONAL_FACTS_LIMIT,
            min_score: 0.0,
            ..Default::default()
        },
    )?;

    let query_facts = store.search(
        query,
        query_embedding,
        &SearchOptions {
            entry_type: Some("fact".to_string()),
            min_score: QUERY_FACTS_MIN_SCORE,
            limit: QUERY_FACTS_LIMIT,
            user_subject_boost: QUERY_FACTS_USER_SUBJECT_BOOST,
            ..Default::default()
        },
    )?;

    let mut seen = std::collections::HashSet::new();
    let mut fact_lines = Vec::new();
    let mut char_total = 0usize;
    for hit in user_facts.iter().chain(query_facts.iter()) {
        if !seen.insert(hit.entry.id) {
            continue;
        }
        let line = if hit.entry.subject() == USER_ID {
            hit.entry.content.clone()
        } else {
            format!("[About {}] {}", hit.entry.subject(), hit.entry.content)
        };
        if char_total + line.len() > FACTS_CHAR_BUDGET {
            break;
        }
        char_total += line.len();
        fact_lines.push(line);
    }

    let conversation_lines = if let Some(session_id) = session_id {
        let hits = store.search(
            "",
            None,
            &SearchOptions {
                session_id: Some(session_id),
                min_score: CONVERSATION_MIN_SCORE,
                recency_boost: 1.5,
                limit: 2 * MAX_CONVERSATION_MESSAGES,
                ..Default::default()
            },
        )?;
        hits.into_iter()
            .filter(|hit| {
                let entry_type = hit.entry.metadata.get("type").and_then(|v| v.as_str());
                let has_conversation_tag = hit
                    .entry
                    .metadata
                    .get("tags")
                    .and_then(|v| v.as_array())
                    .is_some_and(|tags| tags.iter().any(|t| t.as_str() == Some("conversation")));
                matches!(entry_type, Some("raw") | Some("context")) && has_conversation_tag
            })
            .take(MAX_CONVERSATION_MESSAGES)
            .map(|hit| truncate_for_prompt(&hit.entry.content, CONVERSATION_SNIPPET_CHARS))
            .collect()
    } else {
        Vec::new()
    };

    Ok(MemoryContext { fact_lines, conversation_lines })
}
