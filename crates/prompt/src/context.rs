//! Context manager (C8): shapes the raw session message list into what
//! actually gets sent to the provider on each iteration.
//!
//! Never reorders messages and never rewrites a message's content in a way
//! that would break a `tool_use`/`tool_result` pairing — only whole messages
//! are dropped, coalesced, or replaced by a synthetic summary.

use vesper_llm::{ContentBlock, Message, Role};

/// Marker content a skill dispatcher writes instead of repeating an
/// identical tool output verbatim.
const IDENTICAL_OUTPUT_MARKER: &str = "[Identical to previous output]";

/// Number of trailing messages kept verbatim by [`emergency_compress`] when
/// the provider signals a context overflow.
const EMERGENCY_COMPRESS_KEEP: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct ContextManagerConfig {
    /// How many of the most recent turns (a turn starts at a user message)
    /// are always preserved verbatim.
    pub preserve_last_turns: usize,
    /// Character budget for the synthetic summary of older turns. Older
    /// turns are dropped entirely rather than summarised if they don't fit.
    pub summary_char_budget: usize,
}

impl Default for ContextManagerConfig {
    fn default() -> Self {
        Self { preserve_last_turns: 10, summary_char_budget: 1500 }
    }
}

/// Builds the message list to send to the provider for this iteration.
pub fn build_context(messages: &[Message], config: &ContextManagerConfig) -> Vec<Message> {
    let turns = split_into_turns(messages);
    if turns.len() <= config.preserve_last_turns {
        return coalesce_identical_tool_results(messages);
    }

    let split_at = turns.len() - config.preserve_last_turns;
    let (older, newer) = turns.split_at(split_at);

    let mut shaped = Vec::new();
    if let Some(summary) = summarize_turns(older, config.summary_char_budget) {
        shaped.push(summary);
    }
    for turn in newer {
        shaped.extend(turn.iter().cloned());
    }

    coalesce_identical_tool_results(&shaped)
}

/// The last-resort compaction C9 retries with after a provider reports a
/// context-overflow error: only the last three messages, verbatim.
pub fn emergency_compress(messages: &[Message]) -> Vec<Message> {
    let start = messages.len().saturating_sub(EMERGENCY_COMPRESS_KEEP);
    messages[start..].to_vec()
}

fn split_into_turns(messages: &[Message]) -> Vec<Vec<Message>> {
    let mut turns: Vec<Vec<Message>> = Vec::new();
    for message in messages {
        if message.role == Role::User {
            turns.push(vec![message.clone()]);
        } else if let Some(last) = turns.last_mut() {
            last.push(message.clone());
        } else {
            turns.push(vec![message.clone()]);
        }
    }
    turns
}

fn summarize_turns(turns: &[Vec<Message>], char_budget: usize) -> Option<Message> {
    if turns.is_empty() {
        return None;
    }
    let flattened = turns
        .iter()
        .flatten()
        .map(|m| m.as_text())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if flattened.is_empty() {
        return None;
    }
    if flattened.len() > char_budget {
        return None;
    }
    Some(Message {
        role: Role::System,
        content: vec![ContentBlock::Text { text: format!("Earlier in this conversation: {flattened}") }],
    })
}

fn coalesce_identical_tool_results(messages: &[Message]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        if is_identical_marker(message) && out.last().is_some_and(is_identical_marker) {
            continue;
        }
        out.push(message.clone());
    }
    out
}

fn is_identical_marker(message: &Message) -> bool {
    message.role == Role::Tool
        && message.content.len() == 1
        && matches!(&message.content[0], ContentBlock::ToolResult { content, .. } if content == IDENTICAL_OUTPUT_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_result_marker() -> Message {
        Message::tool_result("call-1", IDENTICAL_OUTPUT_MARKER, false)
    }

    #[test]
    fn preserves_all_turns_under_the_limit() {
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        let config = ContextManagerConfig { preserve_last_turns: 10, summary_char_budget: 1000 };
        let shaped = build_context(&messages, &config);
        assert_eq!(shaped.len(), 2);
    }

    #[test]
    fn drops_older_turns_exceeding_summary_budget() {
        let messages = vec![
            Message::user("a very long opening message that will not fit the tiny summary budget at all"),
            Message::assistant("ack"),
            Message::user("second turn"),
            Message::assistant("ack2"),
        ];
        let config = ContextManagerConfig { preserve_last_turns: 1, summary_char_budget: 5 };
        let shaped = build_context(&messages, &config);
        assert_eq!(shaped.len(), 2);
        assert_eq!(shaped[0].as_text(), "second turn");
    }

    #[test]
    fn summarizes_older_turns_within_budget() {
        let messages = vec![Message::user("short"), Message::assistant("ack"), Message::user("second"), Message::assistant("ack2")];
        let config = ContextManagerConfig { preserve_last_turns: 1, summary_char_budget: 1000 };
        let shaped = build_context(&messages, &config);
        assert_eq!(shaped[0].role, Role::System);
        assert_eq!(shaped.last().unwrap().as_text(), "ack2");
    }

    #[test]
    fn coalesces_consecutive_identical_markers() {
        let messages = vec![Message::user("run it twice"), tool_result_marker(), tool_result_marker()];
        let shaped = coalesce_identical_tool_results(&messages);
        assert_eq!(shaped.len(), 2);
    }

    #[test]
    fn emergency_compress_keeps_only_last_three() {
        let messages: Vec<Message> = (0..10).map(|i| Message::user(format!("turn {i}"))).collect();
        let compressed = emergency_compress(&messages);
        assert_eq!(compressed.len(), 3);
        assert_eq!(compressed[0].as_text(), "turn 7");
    }
}
