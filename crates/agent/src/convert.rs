//! Conversions between `vesper_memory`'s persistence-facing session types
//! and `vesper_llm`'s provider wire types, plus `vesper_tools::ToolSpec` →
//! `vesper_llm::ToolSpec` for the skills catalogue.
//!
//! The two crates define their own `Role`/`ContentBlock` independently (the
//! memory crate's copy is part of its on-disk schema; the llm crate's is a
//! provider wire format) — this module is the one place that knows both.

use serde_json::{json, Map, Value};

use vesper_llm::{ContentBlock as LlmBlock, Message as LlmMessage, Role as LlmRole};
use vesper_memory::schema::{ContentBlock as MemBlock, MessageContent, Role as MemRole, SessionMessage};

pub fn mem_role_to_llm(role: MemRole) -> LlmRole {
    match role {
        MemRole::User => LlmRole::User,
        MemRole::Assistant => LlmRole::Assistant,
        MemRole::System => LlmRole::System,
        MemRole::Tool => LlmRole::Tool,
    }
}

pub fn llm_role_to_mem(role: LlmRole) -> MemRole {
    match role {
        LlmRole::User => MemRole::User,
        LlmRole::Assistant => MemRole::Assistant,
        LlmRole::System => MemRole::System,
        LlmRole::Tool => MemRole::Tool,
    }
}

fn mem_block_to_llm(block: &MemBlock) -> LlmBlock {
    match block {
        MemBlock::Text { text } => LlmBlock::Text { text: text.clone() },
        MemBlock::ToolUse { id, name, input } => LlmBlock::ToolUse { id: id.clone(), name: name.clone(), input: input.clone() },
        MemBlock::ToolResult { tool_use_id, content, is_error } => {
            LlmBlock::ToolResult { tool_use_id: tool_use_id.clone(), content: content.clone(), is_error: *is_error }
        }
        MemBlock::Thinking { text } => LlmBlock::Thinking { text: text.clone() },
    }
}

fn llm_block_to_mem(block: &LlmBlock) -> MemBlock {
    match block {
        LlmBlock::Text { text } => MemBlock::Text { text: text.clone() },
        LlmBlock::ToolUse { id, name, input } => MemBlock::ToolUse { id: id.clone(), name: name.clone(), input: input.clone() },
        LlmBlock::ToolResult { tool_use_id, content, is_error } => {
            MemBlock::ToolResult { tool_use_id: tool_use_id.clone(), content: content.clone(), is_error: *is_error }
        }
        LlmBlock::Thinking { text } => MemBlock::Thinking { text: text.clone() },
    }
}

pub fn mem_content_to_llm(content: &MessageContent) -> Vec<LlmBlock> {
    match content {
        MessageContent::Text(text) => vec![LlmBlock::Text { text: text.clone() }],
        MessageContent::Blocks(blocks) => blocks.iter().map(mem_block_to_llm).collect(),
    }
}

pub fn llm_content_to_mem(blocks: &[LlmBlock]) -> MessageContent {
    MessageContent::Blocks(blocks.iter().map(llm_block_to_mem).collect())
}

/// Ordered by `SessionMessage::seq` already (the store's own guarantee).
pub fn session_messages_to_llm(messages: &[SessionMessage]) -> Vec<LlmMessage> {
    messages
        .iter()
        .map(|m| LlmMessage { role: mem_role_to_llm(m.role), content: mem_content_to_llm(&m.content) })
        .collect()
}

/// Builds an object-typed JSON-schema `inputSchema` from a tool's flat
/// param list — every declared param is a string field, which is all the
/// built-in skills (`read_file`/`write_file`/`run_shell`) need.
pub fn tool_specs_to_llm(specs: &[vesper_tools::ToolSpec]) -> Vec<vesper_llm::ToolSpec> {
    specs
        .iter()
        .map(|spec| {
            let mut properties = Map::new();
            let mut required = Vec::new();
            for param in &spec.params {
                properties.insert(param.name.clone(), json!({ "type": "string", "description": param.description }));
                if param.required {
                    required.push(Value::String(param.name.clone()));
                }
            }
            vesper_llm::ToolSpec {
                name: spec.name.clone(),
                description: spec.description.clone(),
                input_schema: json!({ "type": "object", "properties": Value::Object(properties), "required": required }),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_specs_mark_only_required_params() {
        let specs = vec![vesper_tools::ToolSpec {
            name: "write_file".to_string(),
            description: "Write a file".to_string(),
            params: vec![
                vesper_tools::ToolParam { name: "path".to_string(), description: "target path".to_string(), required: true },
                vesper_tools::ToolParam { name: "mode".to_string(), description: "optional mode".to_string(), required: false },
            ],
        }];
        let converted = tool_specs_to_llm(&specs);
        assert_eq!(converted[0].input_schema["required"], json!(["path"]));
        assert!(converted[0].input_schema["properties"]["mode"].is_object());
    }

    #[test]
    fn content_block_round_trips_through_llm_and_back() {
        let mem = MemBlock::ToolUse { id: "1".to_string(), name: "run_shell".to_string(), input: json!({"cmd": "ls"}) };
        let llm = mem_block_to_llm(&mem);
        let back = llm_block_to_mem(&llm);
        match back {
            MemBlock::ToolUse { id, name, .. } => {
                assert_eq!(id, "1");
                assert_eq!(name, "run_shell");
            }
            _ => panic!("expected ToolUse"),
        }
    }
}
