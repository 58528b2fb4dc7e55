//! System prompt assembly (C9 step 6): base persona + workspace pointer +
//! skills catalogue + optional `SOUL.md` + memory context.

use vesper_config::AgentConfig;
use vesper_llm::ToolSpec;

use crate::memory_context::MemoryContext;
use crate::truncate_for_prompt;

/// All pre-computed data needed to assemble the system prompt. Callers do
/// the async memory lookups beforehand; this module is purely synchronous.
pub struct PromptInputs<'a> {
    pub config: &'a AgentConfig,
    pub tool_specs: &'a [ToolSpec],
    pub memory: &'a MemoryContext,
    /// Pre-read `SOUL.md` contents, if the configured path exists.
    pub soul: Option<&'a str>,
}

pub fn build_system_prompt(inputs: &PromptInputs<'_>) -> String {
    let persona = build_persona_block(inputs.config);
    let tools = build_tools_block(inputs.tool_specs);
    let soul = inputs.soul.map(|text| format!("\n\nBEHAVIOURAL GUIDELINES:\n{text}")).unwrap_or_default();
    let memory = build_memory_block(inputs.memory);

    format!(
        "{persona}\n\nWORKSPACE:\n{workspace}{tools}{soul}\n\n{memory}",
        persona = persona,
        workspace = inputs.config.workspace_path,
        tools = tools,
        soul = soul,
        memory = memory,
    )
}

fn build_persona_block(config: &AgentConfig) -> String {
    let user_name = if config.user_name.is_empty() { "the user" } else { &config.user_name };
    format!(
        "You are {name}, a personal AI assistant working with {user_name}. \
         Use MEMORY CONTEXT below for durable background facts and RECENT CONVERSATION \
         for immediate continuity. Never invent a fact that isn't grounded in context \
         or tool output.",
        name = config.name,
    )
}

fn build_tools_block(tool_specs: &[ToolSpec]) -> String {
    if tool_specs.is_empty() {
        return String::new();
    }
    let list = tool_specs
        .iter()
        .map(|spec| format!("  - {}: {}", spec.name, spec.description))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "\n\nAVAILABLE SKILLS:\n{list}\n\
         Call a skill by name with its documented arguments when it would help; \
         otherwise answer directly."
    )
}

fn build_memory_block(memory: &MemoryContext) -> String {
    let facts = if memory.fact_lines.is_empty() {
        "(none known yet)".to_string()
    } else {
        memory.fact_lines.iter().map(|l| format!("- {}", truncate_for_prompt(l, 280))).collect::<Vec<_>>().join("\n")
    };
    let conversation = if memory.conversation_lines.is_empty() {
        "(none yet)".to_string()
    } else {
        memory.conversation_lines.iter().map(|l| format!("- {l}")).collect::<Vec<_>>().join("\n")
    };
    format!("MEMORY CONTEXT:\n{facts}\n\nRECENT CONVERSATION:\n{conversation}")
}
