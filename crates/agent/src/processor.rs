//! `processMessage` (C9, §4.9): the agent turn state machine.
//!
//! `INIT → BUDGET_GATED? → PROCESSING_MEDIA → PROVIDER_SELECTED → ITERATING
//! → (TOOL_DISPATCH ↔ PROVIDER_CALL)* → FINALIZED`, with `StoppedByUser` and
//! `BudgetExceeded` as early terminal states and `ProviderExhausted`
//! propagated as an error.
//!
//! Tool-result messages are appended with `Role::Tool` (not the literal
//! "user message" phrasing some renderings of this step use) to stay
//! consistent with `vesper_prompt::context`'s `coalesce_identical_tool_results`,
//! which keys off `Role::Tool` — see `DESIGN.md`.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{instrument, warn};
use uuid::Uuid;

use vesper_config::AgentConfig;
use vesper_exec::ToolExecutor;
use vesper_llm::{analyze_complexity, CompletionRequest, ContentBlock, LlmRouter, StopReason};
use vesper_memory::schema::{Category, Entry, MessageContent, Role as MemRole, Source};
use vesper_memory::MemoryStore;
use vesper_prompt::{assemble_memory_context, build_context, build_system_prompt, emergency_compress, truncate_for_prompt, ContextManagerConfig, PromptInputs};
use vesper_thinker::{extract_and_store, EmbeddingProvider, ExtractionConfig};
use vesper_tools::ToolRegistry;

use crate::attachments::{process_attachments, Attachment};
use crate::convert::{llm_content_to_mem, session_messages_to_llm, tool_specs_to_llm};
use crate::cost_ledger::MemoryCostLedger;
use crate::error::AgentError;
use crate::progress::ProgressEvent;
use crate::text_tool_calls::{parse_text_tool_calls, strip_tool_call_json};

const SKILL_OUTPUT_SNIPPET_CHARS: usize = 500;

/// Collaborators a turn needs. Borrowed for the duration of one call —
/// callers (`vesper-runtime`, `vesper-cli`) own the actual router/store/etc.
pub struct AgentDeps<'a> {
    pub router: &'a LlmRouter,
    pub store: &'a MemoryStore,
    pub embeddings: &'a dyn EmbeddingProvider,
    pub tool_registry: &'a ToolRegistry,
    pub tool_executor: &'a ToolExecutor,
    pub config: &'a AgentConfig,
    pub extraction_config: &'a ExtractionConfig,
    pub context_config: &'a ContextManagerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStopReason {
    Finalized,
    StoppedByUser,
    BudgetExceeded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ProcessMessageOutput {
    pub response: String,
    pub token_usage: TokenUsage,
    pub iterations_used: usize,
    pub stop_reason: TurnStopReason,
}

/// Entry point: `processMessage(sessionId, userMessage, attachments,
/// onProgress, shouldStop)`.
#[instrument(skip(deps, attachments, on_progress, should_stop), fields(component = "agent_loop", operation = "process_message", %session_id))]
pub async fn process_message(
    deps: &AgentDeps<'_>,
    session_id: Uuid,
    user_message: &str,
    attachments: &[Attachment],
    mut on_progress: impl FnMut(ProgressEvent),
    should_stop: &(dyn Fn() -> bool + Sync),
) -> Result<ProcessMessageOutput, AgentError> {
    // 1. Session lookup.
    deps.store
        .persistence()
        .get_session(session_id)
        .map_err(AgentError::Other)?
        .ok_or(AgentError::SessionNotFound(session_id))?;

    let ledger = MemoryCostLedger::new(deps.store);

    // 2. Budget gate.
    if !deps.router.can_make_request(&ledger).map_err(AgentError::Other)? {
        return Ok(ProcessMessageOutput {
            response: "I can't take on new requests right now — the configured spend cap has been reached.".to_string(),
            token_usage: TokenUsage::default(),
            iterations_used: 0,
            stop_reason: TurnStopReason::BudgetExceeded,
        });
    }

    // 3. Media processing — failures are logged and swallowed inside.
    let attachment_blocks = process_attachments(attachments);

    // 4. Complexity → tier, fixed for the whole turn.
    let tier = analyze_complexity(user_message);

    // 5. Persist the user turn, tag it for §4.10, run extraction.
    let previous_assistant_response = last_assistant_text(deps.store, session_id).map_err(AgentError::Other)?;

    deps.store
        .persistence()
        .append_session_message(session_id, MemRole::User, MessageContent::Text(user_message.to_string()))
        .map_err(AgentError::Other)?;
    record_conversation_memory(deps.store, session_id, user_message, "user-message", Source::User).await;

    let extraction_input = match &previous_assistant_response {
        Some(prev) => format!("Assistant previously said: \"{prev}\"\nUser: {user_message}"),
        None => user_message.to_string(),
    };
    // Awaited inline rather than `tokio::spawn`ed: `AgentDeps` borrows its
    // collaborators for the call's lifetime rather than owning `Arc`s, so
    // there's nothing 'static to hand to a detached task. `extract_and_store`
    // already swallows its own errors, so this costs latency, not
    // correctness — and it trivially satisfies §5's "turn T+1 must never
    // observe a partially applied UPDATES" ordering guarantee.
    extract_and_store(deps.router, &ledger, deps.embeddings, deps.store, &extraction_input, Some(session_id), deps.extraction_config).await;

    // 6. System prompt.
    let native_tool_specs = deps.tool_registry.list_specs();
    let tool_specs = tool_specs_to_llm(&native_tool_specs);
    let soul = std::fs::read_to_string(&deps.config.soul_path).ok();
    let query_embedding = match deps.embeddings.embed(user_message).await {
        Ok(vector) => Some(vector),
        Err(error) => {
            warn!(component = "agent_loop", cause = %error, "query embedding unavailable, falling back to lexical/recency ranking");
            None
        }
    };
    let memory_context = assemble_memory_context(deps.store, user_message, query_embedding.as_deref(), Some(session_id)).map_err(AgentError::Other)?;
    let system_prompt = build_system_prompt(&PromptInputs { config: deps.config, tool_specs: &tool_specs, memory: &memory_context, soul: soul.as_deref() });

    // 7. Iterate.
    let mut total_usage = TokenUsage::default();
    let mut iterations_used = 0usize;
    let mut outcome: Option<(String, TurnStopReason)> = None;

    for iteration in 0..deps.config.max_iterations {
        iterations_used = iteration + 1;

        if should_stop() {
            outcome = Some(("Stopped at your request.".to_string(), TurnStopReason::StoppedByUser));
            break;
        }
        if !deps.router.can_make_request(&ledger).map_err(AgentError::Other)? {
            outcome = Some(("The spend cap was reached partway through this turn.".to_string(), TurnStopReason::BudgetExceeded));
            break;
        }

        let session_messages = deps.store.persistence().get_session_messages(session_id).map_err(AgentError::Other)?;
        let mut history = session_messages_to_llm(&session_messages);
        if iteration == 0 {
            if let Some(last) = history.last_mut() {
                last.content.extend(attachment_blocks.clone());
            }
        }
        let shaped = build_context(&history, deps.context_config);

        let request = CompletionRequest {
            messages: shaped,
            system: Some(system_prompt.clone()),
            tools: tool_specs.clone(),
            max_tokens: deps.config.max_tokens,
            enable_thinking: false,
        };

        let response = match deps.router.execute_with_fallback(&request, tier, Some(session_id), &ledger).await {
            Ok(fallback) => fallback.response,
            Err(error) if error.is_context_overflow() => {
                warn!(component = "agent_loop", operation = "execute_with_fallback", cause = %error, "context overflow, retrying once after emergency compression");
                let compressed_request = CompletionRequest { messages: emergency_compress(&request.messages), ..request };
                deps.router
                    .execute_with_fallback(&compressed_request, tier, Some(session_id), &ledger)
                    .await
                    .map_err(|e| AgentError::ProviderExhausted(e.to_string()))?
                    .response
            }
            Err(error) => return Err(AgentError::ProviderExhausted(error.to_string())),
        };

        total_usage.input_tokens += response.usage.input_tokens;
        total_usage.output_tokens += response.usage.output_tokens;

        let text = response.text();
        let mut tool_uses: Vec<(String, String, Value)> =
            response.tool_uses().into_iter().map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone())).collect();
        if tool_uses.is_empty() && !text.is_empty() {
            tool_uses = parse_text_tool_calls(&text)
                .into_iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => Some((id, name, input)),
                    _ => None,
                })
                .collect();
        }

        if response.stop_reason == StopReason::EndTurn || tool_uses.is_empty() {
            deps.store
                .persistence()
                .append_session_message(session_id, MemRole::Assistant, llm_content_to_mem(&response.content))
                .map_err(AgentError::Other)?;
            outcome = Some((text, TurnStopReason::Finalized));
            break;
        }

        let cleaned = strip_tool_call_json(&text);
        on_progress(if cleaned.is_empty() { ProgressEvent::Thinking } else { ProgressEvent::Status(cleaned) });

        deps.store
            .persistence()
            .append_session_message(session_id, MemRole::Assistant, llm_content_to_mem(&response.content))
            .map_err(AgentError::Other)?;

        let mut tool_result_texts = Vec::with_capacity(tool_uses.len());
        for (id, name, input) in &tool_uses {
            on_progress(ProgressEvent::ToolStart { name: name.clone(), args: input.to_string() });

            let args = json_object_to_string_map(input);
            let (success, output) = match deps.tool_executor.execute(deps.tool_registry, name, &args).await {
                Ok(result) => (result.success, result.output),
                Err(error) => (false, error.to_string()),
            };

            on_progress(ProgressEvent::ToolComplete { name: name.clone(), success, output: output.clone() });

            if success {
                let snippet = truncate_for_prompt(&output, SKILL_OUTPUT_SNIPPET_CHARS);
                record_conversation_memory(deps.store, session_id, &snippet, &format!("skill-execution/{name}"), Source::Skill(name.clone())).await;
            }

            let block = ContentBlock::ToolResult { tool_use_id: id.clone(), content: output.clone(), is_error: !success };
            deps.store
                .persistence()
                .append_session_message(session_id, MemRole::Tool, llm_content_to_mem(std::slice::from_ref(&block)))
                .map_err(AgentError::Other)?;
            tool_result_texts.push(output);
        }

        if iteration + 1 == deps.config.max_iterations {
            let summary = tool_result_texts.join("\n\n");
            outcome = Some((format!("I ran out of iterations before finishing. Here's what I found so far:\n\n{summary}"), TurnStopReason::Finalized));
            break;
        }
    }

    let (response_text, stop_reason) = outcome.unwrap_or_else(|| ("No response was produced.".to_string(), TurnStopReason::Finalized));

    // 8. Post-loop bookkeeping. Per-call cost recording already happened
    // inside `execute_with_fallback`; only session token totals and the
    // final-response memory remain.
    deps.store
        .persistence()
        .record_session_tokens(session_id, total_usage.input_tokens, total_usage.output_tokens)
        .map_err(AgentError::Other)?;
    record_conversation_memory(deps.store, session_id, &response_text, "assistant-response", Source::Assistant).await;

    Ok(ProcessMessageOutput { response: response_text, token_usage: total_usage, iterations_used, stop_reason })
}

fn last_assistant_text(store: &MemoryStore, session_id: Uuid) -> anyhow::Result<Option<String>> {
    let messages = store.persistence().get_session_messages(session_id)?;
    Ok(messages.into_iter().rev().find(|m| m.role == MemRole::Assistant).map(|m| m.content.as_text()))
}

/// Tags a conversation snapshot so §4.10's recent-conversation fetch can
/// find it (`metadata.type = "raw"`, `metadata.tags` contains `"conversation"`).
async fn record_conversation_memory(store: &MemoryStore, session_id: Uuid, content: &str, tag: &str, source: Source) {
    let mut entry = Entry::new(content, Category::Event, source);
    entry.metadata["type"] = Value::String("raw".to_string());
    entry.metadata["tags"] = serde_json::json!(["conversation", tag]);
    entry.metadata["session_id"] = Value::String(session_id.to_string());
    if let Err(error) = store.add_entry(entry).await {
        warn!(component = "agent_loop", operation = "record_conversation_memory", cause = %error, "failed to record conversation memory");
    }
}

fn json_object_to_string_map(value: &Value) -> HashMap<String, String> {
    value.as_object().map(|obj| obj.iter().map(|(k, v)| (k.clone(), json_scalar_to_string(v))).collect()).unwrap_or_default()
}

fn json_scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use vesper_config::PersistenceConfig;
    use vesper_exec::{ExecutionPolicy, ToolExecutor};
    use vesper_llm::{BudgetCaps, Provider, Tier};
    use vesper_memory::Store;
    use vesper_tools::{Tool, ToolOutput, ToolParam, ToolSpec as NativeToolSpec};

    use super::*;

    struct ScriptedProvider {
        responses: Mutex<VecDeque<vesper_llm::CompletionResponse>>,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        fn model(&self) -> &str {
            "scripted-model"
        }
        fn tier(&self) -> Tier {
            Tier::Capable
        }
        fn price_per_1k(&self) -> (f64, f64) {
            (0.0, 0.0)
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn complete(&self, _request: &CompletionRequest) -> Result<vesper_llm::CompletionResponse, vesper_llm::ProviderError> {
            let mut responses = self.responses.lock().unwrap();
            Ok(responses.pop_front().unwrap_or_else(|| text_response("no more scripted responses")))
        }
    }

    fn text_response(text: &str) -> vesper_llm::CompletionResponse {
        vesper_llm::CompletionResponse {
            model: "scripted-model".to_string(),
            content: vec![ContentBlock::Text { text: text.to_string() }],
            stop_reason: StopReason::EndTurn,
            usage: Default::default(),
        }
    }

    fn tool_use_response(name: &str, input: Value) -> vesper_llm::CompletionResponse {
        vesper_llm::CompletionResponse {
            model: "scripted-model".to_string(),
            content: vec![ContentBlock::ToolUse { id: "call_1".to_string(), name: name.to_string(), input }],
            stop_reason: StopReason::ToolUse,
            usage: Default::default(),
        }
    }

    struct StubEmbeddings;

    #[async_trait]
    impl EmbeddingProvider for StubEmbeddings {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![0.1, 0.2, 0.3])
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> NativeToolSpec {
            NativeToolSpec {
                name: "echo".to_string(),
                description: "echoes the given text".to_string(),
                params: vec![ToolParam { name: "text".to_string(), description: "text to echo".to_string(), required: true }],
            }
        }
        async fn run(&self, args: &HashMap<String, String>) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput { success: true, output: format!("echo: {}", args.get("text").cloned().unwrap_or_default()) })
        }
    }

    async fn test_store() -> (MemoryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = PersistenceConfig { data_dir: dir.path().to_string_lossy().to_string(), ..Default::default() };
        (MemoryStore::new(Store::open(&config).await.unwrap()), dir)
    }

    fn test_extraction_config() -> ExtractionConfig {
        ExtractionConfig::from_config(&vesper_config::ExtractionConfig::default(), "UTC")
    }

    #[tokio::test]
    async fn finalizes_immediately_on_plain_text_reply() {
        let (store, _dir) = test_store().await;
        let session = store.persistence().create_session().unwrap();
        let provider = ScriptedProvider {
            responses: Mutex::new(VecDeque::from([text_response("irrelevant"), text_response("Hello! How can I help?")])),
        };
        let router = LlmRouter::new(vec![std::sync::Arc::new(provider)], BudgetCaps { daily_budget_usd: 0.0, monthly_budget_usd: 0.0 }, Tier::Fast);
        let embeddings = StubEmbeddings;
        let registry = ToolRegistry::default();
        let executor = ToolExecutor::new(ExecutionPolicy { approval_mode: vesper_config::ApprovalMode::Autonomous, ..Default::default() });
        let config = AgentConfig::default();
        let extraction_config = test_extraction_config();
        let context_config = ContextManagerConfig::default();

        let deps = AgentDeps {
            router: &router,
            store: &store,
            embeddings: &embeddings,
            tool_registry: &registry,
            tool_executor: &executor,
            config: &config,
            extraction_config: &extraction_config,
            context_config: &context_config,
        };

        let output = process_message(&deps, session.id, "hi there", &[], |_| {}, &|| false).await.unwrap();
        assert_eq!(output.response, "Hello! How can I help?");
        assert_eq!(output.stop_reason, TurnStopReason::Finalized);
        assert_eq!(output.iterations_used, 1);
    }

    #[tokio::test]
    async fn dispatches_tool_then_finalizes() {
        let (store, _dir) = test_store().await;
        let session = store.persistence().create_session().unwrap();
        let provider = ScriptedProvider {
            responses: Mutex::new(VecDeque::from([
                text_response("irrelevant"),
                tool_use_response("echo", serde_json::json!({"text": "hi"})),
                text_response("Done: echo: hi"),
            ])),
        };
        let router = LlmRouter::new(vec![std::sync::Arc::new(provider)], BudgetCaps { daily_budget_usd: 0.0, monthly_budget_usd: 0.0 }, Tier::Fast);
        let embeddings = StubEmbeddings;
        let mut registry = ToolRegistry::default();
        registry.register(Box::new(EchoTool));
        let executor = ToolExecutor::new(ExecutionPolicy { approval_mode: vesper_config::ApprovalMode::Autonomous, ..Default::default() });
        let config = AgentConfig::default();
        let extraction_config = test_extraction_config();
        let context_config = ContextManagerConfig::default();

        let deps = AgentDeps {
            router: &router,
            store: &store,
            embeddings: &embeddings,
            tool_registry: &registry,
            tool_executor: &executor,
            config: &config,
            extraction_config: &extraction_config,
            context_config: &context_config,
        };

        let output = process_message(&deps, session.id, "please echo hi", &[], |_| {}, &|| false).await.unwrap();
        assert_eq!(output.response, "Done: echo: hi");
        assert_eq!(output.iterations_used, 2);

        let messages = store.persistence().get_session_messages(session.id).unwrap();
        assert!(messages.iter().any(|m| m.role == MemRole::Tool));
    }

    #[tokio::test]
    async fn missing_session_is_rejected() {
        let (store, _dir) = test_store().await;
        let router = LlmRouter::new(vec![], BudgetCaps { daily_budget_usd: 0.0, monthly_budget_usd: 0.0 }, Tier::Fast);
        let embeddings = StubEmbeddings;
        let registry = ToolRegistry::default();
        let executor = ToolExecutor::new(ExecutionPolicy::default());
        let config = AgentConfig::default();
        let extraction_config = test_extraction_config();
        let context_config = ContextManagerConfig::default();

        let deps = AgentDeps {
            router: &router,
            store: &store,
            embeddings: &embeddings,
            tool_registry: &registry,
            tool_executor: &executor,
            config: &config,
            extraction_config: &extraction_config,
            context_config: &context_config,
        };

        let result = process_message(&deps, Uuid::new_v4(), "hi", &[], |_| {}, &|| false).await;
        assert!(matches!(result, Err(AgentError::SessionNotFound(_))));
    }
}
