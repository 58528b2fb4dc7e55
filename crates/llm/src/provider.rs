//! Concrete provider clients (`OllamaProvider`, `OpenRouterProvider`),
//! generalized from the teacher's `OllamaClient`/`OpenRouterClient` pair to
//! the typed `Provider` trait.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::schema::{CompletionRequest, CompletionResponse, ContentBlock, ProviderError, Role, StopReason, Tier, Usage};

const BREAKER_THRESHOLD: u32 = 3;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Opens after `BREAKER_THRESHOLD` consecutive failures; half-opens (allows
/// one probe) after `BREAKER_COOLDOWN` has elapsed.
#[derive(Debug, Default)]
struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    fn is_open(&self) -> bool {
        let Some(opened_at) = *self.opened_at.lock().unwrap() else { return false };
        if opened_at.elapsed() >= BREAKER_COOLDOWN {
            // Half-open: let the next attempt probe the provider.
            *self.opened_at.lock().unwrap() = None;
            self.consecutive_failures.store(BREAKER_THRESHOLD - 1, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.opened_at.lock().unwrap() = None;
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= BREAKER_THRESHOLD {
            *self.opened_at.lock().unwrap() = Some(Instant::now());
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    fn tier(&self) -> Tier;
    /// Rough USD cost per 1K input/output tokens, used to break capability
    /// ties on the cheaper provider.
    fn price_per_1k(&self) -> (f64, f64);
    async fn is_available(&self) -> bool;
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError>;
}

#[derive(Debug)]
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    breaker: CircuitBreaker,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder().timeout(timeout).build().unwrap_or_default(),
            base_url: base_url.into(),
            model: model.into(),
            breaker: CircuitBreaker::default(),
        }
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn tier(&self) -> Tier {
        Tier::Fast
    }

    fn price_per_1k(&self) -> (f64, f64) {
        (0.0, 0.0) // local inference
    }

    async fn is_available(&self) -> bool {
        !self.breaker.is_open()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let endpoint = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let mut payload = json!({
            "model": self.model,
            "messages": messages_to_ollama(request),
            "stream": false,
        });
        if !request.tools.is_empty() {
            payload["tools"] = tools_to_openai(&request.tools);
        }

        let result = self.client.post(&endpoint).json(&payload).send().await;
        let response = match result {
            Ok(r) => r,
            Err(error) => {
                self.breaker.record_failure();
                return Err(ProviderError::Request {
                    provider: self.name().to_string(),
                    message: format!("ollama unavailable at {}: {error}", self.base_url),
                    status: None,
                });
            }
        };

        let status = response.status();
        let body: Value = response.json().await.map_err(|error| {
            self.breaker.record_failure();
            ProviderError::Request { provider: self.name().to_string(), message: error.to_string(), status: Some(status.as_u16()) }
        })?;

        if !status.is_success() {
            self.breaker.record_failure();
            return Err(ProviderError::Request {
                provider: self.name().to_string(),
                message: body.to_string(),
                status: Some(status.as_u16()),
            });
        }

        self.breaker.record_success();
        parse_ollama_response(&self.model, &body)
    }
}

#[derive(Debug)]
pub struct OpenRouterProvider {
    client: reqwest::Client,
    model: String,
    tier: Tier,
    breaker: CircuitBreaker,
}

impl OpenRouterProvider {
    pub fn new(model: impl Into<String>, tier: Tier, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder().timeout(timeout).build().unwrap_or_default(),
            model: model.into(),
            tier,
            breaker: CircuitBreaker::default(),
        }
    }

    fn api_key() -> Option<String> {
        std::env::var("OPENROUTER_API_KEY").ok().filter(|k| !k.trim().is_empty())
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn tier(&self) -> Tier {
        self.tier
    }

    fn price_per_1k(&self) -> (f64, f64) {
        match self.tier {
            Tier::Capable => (0.003, 0.015),
            _ => (0.00015, 0.0006),
        }
    }

    async fn is_available(&self) -> bool {
        Self::api_key().is_some() && !self.breaker.is_open()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let Some(api_key) = Self::api_key() else {
            return Err(ProviderError::Unavailable { provider: self.name().to_string() });
        };

        let mut payload = json!({
            "model": self.model,
            "messages": messages_to_openai(request),
            "max_tokens": request.max_tokens,
        });
        if !request.tools.is_empty() {
            payload["tools"] = tools_to_openai(&request.tools);
        }

        let result = self
            .client
            .post("https://openrouter.ai/api/v1/chat/completions")
            .bearer_auth(&api_key)
            .header("HTTP-Referer", "https://vesper.local")
            .header("X-Title", "Vesper")
            .json(&payload)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(error) => {
                self.breaker.record_failure();
                return Err(ProviderError::Request { provider: self.name().to_string(), message: error.to_string(), status: None });
            }
        };

        let status = response.status();
        let body: Value = response.json().await.map_err(|error| {
            self.breaker.record_failure();
            ProviderError::Request { provider: self.name().to_string(), message: error.to_string(), status: Some(status.as_u16()) }
        })?;

        if !status.is_success() {
            self.breaker.record_failure();
            return Err(ProviderError::Request {
                provider: self.name().to_string(),
                message: body.to_string(),
                status: Some(status.as_u16()),
            });
        }

        self.breaker.record_success();
        parse_openai_response(&self.model, &body)
    }
}

fn tools_to_openai(tools: &[crate::schema::ToolSpec]) -> Value {
    json!(tools
        .iter()
        .map(|t| json!({
            "type": "function",
            "function": { "name": t.name, "description": t.description, "parameters": t.input_schema },
        }))
        .collect::<Vec<_>>())
}

fn messages_to_ollama(request: &CompletionRequest) -> Vec<Value> {
    let mut out = Vec::new();
    if let Some(system) = &request.system {
        out.push(json!({ "role": "system", "content": system }));
    }
    for message in &request.messages {
        out.extend(message_to_wire(message, false));
    }
    out
}

fn messages_to_openai(request: &CompletionRequest) -> Vec<Value> {
    let mut out = Vec::new();
    if let Some(system) = &request.system {
        out.push(json!({ "role": "system", "content": system }));
    }
    for message in &request.messages {
        out.extend(message_to_wire(message, true));
    }
    out
}

/// Converts one of our typed messages into one or more OpenAI-shaped wire
/// messages. A tool-result message maps to a `role: tool` entry; an
/// assistant message with `ToolUse` blocks collects them into `tool_calls`.
fn message_to_wire(message: &crate::schema::Message, stringify_arguments: bool) -> Vec<Value> {
    use crate::schema::{ContentBlock::*, Role::*};

    let role = match message.role {
        System => "system",
        User => "user",
        Assistant => "assistant",
        Tool => "tool",
    };

    if message.role == Tool {
        return message
            .content
            .iter()
            .filter_map(|b| match b {
                ToolResult { tool_use_id, content, .. } => {
                    Some(json!({ "role": "tool", "tool_call_id": tool_use_id, "content": content }))
                }
                _ => None,
            })
            .collect();
    }

    let text: String = message
        .content
        .iter()
        .filter_map(|b| match b {
            Text { text } => Some(text.clone()),
            Thinking { text } => Some(text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    let tool_calls: Vec<Value> = message
        .content
        .iter()
        .filter_map(|b| match b {
            ToolUse { id, name, input } => Some(json!({
                "id": id,
                "type": "function",
                "function": {
                    "name": name,
                    "arguments": if stringify_arguments { json!(input.to_string()) } else { input.clone() },
                }
            })),
            _ => None,
        })
        .collect();

    let mut msg = json!({ "role": role });
    if !text.is_empty() || tool_calls.is_empty() {
        msg["content"] = json!(text);
    }
    if !tool_calls.is_empty() {
        msg["tool_calls"] = json!(tool_calls);
    }
    vec![msg]
}

fn parse_ollama_response(model: &str, body: &Value) -> Result<CompletionResponse, ProviderError> {
    let message = body.get("message");
    let text = message.and_then(|m| m.get("content")).and_then(|v| v.as_str()).unwrap_or("").to_string();
    let tool_calls = message.and_then(|m| m.get("tool_calls")).and_then(|v| v.as_array()).map(|calls| parse_tool_calls(calls, false)).unwrap_or_default();

    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(ContentBlock::Text { text });
    }
    let has_tool_calls = !tool_calls.is_empty();
    content.extend(tool_calls);

    let stop_reason = if has_tool_calls {
        StopReason::ToolUse
    } else {
        match body.get("done_reason").and_then(|v| v.as_str()) {
            Some("length") => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        }
    };

    Ok(CompletionResponse {
        model: model.to_string(),
        content,
        stop_reason,
        usage: Usage {
            input_tokens: body.get("prompt_eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
            output_tokens: body.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
        },
    })
}

fn parse_openai_response(model: &str, body: &Value) -> Result<CompletionResponse, ProviderError> {
    let choice = body.get("choices").and_then(|c| c.get(0));
    let message = choice.and_then(|c| c.get("message"));

    let text = message.and_then(|m| m.get("content")).and_then(|v| v.as_str()).unwrap_or("").to_string();
    let tool_calls = message.and_then(|m| m.get("tool_calls")).and_then(|v| v.as_array()).map(|calls| parse_tool_calls(calls, true)).unwrap_or_default();

    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(ContentBlock::Text { text });
    }
    let has_tool_calls = !tool_calls.is_empty();
    content.extend(tool_calls);

    let finish_reason = choice.and_then(|c| c.get("finish_reason")).and_then(|v| v.as_str()).unwrap_or("stop");
    let stop_reason = if has_tool_calls {
        StopReason::ToolUse
    } else {
        match finish_reason {
            "length" => StopReason::MaxTokens,
            "stop" => StopReason::EndTurn,
            _ => StopReason::EndTurn,
        }
    };

    Ok(CompletionResponse {
        model: model.to_string(),
        content,
        stop_reason,
        usage: Usage {
            input_tokens: body.get("usage").and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
            output_tokens: body.get("usage").and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
        },
    })
}

/// Parses a `tool_calls` array; `arguments_is_string` distinguishes
/// OpenRouter's JSON-string arguments from Ollama's already-parsed object.
fn parse_tool_calls(calls: &[Value], arguments_is_string: bool) -> Vec<ContentBlock> {
    calls
        .iter()
        .enumerate()
        .filter_map(|(i, call)| {
            let func = call.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let raw = func.get("arguments").cloned().unwrap_or(json!({}));
            let input = if arguments_is_string {
                raw.as_str().and_then(|s| serde_json::from_str(s).ok()).unwrap_or(json!({}))
            } else {
                raw
            };
            let id = call.get("id").and_then(|v| v.as_str()).map(str::to_string).unwrap_or_else(|| format!("call_{i}"));
            Some(ContentBlock::ToolUse { id, name, input })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Message;

    #[test]
    fn breaker_opens_after_threshold_and_closes_on_success() {
        let breaker = CircuitBreaker::default();
        assert!(!breaker.is_open());
        for _ in 0..BREAKER_THRESHOLD {
            breaker.record_failure();
        }
        assert!(breaker.is_open());
        breaker.record_success();
        assert!(!breaker.is_open());
    }

    #[test]
    fn parse_ollama_response_extracts_tool_calls_and_usage() {
        let body = json!({
            "message": { "content": "", "tool_calls": [{"function": {"name": "search", "arguments": {"q": "rust"}}}] },
            "prompt_eval_count": 10,
            "eval_count": 4,
        });
        let response = parse_ollama_response("llama3.1", &body).unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.usage.input_tokens, 10);
        let uses = response.tool_uses();
        assert_eq!(uses[0].1, "search");
    }

    #[test]
    fn parse_openai_response_extracts_text_and_stop_reason() {
        let body = json!({
            "choices": [{ "message": { "content": "hi there" }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 2 },
        });
        let response = parse_openai_response("gpt-4o-mini", &body).unwrap();
        assert_eq!(response.text(), "hi there");
        assert_eq!(response.stop_reason, StopReason::EndTurn);
    }

    #[test]
    fn message_to_wire_collects_tool_use_into_tool_calls() {
        let msg = Message::assistant_tool_use(vec![ContentBlock::ToolUse {
            id: "1".into(),
            name: "search".into(),
            input: json!({"q": "rust"}),
        }]);
        let wire = message_to_wire(&msg, true);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "search");
    }

    #[test]
    fn tool_result_message_maps_to_tool_role() {
        let msg = Message::tool_result("call_1", "42", false);
        let wire = message_to_wire(&msg, true);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "call_1");
    }
}
