//! Fallback parsing for providers that emit tool calls as JSON embedded in
//! plain text instead of structured `tool_use` content blocks (§4.9 step 7:
//! "two pattern matchers" for the `function/arguments` and `name/input`
//! shapes), plus the matching progress-text cleanup.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use vesper_llm::ContentBlock;

static FENCED_JSON_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

#[derive(Deserialize)]
struct FunctionArgumentsForm {
    function: FunctionCall,
}

#[derive(Deserialize)]
struct FunctionCall {
    name: String,
    arguments: Value,
}

#[derive(Deserialize)]
struct NameInputForm {
    name: String,
    input: Value,
}

/// Scans `text` for JSON tool-call objects in either documented alternative
/// shape. Empty when the text contains neither, which is the common case
/// for providers with native structured tool calling.
pub fn parse_text_tool_calls(text: &str) -> Vec<ContentBlock> {
    json_candidates(text)
        .iter()
        .filter_map(|candidate| {
            if let Ok(form) = serde_json::from_str::<FunctionArgumentsForm>(candidate) {
                Some(ContentBlock::ToolUse { id: Uuid::new_v4().to_string(), name: form.function.name, input: form.function.arguments })
            } else if let Ok(form) = serde_json::from_str::<NameInputForm>(candidate) {
                Some(ContentBlock::ToolUse { id: Uuid::new_v4().to_string(), name: form.name, input: form.input })
            } else {
                None
            }
        })
        .collect()
}

fn json_candidates(text: &str) -> Vec<String> {
    let fenced: Vec<String> = FENCED_JSON_RE.captures_iter(text).map(|c| c[1].to_string()).collect();
    if !fenced.is_empty() {
        return fenced;
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => vec![text[start..=end].to_string()],
        _ => Vec::new(),
    }
}

fn looks_like_tool_call(candidate: &str) -> bool {
    serde_json::from_str::<FunctionArgumentsForm>(candidate).is_ok() || serde_json::from_str::<NameInputForm>(candidate).is_ok()
}

/// Strips fenced or bare tool-call JSON from assistant text before it's
/// shown as a progress update. Leaves ordinary prose (including unrelated
/// JSON) untouched.
pub fn strip_tool_call_json(text: &str) -> String {
    if FENCED_JSON_RE.is_match(text) {
        return FENCED_JSON_RE.replace_all(text, "").trim().to_string();
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if end > start && looks_like_tool_call(&text[start..=end]) {
            return format!("{}{}", &text[..start], &text[end + 1..]).trim().to_string();
        }
    }
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_function_arguments_shape() {
        let text = r#"```json
{"function": {"name": "run_shell", "arguments": {"cmd": "ls"}}}
```"#;
        let calls = parse_text_tool_calls(text);
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            ContentBlock::ToolUse { name, .. } => assert_eq!(name, "run_shell"),
            _ => panic!("expected ToolUse"),
        }
    }

    #[test]
    fn parses_bare_name_input_shape() {
        let text = r#"Sure, let me check. {"name": "read_file", "input": {"path": "a.txt"}}"#;
        let calls = parse_text_tool_calls(text);
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn plain_prose_yields_no_calls() {
        assert!(parse_text_tool_calls("just a normal answer, no tools needed").is_empty());
    }

    #[test]
    fn strip_removes_fenced_block_only() {
        let text = "Here's the plan.\n```json\n{\"function\": {\"name\": \"x\", \"arguments\": {}}}\n```";
        assert_eq!(strip_tool_call_json(text), "Here's the plan.");
    }

    #[test]
    fn strip_leaves_unrelated_json_untouched() {
        let text = r#"The config is {"level": "debug"}."#;
        assert_eq!(strip_tool_call_json(text), text);
    }
}
