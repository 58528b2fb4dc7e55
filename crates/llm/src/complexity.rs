//! `analyzeComplexity` (§4.7): a cheap heuristic suggesting a tier from the
//! shape of a user message, not its meaning.

use crate::schema::Tier;

const ACTION_VERBS: &[&str] = &["write", "refactor", "analyze", "debug", "design", "implement", "optimize", "architect", "review", "plan"];
const TOOL_HINTS: &[&str] = &["search", "fetch", "run ", "execute", "read file", "list directory", "call api", "look up"];

pub fn analyze_complexity(text: &str) -> Tier {
    let lower = text.to_lowercase();
    let len = text.chars().count();
    let has_code_fence = text.contains("```");
    let question_marks = text.matches('?').count();
    let action_count = ACTION_VERBS.iter().filter(|v| lower.contains(*v)).count();
    let tool_hint_count = TOOL_HINTS.iter().filter(|v| lower.contains(*v)).count();

    let mut score = 0i32;
    score += if len > 400 {
        2
    } else if len > 150 {
        1
    } else {
        0
    };
    if has_code_fence {
        score += 2;
    }
    score += action_count as i32;
    score += tool_hint_count as i32;
    if question_marks >= 2 {
        score += 1;
    }

    match score {
        0..=1 => Tier::Fast,
        2..=4 => Tier::Standard,
        _ => Tier::Capable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_plain_message_suggests_fast() {
        assert_eq!(analyze_complexity("hey, what's up?"), Tier::Fast);
    }

    #[test]
    fn code_fence_and_action_verb_push_to_standard_or_above() {
        let tier = analyze_complexity("Can you refactor this?\n```rust\nfn main() {}\n```");
        assert!(tier >= Tier::Standard);
    }

    #[test]
    fn long_message_with_tool_hints_suggests_capable() {
        let long_prompt = "design and implement a plan to ".repeat(20) + "then run the tests and search the docs, review it, and debug the failures?";
        assert_eq!(analyze_complexity(&long_prompt), Tier::Capable);
    }
}
