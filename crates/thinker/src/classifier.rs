//! Relation classifier (C5): one LLM call per batch that labels each
//! candidate fact against the user's existing facts as NEW / UPDATES /
//! EXTENDS.

use std::collections::HashSet;

use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use vesper_llm::{CompletionRequest, CostLedger, LlmRouter, Message, Tier};

/// Batches larger than this are split and re-joined; the classifier never
/// sees more than this many candidates in a single LLM call.
pub const MAX_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub subject: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ExistingFact {
    pub id: Uuid,
    pub subject: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    New,
    Updates(Uuid),
    Extends(Uuid),
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub verdict: Verdict,
    pub confidence: f32,
    pub reason: String,
}

impl Classification {
    fn fallback_new(reason: impl Into<String>) -> Self {
        Self { verdict: Verdict::New, confidence: 0.0, reason: reason.into() }
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    index: usize,
    verdict: String,
    #[serde(default)]
    target_id: Option<String>,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reason: String,
}

/// Classifies `candidates` against `existing` facts, splitting into batches
/// of at most [`MAX_BATCH_SIZE`]. Results are returned in the same order as
/// `candidates`. Any LLM or parse error for a batch falls back to "store
/// all as NEW" for that batch only.
pub async fn classify_relations(
    router: &LlmRouter,
    ledger: &dyn CostLedger,
    candidates: &[Candidate],
    existing: &[ExistingFact],
) -> Vec<Classification> {
    let mut results = Vec::with_capacity(candidates.len());
    for chunk in candidates.chunks(MAX_BATCH_SIZE) {
        let chunk_results = classify_batch(router, ledger, chunk, existing).await;
        results.extend(chunk_results);
    }
    results
}

async fn classify_batch(
    router: &LlmRouter,
    ledger: &dyn CostLedger,
    batch: &[Candidate],
    existing: &[ExistingFact],
) -> Vec<Classification> {
    let prompt = build_prompt(batch, existing);
    let request = CompletionRequest {
        messages: vec![Message::user(prompt)],
        system: Some(
            "You classify candidate facts against a user's existing facts. \
             Respond with a JSON array only, no prose."
                .to_string(),
        ),
        tools: vec![],
        max_tokens: 1024,
        enable_thinking: false,
    };

    let outcome = match router.execute_with_fallback(&request, Tier::Fast, None, ledger).await {
        Ok(outcome) => outcome,
        Err(error) => {
            warn!(component = "relation_classifier", cause = %error, "classifier call failed; storing batch as NEW");
            return batch.iter().map(|_| Classification::fallback_new("classifier error")).collect();
        }
    };

    let text = outcome.response.text();
    let raw = parse_tolerant(&text);
    let known_ids: HashSet<Uuid> = existing.iter().map(|f| f.id).collect();

    let mut results: Vec<Classification> =
        (0..batch.len()).map(|_| Classification::fallback_new("no verdict returned")).collect();

    for item in raw {
        if item.index >= batch.len() {
            continue;
        }
        let verdict = match item.verdict.to_ascii_uppercase().as_str() {
            "UPDATES" => item
                .target_id
                .as_deref()
                .and_then(|s| Uuid::parse_str(s).ok())
                .filter(|id| known_ids.contains(id))
                .map(Verdict::Updates)
                .unwrap_or(Verdict::New),
            "EXTENDS" => item
                .target_id
                .as_deref()
                .and_then(|s| Uuid::parse_str(s).ok())
                .filter(|id| known_ids.contains(id))
                .map(Verdict::Extends)
                .unwrap_or(Verdict::New),
            _ => Verdict::New,
        };
        results[item.index] = Classification {
            verdict,
            confidence: item.confidence.clamp(0.0, 1.0),
            reason: item.reason,
        };
    }

    results
}

fn build_prompt(batch: &[Candidate], existing: &[ExistingFact]) -> String {
    let candidates_json = serde_json::to_string_pretty(
        &batch
            .iter()
            .enumerate()
            .map(|(index, c)| serde_json::json!({"index": index, "subject": c.subject, "content": c.content}))
            .collect::<Vec<_>>(),
    )
    .unwrap_or_default();

    let existing_json = serde_json::to_string_pretty(
        &existing
            .iter()
            .map(|f| serde_json::json!({"id": f.id, "subject": f.subject, "content": f.content}))
            .collect::<Vec<_>>(),
    )
    .unwrap_or_default();

    format!(
        "Existing facts:\n{existing_json}\n\n\
         Candidate facts:\n{candidates_json}\n\n\
         For each candidate, decide: NEW (no related existing fact), \
         UPDATES <id> (supersedes an existing fact), or EXTENDS <id> (adds detail \
         to an existing fact without replacing it). Only use an id that appears \
         in the existing facts list above — never invent one. \
         Respond with a JSON array of objects: \
         {{\"index\": <candidate index>, \"verdict\": \"NEW\"|\"UPDATES\"|\"EXTENDS\", \
         \"target_id\": <existing id or null>, \"confidence\": <0..1>, \"reason\": <short string>}}."
    )
}

/// Tolerant JSON array parse: strips surrounding prose by locating the
/// outermost `[...]` span. Returns an empty vec on any parse failure.
fn parse_tolerant(text: &str) -> Vec<RawVerdict> {
    let start = match text.find('[') {
        Some(i) => i,
        None => return Vec::new(),
    };
    let end = match text.rfind(']') {
        Some(i) => i,
        None => return Vec::new(),
    };
    if end <= start {
        return Vec::new();
    }
    serde_json::from_str(&text[start..=end]).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tolerant_strips_surrounding_prose() {
        let text = "Here you go:\n```json\n[{\"index\":0,\"verdict\":\"NEW\",\"confidence\":0.9,\"reason\":\"new topic\"}]\n```";
        let parsed = parse_tolerant(text);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].verdict, "NEW");
    }

    #[test]
    fn parse_tolerant_returns_empty_on_garbage() {
        assert!(parse_tolerant("not json at all").is_empty());
    }

    #[test]
    fn unknown_target_id_falls_back_to_new() {
        let batch = vec![Candidate { subject: "user".into(), content: "likes tea".into() }];
        let existing = vec![ExistingFact { id: Uuid::new_v4(), subject: "user".into(), content: "likes coffee".into() }];
        let invented = Uuid::new_v4();
        let raw = vec![RawVerdict {
            index: 0,
            verdict: "UPDATES".to_string(),
            target_id: Some(invented.to_string()),
            confidence: 0.8,
            reason: "looks related".to_string(),
        }];
        let known_ids: HashSet<Uuid> = existing.iter().map(|f| f.id).collect();
        let mut results: Vec<Classification> =
            (0..batch.len()).map(|_| Classification::fallback_new("no verdict returned")).collect();
        for item in raw {
            let verdict = match item.verdict.as_str() {
                "UPDATES" => item
                    .target_id
                    .as_deref()
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .filter(|id| known_ids.contains(id))
                    .map(Verdict::Updates)
                    .unwrap_or(Verdict::New),
                _ => Verdict::New,
            };
            results[item.index] = Classification { verdict, confidence: item.confidence, reason: item.reason };
        }
        assert_eq!(results[0].verdict, Verdict::New);
    }
}
