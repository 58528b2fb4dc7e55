//! Fact & trigger extractor (C6): turns a user message into durable memory
//! entries and, when the message implies a future follow-up, a scheduled
//! item. Runs fire-and-forget alongside the turn; failures are logged and
//! never surfaced to the user.

use chrono::{Duration, Utc};
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{instrument, warn};
use uuid::Uuid;

use vesper_llm::{CompletionRequest, CostLedger, LlmRouter, Message, Tier};
use vesper_memory::schema::{
    Category, Entry, MemoryType, RelationType, ScheduledItem, ScheduledItemSource, ScheduledItemType, Source,
};
use vesper_memory::{cosine_similarity, MemoryStore, SearchOptions};

use crate::classifier::{self, Candidate, Verdict};
use crate::embedding::EmbeddingProvider;
use crate::trigger_time::{parse_trigger_phrase, resolve};

const SCHEDULED_ITEM_DEDUP_WINDOW_HOURS: i64 = 6;
/// A candidate whose statement is at least this much longer than the
/// existing near-duplicate it matched is treated as an in-place update
/// rather than dropped.
const LONGER_STATEMENT_OVERRIDE_RATIO: f32 = 1.2;

#[derive(Debug, Deserialize, Default)]
struct RawExtraction {
    #[serde(default)]
    facts: Vec<RawFact>,
    #[serde(default)]
    triggers: Vec<RawTrigger>,
}

#[derive(Debug, Deserialize)]
struct RawFact {
    subject: String,
    content: String,
    category: String,
}

#[derive(Debug, Deserialize)]
struct RawTrigger {
    phrase: String,
    message: String,
}

pub struct ExtractionConfig {
    pub max_facts_per_message: usize,
    pub deduplication_threshold: f32,
    pub embedding_batch_concurrency: usize,
    pub timezone: Tz,
}

impl ExtractionConfig {
    /// Builds a thinker-facing `ExtractionConfig` from the persisted app
    /// config, resolving the named IANA timezone (e.g. the scheduler's
    /// configured zone) so trigger/recurrence math runs in the user's local
    /// time rather than UTC. Falls back to UTC and logs a warning if the
    /// name doesn't parse.
    pub fn from_config(cfg: &vesper_config::ExtractionConfig, timezone: &str) -> Self {
        let resolved_timezone = timezone.parse().unwrap_or_else(|_| {
            warn!(component = "fact_extractor", timezone, "unrecognized timezone, falling back to UTC");
            Tz::UTC
        });
        Self {
            max_facts_per_message: cfg.max_facts_per_message,
            deduplication_threshold: cfg.deduplication_threshold,
            embedding_batch_concurrency: cfg.embedding_batch_concurrency,
            timezone: resolved_timezone,
        }
    }
}

/// Entry point: run the full extraction pipeline over a single user
/// message. Never returns an error to the caller — every failure path logs
/// and degrades to "nothing extracted" for that stage.
#[instrument(skip_all, fields(component = "fact_extractor"))]
pub async fn extract_and_store(
    router: &LlmRouter,
    ledger: &dyn CostLedger,
    embeddings: &dyn EmbeddingProvider,
    store: &MemoryStore,
    message: &str,
    session_id: Option<Uuid>,
    config: &ExtractionConfig,
) {
    let raw = match run_extraction_prompt(router, ledger, message).await {
        Ok(raw) => raw,
        Err(error) => {
            warn!(component = "fact_extractor", cause = %error, "extraction call failed");
            return;
        }
    };

    let mut facts = raw.facts;
    if facts.len() > config.max_facts_per_message {
        warn!(
            component = "fact_extractor",
            dropped = facts.len() - config.max_facts_per_message,
            limit = config.max_facts_per_message,
            "truncating extracted facts"
        );
    }
    facts.truncate(config.max_facts_per_message);

    if !facts.is_empty() {
        if let Err(error) = store_facts(router, ledger, embeddings, store, facts, session_id, config).await {
            warn!(component = "fact_extractor", cause = %error, "fact storage failed");
        }
    }

    for trigger in raw.triggers {
        if let Err(error) = store_trigger(store, &trigger, config).await {
            warn!(component = "fact_extractor", cause = %error, "trigger storage failed");
        }
    }
}

async fn run_extraction_prompt(router: &LlmRouter, ledger: &dyn CostLedger, message: &str) -> anyhow::Result<RawExtraction> {
    let system = "Extract durable facts and proactive reminders from the user's message. \
        Facts: subject is the literal string \"user\" unless the sentence is clearly about a \
        named third party, in which case subject is that person's name. Any statement about a \
        relationship (e.g. \"my sister Ana\") always uses subject \"user\" — the relationship \
        itself is a fact about the user, not about the other person. Split compound statements \
        (\"I like tea and I work at Acme\") into separate facts. category is one of: personal, \
        work, project, location, general, preference, relationship. \
        Triggers: only extract an explicit request to be reminded or followed up on later, with \
        the literal time phrase used (e.g. \"in 20 minutes\", \"tomorrow at 6pm\", \"every weekday \
        at 9am\") and the message to remind the user with. \
        Respond with a single JSON object: {\"facts\": [{\"subject\":..,\"content\":..,\"category\":..}], \
        \"triggers\": [{\"phrase\":..,\"message\":..}]}. Omit keys that have no items rather than \
        inventing content. No prose outside the JSON object.";

    let request = CompletionRequest {
        messages: vec![Message::user(message.to_string())],
        system: Some(system.to_string()),
        tools: vec![],
        max_tokens: 1024,
        enable_thinking: false,
    };

    let outcome = router.execute_with_fallback(&request, Tier::Fast, None, ledger).await?;
    Ok(parse_tolerant(&outcome.response.text()))
}

fn parse_tolerant(text: &str) -> RawExtraction {
    let start = match text.find('{') {
        Some(i) => i,
        None => return RawExtraction::default(),
    };
    let end = match text.rfind('}') {
        Some(i) => i,
        None => return RawExtraction::default(),
    };
    if end <= start {
        return RawExtraction::default();
    }
    serde_json::from_str(&text[start..=end]).unwrap_or_default()
}

fn category_for(raw: &str) -> Category {
    match raw.to_ascii_lowercase().as_str() {
        "preference" => Category::Preference,
        "relationship" => Category::Relationship,
        _ => Category::Fact,
    }
}

async fn store_facts(
    router: &LlmRouter,
    ledger: &dyn CostLedger,
    embeddings: &dyn EmbeddingProvider,
    store: &MemoryStore,
    facts: Vec<RawFact>,
    session_id: Option<Uuid>,
    config: &ExtractionConfig,
) -> anyhow::Result<()> {
    let texts: Vec<String> = facts.iter().map(|f| f.content.clone()).collect();
    let embedded = embed_bounded(embeddings, &texts, config.embedding_batch_concurrency).await;

    let mut survivors = Vec::new();
    for (fact, embedding) in facts.into_iter().zip(embedded.into_iter()) {
        let embedding = match embedding {
            Ok(v) => v,
            Err(error) => {
                warn!(component = "fact_extractor", cause = %error, "embedding failed, skipping candidate");
                continue;
            }
        };

        let same_subject_opts = SearchOptions {
            entry_type: Some("fact".to_string()),
            subject: Some(fact.subject.clone()),
            limit: 50,
            min_score: 0.0,
            ..Default::default()
        };
        let existing = store.search(&fact.content, Some(&embedding), &same_subject_opts)?;

        let near_duplicate = existing
            .iter()
            .map(|hit| (hit, cosine_similarity(hit.entry.embedding.as_deref().unwrap_or(&[]), &embedding)))
            .filter(|(_, sim)| *sim >= config.deduplication_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match near_duplicate {
            Some((hit, _sim)) if fact.content.len() as f32 >= hit.entry.content.len() as f32 * LONGER_STATEMENT_OVERRIDE_RATIO => {
                // Longer restatement of the same fact: update in place rather than drop.
                let mut updated = hit.entry.clone();
                updated.content = fact.content.clone();
                updated.embedding = Some(embedding.clone());
                updated.updated_at = Utc::now();
                store.add_entry(updated).await?;
            }
            Some(_) => {
                // Near-duplicate, no material improvement: drop the candidate.
            }
            None => {
                survivors.push((fact, embedding, existing));
            }
        }
    }

    if survivors.is_empty() {
        return Ok(());
    }

    let candidates: Vec<Candidate> = survivors
        .iter()
        .map(|(fact, _, _)| Candidate { subject: fact.subject.clone(), content: fact.content.clone() })
        .collect();

    let mut existing_by_id = std::collections::HashMap::new();
    let mut existing_facts = Vec::new();
    for (_, _, hits) in &survivors {
        for hit in hits {
            existing_by_id.entry(hit.entry.id).or_insert_with(|| hit.entry.clone());
        }
    }
    for entry in existing_by_id.values() {
        existing_facts.push(classifier::ExistingFact { id: entry.id, subject: entry.subject().to_string(), content: entry.content.clone() });
    }

    let classifications = classifier::classify_relations(router, ledger, &candidates, &existing_facts).await;

    for ((fact, embedding, _), classification) in survivors.into_iter().zip(classifications.into_iter()) {
        let category = category_for(&fact.category);
        let mut entry = Entry::new(fact.content.clone(), category, Source::Assistant).with_subject(fact.subject.clone());
        entry.embedding = Some(embedding);
        entry.confidence = classification.confidence.max(0.5);
        if let Some(sid) = session_id {
            entry.metadata["session_id"] = serde_json::Value::String(sid.to_string());
        }
        entry.metadata["type"] = serde_json::Value::String("fact".to_string());

        match classification.verdict {
            Verdict::Updates(target_id) => {
                if let Some(mut old) = store.get_entry(target_id)? {
                    old.is_latest = false;
                    old.memory_type = MemoryType::Superseded;
                    old.updated_at = Utc::now();
                    store.add_entry(old).await?;
                }
                let new_entry = store.add_entry(entry).await?;
                store.add_relation(vesper_memory::schema::Relation::new(new_entry.id, target_id, RelationType::Updates, classification.confidence)).await?;
            }
            Verdict::Extends(target_id) => {
                let new_entry = store.add_entry(entry).await?;
                store
                    .add_relation(vesper_memory::schema::Relation::new(new_entry.id, target_id, RelationType::Extends, classification.confidence))
                    .await?;
            }
            Verdict::New => {
                store.add_entry(entry).await?;
            }
        }
    }

    Ok(())
}

async fn embed_bounded(embeddings: &dyn EmbeddingProvider, texts: &[String], concurrency: usize) -> Vec<anyhow::Result<Vec<f32>>> {
    stream::iter(texts.iter().cloned())
        .map(|text| async move { embeddings.embed(&text).await })
        .buffered(concurrency.max(1))
        .collect()
        .await
}

async fn store_trigger(store: &MemoryStore, trigger: &RawTrigger, config: &ExtractionConfig) -> anyhow::Result<()> {
    let persistence = store.persistence();
    let window = Duration::hours(SCHEDULED_ITEM_DEDUP_WINDOW_HOURS);
    if persistence.has_similar_pending_scheduled_item(&trigger.message, window)? {
        return Ok(());
    }

    let now = Utc::now();
    let parsed = parse_trigger_phrase(&trigger.phrase, now, config.timezone);
    let (trigger_at, recurring) = resolve(&parsed, now, config.timezone);

    let mut item = ScheduledItem::new(ScheduledItemType::Reminder, trigger.message.clone(), trigger_at);
    item.source = ScheduledItemSource::Agent;
    item.recurring = recurring;
    item.context = trigger.phrase.clone();

    persistence.add_scheduled_item(item)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tolerant_extracts_facts_block() {
        let text = "```json\n{\"facts\":[{\"subject\":\"user\",\"content\":\"likes tea\",\"category\":\"preference\"}]}\n```";
        let parsed = parse_tolerant(text);
        assert_eq!(parsed.facts.len(), 1);
        assert_eq!(parsed.facts[0].content, "likes tea");
    }

    #[test]
    fn parse_tolerant_empty_on_garbage() {
        let parsed = parse_tolerant("no json here");
        assert!(parsed.facts.is_empty());
        assert!(parsed.triggers.is_empty());
    }

    #[test]
    fn category_mapping_routes_preference_and_relationship() {
        assert_eq!(category_for("preference"), Category::Preference);
        assert_eq!(category_for("relationship"), Category::Relationship);
        assert_eq!(category_for("work"), Category::Fact);
        assert_eq!(category_for("location"), Category::Fact);
    }
}
