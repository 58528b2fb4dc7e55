//! Hybrid semantic + lexical retrieval (C2/C3).
//!
//! ```text
//! score = 0.35·cos(q, e) + 0.25·lexical(q, e) + 0.25·recency(e)·recencyBoost + 0.15·subjectBoost
//! ```
//! When no query embedding is available the embedding weight is
//! redistributed onto lexical and recency so entries without an embedding
//! are still ranked purely on the remaining signals.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::schema::{Entry, USER_ID};

#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Filters on `metadata["type"]` (`fact | raw | context | ...`).
    pub entry_type: Option<String>,
    /// Exact match against `Entry::subject()`.
    pub subject: Option<String>,
    /// Filters on `metadata["sessionId"]`.
    pub session_id: Option<Uuid>,
    /// Multiplicative bonus applied to the recency term.
    pub recency_boost: f32,
    /// Multiplicative bonus applied when `subject == "user"`.
    pub user_subject_boost: f32,
    pub min_score: f32,
    pub limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            entry_type: None,
            subject: None,
            session_id: None,
            recency_boost: 1.0,
            user_subject_boost: 1.0,
            min_score: 0.0,
            limit: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub entry: Entry,
    pub score: f32,
}

/// Never mutates state — callers that consume the result for context
/// building must call `recordAccess` (`crate::store::MemoryStore::record_access`)
/// explicitly.
pub fn hybrid_search(
    entries: &[Entry],
    query: &str,
    query_embedding: Option<&[f32]>,
    opts: &SearchOptions,
) -> Vec<SearchHit> {
    let query_terms = tokenize(query);
    let now = Utc::now();

    let mut hits: Vec<SearchHit> = entries
        .iter()
        .filter(|e| {
            opts.entry_type
                .as_deref()
                .is_none_or(|t| e.metadata.get("type").and_then(|v| v.as_str()) == Some(t))
        })
        .filter(|e| opts.subject.as_deref().is_none_or(|s| e.subject() == s))
        .filter(|e| {
            opts.session_id.is_none_or(|sid| {
                e.metadata.get("session_id").and_then(|v| v.as_str()) == Some(sid.to_string().as_str())
            })
        })
        .filter_map(|e| {
            let score = score_entry(e, &query_terms, query_embedding, now, opts);
            (score >= opts.min_score).then(|| SearchHit { entry: e.clone(), score })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.entry.prominence.total_cmp(&a.entry.prominence))
            .then_with(|| b.entry.created_at.cmp(&a.entry.created_at))
    });
    hits.truncate(opts.limit);
    hits
}

fn score_entry(
    entry: &Entry,
    query_terms: &BTreeSet<String>,
    query_embedding: Option<&[f32]>,
    now: DateTime<Utc>,
    opts: &SearchOptions,
) -> f32 {
    let lexical = lexical_relevance_score(&entry.content, query_terms);
    let recency = (recency_score(now, entry.created_at) * opts.recency_boost).min(1.0);
    let subject_boost = if entry.subject() == USER_ID {
        opts.user_subject_boost.min(1.0)
    } else {
        0.0
    };
    let cos = query_embedding.and_then(|q| entry.embedding.as_deref().map(|emb| cosine_similarity(emb, q)));

    match cos {
        Some(cos) => 0.35 * cos + 0.25 * lexical + 0.25 * recency + 0.15 * subject_boost,
        None => 0.45 * lexical + 0.35 * recency + 0.20 * subject_boost,
    }
}

fn recency_score(now: DateTime<Utc>, created_at: DateTime<Utc>) -> f32 {
    let age_hours = (now - created_at).num_seconds().max(0) as f32 / 3600.0;
    // Half-life ~48h: a fresh entry scores ~1.0, a week-old one ~0.35.
    1.0 / (1.0 + (age_hours / 48.0))
}

fn lexical_relevance_score(content: &str, query_terms: &BTreeSet<String>) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let content_terms = tokenize(content);
    let overlap = query_terms.intersection(&content_terms).count() as f32;
    overlap / query_terms.len() as f32
}

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "was", "has", "are", "not", "this", "that", "with", "from", "have", "you",
    "can", "its", "will", "but", "they", "all", "been", "also", "into", "more", "than", "when",
    "who", "what", "how", "out", "our", "new", "now",
];

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Exposed for the fact extractor's semantic-dedup pass (C6 step 5), which
/// needs the same metric outside of a ranked search call.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Category, Source};
    use chrono::Duration;

    fn entry(content: &str, subject: &str, age_hours: i64) -> Entry {
        let mut e = Entry::new(content, Category::Fact, Source::User).with_subject(subject);
        e.created_at = Utc::now() - Duration::hours(age_hours);
        e
    }

    #[test]
    fn entries_without_embedding_are_still_ranked_on_lexical() {
        let entries = vec![entry("loves rust programming", USER_ID, 1), entry("buys groceries weekly", USER_ID, 1)];
        let hits = hybrid_search(&entries, "rust programming", None, &SearchOptions::default());
        assert_eq!(hits[0].entry.content, "loves rust programming");
    }

    #[test]
    fn min_score_filters_low_relevance_entries() {
        let entries = vec![entry("completely unrelated content", USER_ID, 1)];
        let opts = SearchOptions { min_score: 0.9, ..Default::default() };
        let hits = hybrid_search(&entries, "rust programming", None, &opts);
        assert!(hits.iter().all(|h| h.score >= 0.9));
    }

    #[test]
    fn empty_query_orders_by_subject_then_recency_then_prominence() {
        let mut user_old = entry("some fact", USER_ID, 100);
        user_old.prominence = 0.9;
        let user_new = entry("another fact", USER_ID, 1);
        let mut other = entry("third party fact", "Hayat", 1);
        other.prominence = 0.99;

        let entries = vec![user_old.clone(), user_new.clone(), other];
        let hits = hybrid_search(&entries, "", None, &SearchOptions { min_score: 0.0, ..Default::default() });

        assert_eq!(hits[0].entry.id, user_new.id, "more recent user fact should outrank older one");
        assert_eq!(hits[2].entry.subject(), "Hayat", "non-user subject ranks last despite higher prominence");
    }

    #[test]
    fn all_hits_meet_min_score_invariant() {
        let entries = vec![entry("a", USER_ID, 1), entry("b", "Hayat", 500)];
        let opts = SearchOptions { min_score: 0.2, ..Default::default() };
        let hits = hybrid_search(&entries, "query text", None, &opts);
        assert!(hits.iter().all(|h| h.score >= opts.min_score));
    }
}
