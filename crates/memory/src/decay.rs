//! Prominence decay and utility scoring (§4.4).
//!
//! `p(t) = p0 · exp(-λ(type) · age) + κ · accessCount - σ · contradictions`,
//! clamped to `[0, 1]`.

use chrono::{DateTime, Utc};

use crate::schema::{Category, Entry, MemoryType};

const KAPPA: f32 = 0.01;
const SIGMA: f32 = 0.05;

/// Per-day decay rate. Near-zero for `static_profile` and `preference`
/// (slow-changing facts), largest for `event` (stale the moment the event
/// passes).
fn lambda_for(entry: &Entry) -> f32 {
    if entry.memory_type == MemoryType::StaticProfile {
        return 0.0005;
    }
    match entry.category {
        Category::Preference => 0.003,
        Category::Relationship => 0.004,
        Category::Fact => 0.01,
        Category::Insight => 0.015,
        Category::Event => 0.05,
    }
}

/// Recompute one entry's prominence from its current state. Pure function —
/// callers persist the result via `Store::upsert_entry` /
/// `Store::update_prominences`.
pub fn decayed_prominence(entry: &Entry, now: DateTime<Utc>) -> f32 {
    if entry.memory_type == MemoryType::StaticProfile {
        // Hard invariant: static profile facts are exempt from decay.
        return entry.prominence;
    }
    let age_days = (now - entry.document_date).num_seconds().max(0) as f32 / 86_400.0;
    let lambda = lambda_for(entry);
    let decayed = entry.prominence * (-lambda * age_days).exp();
    let boosted = decayed + KAPPA * (entry.access_count as f32).ln_1p();
    let penalised = boosted - SIGMA * entry.contradiction_ids.len() as f32;
    penalised.clamp(0.0, 1.0)
}

/// `true` once an entry should transition to superseded-by-decay: below the
/// archive threshold and untouched for at least `min_age_days`.
/// `static_profile` entries are hard-exempt.
pub fn should_archive(entry: &Entry, now: DateTime<Utc>, archive_threshold: f32, min_age_days: i64) -> bool {
    if entry.memory_type == MemoryType::StaticProfile {
        return false;
    }
    let age_days = (now - entry.last_accessed).num_days();
    entry.prominence < archive_threshold && age_days >= min_age_days
}

/// `true` once an archived (`!is_latest`) entry is eligible for hard
/// deletion on the next prune pass.
pub fn should_hard_delete(entry: &Entry, epsilon: f32) -> bool {
    !entry.is_latest && entry.prominence < epsilon
}

/// Combines prominence, normalised access count, recency of last access, and
/// importance into a single 0..=1 utility figure used by
/// `archiveLowUtilityMemories`.
pub fn utility_score(entry: &Entry, now: DateTime<Utc>) -> f32 {
    let recency = {
        let age_hours = (now - entry.last_accessed).num_seconds().max(0) as f32 / 3600.0;
        1.0 / (1.0 + age_hours / 72.0)
    };
    let normalised_access = (entry.access_count as f32 / 10.0).min(1.0);
    let importance = entry.importance as f32 / 10.0;
    0.40 * entry.prominence + 0.20 * normalised_access + 0.20 * recency + 0.20 * importance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Source;
    use chrono::Duration;

    #[test]
    fn static_profile_entries_never_decay() {
        let mut entry = Entry::new("name is Alex", Category::Fact, Source::User);
        entry.memory_type = MemoryType::StaticProfile;
        entry.document_date = Utc::now() - Duration::days(3650);
        let now = Utc::now();
        assert_eq!(decayed_prominence(&entry, now), entry.prominence);
        assert!(!should_archive(&entry, now, 1.0, 0));
    }

    #[test]
    fn event_entries_decay_faster_than_preferences() {
        let now = Utc::now();
        let mut event = Entry::new("dentist at 3pm", Category::Event, Source::User);
        event.document_date = now - Duration::days(10);
        let mut pref = Entry::new("likes dark roast", Category::Preference, Source::User);
        pref.document_date = now - Duration::days(10);

        assert!(decayed_prominence(&event, now) < decayed_prominence(&pref, now));
    }

    #[test]
    fn contradictions_reduce_prominence() {
        let now = Utc::now();
        let mut clean = Entry::new("fact", Category::Fact, Source::User);
        clean.document_date = now;
        let mut contradicted = clean.clone();
        contradicted.contradiction_ids.insert(uuid::Uuid::new_v4());

        assert!(decayed_prominence(&contradicted, now) < decayed_prominence(&clean, now));
    }

    #[test]
    fn hard_delete_requires_archived_and_below_epsilon() {
        let mut entry = Entry::new("fact", Category::Fact, Source::User);
        entry.prominence = 0.005;
        entry.is_latest = true;
        assert!(!should_hard_delete(&entry, 0.01), "still latest, must not be deletable");
        entry.is_latest = false;
        assert!(should_hard_delete(&entry, 0.01));
    }
}
