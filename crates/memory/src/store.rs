//! `MemoryStore` (C4): the ergonomic facade over [`crate::persistence::Store`]
//! that downstream crates (thinker, prompt, agent, runtime) depend on.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use crate::decay::{decayed_prominence, should_archive, utility_score};
use crate::persistence::Store;
use crate::schema::*;
use crate::search::{hybrid_search, SearchHit, SearchOptions};

/// Maximum hops a relation-chain traversal will take before giving up.
/// Relations can in principle form cycles via repeated edits; the store does
/// not rely on acyclicity.
const MAX_RELATION_DEPTH: usize = 32;

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Store>,
}

impl MemoryStore {
    pub fn new(inner: Store) -> Self {
        Self { inner: Arc::new(inner) }
    }

    pub fn persistence(&self) -> &Store {
        &self.inner
    }

    pub async fn add_entry(&self, entry: Entry) -> Result<Entry> {
        self.inner.upsert_entry(&entry).await?;
        Ok(entry)
    }

    pub fn get_entry(&self, id: Uuid) -> Result<Option<Entry>> {
        self.inner.get_entry(id)
    }

    /// Never mutates state — see `search::hybrid_search`. Callers that
    /// consume the result for context building must call `record_access`
    /// explicitly.
    pub fn search(&self, query: &str, query_embedding: Option<&[f32]>, opts: &SearchOptions) -> Result<Vec<SearchHit>> {
        let entries = self.inner.list_entries()?;
        Ok(hybrid_search(&entries, query, query_embedding, opts))
    }

    pub async fn record_access(&self, id: Uuid) -> Result<()> {
        if let Some(mut entry) = self.inner.get_entry(id)? {
            let before = entry.access_count;
            entry.access_count += 1;
            entry.last_accessed = Utc::now();
            debug_assert!(entry.access_count > before);
            self.inner.upsert_entry(&entry).await?;
        }
        Ok(())
    }

    /// On re-confirmation: clamps both fields to 1.0, bumps
    /// `times_confirmed`.
    pub async fn reinforce_memory(&self, id: Uuid, delta_confidence: f32, delta_prominence: f32) -> Result<()> {
        if let Some(mut entry) = self.inner.get_entry(id)? {
            entry.confidence = (entry.confidence + delta_confidence).clamp(0.0, 1.0);
            entry.prominence = (entry.prominence + delta_prominence).clamp(0.0, 1.0);
            entry.times_confirmed += 1;
            entry.updated_at = Utc::now();
            self.inner.upsert_entry(&entry).await?;
        }
        Ok(())
    }

    /// Appends `other_id` to `id`'s contradiction set without duplicating.
    pub async fn add_contradiction(&self, id: Uuid, other_id: Uuid) -> Result<()> {
        if let Some(mut entry) = self.inner.get_entry(id)? {
            entry.contradiction_ids.insert(other_id);
            entry.updated_at = Utc::now();
            self.inner.upsert_entry(&entry).await?;
        }
        Ok(())
    }

    /// Single-pass bulk decay update over the given ids (or all entries when
    /// `ids` is empty), written one entry at a time but computed from a
    /// single consistent snapshot.
    pub async fn update_prominences(&self, ids: &[Uuid]) -> Result<usize> {
        let now = Utc::now();
        let entries = if ids.is_empty() {
            self.inner.list_entries()?
        } else {
            ids.iter().filter_map(|id| self.inner.get_entry(*id).ok().flatten()).collect()
        };

        let mut updated = 0usize;
        for mut entry in entries {
            let new_prominence = decayed_prominence(&entry, now);
            if (new_prominence - entry.prominence).abs() > f32::EPSILON {
                entry.prominence = new_prominence;
                entry.updated_at = now;
                self.inner.upsert_entry(&entry).await?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Transitions entries crossing below the archive threshold (and
    /// untouched for `min_age_days`) to `is_latest = false, memory_type =
    /// Superseded`. `static_profile` is exempt — hard invariant.
    pub async fn archive_decayed_memories(&self, archive_threshold: f32, min_age_days: i64) -> Result<usize> {
        let now = Utc::now();
        let mut archived = 0usize;
        for mut entry in self.inner.list_entries()? {
            if entry.is_latest && should_archive(&entry, now, archive_threshold, min_age_days) {
                entry.is_latest = false;
                entry.memory_type = MemoryType::Superseded;
                entry.updated_at = now;
                self.inner.upsert_entry(&entry).await?;
                archived += 1;
            }
        }
        Ok(archived)
    }

    /// Archives at most `max_per_run` entries ranked lowest by utility
    /// score, below `utility_threshold` and at least `min_age_days` old.
    pub async fn archive_low_utility_memories(
        &self,
        utility_threshold: f32,
        min_age_days: i64,
        max_per_run: usize,
    ) -> Result<usize> {
        let now = Utc::now();
        let mut candidates: Vec<Entry> = self
            .inner
            .list_entries()?
            .into_iter()
            .filter(|e| {
                e.is_latest
                    && e.memory_type != MemoryType::StaticProfile
                    && (now - e.created_at).num_days() >= min_age_days
                    && utility_score(e, now) < utility_threshold
            })
            .collect();
        candidates.sort_by(|a, b| utility_score(a, now).total_cmp(&utility_score(b, now)));
        candidates.truncate(max_per_run);

        for mut entry in candidates.iter().cloned() {
            entry.is_latest = false;
            entry.memory_type = MemoryType::Superseded;
            entry.updated_at = now;
            self.inner.upsert_entry(&entry).await?;
        }
        Ok(candidates.len())
    }

    pub async fn prune_archived_memories(&self, max_prominence: f32) -> Result<Vec<Uuid>> {
        self.inner.prune_archived_memories(max_prominence).await
    }

    pub async fn prune_orphaned_relations(&self) -> Result<usize> {
        self.inner.prune_orphaned_relations().await
    }

    pub async fn add_relation(&self, relation: Relation) -> Result<()> {
        self.inner.add_relation(relation).await
    }

    /// Appends to the append-only spend ledger (C7 `recordUsage`).
    pub fn record_cost(&self, record: CostRecord) -> Result<()> {
        self.inner.record_cost(record)
    }

    /// Sum of `CostRecord::cost` since `since` (C7 `canMakeRequest` gate).
    pub fn spend_since(&self, since: chrono::DateTime<Utc>) -> Result<f64> {
        self.inner.spend_since(since)
    }

    /// Follows `UPDATES` edges from `id` forward to find the newest entry in
    /// its supersession chain. Caps depth at 32 and breaks on a revisited
    /// node — relation graphs are not guaranteed acyclic.
    pub fn newest_in_update_chain(&self, id: Uuid) -> Result<Uuid> {
        let mut current = id;
        let mut visited = HashSet::new();
        for _ in 0..MAX_RELATION_DEPTH {
            if !visited.insert(current) {
                break;
            }
            let incoming = self.inner.relations_to(current)?;
            let Some(next) = incoming
                .iter()
                .find(|r| r.relation_type == RelationType::Updates)
                .map(|r| r.source_id)
            else {
                break;
            };
            current = next;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_config::PersistenceConfig;

    async fn test_store() -> (MemoryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = PersistenceConfig { data_dir: dir.path().to_string_lossy().to_string(), ..Default::default() };
        (MemoryStore::new(Store::open(&config).await.unwrap()), dir)
    }

    #[tokio::test]
    async fn record_access_is_monotone() {
        let (store, _dir) = test_store().await;
        let entry = store.add_entry(Entry::new("likes tea", Category::Preference, Source::User)).await.unwrap();
        store.record_access(entry.id).await.unwrap();
        store.record_access(entry.id).await.unwrap();
        let reloaded = store.get_entry(entry.id).unwrap().unwrap();
        assert_eq!(reloaded.access_count, 2);
    }

    #[tokio::test]
    async fn reinforce_memory_clamps_to_one() {
        let (store, _dir) = test_store().await;
        let mut entry = Entry::new("likes tea", Category::Preference, Source::User);
        entry.confidence = 0.95;
        entry.prominence = 0.98;
        let entry = store.add_entry(entry).await.unwrap();
        store.reinforce_memory(entry.id, 0.5, 0.5).await.unwrap();
        let reloaded = store.get_entry(entry.id).unwrap().unwrap();
        assert_eq!(reloaded.confidence, 1.0);
        assert_eq!(reloaded.prominence, 1.0);
    }

    #[tokio::test]
    async fn archive_decayed_memories_exempts_static_profile() {
        let (store, _dir) = test_store().await;
        let mut entry = Entry::new("name is Alex", Category::Fact, Source::User);
        entry.memory_type = MemoryType::StaticProfile;
        entry.prominence = 0.0;
        entry.last_accessed = Utc::now() - chrono::Duration::days(365);
        let entry = store.add_entry(entry).await.unwrap();

        store.archive_decayed_memories(0.1, 14).await.unwrap();
        let reloaded = store.get_entry(entry.id).unwrap().unwrap();
        assert!(reloaded.is_latest);
    }

    #[tokio::test]
    async fn newest_in_update_chain_follows_updates_edges() {
        let (store, _dir) = test_store().await;
        let a = store.add_entry(Entry::new("office in Wicklow", Category::Fact, Source::User)).await.unwrap();
        let b = store.add_entry(Entry::new("office in Dublin", Category::Fact, Source::User)).await.unwrap();
        store.add_relation(Relation::new(b.id, a.id, RelationType::Updates, 0.9)).await.unwrap();

        assert_eq!(store.newest_in_update_chain(a.id).unwrap(), b.id);
    }

    #[tokio::test]
    async fn spend_since_sums_only_recent_records() {
        let (store, _dir) = test_store().await;
        let old = CostRecord {
            id: Uuid::new_v4(),
            model: "gpt".to_string(),
            provider: "openrouter".to_string(),
            session_id: None,
            input_tokens: 10,
            output_tokens: 10,
            cost: 1.0,
            timestamp: Utc::now() - chrono::Duration::days(2),
        };
        let recent = CostRecord { id: Uuid::new_v4(), timestamp: Utc::now(), cost: 2.0, ..old.clone() };
        store.record_cost(old).unwrap();
        store.record_cost(recent).unwrap();
        let total = store.spend_since(Utc::now() - chrono::Duration::hours(1)).unwrap();
        assert_eq!(total, 2.0);
    }

    #[tokio::test]
    async fn newest_in_update_chain_breaks_on_cycle() {
        let (store, _dir) = test_store().await;
        let a = store.add_entry(Entry::new("a", Category::Fact, Source::User)).await.unwrap();
        let b = store.add_entry(Entry::new("b", Category::Fact, Source::User)).await.unwrap();
        store.add_relation(Relation::new(b.id, a.id, RelationType::Updates, 0.9)).await.unwrap();
        store.add_relation(Relation::new(a.id, b.id, RelationType::Updates, 0.9)).await.unwrap();

        // Must terminate rather than loop forever.
        let _ = store.newest_in_update_chain(a.id).unwrap();
    }
}
