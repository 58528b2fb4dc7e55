//! `redb`-backed persistence for every entity in the data model.
//!
//! Entries and relations are additionally mirrored to the JSONL
//! [`crate::event_log::MemoryEventLog`], which is the durability-critical
//! write-ahead log; the `redb` tables for those two entities are a
//! queryable index rebuilt from the log at startup
//! ([`Store::rebuild_from_log`]). Every other entity (sessions, scheduled
//! items, the cost ledger, profiles, runtime keys) is stored directly in
//! `redb` — its own transactions provide the durability guarantee there.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::event_log::{MemoryEvent, MemoryEventLog};
use crate::schema::*;

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");
const RELATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("relations");
const REL_BY_SOURCE: TableDefinition<&str, &str> = TableDefinition::new("relations_by_source");
const REL_BY_TARGET: TableDefinition<&str, &str> = TableDefinition::new("relations_by_target");
const USER_PROFILE: TableDefinition<&str, &str> = TableDefinition::new("user_profile");
const DYNAMIC_PROFILE: TableDefinition<&str, &[u8]> = TableDefinition::new("dynamic_profile");
const BEHAVIORAL_PATTERNS: TableDefinition<&str, &[u8]> = TableDefinition::new("behavioral_patterns");
const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");
const SESSION_MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("session_messages");
const SESSION_MESSAGES_BY_SESSION: TableDefinition<&str, &str> =
    TableDefinition::new("session_messages_by_session");
const SESSION_SUMMARIES: TableDefinition<&str, &[u8]> = TableDefinition::new("session_summaries");
const SCHEDULED_ITEMS: TableDefinition<&str, &[u8]> = TableDefinition::new("scheduled_items");
const COST_LEDGER: TableDefinition<&str, &[u8]> = TableDefinition::new("cost_ledger");
const RUNTIME_KEYS: TableDefinition<&str, &str> = TableDefinition::new("runtime_keys");

const DYNAMIC_PROFILE_KEY: &str = "singleton";
const BEHAVIORAL_PATTERNS_KEY: &str = "singleton";
const MIGRATION_SENTINEL: &str = "migration:polluted_sweep_v1";
const SCHEMA_VERSION_KEY: &str = "schema_version";
const CURRENT_SCHEMA_VERSION: &str = "1";

pub struct Store {
    db: Database,
    event_log: MemoryEventLog,
    data_dir: PathBuf,
    /// Serialises the small number of read-modify-write sequences (session
    /// message seq allocation, scheduled-item duplicate checks) that span
    /// more than one `redb` transaction.
    write_lock: Mutex<()>,
}

impl Store {
    pub async fn open(config: &vesper_config::PersistenceConfig) -> Result<Self> {
        let data_dir = PathBuf::from(&config.data_dir);
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating persistence dir {}", data_dir.display()))?;

        let index_path = data_dir.join(&config.index_file);
        let db = Database::create(&index_path)
            .with_context(|| format!("opening redb index at {}", index_path.display()))?;
        ensure_tables(&db)?;

        let event_log = MemoryEventLog::new(data_dir.join(&config.event_log_file));

        let store = Self {
            db,
            event_log,
            data_dir,
            write_lock: Mutex::new(()),
        };

        store.rebuild_from_log().await?;
        store.run_migrations()?;
        Ok(store)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ── Startup: rebuild entries/relations index from the WAL ──────────────

    pub async fn rebuild_from_log(&self) -> Result<usize> {
        let records = self.event_log.load()?;
        let count = records.len();
        let tx = self.db.begin_write()?;
        {
            let mut entries_tbl = tx.open_table(ENTRIES)?;
            let mut relations_tbl = tx.open_table(RELATIONS)?;
            let mut by_source = tx.open_table(REL_BY_SOURCE)?;
            let mut by_target = tx.open_table(REL_BY_TARGET)?;
            for record in &records {
                match &record.event {
                    MemoryEvent::EntryUpserted { entry } => {
                        let id = entry.id.to_string();
                        let bytes = serde_json::to_vec(entry.as_ref())?;
                        entries_tbl.insert(id.as_str(), bytes.as_slice())?;
                    }
                    MemoryEvent::RelationAdded { relation } => {
                        let id = relation.id.to_string();
                        let bytes = serde_json::to_vec(relation)?;
                        relations_tbl.insert(id.as_str(), bytes.as_slice())?;
                        append_index_line(&mut by_source, &relation.source_id.to_string(), &id)?;
                        append_index_line(&mut by_target, &relation.target_id.to_string(), &id)?;
                    }
                }
            }
        }
        tx.commit()?;
        tracing::info!(events = count, "memory index rebuilt from event log");
        Ok(count)
    }

    // ── Migrations ───────────────────────────────────────────────────────

    /// Idempotent migrations run at open. Each checks its own sentinel in
    /// `runtime_keys` so a crash mid-migration is recovered by a clean retry
    /// on the next startup.
    fn run_migrations(&self) -> Result<()> {
        if self.get_runtime_key(SCHEMA_VERSION_KEY)?.is_none() {
            self.set_runtime_key(SCHEMA_VERSION_KEY, CURRENT_SCHEMA_VERSION)?;
        }
        self.migrate_normalize_user_ids()?;
        self.migrate_polluted_sweep()?;
        Ok(())
    }

    fn migrate_normalize_user_ids(&self) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(ENTRIES)?;
            let ids: Vec<String> = tbl
                .iter()?
                .filter_map(|r| r.ok().map(|(k, _)| k.value().to_string()))
                .collect();
            for id in ids {
                if let Some(bytes) = tbl.get(id.as_str())?.map(|v| v.value().to_vec()) {
                    let mut entry: Entry = serde_json::from_slice(&bytes)?;
                    if entry.user_id != USER_ID {
                        entry.user_id = USER_ID.to_string();
                        let updated = serde_json::to_vec(&entry)?;
                        tbl.insert(id.as_str(), updated.as_slice())?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// One-shot archival sweep for skill outputs, long assistant responses,
    /// question-shaped user turns, and proactive check messages. Archives
    /// (lowers prominence, drops `is_latest`) rather than deletes. Guarded by
    /// `MIGRATION_SENTINEL` so it runs at most once.
    fn migrate_polluted_sweep(&self) -> Result<()> {
        if self.get_runtime_key(MIGRATION_SENTINEL)?.is_some() {
            return Ok(());
        }

        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(ENTRIES)?;
            let ids: Vec<String> = tbl
                .iter()?
                .filter_map(|r| r.ok().map(|(k, _)| k.value().to_string()))
                .collect();
            for id in ids {
                if let Some(bytes) = tbl.get(id.as_str())?.map(|v| v.value().to_vec()) {
                    let mut entry: Entry = serde_json::from_slice(&bytes)?;
                    if is_polluted(&entry) {
                        entry.is_latest = false;
                        entry.prominence = entry.prominence.min(0.05);
                        entry.metadata["archived_by_sweep"] = serde_json::Value::Bool(true);
                        entry.updated_at = Utc::now();
                        let updated = serde_json::to_vec(&entry)?;
                        tbl.insert(id.as_str(), updated.as_slice())?;
                    }
                }
            }
        }
        tx.commit()?;
        self.set_runtime_key(MIGRATION_SENTINEL, "done")?;
        Ok(())
    }

    // ── Entries ──────────────────────────────────────────────────────────

    pub async fn upsert_entry(&self, entry: &Entry) -> Result<()> {
        self.event_log
            .append(MemoryEvent::EntryUpserted { entry: Box::new(entry.clone()) })
            .await?;
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(ENTRIES)?;
            let bytes = serde_json::to_vec(entry)?;
            tbl.insert(entry.id.to_string().as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_entry(&self, id: Uuid) -> Result<Option<Entry>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(ENTRIES)?;
        match tbl.get(id.to_string().as_str())? {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        }
    }

    pub fn list_entries(&self) -> Result<Vec<Entry>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(ENTRIES)?;
        let mut out = Vec::new();
        for row in tbl.iter()? {
            let (_, v) = row?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    /// Hard-delete an entry and cascade-delete its incident relations.
    pub async fn delete_entry(&self, id: Uuid) -> Result<()> {
        let incident = self.relations_incident_to(id)?;
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(ENTRIES)?;
            tbl.remove(id.to_string().as_str())?;
            let mut rel_tbl = tx.open_table(RELATIONS)?;
            let mut by_source = tx.open_table(REL_BY_SOURCE)?;
            let mut by_target = tx.open_table(REL_BY_TARGET)?;
            for rel in &incident {
                rel_tbl.remove(rel.id.to_string().as_str())?;
                remove_index_line(&mut by_source, &rel.source_id.to_string(), &rel.id.to_string())?;
                remove_index_line(&mut by_target, &rel.target_id.to_string(), &rel.id.to_string())?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn relations_incident_to(&self, id: Uuid) -> Result<Vec<Relation>> {
        let mut out = self.relations_from(id)?;
        out.extend(self.relations_to(id)?);
        Ok(out)
    }

    // ── Relations ────────────────────────────────────────────────────────

    /// Insert `relation`. When `relation_type == Updates`, also flips the
    /// target entry's `is_latest := false, memory_type := Superseded` in the
    /// same `redb` write transaction.
    pub async fn add_relation(&self, relation: Relation) -> Result<()> {
        self.event_log
            .append(MemoryEvent::RelationAdded { relation: relation.clone() })
            .await?;

        let mut superseded_target: Option<Entry> = None;
        let tx = self.db.begin_write()?;
        {
            let mut rel_tbl = tx.open_table(RELATIONS)?;
            let bytes = serde_json::to_vec(&relation)?;
            rel_tbl.insert(relation.id.to_string().as_str(), bytes.as_slice())?;

            let mut by_source = tx.open_table(REL_BY_SOURCE)?;
            append_index_line(&mut by_source, &relation.source_id.to_string(), &relation.id.to_string())?;
            let mut by_target = tx.open_table(REL_BY_TARGET)?;
            append_index_line(&mut by_target, &relation.target_id.to_string(), &relation.id.to_string())?;

            if relation.relation_type == RelationType::Updates {
                let mut entries_tbl = tx.open_table(ENTRIES)?;
                let key = relation.target_id.to_string();
                if let Some(v) = entries_tbl.get(key.as_str())?.map(|v| v.value().to_vec()) {
                    let mut target: Entry = serde_json::from_slice(&v)?;
                    target.is_latest = false;
                    target.memory_type = MemoryType::Superseded;
                    target.updated_at = Utc::now();
                    let updated = serde_json::to_vec(&target)?;
                    entries_tbl.insert(key.as_str(), updated.as_slice())?;
                    superseded_target = Some(target);
                }
            }
        }
        tx.commit()?;

        if let Some(target) = superseded_target {
            self.event_log
                .append(MemoryEvent::EntryUpserted { entry: Box::new(target) })
                .await?;
        }
        Ok(())
    }

    pub fn relations_from(&self, source_id: Uuid) -> Result<Vec<Relation>> {
        self.relations_by_index(REL_BY_SOURCE, source_id)
    }

    pub fn relations_to(&self, target_id: Uuid) -> Result<Vec<Relation>> {
        self.relations_by_index(REL_BY_TARGET, target_id)
    }

    fn relations_by_index(&self, index: TableDefinition<&str, &str>, key: Uuid) -> Result<Vec<Relation>> {
        let tx = self.db.begin_read()?;
        let idx_tbl = tx.open_table(index)?;
        let ids: Vec<String> = idx_tbl
            .get(key.to_string().as_str())?
            .map(|v| v.value().to_string())
            .unwrap_or_default()
            .lines()
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        let rel_tbl = tx.open_table(RELATIONS)?;
        let mut out = Vec::new();
        for id in ids {
            if let Some(v) = rel_tbl.get(id.as_str())? {
                out.push(serde_json::from_slice(v.value())?);
            }
        }
        Ok(out)
    }

    // ── Profile ──────────────────────────────────────────────────────────

    pub fn get_user_profile(&self) -> Result<std::collections::HashMap<String, String>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(USER_PROFILE)?;
        let mut out = std::collections::HashMap::new();
        for row in tbl.iter()? {
            let (k, v) = row?;
            out.insert(k.value().to_string(), v.value().to_string());
        }
        Ok(out)
    }

    pub fn set_user_profile_field(&self, key: &str, value: &str) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(USER_PROFILE)?;
            tbl.insert(key, value)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_dynamic_profile(&self) -> Result<DynamicProfile> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(DYNAMIC_PROFILE)?;
        match tbl.get(DYNAMIC_PROFILE_KEY)? {
            None => Ok(DynamicProfile::default()),
            Some(v) => Ok(serde_json::from_slice(v.value())?),
        }
    }

    pub fn set_dynamic_profile(&self, profile: &DynamicProfile) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(DYNAMIC_PROFILE)?;
            let bytes = serde_json::to_vec(profile)?;
            tbl.insert(DYNAMIC_PROFILE_KEY, bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_behavioral_patterns(&self) -> Result<BehavioralPatterns> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(BEHAVIORAL_PATTERNS)?;
        match tbl.get(BEHAVIORAL_PATTERNS_KEY)? {
            None => Ok(BehavioralPatterns::default()),
            Some(v) => Ok(serde_json::from_slice(v.value())?),
        }
    }

    pub fn set_behavioral_patterns(&self, patterns: &BehavioralPatterns) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(BEHAVIORAL_PATTERNS)?;
            let bytes = serde_json::to_vec(patterns)?;
            tbl.insert(BEHAVIORAL_PATTERNS_KEY, bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    pub fn create_session(&self) -> Result<Session> {
        let session = Session::new();
        self.put_session(&session)?;
        Ok(session)
    }

    fn put_session(&self, session: &Session) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(SESSIONS)?;
            let bytes = serde_json::to_vec(session)?;
            tbl.insert(session.id.to_string().as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(SESSIONS)?;
        match tbl.get(id.to_string().as_str())? {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        }
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(SESSIONS)?;
        let mut out = Vec::new();
        for row in tbl.iter()? {
            let (_, v) = row?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    pub fn record_session_tokens(&self, id: Uuid, input_tokens: u64, output_tokens: u64) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let Some(mut session) = self.get_session(id)? else {
            return Ok(());
        };
        session.cumulative_input_tokens += input_tokens;
        session.cumulative_output_tokens += output_tokens;
        session.updated_at = Utc::now();
        self.put_session(&session)
    }

    pub fn append_session_message(
        &self,
        session_id: Uuid,
        role: Role,
        content: MessageContent,
    ) -> Result<SessionMessage> {
        let _guard = self.write_lock.lock().unwrap();
        let existing = self.get_session_messages(session_id)?;
        let seq = existing.len() as u64;
        let message = SessionMessage {
            id: Uuid::new_v4(),
            session_id,
            seq,
            role,
            content,
            created_at: Utc::now(),
        };

        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(SESSION_MESSAGES)?;
            let bytes = serde_json::to_vec(&message)?;
            tbl.insert(message.id.to_string().as_str(), bytes.as_slice())?;

            let mut idx = tx.open_table(SESSION_MESSAGES_BY_SESSION)?;
            append_index_line(&mut idx, &session_id.to_string(), &message.id.to_string())?;
        }
        tx.commit()?;
        Ok(message)
    }

    /// Ordered by insertion (monotonic `seq`) — the per-session ordering
    /// guarantee.
    pub fn get_session_messages(&self, session_id: Uuid) -> Result<Vec<SessionMessage>> {
        let tx = self.db.begin_read()?;
        let idx = tx.open_table(SESSION_MESSAGES_BY_SESSION)?;
        let ids: Vec<String> = idx
            .get(session_id.to_string().as_str())?
            .map(|v| v.value().to_string())
            .unwrap_or_default()
            .lines()
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        let tbl = tx.open_table(SESSION_MESSAGES)?;
        let mut out = Vec::new();
        for id in ids {
            if let Some(v) = tbl.get(id.as_str())? {
                out.push(serde_json::from_slice(v.value())?);
            }
        }
        out.sort_by_key(|m: &SessionMessage| m.seq);
        Ok(out)
    }

    pub fn add_session_summary(&self, summary: &SessionSummary) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(SESSION_SUMMARIES)?;
            let bytes = serde_json::to_vec(summary)?;
            tbl.insert(summary.id.to_string().as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_session_summaries(&self, session_id: Uuid) -> Result<Vec<SessionSummary>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(SESSION_SUMMARIES)?;
        let mut out = Vec::new();
        for row in tbl.iter()? {
            let (_, v) = row?;
            let summary: SessionSummary = serde_json::from_slice(v.value())?;
            if summary.session_id == session_id {
                out.push(summary);
            }
        }
        Ok(out)
    }

    /// Cascades to `session_messages` and `session_summaries`.
    pub fn prune_old_sessions(&self, max_age_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
        let tx = self.db.begin_write()?;
        let mut pruned = 0usize;
        let stale_ids: Vec<String> = {
            let tbl = tx.open_table(SESSIONS)?;
            tbl.iter()?
                .filter_map(|r| r.ok())
                .filter_map(|(k, v)| {
                    let session: Session = serde_json::from_slice(v.value()).ok()?;
                    (session.updated_at < cutoff).then(|| k.value().to_string())
                })
                .collect()
        };
        {
            let mut sessions_tbl = tx.open_table(SESSIONS)?;
            let mut messages_tbl = tx.open_table(SESSION_MESSAGES)?;
            let mut messages_idx = tx.open_table(SESSION_MESSAGES_BY_SESSION)?;
            let mut summaries_tbl = tx.open_table(SESSION_SUMMARIES)?;
            for id in &stale_ids {
                sessions_tbl.remove(id.as_str())?;
                let msg_ids: Vec<String> = messages_idx
                    .get(id.as_str())?
                    .map(|v| v.value().to_string())
                    .unwrap_or_default()
                    .lines()
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
                for mid in msg_ids {
                    messages_tbl.remove(mid.as_str())?;
                }
                messages_idx.remove(id.as_str())?;

                let summary_ids: Vec<String> = summaries_tbl
                    .iter()?
                    .filter_map(|r| r.ok())
                    .filter_map(|(k, v)| {
                        let s: SessionSummary = serde_json::from_slice(v.value()).ok()?;
                        (s.session_id.to_string() == *id).then(|| k.value().to_string())
                    })
                    .collect();
                for sid in summary_ids {
                    summaries_tbl.remove(sid.as_str())?;
                }
                pruned += 1;
            }
        }
        tx.commit()?;
        Ok(pruned)
    }

    // ── Scheduled items ──────────────────────────────────────────────────

    pub fn add_scheduled_item(&self, item: ScheduledItem) -> Result<ScheduledItem> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(SCHEDULED_ITEMS)?;
            let bytes = serde_json::to_vec(&item)?;
            tbl.insert(item.id.to_string().as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(item)
    }

    pub fn get_scheduled_item(&self, id: Uuid) -> Result<Option<ScheduledItem>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(SCHEDULED_ITEMS)?;
        match tbl.get(id.to_string().as_str())? {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        }
    }

    fn put_scheduled_item(&self, item: &ScheduledItem) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(SCHEDULED_ITEMS)?;
            let bytes = serde_json::to_vec(item)?;
            tbl.insert(item.id.to_string().as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_scheduled_items(&self) -> Result<Vec<ScheduledItem>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(SCHEDULED_ITEMS)?;
        let mut out = Vec::new();
        for row in tbl.iter()? {
            let (_, v) = row?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    /// Inside a single `IMMEDIATE` write transaction, flips every `pending`
    /// item with `trigger_at <= now` to `processing` and returns only the
    /// ones whose flip actually happened — the mechanism that keeps two
    /// overlapping gardener ticks from double-firing an item.
    pub fn claim_due_scheduled_items(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledItem>> {
        let tx = self.db.begin_write()?;
        let mut claimed = Vec::new();
        {
            let mut tbl = tx.open_table(SCHEDULED_ITEMS)?;
            let due_ids: Vec<String> = tbl
                .iter()?
                .filter_map(|r| r.ok())
                .filter_map(|(k, v)| {
                    let item: ScheduledItem = serde_json::from_slice(v.value()).ok()?;
                    (item.status == ScheduledItemStatus::Pending && item.trigger_at <= now)
                        .then(|| k.value().to_string())
                })
                .collect();
            for id in due_ids {
                if let Some(v) = tbl.get(id.as_str())?.map(|v| v.value().to_vec()) {
                    let mut item: ScheduledItem = serde_json::from_slice(&v)?;
                    if item.status != ScheduledItemStatus::Pending {
                        continue;
                    }
                    item.status = ScheduledItemStatus::Processing;
                    let bytes = serde_json::to_vec(&item)?;
                    tbl.insert(id.as_str(), bytes.as_slice())?;
                    claimed.push(item);
                }
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    pub fn mark_fired(&self, id: Uuid, fired_at: DateTime<Utc>) -> Result<()> {
        if let Some(mut item) = self.get_scheduled_item(id)? {
            item.status = ScheduledItemStatus::Fired;
            item.fired_at = Some(fired_at);
            self.put_scheduled_item(&item)?;
        }
        Ok(())
    }

    /// Fire failed: reset to `pending` so the next tick retries it.
    pub fn reset_to_pending(&self, id: Uuid) -> Result<()> {
        if let Some(mut item) = self.get_scheduled_item(id)? {
            item.status = ScheduledItemStatus::Pending;
            self.put_scheduled_item(&item)?;
        }
        Ok(())
    }

    pub fn dismiss_scheduled_item(&self, id: Uuid) -> Result<()> {
        if let Some(mut item) = self.get_scheduled_item(id)? {
            item.status = ScheduledItemStatus::Dismissed;
            self.put_scheduled_item(&item)?;
        }
        Ok(())
    }

    /// Marks pending items more than `max_age_ms` past their `trigger_at` as
    /// `expired`.
    pub fn expire_old_scheduled_items(&self, max_age: chrono::Duration) -> Result<usize> {
        let now = Utc::now();
        let items = self.list_scheduled_items()?;
        let mut expired = 0usize;
        for mut item in items {
            if item.status == ScheduledItemStatus::Pending && now - item.trigger_at > max_age {
                item.status = ScheduledItemStatus::Expired;
                self.put_scheduled_item(&item)?;
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Groups pending items per user and removes later duplicates by
    /// normalised word-overlap similarity (see `crate::dedup::similar_text`).
    /// Returns the number removed.
    pub fn consolidate_duplicate_scheduled_items(&self) -> Result<usize> {
        let mut items: Vec<ScheduledItem> = self
            .list_scheduled_items()?
            .into_iter()
            .filter(|i| i.status == ScheduledItemStatus::Pending)
            .collect();
        items.sort_by_key(|i| i.created_at);

        let mut keep: Vec<ScheduledItem> = Vec::new();
        let mut removed = 0usize;
        'outer: for item in items {
            for kept in &keep {
                if crate::dedup::scheduled_items_similar(kept, &item) {
                    self.dismiss_scheduled_item(item.id)?;
                    removed += 1;
                    continue 'outer;
                }
            }
            keep.push(item);
        }
        Ok(removed)
    }

    pub fn has_similar_pending_scheduled_item(&self, message: &str, window: chrono::Duration) -> Result<bool> {
        let now = Utc::now();
        let probe = ScheduledItem::new(ScheduledItemType::Reminder, message, now);
        for item in self.list_scheduled_items()? {
            if item.status != ScheduledItemStatus::Pending {
                continue;
            }
            if (now - item.created_at).abs() > window {
                continue;
            }
            if crate::dedup::scheduled_items_similar(&item, &probe) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ── Cost ledger ──────────────────────────────────────────────────────

    pub fn record_cost(&self, record: CostRecord) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(COST_LEDGER)?;
            let bytes = serde_json::to_vec(&record)?;
            tbl.insert(record.id.to_string().as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn spend_since(&self, since: DateTime<Utc>) -> Result<f64> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(COST_LEDGER)?;
        let mut total = 0.0;
        for row in tbl.iter()? {
            let (_, v) = row?;
            let record: CostRecord = serde_json::from_slice(v.value())?;
            if record.timestamp >= since {
                total += record.cost;
            }
        }
        Ok(total)
    }

    // ── Runtime keys ─────────────────────────────────────────────────────

    pub fn get_runtime_key(&self, key: &str) -> Result<Option<String>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(RUNTIME_KEYS)?;
        Ok(tbl.get(key)?.map(|v| v.value().to_string()))
    }

    pub fn set_runtime_key(&self, key: &str, value: &str) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(RUNTIME_KEYS)?;
            tbl.insert(key, value)?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── Pruning ──────────────────────────────────────────────────────────

    /// Deletes entries with `prominence < max_prominence ∧ !is_latest` and
    /// their incident relations. Returns the ids removed so callers can
    /// compact the event log.
    pub async fn prune_archived_memories(&self, max_prominence: f32) -> Result<Vec<Uuid>> {
        let candidates: Vec<Uuid> = self
            .list_entries()?
            .into_iter()
            .filter(|e| e.memory_type != MemoryType::StaticProfile && crate::decay::should_hard_delete(e, max_prominence))
            .map(|e| e.id)
            .collect();
        for id in &candidates {
            self.delete_entry(*id).await?;
        }
        Ok(candidates)
    }

    /// Deletes relations whose source or target no longer exists.
    pub async fn prune_orphaned_relations(&self) -> Result<usize> {
        let live: HashSet<Uuid> = self.list_entries()?.into_iter().map(|e| e.id).collect();
        let tx = self.db.begin_write()?;
        let mut removed = 0usize;
        {
            let mut rel_tbl = tx.open_table(RELATIONS)?;
            let orphans: Vec<(String, Uuid, Uuid)> = rel_tbl
                .iter()?
                .filter_map(|r| r.ok())
                .filter_map(|(k, v)| {
                    let rel: Relation = serde_json::from_slice(v.value()).ok()?;
                    (!live.contains(&rel.source_id) || !live.contains(&rel.target_id))
                        .then(|| (k.value().to_string(), rel.source_id, rel.target_id))
                })
                .collect();
            let mut by_source = tx.open_table(REL_BY_SOURCE)?;
            let mut by_target = tx.open_table(REL_BY_TARGET)?;
            for (id, source_id, target_id) in orphans {
                rel_tbl.remove(id.as_str())?;
                remove_index_line(&mut by_source, &source_id.to_string(), &id)?;
                remove_index_line(&mut by_target, &target_id.to_string(), &id)?;
                removed += 1;
            }
        }
        tx.commit()?;
        Ok(removed)
    }
}

fn ensure_tables(db: &Database) -> Result<()> {
    let tx = db.begin_write()?;
    tx.open_table(ENTRIES)?;
    tx.open_table(RELATIONS)?;
    tx.open_table(REL_BY_SOURCE)?;
    tx.open_table(REL_BY_TARGET)?;
    tx.open_table(USER_PROFILE)?;
    tx.open_table(DYNAMIC_PROFILE)?;
    tx.open_table(BEHAVIORAL_PATTERNS)?;
    tx.open_table(SESSIONS)?;
    tx.open_table(SESSION_MESSAGES)?;
    tx.open_table(SESSION_MESSAGES_BY_SESSION)?;
    tx.open_table(SESSION_SUMMARIES)?;
    tx.open_table(SCHEDULED_ITEMS)?;
    tx.open_table(COST_LEDGER)?;
    tx.open_table(RUNTIME_KEYS)?;
    tx.commit()?;
    Ok(())
}

fn append_index_line(
    table: &mut redb::Table<'_, &str, &str>,
    key: &str,
    value: &str,
) -> Result<()> {
    let existing = table.get(key)?.map(|v| v.value().to_string()).unwrap_or_default();
    let updated = if existing.is_empty() {
        value.to_string()
    } else {
        format!("{existing}\n{value}")
    };
    table.insert(key, updated.as_str())?;
    Ok(())
}

fn remove_index_line(
    table: &mut redb::Table<'_, &str, &str>,
    key: &str,
    value: &str,
) -> Result<()> {
    let existing = table.get(key)?.map(|v| v.value().to_string()).unwrap_or_default();
    let updated: Vec<&str> = existing.lines().filter(|line| *line != value).collect();
    if updated.is_empty() {
        table.remove(key)?;
    } else {
        table.insert(key, updated.join("\n").as_str())?;
    }
    Ok(())
}

/// Heuristics behind the one-shot "polluted memory" sweep migration.
/// Kept as a free function so the criteria can be tuned/tested without
/// touching the migration driver.
fn is_polluted(entry: &Entry) -> bool {
    if matches!(entry.source, Source::Skill(_)) {
        return true;
    }
    if entry.content.len() > 300 {
        return true;
    }
    if matches!(entry.source, Source::Assistant) && entry.content.len() > 200 {
        return true;
    }
    if matches!(entry.source, Source::User) && entry.content.trim_end().ends_with('?') {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_config::PersistenceConfig;

    async fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = PersistenceConfig {
            data_dir: dir.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        (Store::open(&config).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn entry_round_trips() {
        let (store, _dir) = test_store().await;
        let entry = Entry::new("likes tea", Category::Preference, Source::User);
        store.upsert_entry(&entry).await.unwrap();
        let loaded = store.get_entry(entry.id).unwrap().unwrap();
        assert_eq!(loaded.content, "likes tea");
    }

    #[tokio::test]
    async fn updates_relation_flips_target_latest_flag() {
        let (store, _dir) = test_store().await;
        let old = Entry::new("office is in Wicklow", Category::Fact, Source::User);
        let new = Entry::new("office is in Dublin", Category::Fact, Source::User);
        store.upsert_entry(&old).await.unwrap();
        store.upsert_entry(&new).await.unwrap();

        let relation = Relation::new(new.id, old.id, RelationType::Updates, 0.9);
        store.add_relation(relation).await.unwrap();

        let reloaded = store.get_entry(old.id).unwrap().unwrap();
        assert!(!reloaded.is_latest);
        assert_eq!(reloaded.memory_type, MemoryType::Superseded);
    }

    #[tokio::test]
    async fn claim_due_scheduled_items_is_idempotent_per_item() {
        let (store, _dir) = test_store().await;
        let item = ScheduledItem::new(ScheduledItemType::Reminder, "check the oven", Utc::now() - chrono::Duration::seconds(1));
        let item = store.add_scheduled_item(item).unwrap();

        let first = store.claim_due_scheduled_items(Utc::now()).unwrap();
        let second = store.claim_due_scheduled_items(Utc::now()).unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, item.id);
        assert!(second.is_empty(), "already-claimed item must not be claimed twice");
    }

    #[tokio::test]
    async fn session_messages_preserve_insertion_order() {
        let (store, _dir) = test_store().await;
        let session = store.create_session().unwrap();
        store.append_session_message(session.id, Role::User, MessageContent::Text("first".into())).unwrap();
        store.append_session_message(session.id, Role::Assistant, MessageContent::Text("second".into())).unwrap();

        let messages = store.get_session_messages(session.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content.as_text(), "first");
        assert_eq!(messages[1].content.as_text(), "second");
        assert!(messages[0].seq < messages[1].seq);
    }

    #[tokio::test]
    async fn migrations_run_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = PersistenceConfig {
            data_dir: dir.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        let store = Store::open(&config).await.unwrap();
        assert_eq!(store.get_runtime_key(MIGRATION_SENTINEL).unwrap(), Some("done".to_string()));
        drop(store);

        // Re-opening must not error and must not re-run the sweep.
        let store2 = Store::open(&config).await.unwrap();
        assert_eq!(store2.get_runtime_key(MIGRATION_SENTINEL).unwrap(), Some("done".to_string()));
    }
}
