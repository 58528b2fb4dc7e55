//! Append-only JSONL write-ahead log for entries and relations.
//!
//! This is the canonical source of truth for the two entity kinds that
//! demand replay-recoverable durability. `redb` tables elsewhere in the
//! crate are write-through indexes rebuilt from this log at startup.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::schema::{Entry, Relation};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryEvent {
    EntryUpserted { entry: Box<Entry> },
    RelationAdded { relation: Relation },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLogRecord {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event: MemoryEvent,
}

#[derive(Debug, Clone)]
pub struct MemoryEventLog {
    path: PathBuf,
}

impl MemoryEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, event: MemoryEvent) -> Result<()> {
        let record = MemoryLogRecord {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event,
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = serde_json::to_string(&record)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Atomically replace the log's contents. Used to compact out tombstoned
    /// entries during `pruneArchivedMemories`.
    pub async fn overwrite(&self, records: &[MemoryLogRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = {
            let filename = self
                .path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "events.jsonl".to_string());
            self.path.with_file_name(format!("{filename}.tmp"))
        };

        let write_result: Result<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            for record in records {
                let line = serde_json::to_string(record)?;
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        Ok(())
    }

    /// Replay the whole log. Corrupt lines are skipped and preserved in a
    /// `.corrupt` sidecar rather than aborting the load.
    pub fn load(&self) -> Result<Vec<MemoryLogRecord>> {
        use std::fs::OpenOptions;
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&self.path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut corrupt_count = 0usize;

        for (line_idx, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<MemoryLogRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    corrupt_count += 1;
                    tracing::warn!(
                        line = line_idx + 1,
                        error = %err,
                        path = %self.path.display(),
                        "corrupt JSONL record — skipping line (original preserved in .corrupt file)"
                    );
                    let corrupt_path = self.path.with_extension("jsonl.corrupt");
                    if let Ok(mut bad) = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&corrupt_path)
                    {
                        use std::io::Write as _;
                        let _ = writeln!(bad, "{line}");
                    }
                }
            }
        }

        if corrupt_count > 0 {
            tracing::warn!(
                corrupt_lines = corrupt_count,
                path = %self.path.display(),
                "event log loaded with skipped corrupt lines — inspect .corrupt sidecar"
            );
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Category, Source};

    #[tokio::test]
    async fn append_then_load_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = MemoryEventLog::new(dir.path().join("events.jsonl"));
        let entry = Entry::new("likes tea", Category::Preference, Source::User);
        let entry_id = entry.id;
        log.append(MemoryEvent::EntryUpserted { entry: Box::new(entry) }).await?;

        let records = log.load()?;
        assert_eq!(records.len(), 1);
        match &records[0].event {
            MemoryEvent::EntryUpserted { entry } => assert_eq!(entry.id, entry_id),
            _ => panic!("expected EntryUpserted"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_line_is_skipped_not_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.jsonl");
        let log = MemoryEventLog::new(&path);
        let entry = Entry::new("likes tea", Category::Preference, Source::User);
        log.append(MemoryEvent::EntryUpserted { entry: Box::new(entry) }).await?;
        tokio::fs::write(&path, format!("{}\nnot json\n", tokio::fs::read_to_string(&path).await?.trim_end())).await?;

        let records = log.load()?;
        assert_eq!(records.len(), 1);
        assert!(path.with_extension("jsonl.corrupt").exists());
        Ok(())
    }
}
