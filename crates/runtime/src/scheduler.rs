//! Scheduler (C10, §4.11): claims due reminders and fires them through a
//! host-supplied sink, advancing recurring items to their next occurrence.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use vesper_config::SchedulerConfig;
use vesper_memory::schema::ScheduledItem;
use vesper_memory::{next_occurrence, MemoryStore};

/// Delivers a fired scheduled item to the user. The scheduler has no opinion
/// on transport (chat channel, log line, webhook); it only needs to know
/// whether delivery succeeded so it can decide `fired` vs. retry.
#[async_trait]
pub trait ScheduledItemSink: Send + Sync {
    async fn deliver(&self, item: &ScheduledItem) -> anyhow::Result<()>;
}

/// Sink used when nothing else is wired up: logs the item and always
/// succeeds. Useful for tests and for a host that only wants reminders
/// recorded, not delivered anywhere.
pub struct LoggingSink;

#[async_trait]
impl ScheduledItemSink for LoggingSink {
    async fn deliver(&self, item: &ScheduledItem) -> anyhow::Result<()> {
        info!(component = "scheduler", item_id = %item.id, message = %item.message, "scheduled item fired");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    pub expired: usize,
    pub claimed: usize,
    pub fired: usize,
    pub reset: usize,
    pub duplicates_consolidated: usize,
}

pub struct Scheduler {
    store: MemoryStore,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: MemoryStore, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn timezone(&self) -> chrono_tz::Tz {
        self.config.timezone.parse().unwrap_or_else(|_| "UTC".parse().unwrap())
    }

    /// `tick()` (§4.11): expire → claim → fire-or-reset(+recurrence) →
    /// periodic dedup. `consolidate_duplicates` lets the caller run step 4
    /// less often than the rest (the spec says "periodically", not "every
    /// tick").
    #[tracing::instrument(skip(self, sink), fields(component = "scheduler"))]
    pub async fn tick(&self, sink: &dyn ScheduledItemSink, consolidate_duplicates: bool) -> anyhow::Result<TickReport> {
        let persistence = self.store.persistence();
        let mut report = TickReport::default();

        report.expired = persistence.expire_old_scheduled_items(chrono::Duration::hours(self.config.scheduled_item_max_age_hours))?;

        let now = Utc::now();
        let claimed = persistence.claim_due_scheduled_items(now)?;
        report.claimed = claimed.len();

        for item in claimed {
            match sink.deliver(&item).await {
                Ok(()) => {
                    persistence.mark_fired(item.id, now)?;
                    report.fired += 1;
                    if let Some(recurring) = item.recurring {
                        let mut next = ScheduledItem::new(item.item_type, item.message.clone(), next_occurrence(&recurring, now, self.timezone()));
                        next.user_id = item.user_id.clone();
                        next.source = item.source;
                        next.context = item.context.clone();
                        next.recurring = Some(recurring);
                        next.source_memory_id = item.source_memory_id;
                        persistence.add_scheduled_item(next)?;
                    }
                }
                Err(error) => {
                    warn!(component = "scheduler", item_id = %item.id, cause = %error, "scheduled item delivery failed, resetting to pending");
                    persistence.reset_to_pending(item.id)?;
                    report.reset += 1;
                }
            }
        }

        if consolidate_duplicates {
            report.duplicates_consolidated = persistence.consolidate_duplicate_scheduled_items()?;
        }

        Ok(report)
    }

    /// Convenience wrapper for a host-initiated reminder (as opposed to one
    /// the fact/trigger extractor produced). Returns `None` when suppressed
    /// as a duplicate of an already-pending item.
    pub fn add_reminder(&self, item: ScheduledItem) -> anyhow::Result<Option<Uuid>> {
        let persistence = self.store.persistence();
        if persistence.has_similar_pending_scheduled_item(&item.message, chrono::Duration::hours(6))? {
            return Ok(None);
        }
        Ok(Some(persistence.add_scheduled_item(item)?.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vesper_config::PersistenceConfig;
    use vesper_memory::schema::ScheduledItemType;
    use vesper_memory::Store;

    async fn test_store() -> (MemoryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = PersistenceConfig { data_dir: dir.path().to_string_lossy().to_string(), ..Default::default() };
        (MemoryStore::new(Store::open(&config).await.unwrap()), dir)
    }

    struct CountingSink {
        delivered: AtomicUsize,
        fail_next: bool,
    }

    #[async_trait]
    impl ScheduledItemSink for CountingSink {
        async fn deliver(&self, _item: &ScheduledItem) -> anyhow::Result<()> {
            if self.fail_next {
                anyhow::bail!("delivery failed");
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn due_item_is_claimed_and_fired_exactly_once() {
        let (store, _dir) = test_store().await;
        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        let item = ScheduledItem::new(ScheduledItemType::Reminder, "check the oven", Utc::now() - chrono::Duration::seconds(1));
        store.persistence().add_scheduled_item(item).unwrap();

        let sink = CountingSink { delivered: AtomicUsize::new(0), fail_next: false };
        let report = scheduler.tick(&sink, false).await.unwrap();

        assert_eq!(report.claimed, 1);
        assert_eq!(report.fired, 1);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);

        let second = scheduler.tick(&sink, false).await.unwrap();
        assert_eq!(second.claimed, 0, "already-fired item must not be claimed again");
    }

    #[tokio::test]
    async fn failed_delivery_resets_to_pending_for_retry() {
        let (store, _dir) = test_store().await;
        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        let item = ScheduledItem::new(ScheduledItemType::Reminder, "check the oven", Utc::now() - chrono::Duration::seconds(1));
        let item = store.persistence().add_scheduled_item(item).unwrap();

        let sink = CountingSink { delivered: AtomicUsize::new(0), fail_next: true };
        let report = scheduler.tick(&sink, false).await.unwrap();
        assert_eq!(report.reset, 1);

        let reloaded = store.persistence().get_scheduled_item(item.id).unwrap().unwrap();
        assert_eq!(reloaded.status, vesper_memory::schema::ScheduledItemStatus::Pending);
    }

    #[tokio::test]
    async fn recurring_item_reinserts_next_occurrence_on_fire() {
        let (store, _dir) = test_store().await;
        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        let mut item = ScheduledItem::new(ScheduledItemType::Reminder, "check email", Utc::now() - chrono::Duration::seconds(1));
        item.recurring = Some(vesper_memory::schema::RecurringSpec {
            recurring_type: vesper_memory::schema::RecurringType::Daily,
            hour: 9,
            minute: 0,
            day_of_week: None,
        });
        store.persistence().add_scheduled_item(item).unwrap();

        let sink = CountingSink { delivered: AtomicUsize::new(0), fail_next: false };
        scheduler.tick(&sink, false).await.unwrap();

        let pending = store
            .persistence()
            .list_scheduled_items()
            .unwrap()
            .into_iter()
            .filter(|i| i.status == vesper_memory::schema::ScheduledItemStatus::Pending)
            .count();
        assert_eq!(pending, 1, "firing a recurring item must insert exactly one next occurrence");
    }

    #[tokio::test]
    async fn duplicate_reminder_within_window_is_suppressed() {
        let (store, _dir) = test_store().await;
        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        let first = ScheduledItem::new(ScheduledItemType::Reminder, "check the oven", Utc::now() + chrono::Duration::minutes(5));
        let second = ScheduledItem::new(ScheduledItemType::Reminder, "check the oven", Utc::now() + chrono::Duration::minutes(5));

        assert!(scheduler.add_reminder(first).unwrap().is_some());
        assert!(scheduler.add_reminder(second).unwrap().is_none());
    }
}
