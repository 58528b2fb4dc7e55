//! Adapts `vesper_memory::MemoryStore`'s spend ledger to the `CostLedger`
//! trait object `vesper_llm::LlmRouter` reports usage through — the same
//! closure-injection seam the router's own doc comment describes.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use vesper_llm::{CostLedger, Usage};
use vesper_memory::schema::CostRecord;
use vesper_memory::MemoryStore;

pub struct MemoryCostLedger<'a> {
    store: &'a MemoryStore,
}

impl<'a> MemoryCostLedger<'a> {
    pub fn new(store: &'a MemoryStore) -> Self {
        Self { store }
    }
}

impl CostLedger for MemoryCostLedger<'_> {
    fn record_usage(&self, provider: &str, model: &str, session_id: Option<Uuid>, usage: Usage, cost: f64) -> anyhow::Result<()> {
        self.store.record_cost(CostRecord {
            id: Uuid::new_v4(),
            model: model.to_string(),
            provider: provider.to_string(),
            session_id,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost,
            timestamp: Utc::now(),
        })
    }

    fn spend_since(&self, since: DateTime<Utc>) -> anyhow::Result<f64> {
        self.store.spend_since(since)
    }
}
