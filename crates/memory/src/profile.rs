//! Profile helpers: `user_profiles` key/value facts, the `dynamic_profile`
//! singleton, and `behavioral_patterns` exponentially-smoothed signals.

use crate::schema::{ema_update, BehavioralPatterns, DynamicProfile};
use crate::store::MemoryStore;
use anyhow::Result;
use chrono::Utc;

/// Smoothing factor shared by all behavioral-pattern signals.
const EMA_ALPHA: f32 = 0.2;

impl MemoryStore {
    pub fn set_profile_field(&self, key: &str, value: &str) -> Result<()> {
        self.persistence().set_user_profile_field(key, value)
    }

    pub fn profile_fields(&self) -> Result<std::collections::HashMap<String, String>> {
        self.persistence().get_user_profile()
    }

    pub fn touch_dynamic_profile(&self, topic: Option<&str>, mood: Option<&str>) -> Result<()> {
        let mut profile = self.persistence().get_dynamic_profile()?;
        if let Some(topic) = topic {
            profile.recent_topics.retain(|t| t != topic);
            profile.recent_topics.insert(0, topic.to_string());
            profile.recent_topics.truncate(10);
        }
        if let Some(mood) = mood {
            profile.mood = Some(mood.to_string());
        }
        profile.last_interaction = Some(Utc::now());
        self.persistence().set_dynamic_profile(&profile)
    }

    pub fn dynamic_profile(&self) -> Result<DynamicProfile> {
        self.persistence().get_dynamic_profile()
    }

    /// Folds one fresh observation into each running behavioral signal.
    pub fn update_behavioral_signals(
        &self,
        message_frequency_sample: f32,
        session_engagement_sample: f32,
        topic_switch_sample: f32,
        response_length_sample: f32,
    ) -> Result<BehavioralPatterns> {
        let mut patterns = self.persistence().get_behavioral_patterns()?;
        patterns.message_frequency_ema = ema_update(patterns.message_frequency_ema, message_frequency_sample, EMA_ALPHA);
        patterns.session_engagement_ema = ema_update(patterns.session_engagement_ema, session_engagement_sample, EMA_ALPHA);
        patterns.topic_switch_rate_ema = ema_update(patterns.topic_switch_rate_ema, topic_switch_sample, EMA_ALPHA);
        patterns.response_length_trend_ema = ema_update(patterns.response_length_trend_ema, response_length_sample, EMA_ALPHA);
        self.persistence().set_behavioral_patterns(&patterns)?;
        Ok(patterns)
    }

    pub fn behavioral_patterns(&self) -> Result<BehavioralPatterns> {
        self.persistence().get_behavioral_patterns()
    }
}

/// Format the user-facing profile block for prompt injection. Deduplicates
/// by key (the field name) — last write wins since the store is a flat kv
/// table, unlike the entry-based dedup the teacher does over timestamped
/// rows.
pub fn format_user_profile_block(fields: &std::collections::HashMap<String, String>) -> Option<String> {
    if fields.is_empty() {
        return None;
    }
    let mut keys: Vec<&String> = fields.keys().collect();
    keys.sort();
    let lines: Vec<String> = keys.into_iter().map(|k| format!("  - {k}: {}", fields[k])).collect();
    Some(format!("Known about the user:\n{}", lines.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Store;
    use vesper_config::PersistenceConfig;

    async fn test_store() -> (MemoryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = PersistenceConfig { data_dir: dir.path().to_string_lossy().to_string(), ..Default::default() };
        (MemoryStore::new(Store::open(&config).await.unwrap()), dir)
    }

    #[tokio::test]
    async fn dynamic_profile_tracks_recent_topics() {
        let (store, _dir) = test_store().await;
        store.touch_dynamic_profile(Some("rust"), Some("curious")).unwrap();
        store.touch_dynamic_profile(Some("memory systems"), None).unwrap();
        let profile = store.dynamic_profile().unwrap();
        assert_eq!(profile.recent_topics[0], "memory systems");
        assert_eq!(profile.mood.as_deref(), Some("curious"));
    }

    #[tokio::test]
    async fn behavioral_signals_smooth_towards_new_samples() {
        let (store, _dir) = test_store().await;
        let first = store.update_behavioral_signals(1.0, 1.0, 1.0, 1.0).unwrap();
        assert!(first.message_frequency_ema > 0.0);
        let second = store.update_behavioral_signals(0.0, 0.0, 0.0, 0.0).unwrap();
        assert!(second.message_frequency_ema < first.message_frequency_ema);
    }

    #[test]
    fn profile_block_formats_sorted_keys() {
        let mut fields = std::collections::HashMap::new();
        fields.insert("timezone".to_string(), "Europe/Dublin".to_string());
        fields.insert("name".to_string(), "Alex".to_string());
        let block = format_user_profile_block(&fields).unwrap();
        assert!(block.find("name").unwrap() < block.find("timezone").unwrap());
    }
}
