//! Core data model: entries, relations, profiles, sessions, scheduled items
//! and the cost ledger. Mirrors §3 of the design doc field for field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Single-user constant. The persistence layer normalises any
/// channel-prefixed identifier down to this value.
pub const USER_ID: &str = "user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Preference,
    Fact,
    Event,
    Relationship,
    Insight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    StaticProfile,
    DynamicProfile,
    Regular,
    Derived,
    Superseded,
}

/// Who produced the entry. `Skill` carries the skill name;
/// `CleanedSentinel` marks the one-shot pollution-sweep marker row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    User,
    Assistant,
    Skill(String),
    CleanedSentinel,
}

impl Source {
    /// Parse the `source` column's flat string form (`skill:<name>` etc.)
    /// back into a typed `Source`. Used by the startup migration that
    /// backfills the column from free text.
    pub fn parse(raw: &str) -> Self {
        if let Some(name) = raw.strip_prefix("skill:") {
            Source::Skill(name.to_string())
        } else {
            match raw {
                "user" => Source::User,
                "assistant" => Source::Assistant,
                "_cleaned_sentinel" => Source::CleanedSentinel,
                other => Source::Skill(other.to_string()),
            }
        }
    }

    pub fn as_flat(&self) -> String {
        match self {
            Source::User => "user".to_string(),
            Source::Assistant => "assistant".to_string(),
            Source::Skill(name) => format!("skill:{name}"),
            Source::CleanedSentinel => "_cleaned_sentinel".to_string(),
        }
    }
}

/// The atom of memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,
    pub user_id: String,
    pub content: String,
    pub category: Category,
    pub memory_type: MemoryType,
    pub source: Source,
    /// 1..=10
    pub importance: u8,
    /// 0.0..=1.0
    pub confidence: f32,
    pub is_latest: bool,
    pub document_date: DateTime<Utc>,
    pub event_date: Option<DateTime<Utc>>,
    /// 0.0..=1.0 decayable salience, see `crate::decay`.
    pub prominence: f32,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub embedding: Option<Vec<f32>>,
    /// Free-form bag. Must carry `subject` for facts (`"user"` or a name).
    pub metadata: serde_json::Value,
    pub times_confirmed: u32,
    pub contradiction_ids: HashSet<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entry {
    pub fn new(content: impl Into<String>, category: Category, source: Source) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: USER_ID.to_string(),
            content: content.into(),
            category,
            memory_type: MemoryType::Regular,
            source,
            importance: 5,
            confidence: 0.7,
            is_latest: true,
            document_date: now,
            event_date: None,
            prominence: 0.6,
            last_accessed: now,
            access_count: 0,
            embedding: None,
            metadata: serde_json::json!({ "subject": USER_ID }),
            times_confirmed: 1,
            contradiction_ids: HashSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn subject(&self) -> &str {
        self.metadata
            .get("subject")
            .and_then(|v| v.as_str())
            .unwrap_or(USER_ID)
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        let obj = self.metadata.as_object_mut().expect("metadata is an object");
        obj.insert("subject".to_string(), serde_json::Value::String(subject.into()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Updates,
    Extends,
    Derives,
}

/// Directed edge `(source_id -> target_id, type, confidence)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub id: Uuid,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub relation_type: RelationType,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

impl Relation {
    pub fn new(source_id: Uuid, target_id: Uuid, relation_type: RelationType, confidence: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            target_id,
            relation_type,
            confidence,
            created_at: Utc::now(),
        }
    }
}

/// `dynamic_profile` singleton: recent topics, mood, active projects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicProfile {
    pub recent_topics: Vec<String>,
    pub mood: Option<String>,
    pub active_projects: Vec<String>,
    pub last_interaction: Option<DateTime<Utc>>,
}

impl Default for DynamicProfile {
    fn default() -> Self {
        Self {
            recent_topics: Vec::new(),
            mood: None,
            active_projects: Vec::new(),
            last_interaction: None,
        }
    }
}

/// `behavioral_patterns`: communication style and exponentially smoothed
/// signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehavioralPatterns {
    pub communication_style: Option<String>,
    pub message_frequency_ema: f32,
    pub session_engagement_ema: f32,
    pub topic_switch_rate_ema: f32,
    pub response_length_trend_ema: f32,
    pub affect: Option<String>,
}

impl Default for BehavioralPatterns {
    fn default() -> Self {
        Self {
            communication_style: None,
            message_frequency_ema: 0.0,
            session_engagement_ema: 0.0,
            topic_switch_rate_ema: 0.0,
            response_length_trend_ema: 0.0,
            affect: None,
        }
    }
}

/// Exponential moving average update: `new = alpha * sample + (1 - alpha) * prior`.
pub fn ema_update(prior: f32, sample: f32, alpha: f32) -> f32 {
    alpha * sample + (1.0 - alpha) * prior
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult { tool_use_id: String, content: String, is_error: bool },
    Thinking { text: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A session message body: plain text or a list of typed content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flattened text view, used for lexical search and prompt rendering.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.clone()),
                    ContentBlock::Thinking { text } => Some(text.clone()),
                    ContentBlock::ToolResult { content, .. } => Some(content.clone()),
                    ContentBlock::ToolUse { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub metadata: serde_json::Value,
    pub cumulative_input_tokens: u64,
    pub cumulative_output_tokens: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: USER_ID.to_string(),
            metadata: serde_json::json!({}),
            cumulative_input_tokens: 0,
            cumulative_output_tokens: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Monotonic sequence number within the session — the ordering guarantee
    /// messages observe insertion order.
    pub seq: u64,
    pub role: Role,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub session_id: Uuid,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledItemSource {
    User,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledItemType {
    Reminder,
    EventPrep,
    CommitmentCheck,
    GoalCheckin,
    FollowUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledItemStatus {
    Pending,
    Processing,
    Fired,
    Dismissed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurringType {
    Daily,
    Weekly,
    Weekdays,
    Weekends,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringSpec {
    pub recurring_type: RecurringType,
    pub hour: u32,
    pub minute: u32,
    /// 0 = Sunday .. 6 = Saturday. Only meaningful for `Weekly`.
    pub day_of_week: Option<u32>,
}

/// Unified record for user-set reminders and agent-generated follow-ups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledItem {
    pub id: Uuid,
    pub user_id: String,
    pub source: ScheduledItemSource,
    pub item_type: ScheduledItemType,
    pub message: String,
    pub context: String,
    pub trigger_at: DateTime<Utc>,
    pub recurring: Option<RecurringSpec>,
    pub status: ScheduledItemStatus,
    pub source_memory_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub fired_at: Option<DateTime<Utc>>,
}

impl ScheduledItem {
    pub fn new(item_type: ScheduledItemType, message: impl Into<String>, trigger_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: USER_ID.to_string(),
            source: ScheduledItemSource::User,
            item_type,
            message: message.into(),
            context: String::new(),
            trigger_at,
            recurring: None,
            status: ScheduledItemStatus::Pending,
            source_memory_id: None,
            created_at: Utc::now(),
            fired_at: None,
        }
    }
}

/// Append-only spend ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: Uuid,
    pub model: String,
    pub provider: String,
    pub session_id: Option<Uuid>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_round_trips_through_flat_string() {
        let s = Source::Skill("web_search".to_string());
        assert_eq!(Source::parse(&s.as_flat()), s);
    }

    #[test]
    fn entry_defaults_to_user_subject() {
        let e = Entry::new("likes coffee", Category::Preference, Source::User);
        assert_eq!(e.subject(), USER_ID);
        assert!(e.is_latest);
    }

    #[test]
    fn with_subject_overrides_metadata() {
        let e = Entry::new("is a TikToker", Category::Fact, Source::User).with_subject("Hayat");
        assert_eq!(e.subject(), "Hayat");
    }
}
