use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Agent identity and persona knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub user_name: String,
    pub workspace_path: String,
    /// Path to an optional `SOUL.md` behavioural-guidelines file injected
    /// into the system prompt verbatim when present.
    pub soul_path: String,
    /// Upper bound on tool-dispatch ↔ provider-call rounds per turn (C9 §4.9
    /// step 7) before the loop forces a final answer.
    pub max_iterations: usize,
    /// `maxTokens` passed on every completion request.
    pub max_tokens: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Vesper".to_string(),
            user_name: String::new(),
            workspace_path: ".".to_string(),
            soul_path: "SOUL.md".to_string(),
            max_iterations: 10,
            max_tokens: 4096,
        }
    }
}

/// Provider model selection per tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub ollama_model: String,
    pub openrouter_model: String,
    pub openrouter_capable_model: String,
    /// Base URL for the Ollama API. Overridden by `OLLAMA_BASE_URL` at runtime.
    pub ollama_base_url: String,
    /// Wall-clock timeout per provider call, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            ollama_model: "llama3.1:8b".to_string(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            openrouter_capable_model: "anthropic/claude-3.7-sonnet".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// Per-day / per-month spend caps and default tier. A cap of `0.0` means
/// "no cap" — spend is still tracked but never denies a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub daily_budget_usd: f64,
    pub monthly_budget_usd: f64,
    /// Tier used when the complexity heuristic is inconclusive.
    pub default_tier: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            daily_budget_usd: 0.0,
            monthly_budget_usd: 0.0,
            default_tier: "standard".to_string(),
        }
    }
}

/// Fact & trigger extraction tuning (C6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub max_facts_per_message: usize,
    pub deduplication_threshold: f32,
    pub embedding_batch_concurrency: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_facts_per_message: 20,
            deduplication_threshold: 0.95,
            embedding_batch_concurrency: 5,
        }
    }
}

/// Memory decay, archival, and hard-delete thresholds (C4, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub archive_threshold: f32,
    pub archive_min_age_days: i64,
    pub hard_delete_epsilon: f32,
    pub archive_max_per_run: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            archive_threshold: 0.1,
            archive_min_age_days: 14,
            hard_delete_epsilon: 0.01,
            archive_max_per_run: 200,
        }
    }
}

/// Background gardener cadence and quiet hours (C11).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub timezone: String,
    pub quiet_hours_start: u32,
    pub quiet_hours_end: u32,
    pub light_tick_secs: u64,
    pub deep_tick_secs: u64,
    pub sleep_tick_secs: u64,
    pub scheduled_item_max_age_hours: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            quiet_hours_start: 23,
            quiet_hours_end: 5,
            light_tick_secs: 180,
            deep_tick_secs: 72 * 60,
            sleep_tick_secs: 20 * 60 * 60,
            scheduled_item_max_age_hours: 24,
        }
    }
}

/// Coarse approval policy governing when `vesper-exec` pauses for
/// interactive confirmation before running a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Never pause — every eligible tool runs immediately.
    Autonomous,
    /// Read-only tools run immediately; writes and shell commands pause.
    Balanced,
    /// Every tool pauses unless explicitly exempted.
    Safer,
}

impl Default for ApprovalMode {
    fn default() -> Self {
        ApprovalMode::Balanced
    }
}

/// Tool execution and sandboxing (consumed by `vesper-exec`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub approval_mode: ApprovalMode,
    /// Legacy flag, kept for config backward-compatibility; ignored when
    /// `approval_mode` is `Autonomous`.
    pub approval_required: bool,
    pub allow_shell: bool,
    pub sandbox_enabled: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            approval_mode: ApprovalMode::Balanced,
            approval_required: true,
            allow_shell: false,
            sandbox_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// On-disk locations for the persistence layer (C1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub data_dir: String,
    pub event_log_file: String,
    pub index_file: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: ".vesper/memory".to_string(),
            event_log_file: "events.jsonl".to_string(),
            index_file: "index.redb".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub router: RouterConfig,
    pub extraction: ExtractionConfig,
    pub memory: MemoryConfig,
    pub scheduler: SchedulerConfig,
    pub safety: SafetyConfig,
    pub telemetry: TelemetryConfig,
    pub persistence: PersistenceConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.llm.ollama_base_url = value;
            }
        }
        if let Ok(value) = env::var("VESPER_DAILY_BUDGET_USD") {
            if let Ok(parsed) = value.parse() {
                config.router.daily_budget_usd = parsed;
            }
        }
        if let Ok(value) = env::var("VESPER_MONTHLY_BUDGET_USD") {
            if let Ok(parsed) = value.parse() {
                config.router.monthly_budget_usd = parsed;
            }
        }
        if let Ok(value) = env::var("VESPER_WORKSPACE_PATH") {
            if !value.is_empty() {
                config.agent.workspace_path = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Masked configuration dump for `config --json` (§6 CLI surface).
    /// Provider credentials live in environment variables, not this struct,
    /// so there is nothing left to mask beyond documenting the contract here.
    pub fn describe(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        let config = AppConfig::default();
        config.save_to(&path)?;
        let loaded = AppConfig::load_from(&path)?;
        assert_eq!(loaded.agent.name, config.agent.name);
        assert_eq!(loaded.scheduler.quiet_hours_start, 23);
        Ok(())
    }

    #[test]
    fn missing_file_falls_back_to_defaults() -> Result<()> {
        let config = AppConfig::load_from("/nonexistent/path/config.toml")?;
        assert_eq!(config.router.default_tier, "standard");
        Ok(())
    }

    #[test]
    fn env_override_applies_budget_caps() -> Result<()> {
        unsafe {
            env::set_var("VESPER_DAILY_BUDGET_USD", "2.5");
        }
        let config = AppConfig::load_from("/nonexistent/path/config.toml")?;
        assert_eq!(config.router.daily_budget_usd, 2.5);
        unsafe {
            env::remove_var("VESPER_DAILY_BUDGET_USD");
        }
        Ok(())
    }
}
