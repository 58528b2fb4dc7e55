//! Router & cost tracker (C7): `selectProvider`, `executeWithFallback`,
//! `canMakeRequest`/`recordUsage`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::provider::Provider;
use crate::schema::{CompletionRequest, CompletionResponse, ProviderError, Tier, Usage};

/// Spend caps in USD; `0.0` means "no cap" (spend is still tracked).
#[derive(Debug, Clone, Copy)]
pub struct BudgetCaps {
    pub daily_budget_usd: f64,
    pub monthly_budget_usd: f64,
}

/// Collaborator the router reports usage to and asks for running spend.
/// Implemented by the runtime/agent crate over `vesper_memory::MemoryStore`'s
/// cost-ledger methods — kept as a trait object here so this crate never
/// depends on `vesper-memory`, mirroring the teacher's closure-injection
/// idiom for cross-crate collaborators.
pub trait CostLedger: Send + Sync {
    fn record_usage(&self, provider: &str, model: &str, session_id: Option<Uuid>, usage: Usage, cost: f64) -> anyhow::Result<()>;
    fn spend_since(&self, since: DateTime<Utc>) -> anyhow::Result<f64>;
}

/// Result of a successful `executeWithFallback` call: the response plus the
/// ordered list of provider names attempted (for logging/telemetry).
pub struct FallbackOutcome {
    pub response: CompletionResponse,
    pub attempted: Vec<String>,
}

pub struct LlmRouter {
    providers: Vec<Arc<dyn Provider>>,
    caps: BudgetCaps,
    default_tier: Tier,
}

impl LlmRouter {
    /// `providers` should be supplied in a stable preference order; ties in
    /// declared capability are additionally broken on `price_per_1k`.
    pub fn new(providers: Vec<Arc<dyn Provider>>, caps: BudgetCaps, default_tier: Tier) -> Self {
        Self { providers, caps, default_tier }
    }

    pub fn default_tier(&self) -> Tier {
        self.default_tier
    }

    /// Candidates whose declared capability matches or exceeds `tier`,
    /// cheapest first.
    async fn candidates(&self, tier: Tier) -> Vec<Arc<dyn Provider>> {
        let mut eligible: Vec<Arc<dyn Provider>> = Vec::new();
        for provider in &self.providers {
            if provider.tier() >= tier && provider.is_available().await {
                eligible.push(Arc::clone(provider));
            }
        }
        eligible.sort_by(|a, b| {
            let (a_in, a_out) = a.price_per_1k();
            let (b_in, b_out) = b.price_per_1k();
            (a_in + a_out).total_cmp(&(b_in + b_out))
        });
        eligible
    }

    /// Returns the single cheapest available provider meeting `tier`, or
    /// `None` when nothing is available (all circuits open / no credentials).
    pub async fn select_provider(&self, tier: Tier) -> Option<Arc<dyn Provider>> {
        self.candidates(tier).await.into_iter().next()
    }

    /// Denies a request when running day/month spend would exceed a
    /// configured (nonzero) cap.
    pub fn can_make_request(&self, ledger: &dyn CostLedger) -> anyhow::Result<bool> {
        let now = Utc::now();
        if self.caps.daily_budget_usd > 0.0 {
            let day_spend = ledger.spend_since(now - chrono::Duration::hours(24))?;
            if day_spend >= self.caps.daily_budget_usd {
                return Ok(false);
            }
        }
        if self.caps.monthly_budget_usd > 0.0 {
            let month_spend = ledger.spend_since(now - chrono::Duration::days(30))?;
            if month_spend >= self.caps.monthly_budget_usd {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Iterates the ranked candidate list for `tier`, returning the first
    /// successful completion and the providers attempted along the way.
    #[instrument(skip(self, request, ledger), fields(component = "llm_router", operation = "execute_with_fallback"))]
    pub async fn execute_with_fallback(
        &self,
        request: &CompletionRequest,
        tier: Tier,
        session_id: Option<Uuid>,
        ledger: &dyn CostLedger,
    ) -> Result<FallbackOutcome, ProviderError> {
        let candidates = self.candidates(tier).await;
        if candidates.is_empty() {
            return Err(ProviderError::Unavailable { provider: "none".to_string() });
        }

        let mut attempted = Vec::new();
        let mut last_error = None;
        for provider in &candidates {
            attempted.push(provider.name().to_string());
            match provider.complete(request).await {
                Ok(response) => {
                    let (price_in, price_out) = provider.price_per_1k();
                    let cost = (response.usage.input_tokens as f64 / 1000.0) * price_in
                        + (response.usage.output_tokens as f64 / 1000.0) * price_out;
                    if let Err(error) = ledger.record_usage(provider.name(), provider.model(), session_id, response.usage, cost) {
                        warn!(component = "llm_router", operation = "record_usage", cause = %error, "failed to record llm usage");
                    }
                    debug!(component = "llm_router", provider = provider.name(), model = provider.model(), "completion succeeded");
                    return Ok(FallbackOutcome { response, attempted });
                }
                Err(error) => {
                    warn!(component = "llm_router", provider = provider.name(), cause = %error, "provider failed, trying fallback");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or(ProviderError::Unavailable { provider: "none".to_string() }))
    }
}
