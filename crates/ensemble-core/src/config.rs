// Engine Configuration
// Read once at startup; never reloaded.

use serde::Serialize;

use crate::credit::CreditLimits;

/// Process configuration sourced from the environment.
///
/// Credentials for LLM/search providers are consumed only by the MCP server
/// subprocesses; the engine passes the environment through untouched.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    /// Per-session workflow budget cap, USD.
    pub max_budget_usd: f64,
    pub max_cost_per_hour_usd: f64,
    pub max_cost_per_day_usd: f64,
    pub emergency_shutdown_usd: f64,
    /// Run the adapter after every step instead of only at plan exhaustion.
    pub adapt_every_step: bool,
    /// Bounded wait for a correlated approval response, seconds.
    pub approval_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_budget_usd: 10.0,
            max_cost_per_hour_usd: 10.0,
            max_cost_per_day_usd: 50.0,
            emergency_shutdown_usd: 100.0,
            adapt_every_step: true,
            approval_timeout_secs: 60,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_budget_usd: env_f64("MAX_BUDGET_USD", defaults.max_budget_usd),
            max_cost_per_hour_usd: env_f64("MAX_COST_PER_HOUR_USD", defaults.max_cost_per_hour_usd),
            max_cost_per_day_usd: env_f64("MAX_COST_PER_DAY_USD", defaults.max_cost_per_day_usd),
            emergency_shutdown_usd: env_f64(
                "EMERGENCY_SHUTDOWN_USD",
                defaults.emergency_shutdown_usd,
            ),
            adapt_every_step: defaults.adapt_every_step,
            approval_timeout_secs: defaults.approval_timeout_secs,
        }
    }

    /// Credit limits derived from the configured caps. The session budget
    /// stays separate: both are enforced and the smaller binds.
    pub fn credit_limits(&self) -> CreditLimits {
        CreditLimits {
            max_per_hour: self.max_cost_per_hour_usd,
            max_per_day: self.max_cost_per_day_usd,
            emergency_shutdown: self.emergency_shutdown_usd,
            ..CreditLimits::default()
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
