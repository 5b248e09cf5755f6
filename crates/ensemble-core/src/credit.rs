// Credit Tracker
// Tracks API spend across agents, enforces hard USD caps, and holds the
// process-wide code-generator LLM lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::error::{EnsembleError, Result};

// ============================================================================
// Limits & pricing
// ============================================================================

/// Safety limits preventing runaway spend. All values USD unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditLimits {
    pub max_per_session: f64,
    pub max_per_hour: f64,
    pub max_per_day: f64,
    pub emergency_shutdown: f64,
    /// Always 1: only one code-generator LLM instance at a time.
    pub max_llm_instances: usize,
    pub max_calls_per_minute: usize,
}

impl Default for CreditLimits {
    fn default() -> Self {
        Self {
            max_per_session: 5.0,
            max_per_hour: 10.0,
            max_per_day: 50.0,
            emergency_shutdown: 100.0,
            max_llm_instances: 1,
            max_calls_per_minute: 10,
        }
    }
}

// Pricing per 1K tokens for chat providers; flat per call for search.
const GPT_INPUT_PER_1K: f64 = 0.005;
const GPT_OUTPUT_PER_1K: f64 = 0.015;
const CLAUDE_INPUT_PER_1K: f64 = 0.003;
const CLAUDE_OUTPUT_PER_1K: f64 = 0.015;
const SEARCH_PER_CALL: f64 = 0.005;
const UNKNOWN_PER_CALL: f64 = 0.01;

fn calculate_cost(provider: &str, tokens_in: u64, tokens_out: u64) -> f64 {
    let provider = provider.to_lowercase();
    let cost = if provider.contains("gpt") {
        tokens_in as f64 / 1000.0 * GPT_INPUT_PER_1K + tokens_out as f64 / 1000.0 * GPT_OUTPUT_PER_1K
    } else if provider.contains("claude") {
        tokens_in as f64 / 1000.0 * CLAUDE_INPUT_PER_1K
            + tokens_out as f64 / 1000.0 * CLAUDE_OUTPUT_PER_1K
    } else if provider.contains("perplexity") {
        SEARCH_PER_CALL
    } else {
        UNKNOWN_PER_CALL
    };
    (cost * 10_000.0).round() / 10_000.0
}

// ============================================================================
// Usage records
// ============================================================================

/// Per-agent usage counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentUsage {
    pub api_calls: u64,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub last_call: Option<DateTime<Utc>>,
    pub errors: u64,
}

/// Returned from `track_api_call`: current totals plus any warnings.
#[derive(Debug, Clone, Serialize)]
pub struct UsageInfo {
    pub agent: String,
    pub provider: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub total_cost: f64,
    pub session_cost: f64,
    pub hourly_cost: f64,
    pub daily_cost: f64,
    pub warnings: Vec<String>,
}

/// Snapshot for status broadcasts.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub total_cost: f64,
    pub session_cost: f64,
    pub hourly_cost: f64,
    pub daily_cost: f64,
    pub limits: CreditLimits,
    pub agents: HashMap<String, AgentUsage>,
    pub llm_locked: bool,
    pub emergency_shutdown: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedUsage {
    timestamp: DateTime<Utc>,
    total_cost: f64,
    daily_cost: f64,
    session_cost: f64,
    agents: HashMap<String, PersistedAgentUsage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedAgentUsage {
    calls: u64,
    tokens: u64,
    cost: f64,
    errors: u64,
}

// ============================================================================
// Tracker
// ============================================================================

#[derive(Default)]
struct CreditState {
    usage: HashMap<String, AgentUsage>,
    total_cost: f64,
    daily_cost: f64,
    hourly: Vec<(DateTime<Utc>, f64)>,
    minute_calls: Vec<DateTime<Utc>>,
    emergency_shutdown: bool,
    shutdown_reason: String,
}

/// Global credit tracking and safety rail.
///
/// One instance per process; sessions share it. Limits can only be changed
/// through [`CreditTracker::set_limits`], which logs the change.
pub struct CreditTracker {
    limits: Mutex<CreditLimits>,
    state: Mutex<CreditState>,
    llm_slots: Arc<Semaphore>,
    llm_permit: Mutex<Option<OwnedSemaphorePermit>>,
    usage_file: PathBuf,
}

static GLOBAL: OnceLock<Arc<CreditTracker>> = OnceLock::new();

impl CreditTracker {
    pub fn new(limits: CreditLimits) -> Self {
        let usage_file = dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".ensemble")
            .join("usage")
            .join("credit_usage.json");
        Self::with_usage_file(limits, usage_file)
    }

    /// Test constructor with an explicit persistence path.
    pub fn with_usage_file(limits: CreditLimits, usage_file: PathBuf) -> Self {
        let mut state = CreditState::default();
        if let Some(persisted) = load_usage(&usage_file) {
            // Daily totals survive a restart only within the same calendar day.
            if persisted.timestamp.with_timezone(&Local).date_naive()
                == Local::now().date_naive()
            {
                state.daily_cost = persisted.daily_cost;
                tracing::info!(daily_cost = state.daily_cost, "restored daily spend");
            }
        }

        tracing::warn!(
            max_per_session = limits.max_per_session,
            max_per_hour = limits.max_per_hour,
            max_per_day = limits.max_per_day,
            emergency_shutdown = limits.emergency_shutdown,
            "credit tracker initialized"
        );

        let slots = limits.max_llm_instances.max(1);
        Self {
            limits: Mutex::new(limits),
            state: Mutex::new(state),
            llm_slots: Arc::new(Semaphore::new(slots)),
            llm_permit: Mutex::new(None),
            usage_file,
        }
    }

    /// Process-wide instance, constructed lazily with default limits.
    pub fn global() -> Arc<CreditTracker> {
        GLOBAL
            .get_or_init(|| Arc::new(CreditTracker::new(CreditLimits::default())))
            .clone()
    }

    /// Replace the active limits. The only sanctioned way to mutate caps.
    pub async fn set_limits(&self, limits: CreditLimits) {
        tracing::warn!(
            max_per_session = limits.max_per_session,
            max_per_hour = limits.max_per_hour,
            max_per_day = limits.max_per_day,
            emergency_shutdown = limits.emergency_shutdown,
            "credit limits updated"
        );
        *self.limits.lock().await = limits;
    }

    /// Track one API call, update all counters, and enforce limits.
    ///
    /// Limit order: session, hour, day, emergency. At 80% of a cap a warning
    /// is attached to the returned info; crossing a cap trips the sticky
    /// emergency shutdown and this (and every later) call fails.
    pub async fn track_api_call(
        &self,
        agent: &str,
        provider: &str,
        tokens_in: u64,
        tokens_out: u64,
        error: bool,
    ) -> Result<UsageInfo> {
        let limits = self.limits.lock().await.clone();
        let now = Utc::now();
        let snapshot = {
            let mut state = self.state.lock().await;

            if state.emergency_shutdown {
                return Err(EnsembleError::EmergencyShutdown(
                    state.shutdown_reason.clone(),
                ));
            }

            let usage = state.usage.entry(agent.to_string()).or_default();
            usage.api_calls += 1;
            usage.last_call = Some(now);
            if error {
                usage.errors += 1;
            }

            let cost = calculate_cost(provider, tokens_in, tokens_out);
            usage.tokens_used += tokens_in + tokens_out;
            usage.cost_usd += cost;
            state.total_cost += cost;
            state.daily_cost += cost;

            state.hourly.push((now, cost));
            let day_cutoff = now - chrono::Duration::hours(24);
            state.hourly.retain(|(t, _)| *t > day_cutoff);

            state.minute_calls.push(now);
            let minute_cutoff = now - chrono::Duration::seconds(60);
            state.minute_calls.retain(|t| *t > minute_cutoff);

            let session_cost = state.usage.values().map(|u| u.cost_usd).sum::<f64>();
            let hour_cutoff = now - chrono::Duration::hours(1);
            let hourly_cost = state
                .hourly
                .iter()
                .filter(|(t, _)| *t > hour_cutoff)
                .map(|(_, c)| c)
                .sum::<f64>();

            let mut warnings = Vec::new();
            let mut shutdown: Option<String> = None;

            let mut check = |label: &str, value: f64, cap: f64| {
                if value > cap {
                    if shutdown.is_none() {
                        shutdown = Some(format!(
                            "{label} cost ${value:.2} exceeded limit ${cap:.2}"
                        ));
                    }
                } else if value > cap * 0.8 {
                    warnings.push(format!(
                        "{label} cost ${value:.2} approaching limit ${cap:.2}"
                    ));
                }
            };
            check("session", session_cost, limits.max_per_session);
            check("hourly", hourly_cost, limits.max_per_hour);
            check("daily", state.daily_cost, limits.max_per_day);

            if state.total_cost > limits.emergency_shutdown && shutdown.is_none() {
                shutdown = Some(format!(
                    "total cost ${:.2} exceeded emergency limit ${:.2}",
                    state.total_cost, limits.emergency_shutdown
                ));
            }

            if state.minute_calls.len() > limits.max_calls_per_minute {
                warnings.push(format!(
                    "{} calls in the last minute exceeds rate limit {}",
                    state.minute_calls.len(),
                    limits.max_calls_per_minute
                ));
            }

            if let Some(reason) = &shutdown {
                state.emergency_shutdown = true;
                state.shutdown_reason = reason.clone();
                tracing::error!(reason = %reason, "EMERGENCY SHUTDOWN");
            }

            let info = UsageInfo {
                agent: agent.to_string(),
                provider: provider.to_string(),
                tokens_in,
                tokens_out,
                cost,
                total_cost: state.total_cost,
                session_cost,
                hourly_cost,
                daily_cost: state.daily_cost,
                warnings,
            };

            let persisted = persisted_snapshot(&state, session_cost);
            (info, persisted, shutdown)
        };
        let (info, persisted, shutdown) = snapshot;

        if !info.warnings.is_empty() {
            tracing::warn!(warnings = ?info.warnings, "credit warning");
        }

        // Persisted on every call so a crash never loses more than one call.
        if let Err(e) = save_usage(&self.usage_file, &persisted).await {
            tracing::error!(error = %e, "failed to save credit usage");
        }

        match shutdown {
            Some(reason) => Err(EnsembleError::EmergencyShutdown(reason)),
            None => Ok(info),
        }
    }

    /// Acquire the exclusive code-generator LLM slot, waiting up to
    /// `timeout`. Returns false when the slot could not be obtained in time.
    pub async fn acquire_llm_lock(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.llm_slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                *self.llm_permit.lock().await = Some(permit);
                tracing::info!("LLM lock acquired");
                true
            }
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::error!(timeout_secs = timeout.as_secs_f64(), "LLM lock timeout");
                false
            }
        }
    }

    /// Release the LLM slot. Safe to call when not held.
    pub async fn release_llm_lock(&self) {
        if self.llm_permit.lock().await.take().is_some() {
            tracing::info!("LLM lock released");
        }
    }

    pub async fn get_usage_summary(&self) -> UsageSummary {
        let limits = self.limits.lock().await.clone();
        let state = self.state.lock().await;
        let now = Utc::now();
        let hour_cutoff = now - chrono::Duration::hours(1);
        UsageSummary {
            total_cost: state.total_cost,
            session_cost: state.usage.values().map(|u| u.cost_usd).sum(),
            hourly_cost: state
                .hourly
                .iter()
                .filter(|(t, _)| *t > hour_cutoff)
                .map(|(_, c)| c)
                .sum(),
            daily_cost: state.daily_cost,
            limits,
            agents: state.usage.clone(),
            llm_locked: self.llm_slots.available_permits() == 0,
            emergency_shutdown: state.emergency_shutdown,
        }
    }

    pub async fn is_shutdown(&self) -> bool {
        self.state.lock().await.emergency_shutdown
    }
}

fn persisted_snapshot(state: &CreditState, session_cost: f64) -> PersistedUsage {
    PersistedUsage {
        timestamp: Utc::now(),
        total_cost: state.total_cost,
        daily_cost: state.daily_cost,
        session_cost,
        agents: state
            .usage
            .iter()
            .map(|(name, u)| {
                (
                    name.clone(),
                    PersistedAgentUsage {
                        calls: u.api_calls,
                        tokens: u.tokens_used,
                        cost: u.cost_usd,
                        errors: u.errors,
                    },
                )
            })
            .collect(),
    }
}

fn load_usage(path: &PathBuf) -> Option<PersistedUsage> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

async fn save_usage(path: &PathBuf, usage: &PersistedUsage) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let payload = serde_json::to_string_pretty(usage)?;
    tokio::fs::write(path, payload).await?;
    Ok(())
}
