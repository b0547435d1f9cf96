//! Capability map and runtime configuration
//!
//! Stages consult the capability map to decide which optional sub-paths to
//! attempt. Absence of a capability produces a graceful-degradation branch,
//! never an error; only the LLM backend is mandatory.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Which external services are configured, derived from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Language-model backend for planning. Mandatory: jobs fail fast
    /// without it.
    pub llm: bool,
    /// Twelve Data market-data key present (Stooq remains a keyless
    /// fallback, so market data itself is always available).
    pub twelve_data: bool,
    pub fundamentals: bool,
    pub news_search: bool,
}

impl Capabilities {
    pub fn from_env() -> Self {
        Self {
            llm: env_present("GEMINI_API_KEY"),
            twelve_data: env_present("TWELVE_DATA_API_KEY"),
            fundamentals: env_present("ALPHAVANTAGE_API_KEY"),
            news_search: env_present("SERPER_API_KEY"),
        }
    }

    /// Everything configured; used by tests and the one-shot CLI demo.
    pub fn all() -> Self {
        Self {
            llm: true,
            twelve_data: true,
            fundamentals: true,
            news_search: true,
        }
    }

    /// Market data has a keyless fallback provider, so it is available
    /// whenever any market provider is in the chain.
    pub fn market_data(&self) -> bool {
        true
    }
}

fn env_present(key: &str) -> bool {
    env::var(key).map(|v| !v.trim().is_empty()).unwrap_or(false)
}

/// Orchestrator-wide tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum re-invocations per rejected stage (the repair cap).
    pub repair_cap: u32,
    /// Additional sandbox script attempts after a CODE_ERROR.
    pub sandbox_retry_cap: u32,
    /// Overall wall-clock budget per job.
    pub job_budget: Duration,
    /// Wall-clock ceiling for a single sandbox execution.
    pub sandbox_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            repair_cap: 1,
            sandbox_retry_cap: 2,
            job_budget: Duration::from_secs(120),
            sandbox_timeout: Duration::from_secs(2),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(secs) = env::var("JOB_BUDGET_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                cfg.job_budget = Duration::from_secs(secs.max(1));
            }
        }
        cfg
    }
}
