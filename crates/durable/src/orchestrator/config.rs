//! Orchestrator configuration

use serde::{Deserialize, Serialize};

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum events per execution history (for safety)
    pub max_history_events: usize,

    /// Cycles for different executions run at most this many at a time
    pub max_concurrent_executions: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_history_events: 10_000,
            max_concurrent_executions: 64,
        }
    }
}

impl OrchestratorConfig {
    /// Read `DURABLE_MAX_HISTORY_EVENTS` and `DURABLE_MAX_CONCURRENT_EXECUTIONS`,
    /// falling back to defaults for unset or unparsable values
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_history_events: env_usize("DURABLE_MAX_HISTORY_EVENTS")
                .unwrap_or(defaults.max_history_events),
            max_concurrent_executions: env_usize("DURABLE_MAX_CONCURRENT_EXECUTIONS")
                .unwrap_or(defaults.max_concurrent_executions)
                .max(1),
        }
    }

    pub fn with_max_history_events(mut self, max: usize) -> Self {
        self.max_history_events = max;
        self
    }

    pub fn with_max_concurrent_executions(mut self, max: usize) -> Self {
        self.max_concurrent_executions = max.max(1);
        self
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
