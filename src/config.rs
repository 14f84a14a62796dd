use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Tunables of one accounting engine instance.
///
/// There is no implicit global configuration; an `EngineConfig` is built
/// explicitly (or from the environment) and handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Period of the background replicator sweep. Callers observe stale
    /// usage for at most roughly this long after a mutation.
    pub replicator_period: Duration,
    /// Maximum number of audit events retained in memory; 0 keeps everything.
    pub event_log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replicator_period: Duration::from_millis(3500),
            event_log_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Build a config from `CHUNKLEDGER_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let replicator_period = env::var("CHUNKLEDGER_REPLICATOR_PERIOD_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.replicator_period);
        let event_log_capacity = env::var("CHUNKLEDGER_EVENT_LOG_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.event_log_capacity);
        Self {
            replicator_period,
            event_log_capacity,
        }
    }
}
