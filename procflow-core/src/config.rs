use crate::flows::StuckPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine tuning knobs. Deserializable so embedders can load it from their
/// own configuration layer; every field has a default.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound per acquisition cycle.
    pub max_jobs_per_acquisition: usize,
    /// Idle wait between acquisition cycles, milliseconds.
    pub acquire_wait_ms: u64,
    /// How long an acquired job stays locked, milliseconds.
    pub job_lock_ms: u64,
    /// Delay before a failed job is retried, milliseconds.
    pub retry_delay_ms: u64,
    pub max_job_retries: u32,
    /// Concurrent worker slots for job execution.
    pub worker_slots: usize,
    /// Step limit per unit of work, against runaway graphs.
    pub max_steps: usize,
    pub stuck_policy: StuckPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_acquisition: 10,
            acquire_wait_ms: 5_000,
            job_lock_ms: 300_000,
            retry_delay_ms: 1_000,
            max_job_retries: 3,
            worker_slots: 4,
            max_steps: 10_000,
            stuck_policy: StuckPolicy::EndExecution,
        }
    }
}

impl EngineConfig {
    pub fn acquire_wait(&self) -> Duration {
        Duration::from_millis(self.acquire_wait_ms)
    }

    pub fn job_lock(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.job_lock_ms as i64)
    }

    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.retry_delay_ms as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "worker_slots": 2, "stuck_policy": "raise-error" }"#)
                .unwrap();
        assert_eq!(config.worker_slots, 2);
        assert_eq!(config.stuck_policy, StuckPolicy::RaiseError);
        assert_eq!(config.max_jobs_per_acquisition, 10);
        assert_eq!(config.acquire_wait(), Duration::from_millis(5_000));
    }
}
