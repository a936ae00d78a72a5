use serde::{Deserialize, Serialize};

/// Retry policy applied at the outer call-dispatch boundary only.
/// The ledger and patch layers never retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries after the first attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry attempt `attempt` (1-based), capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
        std::time::Duration::from_millis(exp.min(self.max_delay_ms))
    }
}

/// Search consultation knobs for the pipeline's searching stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Results requested per broad query.
    pub broad_limit: usize,
    /// Results requested per precise (quoted) query.
    pub precise_limit: usize,
    /// Cap on queries taken from planning output.
    pub max_queries: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            broad_limit: 5,
            precise_limit: 3,
            max_queries: 4,
        }
    }
}

/// Session-wide orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub retry: RetryConfig,
    pub search: SearchConfig,
    /// Default loop budget for pipeline runs.
    pub default_max_loops: u32,
    /// How many image-regeneration flags in one applied patch actually
    /// reach the image synthesizer. A tunable, not an invariant.
    pub image_batch_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            search: SearchConfig::default(),
            default_max_loops: 3,
            image_batch_limit: 3,
        }
    }
}
