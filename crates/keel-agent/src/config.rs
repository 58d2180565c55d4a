use keel_llm::SamplingParams;
use std::collections::HashMap;

/// Runtime configuration for one session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// Turn budget; the last turn is always treated as a final turn.
    pub max_turns: usize,
    /// Attempts per turn before the session fails with `retries_exhausted`.
    pub max_retries: usize,
    /// Context token budget; 0 disables forced-final behavior.
    pub token_budget: usize,
    /// Percentage of the budget at which the guard forces a final turn.
    pub force_final_percent: u8,
    /// Output format identifier for the final report.
    pub output_format: String,
    /// Chat acceptance mode: non-empty text with stop_reason "stop" wins.
    pub chat_mode: bool,
    pub streaming: bool,
    pub sampling: SamplingParams,
    /// Capacity for queues not named in `queue_capacities`.
    pub default_queue_capacity: usize,
    /// Per-queue concurrency limits declared by the agent.
    pub queue_capacities: HashMap<String, usize>,
    /// TTL for cached tool results; None disables the tool cache.
    pub tool_cache_ttl_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_retries: 3,
            token_budget: 100_000,
            force_final_percent: 80,
            output_format: "markdown".to_string(),
            chat_mode: false,
            streaming: false,
            sampling: SamplingParams::default(),
            default_queue_capacity: 4,
            queue_capacities: HashMap::new(),
            tool_cache_ttl_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_defaults_match_baseline() {
        let config = SessionConfig::default();
        assert_eq!(config.max_turns, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.token_budget, 100_000);
        assert_eq!(config.force_final_percent, 80);
        assert_eq!(config.output_format, "markdown");
        assert!(!config.chat_mode);
        assert_eq!(config.default_queue_capacity, 4);
        assert_eq!(config.tool_cache_ttl_ms, None);
    }
}
