use keel_llm::Usage;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// One completed operation. Entries are append-only and ordered by
/// completion; tool entries may interleave within a turn, never across
/// turns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccountingEntry {
    Llm {
        provider: String,
        model: String,
        usage: Usage,
        latency_ms: u64,
        status: String,
    },
    Tool {
        queue: String,
        tool: String,
        bytes_in: usize,
        bytes_out: usize,
        latency_ms: u64,
        status: String,
    },
}

/// Shared append-only accounting log for one session.
#[derive(Clone, Default)]
pub struct AccountingLog {
    entries: Arc<Mutex<Vec<AccountingEntry>>>,
}

impl AccountingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: AccountingEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    pub fn snapshot(&self) -> Vec<AccountingEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Total tokens across all LLM entries, for audit summaries.
    pub fn llm_token_total(&self) -> u64 {
        self.snapshot()
            .iter()
            .map(|entry| match entry {
                AccountingEntry::Llm { usage, .. } => usage.total_tokens,
                AccountingEntry::Tool { .. } => 0,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_token_total_ignores_tool_entries() {
        let log = AccountingLog::new();
        log.append(AccountingEntry::Llm {
            provider: "test".to_string(),
            model: "m".to_string(),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
            },
            latency_ms: 12,
            status: "success".to_string(),
        });
        log.append(AccountingEntry::Tool {
            queue: "default".to_string(),
            tool: "grep".to_string(),
            bytes_in: 64,
            bytes_out: 256,
            latency_ms: 3,
            status: "ok".to_string(),
        });

        assert_eq!(log.llm_token_total(), 15);
        assert_eq!(log.snapshot().len(), 2);
    }
}
