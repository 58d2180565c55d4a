use keel_llm::{Message, Tokenizer};

/// Fixed structural overhead charged per message beyond its text.
pub const PER_MESSAGE_OVERHEAD_TOKENS: usize = 4;
/// Fixed overhead charged per tool call (id, name, framing).
pub const PER_TOOL_CALL_OVERHEAD_TOKENS: usize = 8;

/// Decides whether the accumulated token tally forces a final turn. Purely
/// advisory and stateless per call; it owns no session state.
#[derive(Clone, Copy, Debug)]
pub struct ContextGuard {
    pub token_budget: usize,
    pub force_final_percent: u8,
}

impl ContextGuard {
    pub fn new(token_budget: usize, force_final_percent: u8) -> Self {
        Self {
            token_budget,
            force_final_percent,
        }
    }

    /// True once the tally crosses the percentage threshold of the budget.
    /// A zero budget disables forcing.
    pub fn should_force_final(&self, used_tokens: usize) -> bool {
        if self.token_budget == 0 {
            return false;
        }
        used_tokens.saturating_mul(100)
            >= self
                .token_budget
                .saturating_mul(usize::from(self.force_final_percent))
    }

    /// Token estimate for the full history: tokenizer counts over content
    /// and tool-call arguments, plus fixed per-message and per-tool-call
    /// overheads.
    pub fn estimate_conversation_tokens(
        &self,
        messages: &[Message],
        tokenizer: &dyn Tokenizer,
    ) -> usize {
        messages
            .iter()
            .map(|message| {
                let mut tokens =
                    tokenizer.count_text(&message.content) + PER_MESSAGE_OVERHEAD_TOKENS;
                for tool_call in &message.tool_calls {
                    tokens += tokenizer.count_text(&tool_call.arguments.to_string())
                        + PER_TOOL_CALL_OVERHEAD_TOKENS;
                }
                tokens
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_llm::{HeuristicTokenizer, ToolCall};
    use serde_json::json;

    #[test]
    fn should_force_final_crosses_at_threshold() {
        let guard = ContextGuard::new(1_000, 80);
        assert!(!guard.should_force_final(799));
        assert!(guard.should_force_final(800));
        assert!(guard.should_force_final(5_000));
    }

    #[test]
    fn zero_budget_never_forces_final() {
        let guard = ContextGuard::new(0, 80);
        assert!(!guard.should_force_final(usize::MAX / 200));
    }

    #[test]
    fn estimate_charges_message_and_tool_call_overheads() {
        let guard = ContextGuard::new(1_000, 80);
        let tokenizer = HeuristicTokenizer;
        let plain = Message::user("abcd"); // 1 token of text
        let with_call = Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("c1", "grep", json!({}))],
        );

        let estimate = guard.estimate_conversation_tokens(&[plain, with_call], &tokenizer);
        // 1 + 4 for the user message; 0 + 4 + ceil(2/4) + 8 for the call.
        assert_eq!(estimate, 5 + 4 + 1 + 8);
    }
}
