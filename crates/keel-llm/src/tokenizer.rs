/// Token counting contract injected into the context guard.
pub trait Tokenizer: Send + Sync {
    fn count_text(&self, text: &str) -> usize;
}

/// Byte-length heuristic, roughly four bytes per token. Good enough for
/// budget enforcement; swap in a real tokenizer per model when accuracy
/// matters.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn count_text(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }
}
