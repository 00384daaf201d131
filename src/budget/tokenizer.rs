//! Pluggable token counting.

use std::sync::Arc;

/// Default characters per token for the heuristic fallback.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Strategy for turning text into a token count.
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> u64;
    fn name(&self) -> &str;
}

/// `ceil(chars / chars_per_token)`. Never undercounts a partial token.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicTokenizer {
    chars_per_token: f64,
}

impl HeuristicTokenizer {
    /// Create a heuristic tokenizer. Non-positive or non-finite ratios fall back to the default.
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    /// Tokens for a known character count.
    pub fn tokens_for_chars(&self, chars: u64) -> u64 {
        (chars as f64 / self.chars_per_token).ceil() as u64
    }
}

impl Default for HeuristicTokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl Tokenizer for HeuristicTokenizer {
    fn count_tokens(&self, text: &str) -> u64 {
        self.tokens_for_chars(text.chars().count() as u64)
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

/// cl100k BPE token counts (requires the `tiktoken` feature).
#[cfg(feature = "tiktoken")]
pub struct TiktokenTokenizer {
    bpe: tiktoken_rs::CoreBPE,
}

#[cfg(feature = "tiktoken")]
impl TiktokenTokenizer {
    pub fn new() -> Option<Self> {
        match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(Self { bpe }),
            Err(err) => {
                tracing::warn!(error = %err, "tiktoken unavailable; using heuristic estimates");
                None
            }
        }
    }
}

#[cfg(feature = "tiktoken")]
impl Tokenizer for TiktokenTokenizer {
    fn count_tokens(&self, text: &str) -> u64 {
        self.bpe.encode_with_special_tokens(text).len() as u64
    }

    fn name(&self) -> &str {
        "tiktoken"
    }
}

/// The precise tokenizer compiled into this build, if any.
pub fn precise_tokenizer() -> Option<Arc<dyn Tokenizer>> {
    #[cfg(feature = "tiktoken")]
    {
        if let Some(tokenizer) = TiktokenTokenizer::new() {
            return Some(Arc::new(tokenizer));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristic_rounds_up() {
        let tokenizer = HeuristicTokenizer::new(4.0);
        assert_eq!(tokenizer.count_tokens(""), 0);
        assert_eq!(tokenizer.count_tokens("abc"), 1);
        assert_eq!(tokenizer.count_tokens("abcd"), 1);
        assert_eq!(tokenizer.count_tokens("abcde"), 2);
    }

    #[test]
    fn test_heuristic_counts_chars_not_bytes() {
        let tokenizer = HeuristicTokenizer::new(1.0);
        assert_eq!(tokenizer.count_tokens("héllo"), 5);
    }

    #[test]
    fn test_invalid_ratio_uses_default() {
        assert_eq!(HeuristicTokenizer::new(0.0).chars_per_token(), DEFAULT_CHARS_PER_TOKEN);
        assert_eq!(HeuristicTokenizer::new(f64::NAN).chars_per_token(), DEFAULT_CHARS_PER_TOKEN);
    }
}
