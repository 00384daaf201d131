//! Token estimation for delegated work.
//!
//! # Overview
//!
//! - **Tokenizer**: strategy trait; the heuristic is always available,
//!   a BPE tokenizer is compiled in with the `tiktoken` feature
//! - **TokenEstimator**: estimates prompts and file sets (paths, directories, globs)
//! - **TokenUsageParser**: reads the actual usage a provider reports in its output
//!
//! # Example
//!
//! ```ignore
//! use conjure::budget::TokenEstimator;
//!
//! let estimator = TokenEstimator::default();
//! let request = estimator.estimate_request("Summarize these files", &["src/**/*.rs".to_string()]);
//! println!("~{} tokens ({} files)", request.total(), request.files_counted);
//! ```

mod estimator;
mod parser;
mod tokenizer;

pub use estimator::{
    FileEstimate, RequestEstimate, SkippedFile, TokenEstimator, DEFAULT_MAX_PRECISE_FILE_BYTES,
    REQUEST_OVERHEAD_TOKENS,
};
pub use parser::{ParsedTokenUsage, TokenUsageParser};
pub use tokenizer::{precise_tokenizer, HeuristicTokenizer, Tokenizer, DEFAULT_CHARS_PER_TOKEN};
#[cfg(feature = "tiktoken")]
pub use tokenizer::TiktokenTokenizer;
