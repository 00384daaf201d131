//! Token estimation for prompts and files.
//!
//! Uses a precise tokenizer when one is compiled in, otherwise a
//! character-count heuristic that rounds up so quota consumption is
//! never underestimated.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::tokenizer::{precise_tokenizer, HeuristicTokenizer, Tokenizer, DEFAULT_CHARS_PER_TOKEN};

/// Tokens added per request for prompt framing and file headers.
pub const REQUEST_OVERHEAD_TOKENS: u64 = 50;

/// Files larger than this are counted with the streaming heuristic even when
/// a precise tokenizer is available.
pub const DEFAULT_MAX_PRECISE_FILE_BYTES: u64 = 1024 * 1024;

const READ_CHUNK_BYTES: usize = 64 * 1024;

const TEXT_EXTENSIONS: &[&str] = &[
    "bash", "c", "cc", "cfg", "conf", "cpp", "cs", "css", "csv", "dart", "el", "erl", "ex", "exs",
    "go", "gradle", "graphql", "h", "hpp", "hs", "html", "ini", "java", "js", "json", "jsonl",
    "jsx", "kt", "kts", "lua", "m", "md", "mdx", "mjs", "ml", "php", "pl", "proto", "ps1", "py",
    "r", "rb", "rs", "rst", "sass", "scala", "scss", "sh", "sql", "svelte", "swift", "tex", "tf",
    "toml", "ts", "tsx", "txt", "vue", "xml", "yaml", "yml", "zig", "zsh",
];

const TEXT_FILE_NAMES: &[&str] = &[
    "Dockerfile", "Makefile", "Justfile", "LICENSE", "README", "CHANGELOG", "Gemfile", "Rakefile",
];

/// A file left out of an estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of scanning a set of paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEstimate {
    pub tokens: u64,
    pub files_counted: usize,
    pub skipped: Vec<SkippedFile>,
}

/// Breakdown of a request estimate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEstimate {
    pub prompt_tokens: u64,
    pub file_tokens: u64,
    pub overhead_tokens: u64,
    pub files_counted: usize,
    pub skipped: Vec<SkippedFile>,
}

impl RequestEstimate {
    pub fn total(&self) -> u64 {
        self.prompt_tokens
            .saturating_add(self.file_tokens)
            .saturating_add(self.overhead_tokens)
    }
}

/// Token estimator for text and files.
#[derive(Clone)]
pub struct TokenEstimator {
    precise: Option<Arc<dyn Tokenizer>>,
    heuristic: HeuristicTokenizer,
    max_precise_file_bytes: u64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenEstimator")
            .field("method", &self.method())
            .field("chars_per_token", &self.heuristic.chars_per_token())
            .finish()
    }
}

impl TokenEstimator {
    /// Create an estimator using the compiled-in precise tokenizer when present.
    pub fn new(chars_per_token: f64) -> Self {
        Self {
            precise: precise_tokenizer(),
            heuristic: HeuristicTokenizer::new(chars_per_token),
            max_precise_file_bytes: DEFAULT_MAX_PRECISE_FILE_BYTES,
        }
    }

    /// Create an estimator that only uses the character heuristic.
    pub fn heuristic(chars_per_token: f64) -> Self {
        Self {
            precise: None,
            heuristic: HeuristicTokenizer::new(chars_per_token),
            max_precise_file_bytes: DEFAULT_MAX_PRECISE_FILE_BYTES,
        }
    }

    /// Use `tokenizer` for exact counts.
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.precise = Some(tokenizer);
        self
    }

    pub fn with_max_precise_file_bytes(mut self, bytes: u64) -> Self {
        self.max_precise_file_bytes = bytes;
        self
    }

    /// Name of the tokenizer used for text estimates.
    pub fn method(&self) -> &str {
        match &self.precise {
            Some(tokenizer) => tokenizer.name(),
            None => self.heuristic.name(),
        }
    }

    /// Estimate tokens from text.
    pub fn estimate(&self, text: &str) -> u64 {
        match &self.precise {
            Some(tokenizer) => tokenizer.count_tokens(text),
            None => self.heuristic.count_tokens(text),
        }
    }

    /// Estimate a prompt plus its attached files.
    pub fn estimate_request(&self, prompt: &str, files: &[String]) -> RequestEstimate {
        let files = self.scan_files(files);
        RequestEstimate {
            prompt_tokens: self.estimate(prompt),
            file_tokens: files.tokens,
            overhead_tokens: REQUEST_OVERHEAD_TOKENS,
            files_counted: files.files_counted,
            skipped: files.skipped,
        }
    }

    /// Total estimated tokens for the given paths and globs.
    pub fn estimate_files(&self, paths: &[String]) -> u64 {
        self.scan_files(paths).tokens
    }

    /// Expand paths and globs, then sum per-file estimates.
    ///
    /// Binary, unreadable and missing files are skipped and listed in the result.
    pub fn scan_files(&self, paths: &[String]) -> FileEstimate {
        let mut estimate = FileEstimate::default();
        let (files, skipped) = expand_inputs(paths);
        estimate.skipped = skipped;

        for path in files {
            match self.count_file(&path) {
                Ok(tokens) => {
                    estimate.tokens = estimate.tokens.saturating_add(tokens);
                    estimate.files_counted += 1;
                }
                Err(reason) => {
                    warn!(path = %path.display(), %reason, "skipping file in token estimate");
                    estimate.skipped.push(SkippedFile { path, reason });
                }
            }
        }

        debug!(
            files = estimate.files_counted,
            skipped = estimate.skipped.len(),
            tokens = estimate.tokens,
            "file token estimate"
        );
        estimate
    }

    fn count_file(&self, path: &Path) -> Result<u64, String> {
        if let Some(tokenizer) = &self.precise {
            let size = fs::metadata(path).map_err(|e| e.to_string())?.len();
            if size <= self.max_precise_file_bytes {
                let text = match fs::read_to_string(path) {
                    Ok(text) => text,
                    Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                        return Err("not valid UTF-8".to_string())
                    }
                    Err(err) => return Err(err.to_string()),
                };
                if text.contains('\0') {
                    return Err("binary content".to_string());
                }
                return Ok(tokenizer.count_tokens(&text));
            }
        }
        let chars = count_chars(path)?;
        Ok(self.heuristic.tokens_for_chars(chars))
    }
}

/// Count UTF-8 characters without holding more than one chunk in memory.
fn count_chars(path: &Path) -> Result<u64, String> {
    let mut file = fs::File::open(path).map_err(|e| e.to_string())?;
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut chars: u64 = 0;
    let mut first = true;

    loop {
        let read = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.to_string()),
        };
        let chunk = &buf[..read];
        if first && chunk.contains(&0) {
            return Err("binary content".to_string());
        }
        first = false;
        // Continuation bytes (0b10xxxxxx) don't start a character.
        chars += chunk.iter().filter(|b| (**b & 0xC0) != 0x80).count() as u64;
    }
    Ok(chars)
}

fn is_glob(input: &str) -> bool {
    input.contains(['*', '?', '['])
}

fn is_text_like(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        let ext = ext.to_ascii_lowercase();
        return TEXT_EXTENSIONS.contains(&ext.as_str());
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |name| TEXT_FILE_NAMES.contains(&name))
}

/// Resolve inputs to a de-duplicated, ordered list of text files.
fn expand_inputs(inputs: &[String]) -> (Vec<PathBuf>, Vec<SkippedFile>) {
    let mut files = BTreeSet::new();
    let mut skipped = Vec::new();

    for input in inputs {
        if is_glob(input) {
            let matches = match glob::glob(input) {
                Ok(matches) => matches,
                Err(err) => {
                    skipped.push(SkippedFile {
                        path: PathBuf::from(input),
                        reason: format!("invalid pattern: {}", err),
                    });
                    continue;
                }
            };
            let mut matched = false;
            for entry in matches {
                match entry {
                    Ok(path) => {
                        matched = true;
                        add_path(&path, &mut files, &mut skipped);
                    }
                    Err(err) => skipped.push(SkippedFile {
                        path: err.path().to_path_buf(),
                        reason: err.error().to_string(),
                    }),
                }
            }
            if !matched {
                skipped.push(SkippedFile {
                    path: PathBuf::from(input),
                    reason: "no files matched".to_string(),
                });
            }
        } else {
            let path = PathBuf::from(input);
            if path.exists() {
                add_path(&path, &mut files, &mut skipped);
            } else {
                skipped.push(SkippedFile {
                    path,
                    reason: "not found".to_string(),
                });
            }
        }
    }

    (files.into_iter().collect(), skipped)
}

fn add_path(path: &Path, files: &mut BTreeSet<PathBuf>, skipped: &mut Vec<SkippedFile>) {
    if path.is_dir() {
        // Directory walks honor .gitignore and skip hidden files; non-text files are dropped quietly.
        for entry in ignore::WalkBuilder::new(path).build().flatten() {
            let is_file = entry.file_type().map_or(false, |t| t.is_file());
            if is_file && is_text_like(entry.path()) {
                files.insert(entry.into_path());
            }
        }
    } else if is_text_like(path) {
        files.insert(path.to_path_buf());
    } else {
        skipped.push(SkippedFile {
            path: path.to_path_buf(),
            reason: "not a text file".to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Counts whitespace-separated words, standing in for a real BPE.
    struct WordTokenizer;

    impl Tokenizer for WordTokenizer {
        fn count_tokens(&self, text: &str) -> u64 {
            text.split_whitespace().count() as u64
        }

        fn name(&self) -> &str {
            "words"
        }
    }

    #[test]
    fn test_fallback_4000_chars_is_1000_tokens() {
        let estimator = TokenEstimator::heuristic(4.0);
        let text = "a".repeat(4000);
        assert_eq!(estimator.estimate(&text), 1000);
        assert_eq!(estimator.method(), "heuristic");
    }

    #[test]
    fn test_overridable_ratio() {
        let estimator = TokenEstimator::heuristic(2.0);
        assert_eq!(estimator.estimate(&"a".repeat(4000)), 2000);
    }

    #[test]
    fn test_empty_string() {
        let estimator = TokenEstimator::heuristic(4.0);
        assert_eq!(estimator.estimate(""), 0);
    }

    #[test]
    fn test_precise_tokenizer_takes_precedence() {
        let estimator = TokenEstimator::heuristic(4.0).with_tokenizer(Arc::new(WordTokenizer));
        assert_eq!(estimator.estimate("three short words"), 3);
        assert_eq!(estimator.method(), "words");
    }

    #[test]
    fn test_estimate_files_sums_per_file_estimates() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("a.rs"), "x".repeat(10)).expect("write");
        fs::write(dir.path().join("b.md"), "y".repeat(7)).expect("write");

        let estimator = TokenEstimator::heuristic(4.0);
        let paths = vec![
            dir.path().join("a.rs").to_string_lossy().into_owned(),
            dir.path().join("b.md").to_string_lossy().into_owned(),
        ];

        // ceil(10/4) + ceil(7/4), not ceil(17/4).
        assert_eq!(estimator.estimate_files(&paths), 5);
    }

    #[test]
    fn test_directory_walk_filters_to_text() {
        let dir = TempDir::new().expect("temp dir");
        fs::create_dir_all(dir.path().join("src")).expect("mkdir");
        fs::write(dir.path().join("src/lib.rs"), "abcd").expect("write");
        fs::write(dir.path().join("src/logo.png"), [0x89, b'P', b'N', b'G']).expect("write");

        let estimator = TokenEstimator::heuristic(4.0);
        let result = estimator.scan_files(&[dir.path().to_string_lossy().into_owned()]);

        assert_eq!(result.files_counted, 1);
        assert_eq!(result.tokens, 1);
        assert!(result.skipped.is_empty());
    }

    #[test]
    fn test_glob_expansion() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("one.py"), "abcd").expect("write");
        fs::write(dir.path().join("two.py"), "abcdabcd").expect("write");
        fs::write(dir.path().join("three.txt"), "ignored by pattern").expect("write");

        let estimator = TokenEstimator::heuristic(4.0);
        let pattern = format!("{}/*.py", dir.path().display());
        let result = estimator.scan_files(&[pattern]);

        assert_eq!(result.files_counted, 2);
        assert_eq!(result.tokens, 3);
    }

    #[test]
    fn test_binary_and_missing_files_are_skipped_not_fatal() {
        let dir = TempDir::new().expect("temp dir");
        let binary = dir.path().join("blob.txt");
        fs::write(&binary, [b'a', 0, b'b']).expect("write");
        let text = dir.path().join("ok.txt");
        fs::write(&text, "abcd").expect("write");

        let estimator = TokenEstimator::heuristic(4.0);
        let result = estimator.scan_files(&[
            binary.to_string_lossy().into_owned(),
            text.to_string_lossy().into_owned(),
            dir.path().join("missing.rs").to_string_lossy().into_owned(),
        ]);

        assert_eq!(result.files_counted, 1);
        assert_eq!(result.tokens, 1);
        assert_eq!(result.skipped.len(), 2);
        assert!(result.skipped.iter().any(|s| s.reason == "binary content"));
        assert!(result.skipped.iter().any(|s| s.reason == "not found"));
    }

    #[test]
    fn test_multibyte_chars_counted_once() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("unicode.md");
        fs::write(&path, "ééééé").expect("write");

        let estimator = TokenEstimator::heuristic(1.0);
        assert_eq!(estimator.estimate_files(&[path.to_string_lossy().into_owned()]), 5);
    }

    #[test]
    fn test_duplicate_inputs_counted_once() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("a.rs");
        fs::write(&path, "abcd").expect("write");
        let input = path.to_string_lossy().into_owned();

        let estimator = TokenEstimator::heuristic(4.0);
        assert_eq!(estimator.estimate_files(&[input.clone(), input]), 1);
    }

    #[test]
    fn test_request_estimate_includes_overhead() {
        let estimator = TokenEstimator::heuristic(4.0);
        let estimate = estimator.estimate_request(&"p".repeat(40), &[]);

        assert_eq!(estimate.prompt_tokens, 10);
        assert_eq!(estimate.file_tokens, 0);
        assert_eq!(estimate.total(), 10 + REQUEST_OVERHEAD_TOKENS);
    }
}
