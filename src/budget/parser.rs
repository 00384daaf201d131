//! Token usage parsing from provider output.
//!
//! Providers that report their own token counts do so in a handful of shapes:
//!
//! - **Gemini API**: `{"usageMetadata": {"promptTokenCount": N, "candidatesTokenCount": N, "totalTokenCount": N}}`
//! - **Gemini CLI** (`--output-format json`): `{"stats": {"models": {"<model>": {"tokens": {"prompt": N, "candidates": N, "total": N}}}}}`
//! - **Anthropic**: `{"usage": {"input_tokens": N, "output_tokens": N}}`
//! - **OpenAI-compatible** (Qwen, Codex): `{"usage": {"prompt_tokens": N, "completion_tokens": N}}`
//!
//! When none is found the caller charges its own estimate.

use serde::Deserialize;
use serde_json::Value;

/// Parsed token usage from provider output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTokenUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// Total tokens, when reported separately.
    pub total_tokens: Option<u64>,
    /// Format the usage was read from (e.g. "gemini", "openai").
    pub source: String,
}

impl ParsedTokenUsage {
    pub fn new(input: u64, output: u64, total: Option<u64>, source: impl Into<String>) -> Self {
        Self {
            input_tokens: Some(input),
            output_tokens: Some(output),
            total_tokens: total,
            source: source.into(),
        }
    }

    /// Get total tokens.
    pub fn total(&self) -> u64 {
        self.total_tokens
            .or_else(|| match (self.input_tokens, self.output_tokens) {
                (Some(i), Some(o)) => Some(i.saturating_add(o)),
                (Some(i), None) => Some(i),
                (None, Some(o)) => Some(o),
                (None, None) => None,
            })
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GeminiCliTokens {
    #[serde(default)]
    prompt: u64,
    #[serde(default)]
    candidates: u64,
    #[serde(default)]
    total: Option<u64>,
}

/// Extracts actual token usage from provider stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsageParser;

impl TokenUsageParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse token usage from provider output. Returns None if nothing recognizable is present.
    pub fn parse(&self, output: &str) -> Option<ParsedTokenUsage> {
        // Whole output first: pretty-printed JSON spans many lines.
        let trimmed = output.trim();
        if trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                if let Some(usage) = self.parse_document(&value) {
                    return Some(usage);
                }
            }
        }

        // JSON lines, last reported usage wins.
        let mut found = None;
        for line in output.lines() {
            let line = line.trim();
            if !line.starts_with('{') {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(line) {
                if let Some(usage) = self.parse_document(&value) {
                    found = Some(usage);
                }
            }
        }
        if found.is_some() {
            return found;
        }

        self.try_extract_embedded(output, "\"usageMetadata\"")
            .or_else(|| self.try_extract_embedded(output, "\"usage\""))
    }

    /// Total tokens reported in `output`, if any.
    pub fn actual_tokens(&self, output: &str) -> Option<u64> {
        self.parse(output).map(|usage| usage.total())
    }

    fn parse_document(&self, value: &Value) -> Option<ParsedTokenUsage> {
        let map = value.as_object()?;

        if let Some(meta) = map.get("usageMetadata") {
            if let Some(usage) = self.parse_gemini_metadata(meta) {
                return Some(usage);
            }
        }
        if let Some(stats) = map.get("stats") {
            if let Some(usage) = self.parse_gemini_cli_stats(stats) {
                return Some(usage);
            }
        }
        if let Some(usage) = map.get("usage") {
            if let Some(parsed) = self.parse_usage_value(usage) {
                return Some(parsed);
            }
        }
        // Streaming events nest the usage one level down (e.g. {"type":"result","message":{...}}).
        map.values()
            .filter(|v| v.is_object())
            .find_map(|v| self.parse_document(v))
    }

    fn parse_gemini_metadata(&self, value: &Value) -> Option<ParsedTokenUsage> {
        let meta = GeminiUsageMetadata::deserialize(value).ok()?;
        if meta.prompt_token_count == 0
            && meta.candidates_token_count == 0
            && meta.total_token_count.is_none()
        {
            return None;
        }
        Some(ParsedTokenUsage::new(
            meta.prompt_token_count,
            meta.candidates_token_count,
            meta.total_token_count,
            "gemini",
        ))
    }

    /// Sum token stats across every model the Gemini CLI used for the turn.
    fn parse_gemini_cli_stats(&self, stats: &Value) -> Option<ParsedTokenUsage> {
        let models = stats.get("models")?.as_object()?;
        let mut input = 0u64;
        let mut output = 0u64;
        let mut total = 0u64;
        let mut seen = false;

        for model in models.values() {
            let Some(tokens) = model.get("tokens") else {
                continue;
            };
            let Ok(tokens) = GeminiCliTokens::deserialize(tokens) else {
                continue;
            };
            seen = true;
            input = input.saturating_add(tokens.prompt);
            output = output.saturating_add(tokens.candidates);
            total = total.saturating_add(
                tokens
                    .total
                    .unwrap_or_else(|| tokens.prompt.saturating_add(tokens.candidates)),
            );
        }

        seen.then(|| ParsedTokenUsage::new(input, output, Some(total), "gemini-cli"))
    }

    fn parse_usage_value(&self, value: &Value) -> Option<ParsedTokenUsage> {
        if let Ok(usage) = AnthropicUsage::deserialize(value) {
            return Some(ParsedTokenUsage::new(
                usage.input_tokens,
                usage.output_tokens,
                None,
                "anthropic",
            ));
        }

        if let Ok(usage) = OpenAIUsage::deserialize(value) {
            return Some(ParsedTokenUsage::new(
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens,
                "openai",
            ));
        }

        None
    }

    /// Find `key: { ... }` inside arbitrary text and parse the object.
    fn try_extract_embedded(&self, output: &str, key: &str) -> Option<ParsedTokenUsage> {
        let idx = output.find(key)?;
        let after_key = &output[idx + key.len()..];
        let colon_idx = after_key.find(':')?;
        let after_colon = after_key[colon_idx + 1..].trim_start();
        if !after_colon.starts_with('{') {
            return None;
        }
        let end_idx = find_matching_brace(after_colon)?;
        let value = serde_json::from_str::<Value>(&after_colon[..=end_idx]).ok()?;

        if key == "\"usageMetadata\"" {
            self.parse_gemini_metadata(&value)
        } else {
            self.parse_usage_value(&value)
        }
    }
}

fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_anthropic_usage() {
        let output = r#"{"usage": {"input_tokens": 1500, "output_tokens": 500}}"#;
        let usage = TokenUsageParser::new().parse(output).unwrap();

        assert_eq!(usage.input_tokens, Some(1500));
        assert_eq!(usage.output_tokens, Some(500));
        assert_eq!(usage.total(), 2000);
        assert_eq!(usage.source, "anthropic");
    }

    #[test]
    fn test_parse_openai_usage() {
        let output = r#"{"usage": {"prompt_tokens": 1000, "completion_tokens": 800, "total_tokens": 1800}}"#;
        let usage = TokenUsageParser::new().parse(output).unwrap();

        assert_eq!(usage.total(), 1800);
        assert_eq!(usage.source, "openai");
    }

    #[test]
    fn test_parse_gemini_usage_metadata() {
        let output = r#"{"candidates": [], "usageMetadata": {"promptTokenCount": 1200, "candidatesTokenCount": 300, "totalTokenCount": 1510}}"#;
        let usage = TokenUsageParser::new().parse(output).unwrap();

        assert_eq!(usage.input_tokens, Some(1200));
        assert_eq!(usage.output_tokens, Some(300));
        assert_eq!(usage.total(), 1510);
        assert_eq!(usage.source, "gemini");
    }

    #[test]
    fn test_parse_gemini_cli_stats_across_models() {
        let output = r#"{
  "response": "done",
  "stats": {
    "models": {
      "gemini-2.5-pro": {"tokens": {"prompt": 900, "candidates": 100, "total": 1000}},
      "gemini-2.5-flash": {"tokens": {"prompt": 40, "candidates": 10}}
    }
  }
}"#;
        let usage = TokenUsageParser::new().parse(output).unwrap();

        assert_eq!(usage.source, "gemini-cli");
        assert_eq!(usage.input_tokens, Some(940));
        assert_eq!(usage.total(), 1050);
    }

    #[test]
    fn test_parse_json_lines_last_usage_wins() {
        let output = r#"
starting
{"type": "progress", "usage": {"input_tokens": 10, "output_tokens": 1}}
{"type": "result", "usage": {"input_tokens": 100, "output_tokens": 50}}
done
"#;
        let usage = TokenUsageParser::new().parse(output).unwrap();
        assert_eq!(usage.total(), 150);
    }

    #[test]
    fn test_parse_nested_usage() {
        let output = r#"{"type":"result","message":{"id":"msg_1","usage":{"input_tokens":42,"output_tokens":15}}}"#;
        let usage = TokenUsageParser::new().parse(output).unwrap();
        assert_eq!(usage.total(), 57);
    }

    #[test]
    fn test_parse_embedded_in_text() {
        let output = r#"Response text. Stats: "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3} trailing"#;
        assert_eq!(TokenUsageParser::new().actual_tokens(output), Some(10));
    }

    #[test]
    fn test_parse_no_usage() {
        let parser = TokenUsageParser::new();
        assert!(parser.parse("Just some plain text output without any JSON").is_none());
        assert!(parser.parse(r#"{"response": "no stats here"}"#).is_none());
        assert_eq!(parser.actual_tokens(""), None);
    }

    #[test]
    fn test_unbalanced_braces_do_not_panic() {
        let output = r#""usage": {"input_tokens": 1"#;
        assert!(TokenUsageParser::new().parse(output).is_none());
    }
}
