//! Provider ranking for automatic selection.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::registry::ServiceConfig;

/// Routing hint attached to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Largest context window first.
    LargeContext,
    /// Smallest context window first.
    Fast,
    /// Smallest context window first.
    Cheap,
    /// Configured priority only.
    Any,
}

impl Requirement {
    /// Parse a tag; unknown or missing tags mean [`Requirement::Any`].
    pub fn parse(tag: Option<&str>) -> Self {
        let Some(tag) = tag else {
            return Requirement::Any;
        };
        match tag.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "large_context" | "large" => Requirement::LargeContext,
            "fast" => Requirement::Fast,
            "cheap" => Requirement::Cheap,
            _ => Requirement::Any,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Requirement::LargeContext => "large_context",
            Requirement::Fast => "fast",
            Requirement::Cheap => "cheap",
            Requirement::Any => "any",
        }
    }
}

/// Order providers for a requirement: requirement rank, then priority, then id.
pub fn rank_providers(
    mut services: Vec<Arc<ServiceConfig>>,
    requirement: Requirement,
) -> Vec<Arc<ServiceConfig>> {
    services.sort_by(|a, b| {
        let by_requirement = match requirement {
            Requirement::LargeContext => b.context_window_tokens.cmp(&a.context_window_tokens),
            Requirement::Fast | Requirement::Cheap => {
                a.context_window_tokens.cmp(&b.context_window_tokens)
            }
            Requirement::Any => Ordering::Equal,
        };
        by_requirement
            .then(a.priority.cmp(&b.priority))
            .then_with(|| a.id.cmp(&b.id))
    });
    services
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: &str, context: u64, priority: u32) -> Arc<ServiceConfig> {
        Arc::new(ServiceConfig::new(id, vec!["echo".to_string()], context).with_priority(priority))
    }

    fn ids(services: &[Arc<ServiceConfig>]) -> Vec<&str> {
        services.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_parse() {
        assert_eq!(Requirement::parse(Some("large-context")), Requirement::LargeContext);
        assert_eq!(Requirement::parse(Some("FAST")), Requirement::Fast);
        assert_eq!(Requirement::parse(Some("whatever")), Requirement::Any);
        assert_eq!(Requirement::parse(None), Requirement::Any);
    }

    #[test]
    fn test_large_context_prefers_biggest_window() {
        let ranked = rank_providers(
            vec![service("qwen", 32_000, 20), service("gemini", 1_000_000, 10), service("mid", 128_000, 5)],
            Requirement::LargeContext,
        );
        assert_eq!(ids(&ranked), vec!["gemini", "mid", "qwen"]);
    }

    #[test]
    fn test_fast_prefers_smallest_window() {
        let ranked = rank_providers(
            vec![service("gemini", 1_000_000, 10), service("qwen", 32_000, 20)],
            Requirement::Fast,
        );
        assert_eq!(ids(&ranked), vec!["qwen", "gemini"]);
    }

    #[test]
    fn test_ties_break_by_priority_then_id() {
        let ranked = rank_providers(
            vec![service("b", 1_000, 1), service("c", 1_000, 0), service("a", 1_000, 1)],
            Requirement::Any,
        );
        assert_eq!(ids(&ranked), vec!["c", "a", "b"]);
    }
}
