//! Glob matching for mutable-tag classification
//!
//! Patterns support `*` (any run of characters). Matching is
//! case-insensitive at the pattern level; the iteration bound keeps
//! pathological patterns from recursing unboundedly.

/// Maximum iterations allowed for pattern matching
const MAX_MATCH_ITERATIONS: usize = 10000;

#[derive(Debug, Clone)]
enum PatternPart {
    /// Literal text that must match exactly
    Literal(String),
    /// Any run of characters, including empty
    Wildcard,
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    parts: Vec<PatternPart>,
}

/// Matcher over a set of tag glob patterns.
#[derive(Debug, Clone)]
pub struct TagMatcher {
    patterns: Vec<CompiledPattern>,
}

impl TagMatcher {
    pub fn new(patterns: &[String]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .map(|p| CompiledPattern {
                    parts: compile_pattern(&p.to_lowercase()),
                })
                .collect(),
        }
    }

    /// Check whether any pattern matches the tag.
    pub fn matches(&self, tag: &str) -> bool {
        let tag = tag.to_lowercase();
        self.patterns.iter().any(|p| {
            let mut iterations = 0;
            match_recursive(&p.parts, &tag, 0, 0, &mut iterations)
        })
    }
}

fn compile_pattern(pattern: &str) -> Vec<PatternPart> {
    let mut parts = Vec::new();
    let mut current = String::new();

    for ch in pattern.chars() {
        if ch == '*' {
            if !current.is_empty() {
                parts.push(PatternPart::Literal(std::mem::take(&mut current)));
            }
            // Collapse consecutive wildcards
            if !matches!(parts.last(), Some(PatternPart::Wildcard)) {
                parts.push(PatternPart::Wildcard);
            }
        } else {
            current.push(ch);
        }
    }

    if !current.is_empty() {
        parts.push(PatternPart::Literal(current));
    }

    parts
}

fn match_recursive(
    parts: &[PatternPart],
    text: &str,
    part_idx: usize,
    pos: usize,
    iterations: &mut usize,
) -> bool {
    *iterations += 1;
    if *iterations > MAX_MATCH_ITERATIONS {
        tracing::warn!(
            "Pattern matching exceeded {} iterations, aborting",
            MAX_MATCH_ITERATIONS
        );
        return false;
    }

    if part_idx >= parts.len() {
        return pos >= text.len();
    }

    let remaining = &text[pos..];

    match &parts[part_idx] {
        PatternPart::Literal(lit) => {
            if remaining.starts_with(lit.as_str()) {
                match_recursive(parts, text, part_idx + 1, pos + lit.len(), iterations)
            } else {
                false
            }
        }
        PatternPart::Wildcard => {
            if part_idx + 1 == parts.len() {
                return true;
            }
            for i in 0..=remaining.len() {
                if match_recursive(parts, text, part_idx + 1, pos + i, iterations) {
                    return true;
                }
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> TagMatcher {
        let owned: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        TagMatcher::new(&owned)
    }

    #[test]
    fn default_patterns_classify_mutable_tags() {
        let m = matcher(&["latest", "*nightly*"]);
        assert!(m.matches("latest"));
        assert!(m.matches("nightly"));
        assert!(m.matches("v2-nightly"));
        assert!(m.matches("nightly-amd64"));
        assert!(!m.matches("v1.0.0"));
        assert!(!m.matches("stable"));
        assert!(!m.matches("latest-v1"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let m = matcher(&["LATEST", "*Nightly*"]);
        assert!(m.matches("latest"));
        assert!(m.matches("Latest"));
        assert!(m.matches("NIGHTLY-build"));
    }

    #[test]
    fn trailing_wildcard_matches_any_suffix() {
        let m = matcher(&["dev-*"]);
        assert!(m.matches("dev-"));
        assert!(m.matches("dev-123"));
        assert!(!m.matches("prod-dev-1"));
    }

    #[test]
    fn consecutive_wildcards_collapse() {
        let m = matcher(&["**nightly**"]);
        assert!(m.matches("nightly"));
        assert!(m.matches("xnightlyx"));
    }

    #[test]
    fn empty_pattern_set_matches_nothing() {
        let m = matcher(&[]);
        assert!(!m.matches("latest"));
    }
}
