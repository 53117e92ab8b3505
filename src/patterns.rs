//! Wildcard matching for exclude lists and mask rules.
//!
//! A pattern is literal text where `*` stands for any run of characters.
//! Matching is anchored at both ends.

use regex::Regex;
use tracing::warn;

/// Compile a single wildcard pattern into an anchored regex.
pub fn wildcard_regex(pattern: &str, case_insensitive: bool) -> Option<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    let flags = if case_insensitive { "(?i)" } else { "" };

    match Regex::new(&format!("{}^{}$", flags, body)) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("Skipping unusable pattern '{}': {}", pattern, e);
            None
        }
    }
}

/// A precompiled list of exact entries and wildcard patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    exact: Vec<String>,
    wildcards: Vec<Regex>,
    case_insensitive: bool,
}

impl PatternSet {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::build(patterns, false)
    }

    pub fn case_insensitive<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::build(patterns, true)
    }

    fn build<I, S>(patterns: I, case_insensitive: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = PatternSet { case_insensitive, ..PatternSet::default() };
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if pattern.contains('*') {
                if let Some(re) = wildcard_regex(pattern, case_insensitive) {
                    set.wildcards.push(re);
                }
            } else if case_insensitive {
                set.exact.push(pattern.to_lowercase());
            } else {
                set.exact.push(pattern.to_string());
            }
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcards.is_empty()
    }

    pub fn matches(&self, subject: &str) -> bool {
        let exact = if self.case_insensitive {
            let lowered = subject.to_lowercase();
            self.exact.iter().any(|e| *e == lowered)
        } else {
            self.exact.iter().any(|e| e == subject)
        };
        exact || self.wildcards.iter().any(|re| re.is_match(subject))
    }

    /// Match a request path; the leading slash is ignored so `health`
    /// excludes `/health`.
    pub fn matches_path(&self, path: &str) -> bool {
        let trimmed = path.trim_start_matches('/');
        let subject = if trimmed.is_empty() { "/" } else { trimmed };
        self.matches(subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_is_anchored() {
        let set = PatternSet::new(["telescope*"]);
        assert!(set.matches("telescope"));
        assert!(set.matches("telescope/requests"));
        assert!(!set.matches("api/telescope"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let set = PatternSet::new(["favicon.ico"]);
        assert!(set.matches("favicon.ico"));
        assert!(!set.matches("faviconxico"));

        let set = PatternSet::new(["api/v1.?/*"]);
        assert!(set.matches("api/v1.?/users"));
        assert!(!set.matches("api/v12/users"));
    }

    #[test]
    fn test_case_insensitive_set() {
        let set = PatternSet::case_insensitive(["LOCALHOST", "*.Internal"]);
        assert!(set.matches("localhost"));
        assert!(set.matches("billing.internal"));
        assert!(!set.matches("example.com"));
    }

    #[test]
    fn test_matches_path_ignores_leading_slash() {
        let set = PatternSet::new(["health", "_debugbar*"]);
        assert!(set.matches_path("/health"));
        assert!(set.matches_path("/_debugbar/assets"));
        assert!(!set.matches_path("/healthz"));
    }
}
