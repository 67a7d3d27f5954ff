//! Path exclusion matching for observability middleware.
//!
//! Patterns are absolute paths compared segment by segment. A segment
//! consisting of a lone `*` matches exactly one request segment; a trailing
//! `*` segment matches any remainder, including none:
//!
//! | pattern | matches | does not match |
//! |---|---|---|
//! | `/metrics` | `/metrics`, `/metrics/` | `/metrics/x` |
//! | `/internal/*` | `/internal`, `/internal/health` | `/internals` |
//! | `/api/*/users` | `/api/v1/users` | `/api/users` |
//!
//! Both sides are canonicalized first (repeated separators collapsed, `.`
//! and `..` resolved, trailing separator dropped). Comparison is
//! case-sensitive and percent-encoding is not decoded.

use std::collections::HashSet;

use crate::error::{Error, Result};

const WILDCARD: &str = "*";

/// Reports whether `path` matches any of `patterns`.
///
/// An empty pattern list never matches. The first matching pattern wins.
pub fn matches<P: AsRef<str>>(path: &str, patterns: &[P]) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let request = segments(path);
    patterns
        .iter()
        .any(|p| match_segments(&request, &segments(p.as_ref())))
}

/// A validated, pre-canonicalized list of exclusion patterns.
///
/// Built once at router construction and only read afterwards, so it is
/// shared between connection tasks without locking.
#[derive(Clone, Debug, Default)]
pub struct ExclusionList {
    raw: Vec<String>,
    compiled: Vec<Vec<String>>,
}

impl ExclusionList {
    /// Validates `patterns`: each must start with `/` and appear only once.
    /// An empty list is valid and excludes nothing.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut raw = Vec::new();
        for pattern in patterns {
            let pattern = pattern.into();
            if !pattern.starts_with('/') {
                return Err(Error::PathValidation(format!("path must start with /: {pattern}")));
            }
            if !seen.insert(pattern.clone()) {
                return Err(Error::PathValidation(format!("duplicate path: {pattern}")));
            }
            raw.push(pattern);
        }
        let compiled = raw
            .iter()
            .map(|p| segments(p).into_iter().map(str::to_owned).collect())
            .collect();
        Ok(Self { raw, compiled })
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.compiled.is_empty() {
            return false;
        }
        let request = segments(path);
        self.compiled.iter().any(|p| {
            let pattern: Vec<&str> = p.iter().map(String::as_str).collect();
            match_segments(&request, &pattern)
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// Canonical segments of `path`. The root path yields no segments.
fn segments(path: &str) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    out
}

fn match_segments(request: &[&str], pattern: &[&str]) -> bool {
    if let Some((&WILDCARD, prefix)) = pattern.split_last() {
        return request.len() >= prefix.len() && match_exact(&request[..prefix.len()], prefix);
    }
    request.len() == pattern.len() && match_exact(request, pattern)
}

fn match_exact(request: &[&str], pattern: &[&str]) -> bool {
    request
        .iter()
        .zip(pattern)
        .all(|(r, p)| *p == WILDCARD || r == p)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: [&str; 0] = [];

    #[test]
    fn trailing_wildcard_matches_deeper_paths() {
        assert!(matches("/api/v1/users", &["/api/*"]));
        assert!(!matches("/api/v1/users", &["/other/*"]));
        assert!(matches("/internal", &["/internal/*"]));
        assert!(!matches("/internals/x", &["/internal/*"]));
    }

    #[test]
    fn trailing_separator_is_ignored() {
        assert!(matches("/health/", &["/health"]));
        assert!(matches("/health", &["/health/"]));
    }

    #[test]
    fn matching_is_case_sensitive_and_literal() {
        assert!(!matches("/API/users", &["/api/users"]));
        assert!(!matches("/a%2Fb", &["/a/b"]));
        assert!(matches("/a%2Fb", &["/a%2Fb"]));
    }

    #[test]
    fn root_and_empty_paths() {
        assert!(matches("", &["/"]));
        assert!(matches("/", &["/"]));
        assert!(!matches("/x", &["/"]));
        assert!(matches("/", &["/*"]));
    }

    #[test]
    fn empty_patterns_never_match() {
        assert!(!matches("/", &NONE));
        assert!(!matches("/anything", &NONE));
    }

    #[test]
    fn interior_wildcard_matches_one_segment() {
        assert!(matches("/api/v2/users", &["/api/*/users"]));
        assert!(!matches("/api/users", &["/api/*/users"]));
        assert!(!matches("/api/v1/x/users", &["/api/*/users"]));
        assert!(matches("/api/v1/users/7", &["/api/*/users/*"]));
    }

    #[test]
    fn canonicalizes_dots_and_repeated_separators() {
        assert!(matches("//metrics", &["/metrics"]));
        assert!(matches("/./internal/../metrics", &["/metrics"]));
        assert!(matches("/metrics", &["/./metrics//"]));
    }

    #[test]
    fn any_pattern_suffices() {
        assert!(matches("/metrics", &["/internal/*", "/metrics"]));
    }

    #[test]
    fn exclusion_list_validation() {
        assert!(matches!(ExclusionList::new(["health"]), Err(Error::PathValidation(_))));
        assert!(ExclusionList::new(["/health"]).is_ok());
        let dup = ExclusionList::new(["/health", "/health"]).unwrap_err();
        assert!(dup.to_string().contains("duplicate path: /health"));
        assert!(ExclusionList::new(NONE).unwrap().is_empty());
        assert!(ExclusionList::new(Vec::<String>::new()).is_ok());
    }

    #[test]
    fn exclusion_list_matches_like_free_function() {
        let list = ExclusionList::new(["/internal/*", "/metrics"]).unwrap();
        for path in ["/internal/health", "/metrics/", "/api", "", "/internal"] {
            assert_eq!(list.matches(path), matches(path, list.patterns()), "{path}");
        }
        assert!(!ExclusionList::default().matches("/"));
    }
}
