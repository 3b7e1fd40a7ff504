//! Event → dependency resolution
//!
//! An event `(source, subject)` satisfies a dependency when
//! `<source>__<subject>` equals the dependency's
//! `<eventSourceName>__<eventName>`, or matches it as a glob (`*`, `?`).

use regex::Regex;
use shared::{event_key, Dependency};

struct Pattern {
    key: String,
    glob: Option<Regex>,
    dependency: String,
}

/// Lookup table from event keys to dependency names
pub struct DependencyIndex {
    patterns: Vec<Pattern>,
}

impl DependencyIndex {
    pub fn new(dependencies: &[Dependency]) -> Self {
        let patterns = dependencies
            .iter()
            .map(|dep| {
                let key = dep.event_key();
                Pattern {
                    glob: glob_regex(&key),
                    key,
                    dependency: dep.name.clone(),
                }
            })
            .collect();
        Self { patterns }
    }

    /// Dependencies satisfied by an event, in declaration order
    ///
    /// Exact matches win; globs are consulted only when nothing matches exactly.
    pub fn resolve(&self, source: &str, subject: &str) -> Vec<&str> {
        let key = event_key(source, subject);
        let exact: Vec<&str> = self
            .patterns
            .iter()
            .filter(|p| p.key == key)
            .map(|p| p.dependency.as_str())
            .collect();
        if !exact.is_empty() {
            return exact;
        }

        self.patterns
            .iter()
            .filter(|p| p.glob.as_ref().is_some_and(|re| re.is_match(&key)))
            .map(|p| p.dependency.as_str())
            .collect()
    }

    /// Dependency names in declaration order
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.dependency.as_str())
    }
}

/// Compile a glob key, or `None` when it has no wildcard
fn glob_regex(key: &str) -> Option<Regex> {
    if !key.contains(['*', '?']) {
        return None;
    }
    let mut pattern = String::with_capacity(key.len() + 8);
    pattern.push('^');
    for c in key.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    pattern.push('$');

    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Invalid dependency glob, using exact match only");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let index = DependencyIndex::new(&[
            Dependency::new("a", "webhook", "example"),
            Dependency::new("b", "calendar", "example"),
        ]);
        assert_eq!(index.resolve("webhook", "example"), vec!["a"]);
        assert!(index.resolve("webhook", "other").is_empty());
    }

    #[test]
    fn test_multiple_dependencies_same_event() {
        let index = DependencyIndex::new(&[
            Dependency::new("a", "webhook", "example"),
            Dependency::new("b", "webhook", "example"),
        ]);
        assert_eq!(index.resolve("webhook", "example"), vec!["a", "b"]);
    }

    #[test]
    fn test_glob_match() {
        let index = DependencyIndex::new(&[
            Dependency::new("any-hook", "webhook", "*"),
            Dependency::new("cal", "calendar-?", "tick"),
        ]);
        assert_eq!(index.resolve("webhook", "push"), vec!["any-hook"]);
        assert_eq!(index.resolve("calendar-1", "tick"), vec!["cal"]);
        assert!(index.resolve("calendar-10", "tick").is_empty());
    }

    #[test]
    fn test_exact_preferred_over_glob() {
        let index = DependencyIndex::new(&[
            Dependency::new("any", "webhook", "*"),
            Dependency::new("push", "webhook", "push"),
        ]);
        assert_eq!(index.resolve("webhook", "push"), vec!["push"]);
        assert_eq!(index.resolve("webhook", "pull"), vec!["any"]);
    }

    #[test]
    fn test_glob_escapes_regex_characters() {
        let index = DependencyIndex::new(&[Dependency::new("d", "my.source", "evt*")]);
        assert_eq!(index.resolve("my.source", "evt-1"), vec!["d"]);
        assert!(index.resolve("myXsource", "evt-1").is_empty());
    }
}
