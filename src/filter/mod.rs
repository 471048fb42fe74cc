//! Tag and repository selection
//!
//! A name is selected iff it matches at least one include pattern (an empty include
//! list means "everything") and matches no exclude pattern. Exclusion always wins.
//! Compiled patterns are cached by pattern string so filtering hundreds of
//! repositories compiles each rule once.

pub mod pattern;

pub use pattern::TagPattern;

use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct TagFilter {
    cache: Mutex<HashMap<String, Arc<TagPattern>>>,
}

impl TagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `pattern`, reusing a cached compilation when available
    pub fn compile(&self, pattern: &str) -> Result<Arc<TagPattern>> {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(compiled) = cache.get(pattern) {
            return Ok(Arc::clone(compiled));
        }

        let compiled = Arc::new(TagPattern::compile(pattern)?);
        cache.insert(pattern.to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Compile every pattern up front so bad rules surface before any work starts
    pub fn validate(&self, patterns: &[String]) -> Result<()> {
        for pattern in patterns {
            self.compile(pattern)?;
        }
        Ok(())
    }

    pub fn cached_patterns(&self) -> usize {
        self.cache
            .lock()
            .map(|cache| cache.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    /// Whether `name` matches any of `patterns`
    pub fn matches_any(&self, name: &str, patterns: &[String]) -> Result<bool> {
        for pattern in patterns {
            if self.compile(pattern)?.matches(name) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Select the names that pass the include/exclude rules, preserving input order
    pub fn select(
        &self,
        all_tags: &[String],
        include: &[String],
        exclude: &[String],
    ) -> Result<Vec<String>> {
        let include = self.compile_all(include)?;
        let exclude = self.compile_all(exclude)?;

        Ok(all_tags
            .iter()
            .filter(|tag| include.is_empty() || include.iter().any(|p| p.matches(tag)))
            .filter(|tag| !exclude.iter().any(|p| p.matches(tag)))
            .cloned()
            .collect())
    }

    fn compile_all(&self, patterns: &[String]) -> Result<Vec<Arc<TagPattern>>> {
        patterns.iter().map(|p| self.compile(p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = TagFilter::new();
        let selected = filter
            .select(
                &strings(&["v1", "v2", "latest", "dev"]),
                &strings(&["v*"]),
                &strings(&["v2"]),
            )
            .unwrap();
        assert_eq!(selected, vec!["v1"]);
    }

    #[test]
    fn test_empty_include_selects_everything_in_order() {
        let filter = TagFilter::new();
        let tags = strings(&["zeta", "alpha", "dev", "mid"]);
        let selected = filter.select(&tags, &[], &strings(&["dev"])).unwrap();
        assert_eq!(selected, strings(&["zeta", "alpha", "mid"]));
    }

    #[test]
    fn test_multiple_includes() {
        let filter = TagFilter::new();
        let selected = filter
            .select(
                &strings(&["1.0", "latest", "nightly", "2.1"]),
                &strings(&["latest", "[0-9]*"]),
                &[],
            )
            .unwrap();
        assert_eq!(selected, strings(&["1.0", "latest", "2.1"]));
    }

    #[test]
    fn test_patterns_are_cached() {
        let filter = TagFilter::new();
        let tags = strings(&["v1", "v2"]);
        for _ in 0..10 {
            filter.select(&tags, &strings(&["v*"]), &strings(&["v2"])).unwrap();
        }
        assert_eq!(filter.cached_patterns(), 2);

        let first = filter.compile("v*").unwrap();
        let second = filter.compile("v*").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let filter = TagFilter::new();
        assert!(filter.select(&strings(&["v1"]), &strings(&["[v"]), &[]).is_err());
        assert!(filter.validate(&strings(&["ok*", "[z-a]"])).is_err());
    }

    #[test]
    fn test_matches_any_for_repositories() {
        let filter = TagFilter::new();
        let patterns = strings(&["internal/*", "scratch"]);
        assert!(filter.matches_any("internal/tools", &patterns).unwrap());
        assert!(filter.matches_any("scratch", &patterns).unwrap());
        assert!(!filter.matches_any("public/app", &patterns).unwrap());
    }
}
