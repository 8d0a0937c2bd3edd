//! Path filtering hooks consumed by the inventory walk.
//!
//! The engine behind include/exclude rules is a collaborator; the sync core
//! only asks one question: does this relative path participate in the run?

use std::path::Path;

use anyhow::{Context, Result};

pub trait PathFilter: Send + Sync {
    /// `rel` uses forward slashes and names a file or directory under a
    /// source root.
    fn includes(&self, rel: &str) -> bool;
}

/// Filter that lets everything through.
pub struct AcceptAll;

impl PathFilter for AcceptAll {
    fn includes(&self, _rel: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleKind {
    Include,
    Exclude,
}

/// Ordered include/exclude rules, first match wins; unmatched paths are
/// included. An explicit files-from list overrides the rules entirely.
#[derive(Default)]
pub struct PatternFilter {
    rules: Vec<(RuleKind, String)>,
    only: Option<Vec<String>>,
}

impl PatternFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(&mut self, pattern: &str) {
        self.rules.push((RuleKind::Include, pattern.to_string()));
    }

    pub fn exclude(&mut self, pattern: &str) {
        self.rules.push((RuleKind::Exclude, pattern.to_string()));
    }

    /// Restrict the run to exactly these relative paths (and their parents).
    pub fn only_files(&mut self, paths: Vec<String>) {
        self.only = Some(paths);
    }

    pub fn include_from(&mut self, file: &Path) -> Result<()> {
        for pattern in read_pattern_file(file)? {
            self.include(&pattern);
        }
        Ok(())
    }

    pub fn exclude_from(&mut self, file: &Path) -> Result<()> {
        for pattern in read_pattern_file(file)? {
            self.exclude(&pattern);
        }
        Ok(())
    }

    pub fn files_from(&mut self, file: &Path) -> Result<()> {
        self.only_files(read_pattern_file(file)?);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.only.is_none()
    }
}

fn read_pattern_file(file: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading pattern file {}", file.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

impl PathFilter for PatternFilter {
    fn includes(&self, rel: &str) -> bool {
        if let Some(only) = &self.only {
            return only
                .iter()
                .any(|want| want == rel || want.starts_with(&format!("{rel}/")));
        }
        let name = rel.rsplit('/').next().unwrap_or(rel);
        for (kind, pattern) in &self.rules {
            if glob_match(pattern, rel) || glob_match(pattern, name) {
                return *kind == RuleKind::Include;
            }
        }
        true
    }
}

/// Simple glob matching (supports `*` wildcards).
fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern.contains('*') {
        if pattern.starts_with('*') && pattern.ends_with('*') && pattern.len() >= 2 {
            let middle = &pattern[1..pattern.len() - 1];
            return text.contains(middle);
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            return text.ends_with(suffix);
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            return text.starts_with(prefix);
        }
    }
    pattern == text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_includes_everything() {
        let f = PatternFilter::new();
        assert!(f.includes("a.txt"));
        assert!(f.includes("deep/nested/b.bin"));
    }

    #[test]
    fn exclude_by_extension() {
        let mut f = PatternFilter::new();
        f.exclude("*.o");
        assert!(!f.includes("build/main.o"));
        assert!(f.includes("build/main.c"));
    }

    #[test]
    fn first_match_wins() {
        let mut f = PatternFilter::new();
        f.include("keep.log");
        f.exclude("*.log");
        assert!(f.includes("keep.log"));
        assert!(!f.includes("other.log"));
    }

    #[test]
    fn exclude_directory_component() {
        let mut f = PatternFilter::new();
        f.exclude("target");
        assert!(!f.includes("target"));
        assert!(f.includes("src/main.rs"));
    }

    #[test]
    fn files_from_restricts_and_keeps_parents() {
        let mut f = PatternFilter::new();
        f.only_files(vec!["sub/inner/a.txt".to_string()]);
        assert!(f.includes("sub/inner/a.txt"));
        assert!(f.includes("sub"));
        assert!(f.includes("sub/inner"));
        assert!(!f.includes("sub/other.txt"));
    }

    #[test]
    fn glob_shapes() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*.tmp", "x.tmp"));
        assert!(glob_match("cache*", "cache-dir"));
        assert!(glob_match("*seg*", "a-seg-b"));
        assert!(!glob_match("*.tmp", "x.tmp2"));
    }
}
