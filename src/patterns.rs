//! Exclusion patterns
//!
//! Rules are glob expressions, optionally hierarchical: components are
//! separated by `/`, a leading `/` anchors the rule at the scan root, and a
//! trailing `/` excludes the *contents* of matching directories while
//! keeping the directory itself. Rules without a leading `/` float: they are
//! tried at every level.
//!
//! The scanner consults the predicate before it stats an entry; a
//! [`Match::FileOnly`] outcome defers the decision until the entry kind is
//! known. Descending into a directory derives the child predicate with
//! [`Patterns::enter`], advancing hierarchical rules that matched the
//! directory name.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;

use globset::{GlobBuilder, GlobMatcher};

use crate::error::ConfigError;

/// Outcome of matching a name against the rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Match {
    /// Not excluded.
    None,
    /// Excluded only if the entry turns out not to be a directory.
    FileOnly,
    /// Excluded regardless of kind.
    Both,
}

/// One compiled exclusion rule.
#[derive(Debug, Clone)]
struct Rule {
    /// Glob matcher per path component.
    components: Vec<GlobMatcher>,
    /// Leading `/`: only valid starting at the scan root.
    anchored: bool,
    /// Exclude only non-directories.
    file_only: bool,
    /// Trailing `/`: exclude the contents of a matching directory.
    dir_contents: bool,
}

impl Rule {
    fn parse(pattern: &str, file_only: bool) -> Result<Self, ConfigError> {
        let bad = |reason: &str| ConfigError::InvalidExcludePattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let mut text = pattern;
        let anchored = text.starts_with('/');
        if anchored {
            text = &text[1..];
        }
        let dir_contents = text.ends_with('/');
        if dir_contents {
            text = &text[..text.len() - 1];
        }
        if text.is_empty() {
            return Err(bad("empty pattern"));
        }

        let mut components = Vec::new();
        for comp in text.split('/') {
            if comp.is_empty() {
                return Err(bad("empty path component"));
            }
            let glob = GlobBuilder::new(comp)
                .literal_separator(true)
                .build()
                .map_err(|e| bad(&e.to_string()))?;
            components.push(glob.compile_matcher());
        }

        Ok(Self {
            components,
            anchored,
            file_only,
            dir_contents,
        })
    }
}

/// The compiled rule set shared by every level of a scan.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    rules: Arc<Vec<Rule>>,
}

impl PatternSet {
    /// Compile unconditional exclusion rules (files and directories alike).
    pub fn compile(patterns: &[String]) -> Result<Self, ConfigError> {
        Self::build(patterns.iter().map(|p| (p.as_str(), false)))
    }

    /// Compile a mixed list of `(pattern, file_only)` rules.
    ///
    /// File-only rules exclude an entry only when it is not a directory;
    /// they are part of the library surface and of exclude files using the
    /// `f:` prefix.
    pub fn build<'a>(
        patterns: impl IntoIterator<Item = (&'a str, bool)>,
    ) -> Result<Self, ConfigError> {
        let mut rules = Vec::new();
        for (pat, file_only) in patterns {
            rules.push(Rule::parse(pat, file_only)?);
        }
        Ok(Self {
            rules: Arc::new(rules),
        })
    }

    /// The root-level predicate.
    pub fn root(&self) -> Patterns {
        let active = (0..self.rules.len() as u32).map(|i| (i, 0)).collect();
        Patterns {
            rules: Arc::clone(&self.rules),
            active,
            all: false,
        }
    }
}

/// Parse the lines of an exclude file: one pattern per line, `#` comments
/// and blank lines ignored, `f:` prefix marks a file-only rule.
pub fn parse_exclude_lines(text: &str) -> Vec<(String, bool)> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| match l.strip_prefix("f:") {
            Some(rest) => (rest.to_string(), true),
            None => (l.to_string(), false),
        })
        .collect()
}

/// The per-level predicate handed to the scanner.
///
/// Cheap to derive per directory: it holds the shared rule set plus the
/// positions of rules still in play at this level.
#[derive(Debug, Clone)]
pub struct Patterns {
    rules: Arc<Vec<Rule>>,
    /// `(rule index, component index)` pairs active at this level.
    active: Vec<(u32, u32)>,
    /// A directory-contents rule fired on the parent: everything here is
    /// excluded.
    all: bool,
}

impl Patterns {
    /// A predicate that never matches.
    pub fn empty() -> Self {
        Patterns {
            rules: Arc::new(Vec::new()),
            active: Vec::new(),
            all: false,
        }
    }

    /// True when no rule can ever match below this level.
    pub fn is_inert(&self) -> bool {
        !self.all && self.active.is_empty()
    }

    /// Match a name at this level. The stricter outcome wins when several
    /// rules match.
    pub fn match_name(&self, name: &[u8]) -> Match {
        if self.all {
            return Match::Both;
        }
        let path = Path::new(OsStr::from_bytes(name));
        let mut result = Match::None;
        for &(rule_idx, comp_idx) in &self.active {
            let rule = &self.rules[rule_idx as usize];
            let last = comp_idx as usize + 1 == rule.components.len();
            if !last || rule.dir_contents {
                continue;
            }
            if rule.components[comp_idx as usize].is_match(path) {
                let outcome = if rule.file_only {
                    Match::FileOnly
                } else {
                    Match::Both
                };
                result = result.max(outcome);
                if result == Match::Both {
                    break;
                }
            }
        }
        result
    }

    /// Derive the predicate for the contents of child directory `name`.
    pub fn enter(&self, name: &[u8]) -> Patterns {
        if self.all {
            // Everything below an excluded-contents dir is excluded too,
            // but the scanner never descends past a Both match.
            return self.clone();
        }
        let path = Path::new(OsStr::from_bytes(name));
        let mut active = Vec::new();
        let mut all = false;
        for &(rule_idx, comp_idx) in &self.active {
            let rule = &self.rules[rule_idx as usize];
            // Floating rules restart at every level.
            if !rule.anchored && comp_idx == 0 {
                active.push((rule_idx, 0));
            }
            if rule.components[comp_idx as usize].is_match(path) {
                let last = comp_idx as usize + 1 == rule.components.len();
                if last {
                    if rule.dir_contents {
                        all = true;
                    }
                } else {
                    active.push((rule_idx, comp_idx + 1));
                }
            }
        }
        active.dedup();
        Patterns {
            rules: Arc::clone(&self.rules),
            active,
            all,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(patterns: &[&str]) -> PatternSet {
        let owned: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        PatternSet::compile(&owned).unwrap()
    }

    #[test]
    fn test_plain_glob_matches_any_level() {
        let p = set(&["*.log"]).root();
        assert_eq!(p.match_name(b"x.log"), Match::Both);
        assert_eq!(p.match_name(b"x.txt"), Match::None);

        let deep = p.enter(b"a").enter(b"b");
        assert_eq!(deep.match_name(b"y.log"), Match::Both);
    }

    #[test]
    fn test_anchored_only_at_root() {
        let p = set(&["/build"]).root();
        assert_eq!(p.match_name(b"build"), Match::Both);
        let sub = p.enter(b"src");
        assert_eq!(sub.match_name(b"build"), Match::None);
    }

    #[test]
    fn test_hierarchical_descent() {
        let p = set(&["cache/objects"]).root();
        assert_eq!(p.match_name(b"cache"), Match::None);
        let inside = p.enter(b"cache");
        assert_eq!(inside.match_name(b"objects"), Match::Both);
        // The floating rule restarts below, too.
        let deeper = inside.enter(b"other");
        assert_eq!(deeper.enter(b"cache").match_name(b"objects"), Match::Both);
    }

    #[test]
    fn test_dir_contents_rule() {
        let p = set(&["tmp/"]).root();
        // The directory itself survives...
        assert_eq!(p.match_name(b"tmp"), Match::None);
        // ...its contents do not.
        let inside = p.enter(b"tmp");
        assert_eq!(inside.match_name(b"anything"), Match::Both);
    }

    #[test]
    fn test_file_only_rule() {
        let p = PatternSet::build([("core", true)]).unwrap().root();
        assert_eq!(p.match_name(b"core"), Match::FileOnly);
        // A Both rule on the same name wins.
        let p2 = PatternSet::build([("core", true), ("core", false)])
            .unwrap()
            .root();
        assert_eq!(p2.match_name(b"core"), Match::Both);
    }

    #[test]
    fn test_exclude_file_lines() {
        let lines = parse_exclude_lines("# comment\n*.o\n\nf:core\n  .git  \n");
        assert_eq!(
            lines,
            vec![
                ("*.o".to_string(), false),
                ("core".to_string(), true),
                (".git".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(PatternSet::compile(&["".to_string()]).is_err());
        assert!(PatternSet::compile(&["a//b".to_string()]).is_err());
        assert!(PatternSet::compile(&["[".to_string()]).is_err());
    }

    #[test]
    fn test_non_utf8_name() {
        let p = set(&["*.log"]).root();
        assert_eq!(p.match_name(b"\xff\xfe.log"), Match::Both);
    }
}
