//! Trigger matching and path filtering.

use gridline_core::config::TriggerConfig;
use gridline_core::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The logical reference a trigger belongs to. A new trigger for the same
/// reference supersedes the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitRef {
    Branch(String),
    PullRequest(u64),
}

impl fmt::Display for GitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitRef::Branch(name) => write!(f, "refs/heads/{}", name),
            GitRef::PullRequest(number) => write!(f, "refs/pull/{}", number),
        }
    }
}

impl std::str::FromStr for GitRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(name) = s.strip_prefix("refs/heads/") {
            return Ok(GitRef::Branch(name.to_string()));
        }
        let pr = s
            .strip_prefix("refs/pull/")
            .or_else(|| s.strip_prefix("pr/"))
            .or_else(|| s.strip_prefix('#'));
        if let Some(number) = pr {
            let number = number.trim_end_matches("/merge").trim_end_matches("/head");
            return number.parse().map(GitRef::PullRequest).map_err(|_| {
                Error::Configuration(format!("Invalid pull request reference '{}'", s))
            });
        }
        if s.trim().is_empty() {
            return Err(Error::Configuration("Empty git reference".to_string()));
        }
        Ok(GitRef::Branch(s.to_string()))
    }
}

/// A code-change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub reference: GitRef,
    pub commit: String,
    /// Pull requests carry their target branch for branch filtering.
    #[serde(default)]
    pub target_branch: Option<String>,
    #[serde(default)]
    pub changed_paths: Vec<String>,
}

impl TriggerEvent {
    pub fn push(branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            reference: GitRef::Branch(branch.into()),
            commit: commit.into(),
            target_branch: None,
            changed_paths: Vec::new(),
        }
    }

    pub fn pull_request(number: u64, target: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            reference: GitRef::PullRequest(number),
            commit: commit.into(),
            target_branch: Some(target.into()),
            changed_paths: Vec::new(),
        }
    }

    pub fn with_changed_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_paths = paths.into_iter().map(Into::into).collect();
        self
    }
}

/// Compiled glob pattern. `**` crosses directory separators, `*` and `?` do not.
#[derive(Debug, Clone)]
struct Glob(Regex);

impl Glob {
    fn compile(pattern: &str) -> Result<Self> {
        let mut re = String::from("^");
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                }
                '*' => re.push_str("[^/]*"),
                '?' => re.push_str("[^/]"),
                other => re.push_str(&regex::escape(&other.to_string())),
            }
        }
        re.push('$');
        Regex::new(&re)
            .map(Glob)
            .map_err(|e| Error::Configuration(format!("Invalid pattern '{}': {}", pattern, e)))
    }

    fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }
}

/// Decides whether an event starts a matrix run.
#[derive(Debug, Clone)]
pub struct TriggerMatcher {
    branches: Vec<Glob>,
    paths_ignore: Vec<Glob>,
    pull_requests: bool,
}

impl TriggerMatcher {
    pub fn new(config: &TriggerConfig) -> Result<Self> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| Glob::compile(p))
                .collect::<Result<Vec<_>>>()
        };
        Ok(Self {
            branches: compile(&config.branches)?,
            paths_ignore: compile(&config.paths_ignore)?,
            pull_requests: config.pull_requests,
        })
    }

    /// True when the event should produce jobs.
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        let branch = match &event.reference {
            GitRef::Branch(name) => Some(name.as_str()),
            GitRef::PullRequest(_) => {
                if !self.pull_requests {
                    return false;
                }
                event.target_branch.as_deref()
            }
        };

        let branch_ok = match branch {
            Some(name) => self.branch_matches(name),
            None => self.branches.is_empty(),
        };

        branch_ok && self.paths_match(&event.changed_paths)
    }

    fn branch_matches(&self, branch: &str) -> bool {
        self.branches.is_empty() || self.branches.iter().any(|g| g.is_match(branch))
    }

    /// An event whose every changed path is ignored does not trigger. An
    /// event with no path information always does.
    fn paths_match(&self, changed: &[String]) -> bool {
        if changed.is_empty() || self.paths_ignore.is_empty() {
            return true;
        }
        !changed
            .iter()
            .all(|path| self.paths_ignore.iter().any(|g| g.is_match(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(branches: &[&str], ignore: &[&str]) -> TriggerMatcher {
        TriggerMatcher::new(&TriggerConfig {
            branches: branches.iter().map(|s| s.to_string()).collect(),
            paths_ignore: ignore.iter().map(|s| s.to_string()).collect(),
            pull_requests: true,
        })
        .unwrap()
    }

    #[test]
    fn test_branch_match_exact() {
        let m = matcher(&["main"], &[]);
        assert!(m.matches(&TriggerEvent::push("main", "abc")));
        assert!(!m.matches(&TriggerEvent::push("develop", "abc")));
    }

    #[test]
    fn test_branch_match_glob() {
        let m = matcher(&["feature/*", "release/**"], &[]);
        assert!(m.matches(&TriggerEvent::push("feature/foo", "abc")));
        assert!(!m.matches(&TriggerEvent::push("feature/foo/bar", "abc")));
        assert!(m.matches(&TriggerEvent::push("release/v1/hotfix", "abc")));
    }

    #[test]
    fn test_empty_patterns_match_all() {
        let m = matcher(&[], &[]);
        assert!(m.matches(&TriggerEvent::push("any-branch", "abc")));
    }

    #[test]
    fn test_docs_only_changes_suppressed() {
        let m = matcher(&[], &["docs/**", "**/*.md"]);
        let docs = TriggerEvent::push("main", "abc")
            .with_changed_paths(["docs/index.md", "README.md", "docs/api/backends.rst"]);
        assert!(!m.matches(&docs));

        let mixed = TriggerEvent::push("main", "abc")
            .with_changed_paths(["docs/index.md", "ibis/backends/duckdb/__init__.py"]);
        assert!(m.matches(&mixed));
    }

    #[test]
    fn test_pull_request_filters_on_target_branch() {
        let m = matcher(&["main"], &[]);
        assert!(m.matches(&TriggerEvent::pull_request(42, "main", "abc")));
        assert!(!m.matches(&TriggerEvent::pull_request(42, "other", "abc")));
    }

    #[test]
    fn test_git_ref_parsing() {
        assert_eq!(
            "refs/heads/main".parse::<GitRef>().unwrap(),
            GitRef::Branch("main".into())
        );
        assert_eq!(
            "refs/pull/17/merge".parse::<GitRef>().unwrap(),
            GitRef::PullRequest(17)
        );
        assert_eq!("#5".parse::<GitRef>().unwrap(), GitRef::PullRequest(5));
        assert!("refs/pull/x".parse::<GitRef>().is_err());
        assert_eq!(GitRef::PullRequest(3).to_string(), "refs/pull/3");
    }
}
