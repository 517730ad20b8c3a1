//! Branch fallback for a dependent that has no companion changeset.
//!
//! Priority, strictest first:
//!
//! 1. a `<repo> companion branch: <branch>` directive from a description,
//! 2. the override table: the start changeset's base branch is matched
//!    against the source repository's pattern and the captured suffix is
//!    substituted into the dependent's pattern,
//! 3. the most recently updated dependent branch matching its pattern when
//!    the computed name does not exist (ties go to the greatest name),
//! 4. the dependent's default branch.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, info};

use crate::error::{CheckError, Result};
use crate::host::{BranchInfo, CodeHost};
use crate::model::RepoId;

/// A branch name pattern with exactly one `*` wildcard, e.g. `release-v*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPattern {
    prefix: String,
    suffix: String,
}

impl BranchPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut parts = pattern.split('*');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(prefix), Some(suffix), None) => Ok(Self {
                prefix: prefix.to_string(),
                suffix: suffix.to_string(),
            }),
            _ => Err(CheckError::Config(format!(
                "branch pattern {pattern:?} must contain exactly one `*`"
            ))),
        }
    }

    /// The wildcard-captured part of `branch`, if it matches.
    pub fn capture<'b>(&self, branch: &'b str) -> Option<&'b str> {
        branch
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())
    }

    pub fn matches(&self, branch: &str) -> bool {
        self.capture(branch).is_some()
    }

    /// Replace the wildcard with `captured`.
    pub fn substitute(&self, captured: &str) -> String {
        format!("{}{}{}", self.prefix, captured, self.suffix)
    }
}

impl fmt::Display for BranchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*{}", self.prefix, self.suffix)
    }
}

/// Per-repository branch patterns, keyed by repository name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchOverrideTable {
    patterns: BTreeMap<String, BranchPattern>,
}

impl BranchOverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `repo name -> pattern` strings.
    pub fn from_patterns<'a>(
        entries: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<Self> {
        let mut table = Self::new();
        for (repo, pattern) in entries {
            table.insert(repo, BranchPattern::parse(pattern)?);
        }
        Ok(table)
    }

    pub fn insert(&mut self, repo_name: &str, pattern: BranchPattern) {
        self.patterns
            .insert(repo_name.to_ascii_lowercase(), pattern);
    }

    pub fn pattern_for(&self, repo: &RepoId) -> Option<&BranchPattern> {
        self.patterns.get(&repo.name)
    }

    /// Map `source_branch` of `source` onto the branch `destination` should
    /// use. `None` when either repository has no pattern or the branch does
    /// not match the source pattern.
    pub fn correlate(
        &self,
        source: &RepoId,
        source_branch: &str,
        destination: &RepoId,
    ) -> Option<String> {
        let captured = self.pattern_for(source)?.capture(source_branch)?;
        Some(self.pattern_for(destination)?.substitute(captured))
    }
}

/// How the dependent's branch was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchChoice {
    Directive(String),
    Correlated(String),
    MostRecent(String),
    Default(String),
}

impl BranchChoice {
    pub fn name(&self) -> &str {
        match self {
            Self::Directive(b) | Self::Correlated(b) | Self::MostRecent(b) | Self::Default(b) => b,
        }
    }
}

/// The most recently updated branch; equal timestamps go to the
/// lexicographically greatest name so the choice is deterministic.
pub fn most_recent(branches: &[BranchInfo]) -> Option<&BranchInfo> {
    branches
        .iter()
        .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.name.cmp(&b.name)))
}

/// Pick the branch `dependent` is built from when the graph holds no
/// companion for it.
pub async fn choose_branch(
    host: &dyn CodeHost,
    table: &BranchOverrideTable,
    source: &RepoId,
    source_branch: &str,
    dependent: &RepoId,
    directive: Option<&str>,
) -> Result<BranchChoice> {
    if let Some(branch) = directive {
        if !host.branch_exists(dependent, branch).await? {
            return Err(CheckError::MissingTargetBranch {
                repo: dependent.to_string(),
                branch: branch.to_string(),
            });
        }
        info!(repo = %dependent, branch, "using branch from description directive");
        return Ok(BranchChoice::Directive(branch.to_string()));
    }

    if let Some(branch) = table.correlate(source, source_branch, dependent) {
        if host.branch_exists(dependent, &branch).await? {
            info!(repo = %dependent, %branch, "using correlated branch");
            return Ok(BranchChoice::Correlated(branch));
        }
        debug!(repo = %dependent, %branch, "correlated branch does not exist");
        if let Some(pattern) = table.pattern_for(dependent) {
            let candidates = host.matching_branches(dependent, pattern).await?;
            if let Some(latest) = most_recent(&candidates) {
                info!(
                    repo = %dependent,
                    branch = %latest.name,
                    %pattern,
                    "using most recently updated matching branch"
                );
                return Ok(BranchChoice::MostRecent(latest.name.clone()));
            }
        }
    }

    let default = host.default_branch(dependent).await?;
    info!(repo = %dependent, branch = %default, "using default branch");
    Ok(BranchChoice::Default(default))
}
