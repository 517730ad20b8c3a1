//! Repository and changeset identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CheckError, Result};

/// Identifies a repository as `org/name`.
///
/// Both parts are lower-cased on construction; code hosts treat repository
/// names case-insensitively and the resolver relies on equality here.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    pub org: String,
    pub name: String,
}

impl RepoId {
    pub fn new(org: impl AsRef<str>, name: impl AsRef<str>) -> Self {
        Self {
            org: org.as_ref().to_ascii_lowercase(),
            name: name.as_ref().to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.org, self.name)
    }
}

impl FromStr for RepoId {
    type Err = CheckError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().split_once('/') {
            Some((org, name)) if !org.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(org, name))
            }
            _ => Err(CheckError::Config(format!(
                "expected repository as `org/name`, got {s:?}"
            ))),
        }
    }
}

/// Points at one changeset (pull request) in a repository.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangesetRef {
    pub repo: RepoId,
    pub number: u64,
}

impl ChangesetRef {
    pub fn new(repo: RepoId, number: u64) -> Self {
        Self { repo, number }
    }

    /// Interpret a CI ref name as a changeset of `repo`.
    ///
    /// Accepts `123`, `pr-123`, `PR-123` and `refs/pull/123/head`. Anything
    /// else (plain branches, tags) is not a changeset and yields `None`.
    pub fn from_ci_ref(repo: RepoId, ci_ref: &str) -> Option<Self> {
        let trimmed = ci_ref.trim();
        let digits = if let Some(rest) = trimmed.strip_prefix("refs/pull/") {
            rest.strip_suffix("/head")
                .or_else(|| rest.strip_suffix("/merge"))?
        } else if let Some(rest) = trimmed
            .strip_prefix("pr-")
            .or_else(|| trimmed.strip_prefix("PR-"))
        {
            rest
        } else {
            trimmed
        };
        digits.parse().ok().map(|number| Self::new(repo, number))
    }

    /// The fetchable head ref of this changeset on a GitHub-style remote.
    pub fn head_ref(&self) -> String {
        format!("pull/{}/head", self.number)
    }
}

impl fmt::Display for ChangesetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

impl FromStr for ChangesetRef {
    type Err = CheckError;

    /// Parses `org/name#number`.
    fn from_str(s: &str) -> Result<Self> {
        let (repo, number) = s.trim().split_once('#').ok_or_else(|| {
            CheckError::Config(format!("expected changeset as `org/name#number`, got {s:?}"))
        })?;
        let number = number
            .parse()
            .map_err(|_| CheckError::Config(format!("invalid changeset number in {s:?}")))?;
        Ok(Self::new(repo.parse()?, number))
    }
}

/// Lifecycle state reported by the code host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangesetState {
    Open,
    Closed,
    Merged,
}

/// A fetched changeset. Immutable for the duration of a resolution run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub reference: ChangesetRef,
    /// Branch the changeset targets.
    pub base_branch: String,
    /// Commit at the head of the changeset.
    pub head_sha: String,
    /// Free-text description.
    pub body: String,
    pub state: ChangesetState,
    /// `None` while the host is still computing mergeability.
    pub mergeable: Option<bool>,
}

impl Changeset {
    pub fn repo(&self) -> &RepoId {
        &self.reference.repo
    }

    pub fn is_open(&self) -> bool {
        self.state == ChangesetState::Open
    }
}

/// Template for the remote that receives published snapshots.
///
/// `{org}` and `{repo}` are substituted, e.g.
/// `https://gitlab.example.com/mirrors/{repo}.git`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRemote {
    pub template: String,
}

impl SnapshotRemote {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn url_for(&self, repo: &RepoId) -> String {
        self.template
            .replace("{org}", &repo.org)
            .replace("{repo}", &repo.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_id_is_case_insensitive() {
        assert_eq!(RepoId::new("ParityTech", "Substrate"), RepoId::new("paritytech", "substrate"));
    }

    #[test]
    fn test_repo_id_parse() {
        let id: RepoId = "org/repo".parse().unwrap();
        assert_eq!(id.to_string(), "org/repo");
        assert!("org".parse::<RepoId>().is_err());
        assert!("org/a/b".parse::<RepoId>().is_err());
    }

    #[test]
    fn test_changeset_ref_parse_and_display() {
        let r: ChangesetRef = "org/polkadot#123".parse().unwrap();
        assert_eq!(r.number, 123);
        assert_eq!(r.to_string(), "org/polkadot#123");
        assert!("org/polkadot".parse::<ChangesetRef>().is_err());
        assert!("org/polkadot#abc".parse::<ChangesetRef>().is_err());
    }

    #[test]
    fn test_from_ci_ref_variants() {
        let repo = RepoId::new("org", "substrate");
        for ci_ref in ["42", "pr-42", "PR-42", "refs/pull/42/head"] {
            let r = ChangesetRef::from_ci_ref(repo.clone(), ci_ref).unwrap();
            assert_eq!(r.number, 42, "ref {ci_ref}");
        }
        assert!(ChangesetRef::from_ci_ref(repo.clone(), "master").is_none());
        assert!(ChangesetRef::from_ci_ref(repo, "v1.0.0").is_none());
    }

    #[test]
    fn test_snapshot_remote_substitutes_placeholders() {
        let remote = SnapshotRemote::new("https://gitlab.example.com/{org}-mirrors/{repo}.git");
        let url = remote.url_for(&RepoId::new("org", "polkadot"));
        assert_eq!(url, "https://gitlab.example.com/org-mirrors/polkadot.git");
    }
}
