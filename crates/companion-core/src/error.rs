//! Error types for companion resolution, sequencing, dispatch and caching.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the companion check engine.
#[derive(Debug, Error)]
pub enum CheckError {
    /// A companion line matched the keyword but not the expected shape, or
    /// pointed outside the expected organization.
    #[error("malformed companion reference in {changeset}: {line:?} ({reason})")]
    MalformedReference {
        changeset: String,
        line: String,
        reason: String,
    },

    /// The referenced changeset (or the start changeset) does not exist.
    #[error("changeset not found: {changeset}")]
    ChangesetNotFound { changeset: String },

    /// The host reports that a companion cannot be merged into its base.
    #[error("companion {changeset} is not mergeable into {base}; resolve its conflicts first")]
    UnmergeableCompanion { changeset: String, base: String },

    /// Speculative merge of a changeset with its base branch failed.
    #[error("merging {head} into {base} failed in {repo}; resolve the conflict manually")]
    MergeConflict {
        repo: String,
        head: String,
        base: String,
    },

    /// The patched tree references a crate that its source repository no
    /// longer provides.
    #[error(
        "{manifest} in {dependent} references crate `{krate}` which no longer exists in \
         {repository}; open or update a {dependent} companion for this change"
    )]
    DanglingReference {
        dependent: String,
        krate: String,
        repository: String,
        manifest: PathBuf,
    },

    /// Manifest dependencies between the dependent and its upstreams form a
    /// cycle.
    #[error("unresolvable dependency order between repos: {repos:?}")]
    UnresolvableDependency { repos: Vec<String> },

    /// An explicitly requested branch does not exist in the repository.
    #[error("branch `{branch}` does not exist in {repo}")]
    MissingTargetBranch { repo: String, branch: String },

    /// A remote service kept failing past the retry budget.
    #[error("{service} unavailable after {attempts} attempts: {detail}")]
    RemoteUnavailable {
        service: String,
        attempts: u32,
        detail: String,
    },

    /// Pipeline status polling kept failing past the retry budget.
    #[error("status of pipeline {pipeline} unavailable after {attempts} attempts: {detail}")]
    PollingUnavailable {
        pipeline: u64,
        attempts: u32,
        detail: String,
    },

    /// Recorded fingerprints disagree with the current state.
    #[error("cache mismatch for {scope}: {detail}")]
    CacheMismatch { scope: String, detail: String },

    /// A `git` invocation failed.
    #[error("git error: {0}")]
    Git(String),

    /// A `cargo` invocation failed.
    #[error("cargo error: {0}")]
    Cargo(String),

    /// A manifest or lock file could not be parsed or rewritten.
    #[error("manifest error in {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckError {
    /// Build a [`CheckError::Manifest`] for `path`.
    pub fn manifest(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Manifest {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, CheckError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_conflict_names_both_refs() {
        let err = CheckError::MergeConflict {
            repo: "paritytech/polkadot".to_string(),
            head: "pull/42/head".to_string(),
            base: "master".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pull/42/head"));
        assert!(msg.contains("master"));
        assert!(msg.contains("paritytech/polkadot"));
    }

    #[test]
    fn test_dangling_reference_carries_hint() {
        let err = CheckError::DanglingReference {
            dependent: "org/polkadot".to_string(),
            krate: "sp-io".to_string(),
            repository: "org/substrate".to_string(),
            manifest: PathBuf::from("runtime/Cargo.toml"),
        };
        let msg = err.to_string();
        assert!(msg.contains("sp-io"));
        assert!(msg.contains("runtime/Cargo.toml"));
        assert!(msg.contains("companion"));
    }

    #[test]
    fn test_cache_mismatch_displays_scope() {
        let err = CheckError::CacheMismatch {
            scope: "dependent org/polkadot".to_string(),
            detail: "`x` recorded as 100644 h1 but is now 100644 h2".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("org/polkadot"));
        assert!(msg.contains("h1"));
        assert!(msg.contains("h2"));
    }
}
