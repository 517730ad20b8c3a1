//! `Cargo.lock` parsing.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CheckError, Result};
use crate::manifest::normalize_git_url;

/// One resolved package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockedPackage {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub source: Option<String>,
}

impl LockedPackage {
    /// `(name, version, source)` with an empty source for local packages.
    pub fn triple(&self) -> (String, String, String) {
        (
            self.name.clone(),
            self.version.clone(),
            self.source.clone().unwrap_or_default(),
        )
    }

    /// True when the package is fetched from the git repository at
    /// `repo_url`. Query and fragment are ignored; the repository must match
    /// exactly.
    pub fn is_from(&self, repo_url: &str) -> bool {
        self.source
            .as_deref()
            .is_some_and(|source| normalize_git_url(source) == normalize_git_url(repo_url))
    }

    /// Commit a git-sourced package is locked to (the `#<sha>` fragment).
    pub fn commit(&self) -> Option<&str> {
        self.source
            .as_deref()
            .filter(|s| s.starts_with("git+"))
            .and_then(|s| s.rsplit_once('#'))
            .map(|(_, sha)| sha)
            .filter(|sha| !sha.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawPatch {
    #[serde(default)]
    unused: Vec<LockedPackage>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLock {
    #[serde(default)]
    package: Vec<LockedPackage>,
    #[serde(default)]
    patch: RawPatch,
}

/// A parsed lock file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lockfile {
    pub packages: Vec<LockedPackage>,
    /// Entries Cargo reports under `[[patch.unused]]`.
    pub unused_patches: Vec<LockedPackage>,
}

impl Lockfile {
    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawLock =
            toml::from_str(content).map_err(|e| CheckError::manifest("Cargo.lock", e))?;
        Ok(Self {
            packages: raw.package,
            unused_patches: raw.patch.unused,
        })
    }

    /// Raw content of `<root>/Cargo.lock`, if present.
    pub fn read_raw(root: &Path) -> Result<Option<String>> {
        let path = root.join("Cargo.lock");
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    /// Load `<root>/Cargo.lock`, or `None` when the tree has no lock file.
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let Some(content) = Self::read_raw(root)? else {
            return Ok(None);
        };
        let path = root.join("Cargo.lock");
        Self::parse(&content).map(Some).map_err(|e| match e {
            CheckError::Manifest { reason, .. } => CheckError::manifest(&path, reason),
            other => other,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.iter().any(|p| p.name == name)
    }

    /// Commit of the first package sourced from `repo_url`.
    pub fn commit_from(&self, repo_url: &str) -> Option<&str> {
        self.packages
            .iter()
            .filter(|p| p.is_from(repo_url))
            .find_map(LockedPackage::commit)
    }

    /// `(name, version, source)` triples of packages not sourced from any of
    /// `excluded_repos`.
    pub fn triples_excluding(&self, excluded_repos: &[&str]) -> BTreeSet<(String, String, String)> {
        self.packages
            .iter()
            .filter(|p| !excluded_repos.iter().any(|url| p.is_from(url)))
            .map(LockedPackage::triple)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCK: &str = r#"
version = 3

[[package]]
name = "serde"
version = "1.0.190"
source = "registry+https://github.com/rust-lang/crates.io-index"

[[package]]
name = "sp-io"
version = "23.0.0"
source = "git+https://github.com/org/substrate?branch=master#abc123"

[[package]]
name = "polkadot-runtime"
version = "1.0.0"

[[patch.unused]]
name = "sp-core"
version = "21.0.0"
source = "git+https://github.com/org/substrate?branch=master#abc123"
"#;

    #[test]
    fn test_parse_packages_and_unused_patches() {
        let lock = Lockfile::parse(LOCK).unwrap();
        assert_eq!(lock.packages.len(), 3);
        assert!(lock.contains("sp-io"));
        assert_eq!(lock.unused_patches.len(), 1);
        assert_eq!(lock.unused_patches[0].name, "sp-core");
    }

    #[test]
    fn test_is_from_normalizes_urls() {
        let lock = Lockfile::parse(LOCK).unwrap();
        let sp_io = &lock.packages[1];
        assert!(sp_io.is_from("https://github.com/Org/substrate.git"));
        assert!(!sp_io.is_from("https://github.com/org/polkadot"));
        assert!(!lock.packages[2].is_from("https://github.com/org/substrate"));
    }

    #[test]
    fn test_triples_excluding_companion_sources() {
        let lock = Lockfile::parse(LOCK).unwrap();
        let triples = lock.triples_excluding(&["https://github.com/org/substrate"]);
        assert_eq!(triples.len(), 2);
        assert!(triples.iter().all(|(name, _, _)| name != "sp-io"));
        assert!(triples.contains(&(
            "polkadot-runtime".to_string(),
            "1.0.0".to_string(),
            String::new()
        )));
    }

    #[test]
    fn test_commit_from_git_source() {
        let lock = Lockfile::parse(LOCK).unwrap();
        assert_eq!(lock.packages[1].commit(), Some("abc123"));
        assert_eq!(lock.packages[0].commit(), None);
        assert_eq!(lock.commit_from("https://github.com/org/substrate"), Some("abc123"));
        assert_eq!(lock.commit_from("https://github.com/org/cumulus"), None);
    }

    #[test]
    fn test_repository_names_sharing_a_prefix_stay_distinct() {
        let lock = Lockfile::parse(
            r#"
[[package]]
name = "sdk-io"
version = "1.0.0"
source = "git+https://github.com/org/polkadot-sdk?branch=master#sdk111"

[[package]]
name = "pd-rt"
version = "1.0.0"
source = "git+https://github.com/org/polkadot?branch=master#pd222"
"#,
        )
        .unwrap();
        assert_eq!(lock.commit_from("https://github.com/org/polkadot"), Some("pd222"));
        assert_eq!(lock.commit_from("https://github.com/org/polkadot-sdk"), Some("sdk111"));

        let left = lock.triples_excluding(&["https://github.com/org/polkadot"]);
        assert_eq!(left.len(), 1);
        assert!(left.iter().all(|(name, _, _)| name == "sdk-io"));
    }

    #[test]
    fn test_load_missing_lock_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Lockfile::load(dir.path()).unwrap().is_none());
    }
}
