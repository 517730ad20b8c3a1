//! Runtime configuration.
//!
//! Values come from an optional TOML file; anything the file leaves out
//! falls back to the environment and then to built-in defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::branch::BranchOverrideTable;
use crate::dispatch::PollPolicy;
use crate::error::{CheckError, Result};
use crate::model::SnapshotRemote;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Organization every companion must belong to.
    pub organization: String,
    pub github_api_url: String,
    #[serde(skip_serializing)]
    pub github_token: Option<String>,
    pub gitlab_url: String,
    #[serde(skip_serializing)]
    pub gitlab_token: Option<String>,
    /// Pipeline project id or url-encoded path.
    pub gitlab_project: Option<String>,
    /// Snapshot remote template with `{org}` and `{repo}` placeholders.
    pub mirror_url: String,
    /// `repo name → branch pattern`, e.g. `polkadot = "release-v*"`.
    pub branch_overrides: BTreeMap<String, String>,
    pub poll_interval_secs: u64,
    pub poll_retries: u32,
    pub cache_dir: PathBuf,
    /// Audit every patched workspace and log findings.
    pub audit_workspaces: bool,
    pub git_author_name: String,
    pub git_author_email: String,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            organization: "paritytech".to_string(),
            github_api_url: "https://api.github.com".to_string(),
            github_token: std::env::var("GITHUB_TOKEN").ok(),
            gitlab_url: std::env::var("CBS_GITLAB_URL")
                .unwrap_or_else(|_| "https://gitlab.parity.io".to_string()),
            gitlab_token: std::env::var("GITLAB_TOKEN").ok(),
            gitlab_project: std::env::var("CBS_GITLAB_PROJECT").ok(),
            mirror_url: std::env::var("CBS_MIRROR_URL").unwrap_or_else(|_| {
                "https://gitlab.parity.io/parity/mirrors/{repo}.git".to_string()
            }),
            branch_overrides: BTreeMap::new(),
            poll_interval_secs: 30,
            poll_retries: 3,
            cache_dir: std::env::var("CBS_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".cbs-cache")),
            audit_workspaces: false,
            git_author_name: "companion-check".to_string(),
            git_author_email: "companion-check@localhost".to_string(),
        }
    }
}

impl CheckConfig {
    /// Defaults from the environment.
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Load `path` if given, otherwise [`Self::from_env`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = fs::read_to_string(path)?;
                Self::from_toml(&content)
                    .map_err(|e| CheckError::Config(format!("{}: {e}", path.display())))?
            }
            None => Self::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CheckError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.organization.trim().is_empty() {
            return Err(CheckError::Config("organization must not be empty".to_string()));
        }
        if !self.mirror_url.contains("{repo}") {
            return Err(CheckError::Config(format!(
                "mirror_url {:?} must contain a `{{repo}}` placeholder",
                self.mirror_url
            )));
        }
        self.override_table()?;
        Ok(())
    }

    pub fn override_table(&self) -> Result<BranchOverrideTable> {
        BranchOverrideTable::from_patterns(&self.branch_overrides)
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(self.poll_interval_secs),
            retries: self.poll_retries,
        }
    }

    pub fn snapshot_remote(&self) -> SnapshotRemote {
        SnapshotRemote::new(self.mirror_url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RepoId;

    #[test]
    fn test_toml_overrides_defaults() {
        let config = CheckConfig::from_toml(
            r#"
organization = "acme"
mirror_url = "https://git.example.com/mirrors/{org}-{repo}.git"
poll_interval_secs = 5

[branch_overrides]
polkadot = "release-v*"
substrate = "polkadot-v*"
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.organization, "acme");
        assert_eq!(config.poll_policy().interval, Duration::from_secs(5));
        assert_eq!(config.poll_policy().retries, 3);
        assert_eq!(
            config.snapshot_remote().url_for(&RepoId::new("acme", "polkadot")),
            "https://git.example.com/mirrors/acme-polkadot.git"
        );
        let table = config.override_table().unwrap();
        assert_eq!(
            table
                .correlate(
                    &RepoId::new("acme", "substrate"),
                    "polkadot-v0.9.42",
                    &RepoId::new("acme", "polkadot")
                )
                .as_deref(),
            Some("release-v0.9.42")
        );
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let config = CheckConfig::from_toml("[branch_overrides]\npolkadot = \"release\"\n").unwrap();
        assert!(matches!(config.validate(), Err(CheckError::Config(_))));
    }

    #[test]
    fn test_mirror_template_needs_repo_placeholder() {
        let config = CheckConfig::from_toml("mirror_url = \"https://example.com/fixed.git\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_reports_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cbs.toml");
        fs::write(&path, "poll_retries = \"many\"\n").unwrap();
        let err = CheckConfig::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("cbs.toml"));
    }
}
