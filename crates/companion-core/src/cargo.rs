//! Lock file re-resolution through `cargo update`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{CheckError, Result};
use crate::process;

/// Serve fetches of `url` from the local repository at `local`.
///
/// Snapshots are pinned to their mirror URL before they are published, so
/// lock resolution during sequencing reads them from the working trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRedirect {
    pub url: String,
    pub local: PathBuf,
}

/// Re-resolves `Cargo.lock` after manifests were patched.
#[async_trait]
pub trait LockTool: Send + Sync {
    /// Update only `packages` to the newest versions the manifests allow.
    async fn update_packages(
        &self,
        root: &Path,
        packages: &[String],
        redirects: &[UrlRedirect],
    ) -> Result<()>;

    /// Re-resolve the workspace members without touching other packages.
    async fn refresh(&self, root: &Path, redirects: &[UrlRedirect]) -> Result<()>;
}

/// Environment making cargo fetch through the git CLI with `insteadOf`
/// rewrites for every redirect.
pub fn redirect_env(redirects: &[UrlRedirect]) -> Vec<(String, String)> {
    let mut env = vec![
        ("CARGO_NET_GIT_FETCH_WITH_CLI".to_string(), "true".to_string()),
        ("GIT_CONFIG_COUNT".to_string(), redirects.len().to_string()),
    ];
    for (idx, redirect) in redirects.iter().enumerate() {
        env.push((
            format!("GIT_CONFIG_KEY_{idx}"),
            format!("url.file://{}.insteadOf", redirect.local.display()),
        ));
        env.push((format!("GIT_CONFIG_VALUE_{idx}"), redirect.url.clone()));
    }
    env
}

/// [`LockTool`] backed by the `cargo` binary.
#[derive(Debug, Clone)]
pub struct CargoCli {
    program: String,
}

impl Default for CargoCli {
    fn default() -> Self {
        Self {
            program: "cargo".to_string(),
        }
    }
}

impl CargoCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn cargo(&self, root: &Path, args: &[&str], redirects: &[UrlRedirect]) -> Result<()> {
        debug!(root = %root.display(), ?args, "running cargo");
        let out = process::run(&self.program, args, root, &redirect_env(redirects))
            .await
            .map_err(|e| CheckError::Cargo(format!("failed to run {}: {e}", self.program)))?;
        if !out.success {
            return Err(CheckError::Cargo(format!(
                "`cargo {}` failed in {}: {}",
                args.join(" "),
                root.display(),
                out.stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LockTool for CargoCli {
    async fn update_packages(
        &self,
        root: &Path,
        packages: &[String],
        redirects: &[UrlRedirect],
    ) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let mut args = vec!["update"];
        for package in packages {
            args.push("-p");
            args.push(package);
        }
        self.cargo(root, &args, redirects).await
    }

    async fn refresh(&self, root: &Path, redirects: &[UrlRedirect]) -> Result<()> {
        self.cargo(root, &["update", "--workspace"], redirects).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_env_numbers_each_rewrite() {
        let env = redirect_env(&[
            UrlRedirect {
                url: "https://mirror/substrate.git".to_string(),
                local: PathBuf::from("/tmp/w/org-substrate"),
            },
            UrlRedirect {
                url: "https://mirror/cumulus.git".to_string(),
                local: PathBuf::from("/tmp/w/org-cumulus"),
            },
        ]);
        assert!(env.contains(&("GIT_CONFIG_COUNT".to_string(), "2".to_string())));
        assert!(env.contains(&(
            "GIT_CONFIG_KEY_1".to_string(),
            "url.file:///tmp/w/org-cumulus.insteadOf".to_string()
        )));
        assert!(env.contains(&(
            "GIT_CONFIG_VALUE_0".to_string(),
            "https://mirror/substrate.git".to_string()
        )));
    }

    #[tokio::test]
    async fn test_update_with_no_packages_is_noop() {
        let cargo = CargoCli::new("/nonexistent/cargo");
        let dir = tempfile::tempdir().unwrap();
        cargo.update_packages(dir.path(), &[], &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_is_cargo_error() {
        let cargo = CargoCli::new("/nonexistent/cargo");
        let dir = tempfile::tempdir().unwrap();
        let err = cargo.refresh(dir.path(), &[]).await.unwrap_err();
        assert!(matches!(err, CheckError::Cargo(_)));
    }
}
