//! Working tree management through the `git` binary.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{CheckError, Result};
use crate::fingerprint::FingerprintSet;
use crate::model::RepoId;
use crate::process;

/// What to check out when materializing a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkout {
    Branch(String),
    /// Fetch `head_ref` and merge it into the tip of `base`.
    Changeset { head_ref: String, base: String },
    /// A detached commit.
    Revision(String),
}

/// A materialized working tree, exclusively owned by one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub repo: RepoId,
    pub path: PathBuf,
    /// Commit checked out after materialization.
    pub head: String,
}

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Clone `url` into `dest` and check out `checkout`.
    ///
    /// A failed speculative merge is [`CheckError::MergeConflict`].
    async fn materialize(
        &self,
        repo: &RepoId,
        url: &str,
        checkout: &Checkout,
        dest: &Path,
    ) -> Result<Worktree>;

    /// Fingerprints of the files tracked in `tree`.
    async fn tracked_files(&self, tree: &Path) -> Result<FingerprintSet>;

    /// Commit every change in `tree` and return the new head. A clean tree
    /// returns the current head.
    async fn commit_all(&self, tree: &Path, message: &str) -> Result<String>;

    /// Force-push the head of `tree` to `branch` on `remote_url`.
    async fn publish(&self, tree: &Path, remote_url: &str, branch: &str) -> Result<()>;
}

/// [`SourceControl`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    author_name: String,
    author_email: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("companion-check", "companion-check@localhost")
    }
}

impl GitCli {
    pub fn new(author_name: impl Into<String>, author_email: impl Into<String>) -> Self {
        Self {
            author_name: author_name.into(),
            author_email: author_email.into(),
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let name = format!("user.name={}", self.author_name);
        let email = format!("user.email={}", self.author_email);
        let mut full = vec!["-c", name.as_str(), "-c", email.as_str()];
        full.extend_from_slice(args);

        let out = process::run("git", &full, dir, &[])
            .await
            .map_err(|e| CheckError::Git(format!("failed to run git: {e}")))?;
        if !out.success {
            return Err(CheckError::Git(format!(
                "git {} failed in {}: {}",
                args.join(" "),
                dir.display(),
                out.stderr.trim()
            )));
        }
        Ok(out.stdout.trim().to_string())
    }

    async fn head(&self, dir: &Path) -> Result<String> {
        let sha = self.git(dir, &["rev-parse", "HEAD"]).await?;
        if sha.is_empty() {
            return Err(CheckError::Git(
                "git rev-parse HEAD returned empty output".to_string(),
            ));
        }
        Ok(sha)
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn materialize(
        &self,
        repo: &RepoId,
        url: &str,
        checkout: &Checkout,
        dest: &Path,
    ) -> Result<Worktree> {
        let parent = dest.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent)?;
        let dest_str = dest.to_string_lossy().to_string();
        debug!(%repo, ?checkout, dest = %dest.display(), "materializing");

        match checkout {
            Checkout::Branch(branch) => {
                self.git(parent, &["clone", "--quiet", "--branch", branch, url, &dest_str])
                    .await?;
            }
            Checkout::Changeset { head_ref, base } => {
                self.git(parent, &["clone", "--quiet", "--branch", base, url, &dest_str])
                    .await?;
                self.git(dest, &["fetch", "--quiet", "origin", head_ref]).await?;
                if let Err(e) = self.git(dest, &["merge", "--no-edit", "FETCH_HEAD"]).await {
                    warn!(%repo, head = %head_ref, %base, error = %e, "speculative merge failed");
                    let _ = self.git(dest, &["merge", "--abort"]).await;
                    return Err(CheckError::MergeConflict {
                        repo: repo.to_string(),
                        head: head_ref.clone(),
                        base: base.clone(),
                    });
                }
            }
            Checkout::Revision(sha) => {
                self.git(parent, &["clone", "--quiet", "--no-checkout", url, &dest_str])
                    .await?;
                self.git(dest, &["checkout", "--quiet", "--detach", sha]).await?;
            }
        }

        Ok(Worktree {
            repo: repo.clone(),
            path: dest.to_path_buf(),
            head: self.head(dest).await?,
        })
    }

    async fn tracked_files(&self, tree: &Path) -> Result<FingerprintSet> {
        let listing = self.git(tree, &["ls-files", "--stage"]).await?;
        FingerprintSet::from_ls_files(&listing)
    }

    async fn commit_all(&self, tree: &Path, message: &str) -> Result<String> {
        self.git(tree, &["add", "--all"]).await?;
        let status = self.git(tree, &["status", "--porcelain"]).await?;
        if !status.is_empty() {
            self.git(tree, &["commit", "--quiet", "-m", message]).await?;
        }
        self.head(tree).await
    }

    async fn publish(&self, tree: &Path, remote_url: &str, branch: &str) -> Result<()> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        self.git(tree, &["push", "--quiet", "--force", remote_url, &refspec])
            .await?;
        Ok(())
    }
}
