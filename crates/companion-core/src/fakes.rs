//! In-memory fakes for the collaborator traits (testing only).
//!
//! Trees are plain directories written from registered file lists; commit
//! ids are SHA-256 digests of the tree's fingerprint listing, so identical
//! content always yields the same id.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::branch::BranchPattern;
use crate::cache::{CacheKey, CacheRecord, CacheStore};
use crate::cargo::{LockTool, UrlRedirect};
use crate::error::{CheckError, Result};
use crate::fingerprint::{fingerprint_directory, FingerprintSet};
use crate::git::{Checkout, SourceControl, Worktree};
use crate::host::{BranchInfo, CodeHost, PipelineHost, RunHandle, RunRequest, RunStatus};
use crate::model::{Changeset, ChangesetRef, ChangesetState, RepoId};
use crate::skip_cache::{CurrentState, StateProbe};

/// An open, mergeable changeset targeting `base`.
pub fn changeset(repo: RepoId, number: u64, base: &str, body: &str) -> Changeset {
    Changeset {
        head_sha: format!("{}-{}-head", repo.name, number),
        reference: ChangesetRef::new(repo, number),
        base_branch: base.to_string(),
        body: body.to_string(),
        state: ChangesetState::Open,
        mergeable: Some(true),
    }
}

// ---------------------------------------------------------------------------
// MemoryCodeHost
// ---------------------------------------------------------------------------

/// A job reported as passed through [`CodeHost::mark_job_passed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassedJob {
    pub repo: RepoId,
    pub sha: String,
    pub job: String,
    pub details_url: String,
}

#[derive(Debug, Default)]
pub struct MemoryCodeHost {
    changesets: Mutex<BTreeMap<ChangesetRef, Changeset>>,
    default_branches: Mutex<BTreeMap<RepoId, String>>,
    branches: Mutex<BTreeMap<RepoId, Vec<BranchInfo>>>,
    fetches: Mutex<BTreeMap<RepoId, usize>>,
    passed: Mutex<Vec<PassedJob>>,
}

impl MemoryCodeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_changeset(&self, changeset: Changeset) {
        self.changesets
            .lock()
            .unwrap()
            .insert(changeset.reference.clone(), changeset);
    }

    pub fn set_default_branch(&self, repo: &RepoId, branch: &str) {
        self.default_branches
            .lock()
            .unwrap()
            .insert(repo.clone(), branch.to_string());
    }

    pub fn add_branch(&self, repo: &RepoId, name: &str, updated_at: DateTime<Utc>) {
        self.branches
            .lock()
            .unwrap()
            .entry(repo.clone())
            .or_default()
            .push(BranchInfo {
                name: name.to_string(),
                updated_at,
            });
    }

    /// How often changesets of `repo` were fetched.
    pub fn fetch_count(&self, repo: &RepoId) -> usize {
        self.fetches.lock().unwrap().get(repo).copied().unwrap_or(0)
    }

    pub fn passed_jobs(&self) -> Vec<PassedJob> {
        self.passed.lock().unwrap().clone()
    }

    fn default_for(&self, repo: &RepoId) -> String {
        self.default_branches
            .lock()
            .unwrap()
            .get(repo)
            .cloned()
            .unwrap_or_else(|| "master".to_string())
    }
}

#[async_trait]
impl CodeHost for MemoryCodeHost {
    async fn changeset(&self, reference: &ChangesetRef) -> Result<Changeset> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(reference.repo.clone())
            .or_default() += 1;
        self.changesets
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| CheckError::ChangesetNotFound {
                changeset: reference.to_string(),
            })
    }

    async fn default_branch(&self, repo: &RepoId) -> Result<String> {
        Ok(self.default_for(repo))
    }

    async fn branch_exists(&self, repo: &RepoId, branch: &str) -> Result<bool> {
        if self.default_for(repo) == branch {
            return Ok(true);
        }
        Ok(self
            .branches
            .lock()
            .unwrap()
            .get(repo)
            .is_some_and(|branches| branches.iter().any(|b| b.name == branch)))
    }

    async fn matching_branches(
        &self,
        repo: &RepoId,
        pattern: &BranchPattern,
    ) -> Result<Vec<BranchInfo>> {
        Ok(self
            .branches
            .lock()
            .unwrap()
            .get(repo)
            .into_iter()
            .flatten()
            .filter(|b| pattern.matches(&b.name))
            .cloned()
            .collect())
    }

    fn clone_url(&self, repo: &RepoId) -> String {
        format!("https://github.com/{}/{}.git", repo.org, repo.name)
    }

    async fn mark_job_passed(
        &self,
        repo: &RepoId,
        sha: &str,
        job: &str,
        details_url: &str,
    ) -> Result<()> {
        self.passed.lock().unwrap().push(PassedJob {
            repo: repo.clone(),
            sha: sha.to_string(),
            job: job.to_string(),
            details_url: details_url.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySourceControl
// ---------------------------------------------------------------------------

/// A push recorded by [`SourceControl::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRecord {
    pub path: PathBuf,
    pub remote_url: String,
    pub branch: String,
}

type TreeFiles = Vec<(String, Vec<u8>)>;

/// Source control over registered file lists.
///
/// Changeset trees are registered under their head ref, branch trees under
/// the branch name. Unregistered trees materialize empty.
#[derive(Debug, Default)]
pub struct MemorySourceControl {
    trees: Mutex<BTreeMap<(RepoId, String), TreeFiles>>,
    conflicts: Mutex<BTreeSet<(RepoId, String)>>,
    commits: Mutex<BTreeMap<String, TreeFiles>>,
    pushes: Mutex<Vec<PushRecord>>,
}

impl MemorySourceControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_tree(&self, repo: &RepoId, label: String, files: &[(&str, &str)]) {
        let files = files
            .iter()
            .map(|(path, content)| (path.to_string(), content.as_bytes().to_vec()))
            .collect();
        self.trees.lock().unwrap().insert((repo.clone(), label), files);
    }

    /// Tree of changeset `number` merged with its base.
    pub fn add_changeset_tree(&self, repo: &RepoId, number: u64, files: &[(&str, &str)]) {
        self.add_tree(repo, ChangesetRef::new(repo.clone(), number).head_ref(), files);
    }

    pub fn add_branch_tree(&self, repo: &RepoId, branch: &str, files: &[(&str, &str)]) {
        self.add_tree(repo, branch.to_string(), files);
    }

    /// Make merging changeset `number` fail.
    pub fn add_conflict(&self, repo: &RepoId, number: u64) {
        self.conflicts
            .lock()
            .unwrap()
            .insert((repo.clone(), ChangesetRef::new(repo.clone(), number).head_ref()));
    }

    pub fn pushes(&self) -> Vec<PushRecord> {
        self.pushes.lock().unwrap().clone()
    }

    /// Snapshot `tree` and return its commit id.
    fn snapshot(&self, tree: &Path) -> Result<String> {
        let listing = fingerprint_directory(tree)?;
        let sha = hex::encode(Sha256::digest(listing.to_listing().as_bytes()));
        let mut files = Vec::with_capacity(listing.len());
        for file in listing.files() {
            files.push((file.path.clone(), fs::read(tree.join(&file.path))?));
        }
        self.commits.lock().unwrap().insert(sha.clone(), files);
        Ok(sha)
    }
}

#[async_trait]
impl SourceControl for MemorySourceControl {
    async fn materialize(
        &self,
        repo: &RepoId,
        _url: &str,
        checkout: &Checkout,
        dest: &Path,
    ) -> Result<Worktree> {
        let files = match checkout {
            Checkout::Branch(branch) => self
                .trees
                .lock()
                .unwrap()
                .get(&(repo.clone(), branch.clone()))
                .cloned()
                .unwrap_or_default(),
            Checkout::Changeset { head_ref, base } => {
                let key = (repo.clone(), head_ref.clone());
                if self.conflicts.lock().unwrap().contains(&key) {
                    return Err(CheckError::MergeConflict {
                        repo: repo.to_string(),
                        head: head_ref.clone(),
                        base: base.clone(),
                    });
                }
                self.trees.lock().unwrap().get(&key).cloned().unwrap_or_default()
            }
            Checkout::Revision(sha) => self
                .commits
                .lock()
                .unwrap()
                .get(sha)
                .cloned()
                .ok_or_else(|| CheckError::Git(format!("unknown revision {sha} in {repo}")))?,
        };

        if dest.exists() {
            fs::remove_dir_all(dest)?;
        }
        fs::create_dir_all(dest)?;
        for (path, content) in files {
            let full = dest.join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(full, content)?;
        }

        Ok(Worktree {
            repo: repo.clone(),
            path: dest.to_path_buf(),
            head: self.snapshot(dest)?,
        })
    }

    async fn tracked_files(&self, tree: &Path) -> Result<FingerprintSet> {
        fingerprint_directory(tree)
    }

    async fn commit_all(&self, tree: &Path, _message: &str) -> Result<String> {
        self.snapshot(tree)
    }

    async fn publish(&self, tree: &Path, remote_url: &str, branch: &str) -> Result<()> {
        self.pushes.lock().unwrap().push(PushRecord {
            path: tree.to_path_buf(),
            remote_url: remote_url.to_string(),
            branch: branch.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryPipelineHost
// ---------------------------------------------------------------------------

/// Pipeline host answering status polls from a script.
///
/// Once the script is exhausted every poll fails.
#[derive(Debug, Default)]
pub struct MemoryPipelineHost {
    statuses: Mutex<VecDeque<std::result::Result<RunStatus, String>>>,
    requests: Mutex<Vec<RunRequest>>,
    jobs: Mutex<BTreeMap<String, Vec<String>>>,
}

impl MemoryPipelineHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_status(&self, status: RunStatus) {
        self.statuses.lock().unwrap().push_back(Ok(status));
    }

    pub fn push_failure(&self, detail: &str) {
        self.statuses
            .lock()
            .unwrap()
            .push_back(Err(detail.to_string()));
    }

    pub fn set_jobs(&self, jobs_url: &str, names: &[&str]) {
        self.jobs.lock().unwrap().insert(
            jobs_url.to_string(),
            names.iter().map(ToString::to_string).collect(),
        );
    }

    pub fn requests(&self) -> Vec<RunRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Jobs url of the run created `n`-th (1-based).
    pub fn jobs_url_for(run_id: u64) -> String {
        format!("https://ci.example.com/api/v4/projects/1/pipelines/{run_id}/jobs")
    }
}

#[async_trait]
impl PipelineHost for MemoryPipelineHost {
    async fn create_run(&self, request: &RunRequest) -> Result<RunHandle> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        let run_id = requests.len() as u64;
        Ok(RunHandle {
            project_id: 1,
            run_id,
            web_url: Some(format!("https://ci.example.com/pipelines/{run_id}")),
            jobs_url: Self::jobs_url_for(run_id),
        })
    }

    async fn run_status(&self, run: &RunHandle) -> Result<RunStatus> {
        match self.statuses.lock().unwrap().pop_front() {
            Some(Ok(status)) => Ok(status),
            Some(Err(detail)) => Err(CheckError::RemoteUnavailable {
                service: format!("pipeline {}", run.run_id),
                attempts: 1,
                detail,
            }),
            None => Err(CheckError::RemoteUnavailable {
                service: format!("pipeline {}", run.run_id),
                attempts: 1,
                detail: "no scripted status left".to_string(),
            }),
        }
    }

    async fn job_names(&self, jobs_url: &str) -> Result<Vec<String>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .get(jobs_url)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// NoopLockTool
// ---------------------------------------------------------------------------

/// Records lock updates without touching the trees.
#[derive(Debug, Default)]
pub struct NoopLockTool {
    updates: Mutex<Vec<(PathBuf, Vec<String>)>>,
    refreshes: Mutex<Vec<PathBuf>>,
}

impl NoopLockTool {
    pub fn updates(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn refreshes(&self) -> Vec<PathBuf> {
        self.refreshes.lock().unwrap().clone()
    }
}

#[async_trait]
impl LockTool for NoopLockTool {
    async fn update_packages(
        &self,
        root: &Path,
        packages: &[String],
        _redirects: &[UrlRedirect],
    ) -> Result<()> {
        self.updates
            .lock()
            .unwrap()
            .push((root.to_path_buf(), packages.to_vec()));
        Ok(())
    }

    async fn refresh(&self, root: &Path, _redirects: &[UrlRedirect]) -> Result<()> {
        self.refreshes.lock().unwrap().push(root.to_path_buf());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryCacheStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<BTreeMap<CacheKey, Vec<u8>>>,
    unavailable: bool,
}

impl MemoryCacheStore {
    /// A store whose every read and write fails.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn record(&self, key: &CacheKey) -> Option<CacheRecord> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .and_then(|bytes| CacheRecord::from_json(bytes).ok())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(CheckError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "cache store unavailable",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &CacheKey, value: &[u8]) -> Result<()> {
        self.check_available()?;
        self.entries
            .lock()
            .unwrap()
            .insert(key.clone(), value.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FixedStateProbe
// ---------------------------------------------------------------------------

/// Returns the same state for every record.
#[derive(Debug, Clone, Default)]
pub struct FixedStateProbe {
    state: CurrentState,
}

impl FixedStateProbe {
    pub fn new(state: CurrentState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl StateProbe for FixedStateProbe {
    async fn capture(&self, _record: &CacheRecord) -> Result<CurrentState> {
        Ok(self.state.clone())
    }
}
