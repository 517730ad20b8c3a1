//! Narrow contracts for the version-control host and the pipeline host.
//!
//! Implement these traits to plug in real forge APIs or test stubs (see
//! [`crate::fakes`]). Implementations are expected to retry transient
//! failures themselves and surface [`crate::CheckError::RemoteUnavailable`]
//! once their budget is spent.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::branch::BranchPattern;
use crate::error::Result;
use crate::model::{Changeset, ChangesetRef, RepoId};

/// A branch and the time of its latest commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub updated_at: DateTime<Utc>,
}

/// Version-control host: changesets, branches and commit statuses.
#[async_trait]
pub trait CodeHost: Send + Sync {
    /// Fetch a changeset, or [`crate::CheckError::ChangesetNotFound`].
    async fn changeset(&self, reference: &ChangesetRef) -> Result<Changeset>;

    async fn default_branch(&self, repo: &RepoId) -> Result<String>;

    async fn branch_exists(&self, repo: &RepoId, branch: &str) -> Result<bool>;

    /// Branches of `repo` whose name matches `pattern`.
    async fn matching_branches(
        &self,
        repo: &RepoId,
        pattern: &BranchPattern,
    ) -> Result<Vec<BranchInfo>>;

    /// Fetchable URL of `repo`.
    fn clone_url(&self, repo: &RepoId) -> String;

    /// Report `job` as already passed on commit `sha` of `repo`.
    async fn mark_job_passed(
        &self,
        repo: &RepoId,
        sha: &str,
        job: &str,
        details_url: &str,
    ) -> Result<()>;
}

/// Parameters for creating a remote run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Branch (in the pipeline project) to run against.
    pub branch: String,
    pub variables: BTreeMap<String, String>,
}

/// Identifies a created remote run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub project_id: u64,
    pub run_id: u64,
    pub web_url: Option<String>,
    /// API location of the run's job listing.
    pub jobs_url: String,
}

/// Status values reported by the pipeline host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Canceled,
    Skipped,
    /// Any non-terminal state (`created`, `pending`, `running`, ...).
    Running(String),
}

impl RunStatus {
    pub fn from_api(status: &str) -> Self {
        match status {
            "success" => Self::Success,
            "failed" => Self::Failed,
            "canceled" | "cancelled" => Self::Canceled,
            "skipped" => Self::Skipped,
            other => Self::Running(other.to_string()),
        }
    }
}

/// Pipeline host: creates runs and reports their status.
#[async_trait]
pub trait PipelineHost: Send + Sync {
    async fn create_run(&self, request: &RunRequest) -> Result<RunHandle>;

    async fn run_status(&self, run: &RunHandle) -> Result<RunStatus>;

    /// Names of the jobs listed at `jobs_url`.
    async fn job_names(&self, jobs_url: &str) -> Result<Vec<String>>;
}
