//! Publishing the snapshot chain and driving the remote run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{CheckError, Result};
use crate::git::SourceControl;
use crate::host::{PipelineHost, RunHandle, RunRequest, RunStatus};
use crate::model::ChangesetRef;
use crate::sequencer::SnapshotChain;

/// Run variable listing repositories already validated by this run.
pub const VALIDATED_REPOS_VAR: &str = "CBS_VALIDATED_REPOS";
/// Run variable marking a tree that is already patched.
pub const PRE_PATCHED_VAR: &str = "CBS_PRE_PATCHED";

/// Deterministic branch for a check of `source`, optionally nested under a
/// companion changeset number.
pub fn branch_name(source: &ChangesetRef, nested_companion: Option<u64>) -> String {
    match nested_companion {
        Some(n) => format!("cbs/{}/PR-{}/{}", source.repo.name, source.number, n),
        None => format!("cbs/{}/PR-{}", source.repo.name, source.number),
    }
}

/// How status polling behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Consecutive failed status fetches tolerated before giving up.
    pub retries: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            retries: 3,
        }
    }
}

/// Who asked for the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchContext {
    pub source: ChangesetRef,
    pub nested_companion: Option<u64>,
    /// Repositories a parent run already validated.
    pub validated_repos: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: TerminalStatus,
    pub run: RunHandle,
    pub branch: String,
}

pub struct PipelineDispatcher {
    vcs: Arc<dyn SourceControl>,
    pipelines: Arc<dyn PipelineHost>,
    policy: PollPolicy,
}

impl PipelineDispatcher {
    pub fn new(vcs: Arc<dyn SourceControl>, pipelines: Arc<dyn PipelineHost>, policy: PollPolicy) -> Self {
        Self {
            vcs,
            pipelines,
            policy,
        }
    }

    /// Publish every snapshot dependency-first, start a run against the
    /// dependent and wait for a terminal status.
    #[instrument(skip(self, chain), fields(source = %context.source))]
    pub async fn dispatch(&self, chain: &SnapshotChain, context: &DispatchContext) -> Result<RunOutcome> {
        let branch = branch_name(&context.source, context.nested_companion);

        for snapshot in &chain.snapshots {
            info!(repo = %snapshot.repo, sha = %snapshot.sha, remote = %snapshot.published_url, %branch, "publishing snapshot");
            self.vcs
                .publish(&snapshot.path, &snapshot.published_url, &branch)
                .await?;
        }

        let request = RunRequest {
            branch: branch.clone(),
            variables: run_variables(chain, context),
        };
        let run = self.pipelines.create_run(&request).await?;
        info!(
            run_id = run.run_id,
            project_id = run.project_id,
            url = run.web_url.as_deref().unwrap_or("-"),
            "pipeline created"
        );

        let status = self.wait(&run).await?;
        info!(run_id = run.run_id, ?status, "pipeline finished");
        Ok(RunOutcome { status, run, branch })
    }

    /// Poll until the run reaches a terminal status.
    ///
    /// Failed fetches are retried silently up to the policy's budget; any
    /// successful fetch resets the count. There is no overall deadline.
    pub async fn wait(&self, run: &RunHandle) -> Result<TerminalStatus> {
        let mut failures = 0u32;
        loop {
            tokio::time::sleep(self.policy.interval).await;
            match self.pipelines.run_status(run).await {
                Ok(RunStatus::Success) => return Ok(TerminalStatus::Success),
                Ok(RunStatus::Failed | RunStatus::Skipped) => return Ok(TerminalStatus::Failed),
                Ok(RunStatus::Canceled) => return Ok(TerminalStatus::Cancelled),
                Ok(RunStatus::Running(state)) => {
                    failures = 0;
                    debug!(run_id = run.run_id, %state, "pipeline still running");
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.policy.retries {
                        warn!(run_id = run.run_id, attempts = failures, error = %e, "giving up on pipeline status");
                        return Err(CheckError::PollingUnavailable {
                            pipeline: run.run_id,
                            attempts: failures,
                            detail: e.to_string(),
                        });
                    }
                    debug!(run_id = run.run_id, attempt = failures, error = %e, "status fetch failed");
                }
            }
        }
    }
}

fn run_variables(chain: &SnapshotChain, context: &DispatchContext) -> BTreeMap<String, String> {
    let validated: BTreeSet<String> = context
        .validated_repos
        .iter()
        .cloned()
        .chain(chain.snapshots.iter().map(|s| s.repo.to_string()))
        .collect();
    BTreeMap::from([
        (
            VALIDATED_REPOS_VAR.to_string(),
            validated.into_iter().collect::<Vec<_>>().join(" "),
        ),
        (PRE_PATCHED_VAR.to_string(), "1".to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemoryPipelineHost, MemorySourceControl};
    use crate::fingerprint::FingerprintSet;
    use crate::model::RepoId;
    use crate::sequencer::PatchedSnapshot;

    fn snapshot(name: &str) -> PatchedSnapshot {
        PatchedSnapshot {
            repo: RepoId::new("org", name),
            sha: format!("{name}-sha"),
            fingerprints: FingerprintSet::default(),
            source_url: format!("https://github.com/org/{name}"),
            published_url: format!("https://mirror/{name}.git"),
            path: std::path::PathBuf::from(format!("/work/org-{name}")),
        }
    }

    fn chain() -> SnapshotChain {
        SnapshotChain {
            snapshots: vec![snapshot("c"), snapshot("b"), snapshot("a")],
            dependent_lock: None,
            dependent_branch: None,
        }
    }

    fn context() -> DispatchContext {
        DispatchContext {
            source: ChangesetRef::new(RepoId::new("org", "substrate"), 42),
            nested_companion: None,
            validated_repos: vec!["org/polkadot".to_string()],
        }
    }

    fn dispatcher(
        pipelines: Arc<MemoryPipelineHost>,
        vcs: Arc<MemorySourceControl>,
    ) -> PipelineDispatcher {
        PipelineDispatcher::new(vcs, pipelines, PollPolicy::default())
    }

    #[test]
    fn test_branch_names_are_distinct_per_changeset() {
        let source = ChangesetRef::new(RepoId::new("org", "substrate"), 42);
        assert_eq!(branch_name(&source, None), "cbs/substrate/PR-42");
        assert_eq!(branch_name(&source, Some(7)), "cbs/substrate/PR-42/7");
        let other = ChangesetRef::new(RepoId::new("org", "substrate"), 43);
        assert_ne!(branch_name(&source, None), branch_name(&other, None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_dependency_first_and_passes_variables() {
        let pipelines = Arc::new(MemoryPipelineHost::new());
        pipelines.push_status(RunStatus::Running("pending".to_string()));
        pipelines.push_status(RunStatus::Success);
        let vcs = Arc::new(MemorySourceControl::new());

        let outcome = dispatcher(pipelines.clone(), vcs.clone())
            .dispatch(&chain(), &context())
            .await
            .unwrap();
        assert_eq!(outcome.status, TerminalStatus::Success);

        let pushed: Vec<String> = vcs.pushes().into_iter().map(|p| p.remote_url).collect();
        assert_eq!(
            pushed,
            vec!["https://mirror/c.git", "https://mirror/b.git", "https://mirror/a.git"]
        );
        let request = &pipelines.requests()[0];
        assert_eq!(request.branch, "cbs/substrate/PR-42");
        assert_eq!(request.variables[PRE_PATCHED_VAR], "1");
        assert_eq!(
            request.variables[VALIDATED_REPOS_VAR],
            "org/a org/b org/c org/polkadot"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_status_mapping() {
        for (status, expected) in [
            (RunStatus::Failed, TerminalStatus::Failed),
            (RunStatus::Skipped, TerminalStatus::Failed),
            (RunStatus::Canceled, TerminalStatus::Cancelled),
        ] {
            let pipelines = Arc::new(MemoryPipelineHost::new());
            pipelines.push_status(status);
            let outcome = dispatcher(pipelines, Arc::new(MemorySourceControl::new()))
                .dispatch(&chain(), &context())
                .await
                .unwrap();
            assert_eq!(outcome.status, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_below_budget_are_silent() {
        let pipelines = Arc::new(MemoryPipelineHost::new());
        for _ in 0..3 {
            pipelines.push_failure("502 bad gateway");
        }
        pipelines.push_status(RunStatus::Success);
        let outcome = dispatcher(pipelines, Arc::new(MemorySourceControl::new()))
            .dispatch(&chain(), &context())
            .await
            .unwrap();
        assert_eq!(outcome.status, TerminalStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_past_budget_are_fatal() {
        let pipelines = Arc::new(MemoryPipelineHost::new());
        for _ in 0..4 {
            pipelines.push_failure("connection reset");
        }
        let err = dispatcher(pipelines, Arc::new(MemorySourceControl::new()))
            .dispatch(&chain(), &context())
            .await
            .unwrap_err();
        match err {
            CheckError::PollingUnavailable { attempts, detail, .. } => {
                assert_eq!(attempts, 4);
                assert!(detail.contains("connection reset"));
            }
            other => panic!("expected polling unavailable, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_resets_failure_count() {
        let pipelines = Arc::new(MemoryPipelineHost::new());
        for _ in 0..3 {
            pipelines.push_failure("timeout");
        }
        pipelines.push_status(RunStatus::Running("running".to_string()));
        for _ in 0..3 {
            pipelines.push_failure("timeout");
        }
        pipelines.push_status(RunStatus::Success);
        let outcome = dispatcher(pipelines, Arc::new(MemorySourceControl::new()))
            .dispatch(&chain(), &context())
            .await
            .unwrap();
        assert_eq!(outcome.status, TerminalStatus::Success);
    }
}
