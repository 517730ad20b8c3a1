//! The companion check engine: resolve, sequence, dispatch, record.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::branch::BranchOverrideTable;
use crate::cache::{CacheKey, CacheRecord, CacheStore};
use crate::cargo::LockTool;
use crate::config::CheckConfig;
use crate::dispatch::{DispatchContext, PipelineDispatcher, PollPolicy, RunOutcome, TerminalStatus};
use crate::error::Result;
use crate::git::{Checkout, SourceControl};
use crate::host::{CodeHost, PipelineHost};
use crate::lockfile::Lockfile;
use crate::model::{Changeset, ChangesetRef, RepoId, SnapshotRemote};
use crate::resolver::{node_dir, CompanionResolver};
use crate::sequencer::{PatchSequencer, SnapshotChain};
use crate::skip_cache::{CurrentState, SkipCacheValidator, SkipDecision, StateProbe};

/// One invocation: check `dependent` against the change `source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    pub source: ChangesetRef,
    pub dependent: RepoId,
    /// Set when invoked for a companion of an outer check.
    pub nested_companion: Option<u64>,
    /// Repositories a parent run already validated.
    pub validated_repos: Vec<String>,
    /// The tree was patched by a parent run.
    pub pre_patched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// A parent run already validated the dependent.
    AlreadyValidated,
    /// The tree was already patched; nothing to sequence or dispatch.
    PrePatched,
    /// A cached run still covers the current state; its jobs were marked
    /// as passed.
    Cached { jobs: Vec<String> },
    Completed(RunOutcome),
}

impl CheckOutcome {
    /// False only for a finished run that did not succeed.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Completed(run) => run.status == TerminalStatus::Success,
            Self::AlreadyValidated | Self::PrePatched | Self::Cached { .. } => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipOutcome {
    /// Jobs marked as passed on the changeset's head.
    Skipped { jobs: Vec<String> },
    MustRun { reason: String },
}

pub struct CompanionCheck {
    host: Arc<dyn CodeHost>,
    vcs: Arc<dyn SourceControl>,
    pipelines: Arc<dyn PipelineHost>,
    lock_tool: Arc<dyn LockTool>,
    validator: SkipCacheValidator,
    organization: String,
    remote: SnapshotRemote,
    overrides: BranchOverrideTable,
    poll: PollPolicy,
    audit_workspaces: bool,
}

impl CompanionCheck {
    pub fn new(
        config: &CheckConfig,
        host: Arc<dyn CodeHost>,
        vcs: Arc<dyn SourceControl>,
        pipelines: Arc<dyn PipelineHost>,
        lock_tool: Arc<dyn LockTool>,
        store: Arc<dyn CacheStore>,
    ) -> Result<Self> {
        Ok(Self {
            host,
            vcs,
            pipelines,
            lock_tool,
            validator: SkipCacheValidator::new(store),
            organization: config.organization.clone(),
            remote: config.snapshot_remote(),
            overrides: config.override_table()?,
            poll: config.poll_policy(),
            audit_workspaces: config.audit_workspaces,
        })
    }

    fn workdir() -> Result<TempDir> {
        Ok(tempfile::Builder::new()
            .prefix(&format!("cbs-{}-", Uuid::new_v4()))
            .tempdir()?)
    }

    fn resolver(&self) -> CompanionResolver {
        CompanionResolver::new(self.host.clone(), self.vcs.clone(), self.organization.clone())
    }

    fn sequencer(&self) -> PatchSequencer {
        PatchSequencer::new(
            self.host.clone(),
            self.vcs.clone(),
            self.lock_tool.clone(),
            self.remote.clone(),
            self.overrides.clone(),
        )
        .with_workspace_audit(self.audit_workspaces)
    }

    /// Resolve and sequence without publishing. Working trees are removed
    /// before returning.
    pub async fn plan(&self, source: &ChangesetRef, dependent: &RepoId) -> Result<SnapshotChain> {
        let workdir = Self::workdir()?;
        let graph = self.resolver().resolve(source, workdir.path()).await?;
        self.sequencer().sequence(&graph, dependent, workdir.path()).await
    }

    #[instrument(skip(self, request), fields(source = %request.source, dependent = %request.dependent))]
    pub async fn run(&self, request: &CheckRequest) -> Result<CheckOutcome> {
        let dependent_name = request.dependent.to_string();
        if request.validated_repos.iter().any(|r| r.eq_ignore_ascii_case(&dependent_name)) {
            info!("dependent already validated by a parent run");
            return Ok(CheckOutcome::AlreadyValidated);
        }
        if request.pre_patched {
            info!("tree already patched by a parent run");
            return Ok(CheckOutcome::PrePatched);
        }

        let workdir = Self::workdir()?;
        info!(workdir = %workdir.path().display(), "starting companion check");

        let graph = self.resolver().resolve(&request.source, workdir.path()).await?;
        let companion = graph
            .node(&request.dependent)
            .and_then(|n| n.changeset())
            .cloned();

        if let Some(cs) = &companion {
            let key = CacheKey::new(&request.dependent, cs.reference.number);
            let probe = WorktreeProbe {
                host: self.host.clone(),
                vcs: self.vcs.clone(),
                changeset: cs.clone(),
                workdir: workdir.path().join("cache-probe"),
            };
            if let SkipDecision::Skip { jobs } = self.validator.validate(&key, &probe).await {
                let names = self.mark_passed(cs, &jobs).await?;
                return Ok(CheckOutcome::Cached { jobs: names });
            }
        }

        let chain = self
            .sequencer()
            .sequence(&graph, &request.dependent, workdir.path())
            .await?;

        let dispatcher = PipelineDispatcher::new(self.vcs.clone(), self.pipelines.clone(), self.poll);
        let context = DispatchContext {
            source: request.source.clone(),
            nested_companion: request.nested_companion,
            validated_repos: request.validated_repos.clone(),
        };
        let outcome = dispatcher.dispatch(&chain, &context).await?;

        if outcome.status == TerminalStatus::Success {
            match &companion {
                Some(cs) => {
                    let key = CacheKey::new(&request.dependent, cs.reference.number);
                    if let Err(e) = self.record(&key, &chain, &outcome).await {
                        warn!(%key, error = %e, "failed to write skip cache");
                    }
                }
                None => info!("dependent has no companion; nothing to cache"),
            }
        }
        Ok(CheckOutcome::Completed(outcome))
    }

    async fn record(&self, key: &CacheKey, chain: &SnapshotChain, outcome: &RunOutcome) -> Result<()> {
        let record = CacheRecord::from_chain(chain, &outcome.run.jobs_url)?;
        self.validator.record(key, &record).await
    }

    /// Skip path for `changeset`: compare against its cache record and, on a
    /// match, mark every cached job as passed. Mismatches are errors.
    #[instrument(skip(self, changeset), fields(changeset = %changeset))]
    pub async fn skip(&self, changeset: &ChangesetRef) -> Result<SkipOutcome> {
        let key = CacheKey::new(&changeset.repo, changeset.number);
        let cs = self.host.changeset(changeset).await?;
        let workdir = Self::workdir()?;
        let probe = WorktreeProbe {
            host: self.host.clone(),
            vcs: self.vcs.clone(),
            changeset: cs.clone(),
            workdir: workdir.path().to_path_buf(),
        };

        match self.validator.check(&key, &probe).await? {
            SkipDecision::MustRun { reason } => Ok(SkipOutcome::MustRun { reason }),
            SkipDecision::Skip { jobs } => {
                let names = self.mark_passed(&cs, &jobs).await?;
                Ok(SkipOutcome::Skipped { jobs: names })
            }
        }
    }

    /// Mark every job listed at `jobs_url` as passed on the head of `cs`.
    async fn mark_passed(&self, cs: &Changeset, jobs_url: &str) -> Result<Vec<String>> {
        let names = self.pipelines.job_names(jobs_url).await?;
        for job in &names {
            self.host
                .mark_job_passed(cs.repo(), &cs.head_sha, job, jobs_url)
                .await?;
        }
        info!(changeset = %cs.reference, count = names.len(), "marked cached jobs as passed");
        Ok(names)
    }
}

/// Materializes the current state of a changeset and of the dependency
/// commits its lock file points at.
struct WorktreeProbe {
    host: Arc<dyn CodeHost>,
    vcs: Arc<dyn SourceControl>,
    changeset: Changeset,
    workdir: PathBuf,
}

impl WorktreeProbe {
    async fn materialize(&self, repo: &RepoId, checkout: Checkout) -> Result<PathBuf> {
        let tree = self
            .vcs
            .materialize(repo, &self.host.clone_url(repo), &checkout, &node_dir(&self.workdir, repo))
            .await?;
        Ok(tree.path)
    }
}

#[async_trait]
impl StateProbe for WorktreeProbe {
    async fn capture(&self, record: &CacheRecord) -> Result<CurrentState> {
        let path = self
            .materialize(
                self.changeset.repo(),
                Checkout::Changeset {
                    head_ref: self.changeset.reference.head_ref(),
                    base: self.changeset.base_branch.clone(),
                },
            )
            .await?;
        let dependent = self.vcs.tracked_files(&path).await?;
        let lock = Lockfile::read_raw(&path)?;
        let parsed = lock.as_deref().map(Lockfile::parse).transpose()?;

        let mut state = CurrentState {
            dependent,
            lock,
            ..CurrentState::default()
        };
        for (prefix, cached) in &record.dependencies {
            let Some(sha) = parsed.as_ref().and_then(|l| l.commit_from(prefix)) else {
                continue;
            };
            let repo: RepoId = cached.repository.parse()?;
            let tree = self.materialize(&repo, Checkout::Revision(sha.to_string())).await?;
            state
                .dependencies
                .insert(prefix.clone(), self.vcs.tracked_files(&tree).await?);
        }
        Ok(state)
    }
}
