//! Builds the ordered chain of patched snapshots.
//!
//! Every node is processed after the nodes its manifests depend on. Its git
//! dependencies on already processed repositories are pinned to their
//! snapshots, the lock is re-resolved, unused `[patch]` entries are pruned
//! and the result is committed. The dependent under test always comes last.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::branch::{self, BranchChoice, BranchOverrideTable};
use crate::cargo::{LockTool, UrlRedirect};
use crate::error::{CheckError, Result};
use crate::fingerprint::FingerprintSet;
use crate::git::{Checkout, SourceControl};
use crate::graph::DependencyGraph;
use crate::host::CodeHost;
use crate::lockfile::Lockfile;
use crate::manifest;
use crate::model::{RepoId, SnapshotRemote};
use crate::resolver::{node_dir, ResolvedGraph};
use crate::workspace_audit;

/// One committed, immutable step of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedSnapshot {
    pub repo: RepoId,
    /// Commit produced by patching.
    pub sha: String,
    /// Tracked files before patching.
    pub fingerprints: FingerprintSet,
    /// Normalized URL dependents use to reference the repository.
    pub source_url: String,
    /// URL the snapshot is published to and pinned at.
    pub published_url: String,
    pub path: PathBuf,
}

/// The full chain, dependency first, dependent last.
#[derive(Debug, Clone)]
pub struct SnapshotChain {
    pub snapshots: Vec<PatchedSnapshot>,
    /// Raw `Cargo.lock` of the dependent before patching.
    pub dependent_lock: Option<String>,
    /// Set when the dependent had no companion and a branch was chosen.
    pub dependent_branch: Option<BranchChoice>,
}

impl SnapshotChain {
    pub fn dependent(&self) -> Option<&PatchedSnapshot> {
        self.snapshots.last()
    }

    /// Every snapshot except the dependent.
    pub fn dependencies(&self) -> &[PatchedSnapshot] {
        match self.snapshots.split_last() {
            Some((_, rest)) => rest,
            None => &[],
        }
    }
}

pub struct PatchSequencer {
    host: Arc<dyn CodeHost>,
    vcs: Arc<dyn SourceControl>,
    lock_tool: Arc<dyn LockTool>,
    remote: SnapshotRemote,
    overrides: BranchOverrideTable,
    audit_workspaces: bool,
}

impl PatchSequencer {
    pub fn new(
        host: Arc<dyn CodeHost>,
        vcs: Arc<dyn SourceControl>,
        lock_tool: Arc<dyn LockTool>,
        remote: SnapshotRemote,
        overrides: BranchOverrideTable,
    ) -> Self {
        Self {
            host,
            vcs,
            lock_tool,
            remote,
            overrides,
            audit_workspaces: false,
        }
    }

    /// Also audit each patched workspace; findings are logged as warnings.
    pub fn with_workspace_audit(mut self, enabled: bool) -> Self {
        self.audit_workspaces = enabled;
        self
    }

    #[instrument(skip(self, graph, workdir), fields(start = %graph.start.reference))]
    pub async fn sequence(
        &self,
        graph: &ResolvedGraph,
        dependent: &RepoId,
        workdir: &Path,
    ) -> Result<SnapshotChain> {
        let mut trees: BTreeMap<RepoId, PathBuf> = graph
            .nodes
            .iter()
            .map(|n| (n.repo.clone(), n.worktree.path.clone()))
            .collect();

        let dependent_branch = if trees.contains_key(dependent) {
            None
        } else {
            let choice = branch::choose_branch(
                self.host.as_ref(),
                &self.overrides,
                graph.start.repo(),
                &graph.start.base_branch,
                dependent,
                graph.branch_override_for(dependent),
            )
            .await?;
            let worktree = self
                .vcs
                .materialize(
                    dependent,
                    &self.host.clone_url(dependent),
                    &Checkout::Branch(choice.name().to_string()),
                    &node_dir(workdir, dependent),
                )
                .await?;
            trees.insert(dependent.clone(), worktree.path);
            Some(choice)
        };

        let order = self.patch_order(&trees, dependent)?;
        info!(
            order = ?order.iter().map(|(r, _)| r.to_string()).collect::<Vec<_>>(),
            "patch order"
        );

        let dependent_lock = Lockfile::read_raw(&trees[dependent])?;
        let mut snapshots: Vec<PatchedSnapshot> = Vec::with_capacity(order.len());
        for (repo, deps) in order {
            let snapshot = self.patch_node(&repo, &trees[&repo], &deps, &snapshots).await?;
            snapshots.push(snapshot);
        }

        Ok(SnapshotChain {
            snapshots,
            dependent_lock,
            dependent_branch,
        })
    }

    /// Dependency-first order over the dependent's transitive upstreams,
    /// each with its direct dependencies. The dependent comes last; nodes it
    /// does not depend on are left out of the chain.
    fn patch_order(
        &self,
        trees: &BTreeMap<RepoId, PathBuf>,
        dependent: &RepoId,
    ) -> Result<Vec<(RepoId, Vec<RepoId>)>> {
        let repos: Vec<RepoId> = trees.keys().cloned().collect();
        let mut upstream: BTreeMap<&RepoId, BTreeSet<RepoId>> = BTreeMap::new();
        for (repo, path) in trees {
            let others: Vec<RepoId> = repos.iter().filter(|r| *r != repo).cloned().collect();
            let deps = manifest::depended_repositories(path, &others)?;
            for dep in &deps {
                debug!(%repo, dependency = %dep, "manifest dependency");
            }
            upstream.insert(repo, deps);
        }

        let mut deps_graph = DependencyGraph::new();
        deps_graph.add_node(dependent.clone());
        let mut pending = vec![dependent.clone()];
        while let Some(repo) = pending.pop() {
            for dep in upstream.get(&repo).into_iter().flatten() {
                let discovered = !deps_graph.contains(dep);
                deps_graph.add_dependency(dep, &repo)?;
                if discovered {
                    pending.push(dep.clone());
                }
            }
        }
        for repo in repos.iter().filter(|r| !deps_graph.contains(r)) {
            debug!(%repo, %dependent, "not an upstream of the dependent; left out of the chain");
        }

        // Every other node is an ancestor of the dependent, so it sorts last.
        let order = deps_graph.topological_order()?;
        Ok(order
            .into_iter()
            .map(|repo| {
                let deps = deps_graph
                    .dependencies_of(&repo)
                    .into_iter()
                    .cloned()
                    .collect();
                (repo, deps)
            })
            .collect())
    }

    async fn patch_node(
        &self,
        repo: &RepoId,
        path: &Path,
        deps: &[RepoId],
        processed: &[PatchedSnapshot],
    ) -> Result<PatchedSnapshot> {
        let fingerprints = self.vcs.tracked_files(path).await?;

        let mut pinned_packages = BTreeSet::new();
        for dep in deps {
            let Some(snapshot) = processed.iter().find(|s| &s.repo == dep) else {
                continue;
            };
            let pins = manifest::pin_repository(path, dep, &snapshot.published_url, &snapshot.sha)?;
            let provided = manifest::crate_names(&snapshot.path)?;
            for pin in pins {
                if !provided.contains(&pin.package) {
                    return Err(CheckError::DanglingReference {
                        dependent: repo.to_string(),
                        krate: pin.package,
                        repository: dep.to_string(),
                        manifest: pin
                            .manifest
                            .strip_prefix(path)
                            .unwrap_or(pin.manifest.as_path())
                            .to_path_buf(),
                    });
                }
                pinned_packages.insert(pin.package);
            }
        }

        if !pinned_packages.is_empty() {
            self.relock(path, &pinned_packages, processed).await?;
        }

        if self.audit_workspaces {
            match workspace_audit::audit(path) {
                Ok(report) => {
                    for finding in report.problems() {
                        warn!(%repo, %finding, "workspace audit");
                    }
                }
                Err(e) => warn!(%repo, error = %e, "workspace audit failed"),
            }
        }

        let sha = self
            .vcs
            .commit_all(path, &format!("Pin {repo} dependencies to companion snapshots"))
            .await?;
        info!(%repo, %sha, pinned = pinned_packages.len(), "snapshot committed");

        Ok(PatchedSnapshot {
            repo: repo.clone(),
            sha,
            fingerprints,
            source_url: manifest::normalize_git_url(&self.host.clone_url(repo)),
            published_url: self.remote.url_for(repo),
            path: path.to_path_buf(),
        })
    }

    async fn relock(
        &self,
        path: &Path,
        pinned: &BTreeSet<String>,
        processed: &[PatchedSnapshot],
    ) -> Result<()> {
        let Some(lock) = Lockfile::load(path)? else {
            debug!(path = %path.display(), "no lock file to update");
            return Ok(());
        };
        let redirects: Vec<UrlRedirect> = processed
            .iter()
            .map(|s| UrlRedirect {
                url: s.published_url.clone(),
                local: s.path.clone(),
            })
            .collect();

        let packages: Vec<String> = pinned.iter().filter(|p| lock.contains(p)).cloned().collect();
        self.lock_tool
            .update_packages(path, &packages, &redirects)
            .await?;

        if let Some(lock) = Lockfile::load(path)? {
            if !lock.unused_patches.is_empty() {
                let pruned = manifest::prune_patches(path, &lock.unused_patches)?;
                debug!(path = %path.display(), pruned, "pruned unused patches");
                self.lock_tool.refresh(path, &redirects).await?;
            }
        }
        Ok(())
    }
}
