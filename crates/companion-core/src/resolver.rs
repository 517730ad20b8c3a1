//! Companion graph resolution.
//!
//! Starting from one changeset, descriptions are scanned for companion
//! references and every referenced changeset is fetched and materialized.
//! Discovery runs as a single loop over a work queue; a repository is marked
//! visited before its changeset is fetched, so each repository is fetched at
//! most once and mutually referencing changesets terminate.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::description;
use crate::error::{CheckError, Result};
use crate::git::{Checkout, SourceControl, Worktree};
use crate::host::CodeHost;
use crate::model::{Changeset, ChangesetRef, RepoId};

/// Where a node's tree comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSource {
    /// An open changeset, merged with the tip of its base branch.
    Changeset(Changeset),
    /// The companion was closed or merged; the default branch is used.
    DefaultBranch(String),
}

/// One repository in the resolved graph.
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub repo: RepoId,
    pub source: NodeSource,
    pub worktree: Worktree,
    /// Companion references found in this node's description.
    pub companions: Vec<ChangesetRef>,
}

impl ResolvedNode {
    pub fn changeset(&self) -> Option<&Changeset> {
        match &self.source {
            NodeSource::Changeset(cs) => Some(cs),
            NodeSource::DefaultBranch(_) => None,
        }
    }
}

/// Result of one resolution run, in discovery order (start first).
#[derive(Debug, Clone)]
pub struct ResolvedGraph {
    pub start: Changeset,
    pub nodes: Vec<ResolvedNode>,
    /// `repo name → branch` from `<repo> companion branch:` directives.
    pub branch_overrides: BTreeMap<String, String>,
}

impl ResolvedGraph {
    pub fn node(&self, repo: &RepoId) -> Option<&ResolvedNode> {
        self.nodes.iter().find(|n| &n.repo == repo)
    }

    pub fn repos(&self) -> Vec<&RepoId> {
        self.nodes.iter().map(|n| &n.repo).collect()
    }

    pub fn branch_override_for(&self, repo: &RepoId) -> Option<&str> {
        self.branch_overrides.get(&repo.name).map(String::as_str)
    }
}

/// State owned by a single resolution run.
#[derive(Default)]
struct ResolutionContext {
    visited: BTreeSet<RepoId>,
    nodes: Vec<ResolvedNode>,
    /// Indices into `nodes` whose descriptions still need scanning.
    queue: VecDeque<usize>,
}

impl ResolutionContext {
    fn add(&mut self, node: ResolvedNode, scan: bool) {
        self.nodes.push(node);
        if scan {
            self.queue.push_back(self.nodes.len() - 1);
        }
    }
}

/// Discovers the transitive set of companions of a changeset.
pub struct CompanionResolver {
    host: Arc<dyn CodeHost>,
    vcs: Arc<dyn SourceControl>,
    org: String,
}

impl CompanionResolver {
    /// `org` is the organization every companion must belong to.
    pub fn new(host: Arc<dyn CodeHost>, vcs: Arc<dyn SourceControl>, org: impl Into<String>) -> Self {
        Self {
            host,
            vcs,
            org: org.into().to_ascii_lowercase(),
        }
    }

    /// Resolve the graph rooted at `start`, materializing every node below
    /// `workdir`.
    #[instrument(skip(self, workdir), fields(start = %start))]
    pub async fn resolve(&self, start: &ChangesetRef, workdir: &Path) -> Result<ResolvedGraph> {
        let mut ctx = ResolutionContext::default();

        let start_cs = self.host.changeset(start).await?;
        ctx.visited.insert(start.repo.clone());
        let worktree = self.materialize_changeset(&start_cs, workdir).await?;
        ctx.add(
            ResolvedNode {
                repo: start.repo.clone(),
                source: NodeSource::Changeset(start_cs.clone()),
                worktree,
                companions: Vec::new(),
            },
            true,
        );

        while let Some(idx) = ctx.queue.pop_front() {
            let (repo, reference, body) = match &ctx.nodes[idx].source {
                NodeSource::Changeset(cs) => (cs.repo().clone(), cs.reference.clone(), cs.body.clone()),
                NodeSource::DefaultBranch(_) => continue,
            };

            for companion in description::companions(&body, &self.org, &reference)? {
                if companion.repo == repo {
                    debug!(%reference, %companion, "ignoring self reference");
                    continue;
                }
                ctx.nodes[idx].companions.push(companion.clone());
                if !ctx.visited.insert(companion.repo.clone()) {
                    debug!(%reference, %companion, "repository already visited");
                    continue;
                }
                self.visit(&mut ctx, &reference, &companion, workdir).await?;
            }
        }

        let mut branch_overrides = BTreeMap::new();
        for node in &ctx.nodes {
            let Some(cs) = node.changeset() else { continue };
            for directive in description::branch_overrides(&cs.body) {
                branch_overrides
                    .entry(directive.repo_name)
                    .or_insert(directive.branch);
            }
        }

        info!(
            repos = ?ctx.nodes.iter().map(|n| n.repo.to_string()).collect::<Vec<_>>(),
            overrides = branch_overrides.len(),
            "companion graph resolved"
        );

        Ok(ResolvedGraph {
            start: start_cs,
            nodes: ctx.nodes,
            branch_overrides,
        })
    }

    async fn visit(
        &self,
        ctx: &mut ResolutionContext,
        referrer: &ChangesetRef,
        companion: &ChangesetRef,
        workdir: &Path,
    ) -> Result<()> {
        let cs = self.host.changeset(companion).await?;

        if !cs.is_open() {
            let branch = self.host.default_branch(&companion.repo).await?;
            warn!(%referrer, %companion, %branch, "companion is not open; using default branch");
            let worktree = self
                .vcs
                .materialize(
                    &companion.repo,
                    &self.host.clone_url(&companion.repo),
                    &Checkout::Branch(branch.clone()),
                    &node_dir(workdir, &companion.repo),
                )
                .await?;
            ctx.add(
                ResolvedNode {
                    repo: companion.repo.clone(),
                    source: NodeSource::DefaultBranch(branch),
                    worktree,
                    companions: Vec::new(),
                },
                false,
            );
            return Ok(());
        }

        if cs.mergeable == Some(false) {
            return Err(CheckError::UnmergeableCompanion {
                changeset: companion.to_string(),
                base: cs.base_branch.clone(),
            });
        }

        info!(%referrer, %companion, base = %cs.base_branch, "found companion");
        let worktree = self.materialize_changeset(&cs, workdir).await?;
        ctx.add(
            ResolvedNode {
                repo: companion.repo.clone(),
                source: NodeSource::Changeset(cs),
                worktree,
                companions: Vec::new(),
            },
            true,
        );
        Ok(())
    }

    async fn materialize_changeset(&self, cs: &Changeset, workdir: &Path) -> Result<Worktree> {
        self.vcs
            .materialize(
                cs.repo(),
                &self.host.clone_url(cs.repo()),
                &Checkout::Changeset {
                    head_ref: cs.reference.head_ref(),
                    base: cs.base_branch.clone(),
                },
                &node_dir(workdir, cs.repo()),
            )
            .await
    }
}

/// Working tree location of `repo` inside `workdir`.
pub fn node_dir(workdir: &Path, repo: &RepoId) -> PathBuf {
    workdir.join(format!("{}-{}", repo.org, repo.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemoryCodeHost, MemorySourceControl};

    fn cs(repo: &str, number: u64, body: &str) -> Changeset {
        crate::fakes::changeset(RepoId::new("org", repo), number, "master", body)
    }

    fn resolver(host: MemoryCodeHost) -> (Arc<MemoryCodeHost>, CompanionResolver) {
        let host = Arc::new(host);
        let vcs = Arc::new(MemorySourceControl::new());
        let resolver = CompanionResolver::new(host.clone(), vcs, "org");
        (host, resolver)
    }

    #[tokio::test]
    async fn test_visits_each_distinct_companion_once() {
        let host = MemoryCodeHost::new();
        host.add_changeset(cs(
            "a",
            1,
            "companion: org/b#2\ncompanion: c#3\nb companion: https://github.com/org/b/pull/2",
        ));
        host.add_changeset(cs("b", 2, ""));
        host.add_changeset(cs("c", 3, ""));
        let (host, resolver) = resolver(host);

        let dir = tempfile::tempdir().unwrap();
        let graph = resolver
            .resolve(&ChangesetRef::new(RepoId::new("org", "a"), 1), dir.path())
            .await
            .unwrap();
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(host.fetch_count(&RepoId::new("org", "b")), 1);
    }

    #[tokio::test]
    async fn test_mutual_references_terminate() {
        let host = MemoryCodeHost::new();
        host.add_changeset(cs("a", 1, "companion: b#2"));
        host.add_changeset(cs("b", 2, "companion: a#1"));
        let (host, resolver) = resolver(host);

        let dir = tempfile::tempdir().unwrap();
        let graph = resolver
            .resolve(&ChangesetRef::new(RepoId::new("org", "a"), 1), dir.path())
            .await
            .unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(host.fetch_count(&RepoId::new("org", "a")), 1);
        assert_eq!(graph.nodes[1].companions.len(), 1);
    }

    #[tokio::test]
    async fn test_self_reference_is_ignored() {
        let host = MemoryCodeHost::new();
        host.add_changeset(cs("a", 1, "companion: a#7"));
        let (_host, resolver) = resolver(host);
        let dir = tempfile::tempdir().unwrap();
        let graph = resolver
            .resolve(&ChangesetRef::new(RepoId::new("org", "a"), 1), dir.path())
            .await
            .unwrap();
        assert_eq!(graph.nodes.len(), 1);
        assert!(graph.nodes[0].companions.is_empty());
    }

    #[tokio::test]
    async fn test_closed_companion_uses_default_branch() {
        let host = MemoryCodeHost::new();
        host.add_changeset(cs("a", 1, "companion: b#2"));
        let mut closed = cs("b", 2, "companion: c#3");
        closed.state = crate::model::ChangesetState::Merged;
        host.add_changeset(closed);
        host.set_default_branch(&RepoId::new("org", "b"), "main");
        let (host, resolver) = resolver(host);

        let dir = tempfile::tempdir().unwrap();
        let graph = resolver
            .resolve(&ChangesetRef::new(RepoId::new("org", "a"), 1), dir.path())
            .await
            .unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(
            graph.nodes[1].source,
            NodeSource::DefaultBranch("main".to_string())
        );
        assert_eq!(host.fetch_count(&RepoId::new("org", "c")), 0);
    }

    #[tokio::test]
    async fn test_unmergeable_companion_is_fatal() {
        let host = MemoryCodeHost::new();
        host.add_changeset(cs("a", 1, "companion: b#2"));
        let mut b = cs("b", 2, "");
        b.mergeable = Some(false);
        host.add_changeset(b);
        let (_host, resolver) = resolver(host);

        let dir = tempfile::tempdir().unwrap();
        let err = resolver
            .resolve(&ChangesetRef::new(RepoId::new("org", "a"), 1), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::UnmergeableCompanion { ref changeset, .. } if changeset == "org/b#2"));
    }

    #[tokio::test]
    async fn test_foreign_org_is_malformed() {
        let host = MemoryCodeHost::new();
        host.add_changeset(cs("a", 1, "companion: https://github.com/other/b/pull/2"));
        let (_host, resolver) = resolver(host);
        let dir = tempfile::tempdir().unwrap();
        let err = resolver
            .resolve(&ChangesetRef::new(RepoId::new("org", "a"), 1), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::MalformedReference { .. }));
    }

    #[tokio::test]
    async fn test_collects_branch_overrides_from_every_node() {
        let host = MemoryCodeHost::new();
        host.add_changeset(cs("a", 1, "companion: b#2\ncumulus companion branch: rel-v1"));
        host.add_changeset(cs("b", 2, "polkadot companion branch: rel-v2"));
        let (_host, resolver) = resolver(host);
        let dir = tempfile::tempdir().unwrap();
        let graph = resolver
            .resolve(&ChangesetRef::new(RepoId::new("org", "a"), 1), dir.path())
            .await
            .unwrap();
        assert_eq!(graph.branch_override_for(&RepoId::new("org", "cumulus")), Some("rel-v1"));
        assert_eq!(graph.branch_override_for(&RepoId::new("org", "polkadot")), Some("rel-v2"));
    }
}
