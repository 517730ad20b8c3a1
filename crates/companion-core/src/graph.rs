//! Manifest dependency graph over the resolved repositories.
//!
//! An edge `A → B` means "B depends on A": A's snapshot must exist before B
//! is patched. Ordering uses Kahn's algorithm with sorted ties so the same
//! graph always yields the same chain.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{CheckError, Result};
use crate::model::RepoId;

/// Directed dependency graph over [`RepoId`]s.
///
/// Cycles are rejected at insertion time via DFS.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// `dependency → {dependent, ...}`
    downstream: BTreeMap<RepoId, BTreeSet<RepoId>>,
    /// `dependent → {dependency, ...}`
    upstream: BTreeMap<RepoId, BTreeSet<RepoId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repository. Idempotent.
    pub fn add_node(&mut self, repo: RepoId) {
        self.downstream.entry(repo.clone()).or_default();
        self.upstream.entry(repo).or_default();
    }

    pub fn contains(&self, repo: &RepoId) -> bool {
        self.downstream.contains_key(repo)
    }

    /// Record that `dependent` depends on `dependency`.
    ///
    /// Unknown repositories are registered. An edge closing a cycle is
    /// rolled back and reported as [`CheckError::UnresolvableDependency`]
    /// listing the cycle.
    pub fn add_dependency(&mut self, dependency: &RepoId, dependent: &RepoId) -> Result<()> {
        self.add_node(dependency.clone());
        self.add_node(dependent.clone());

        self.downstream
            .entry(dependency.clone())
            .or_default()
            .insert(dependent.clone());
        self.upstream
            .entry(dependent.clone())
            .or_default()
            .insert(dependency.clone());

        if let Some(cycle) = self.find_cycle_through(dependent) {
            if let Some(set) = self.downstream.get_mut(dependency) {
                set.remove(dependent);
            }
            if let Some(set) = self.upstream.get_mut(dependent) {
                set.remove(dependency);
            }
            return Err(CheckError::UnresolvableDependency {
                repos: cycle.iter().map(ToString::to_string).collect(),
            });
        }
        Ok(())
    }

    /// Direct dependencies of `repo`.
    pub fn dependencies_of(&self, repo: &RepoId) -> Vec<&RepoId> {
        self.upstream.get(repo).into_iter().flatten().collect()
    }

    /// Repositories in dependency-first order.
    pub fn topological_order(&self) -> Result<Vec<RepoId>> {
        let mut in_degree: BTreeMap<&RepoId, usize> = self
            .upstream
            .iter()
            .map(|(repo, deps)| (repo, deps.len()))
            .collect();

        // BTreeMap iteration keeps the initial wave sorted.
        let mut queue: VecDeque<&RepoId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&repo, _)| repo)
            .collect();

        let mut sorted = Vec::with_capacity(in_degree.len());
        while let Some(repo) = queue.pop_front() {
            sorted.push(repo.clone());
            let mut next = Vec::new();
            for dependent in self.downstream.get(repo).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_unstable();
            queue.extend(next);
        }

        if sorted.len() != self.downstream.len() {
            let placed: BTreeSet<&RepoId> = sorted.iter().collect();
            return Err(CheckError::UnresolvableDependency {
                repos: self
                    .downstream
                    .keys()
                    .filter(|r| !placed.contains(r))
                    .map(ToString::to_string)
                    .collect(),
            });
        }
        Ok(sorted)
    }

    fn find_cycle_through(&self, start: &RepoId) -> Option<Vec<RepoId>> {
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();
        if self.dfs_cycle(start, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs_cycle(
        &self,
        node: &RepoId,
        visited: &mut BTreeSet<RepoId>,
        path: &mut Vec<RepoId>,
    ) -> bool {
        if path.contains(node) {
            path.push(node.clone());
            return true;
        }
        if !visited.insert(node.clone()) {
            return false;
        }
        path.push(node.clone());
        for dependent in self.downstream.get(node).into_iter().flatten() {
            if self.dfs_cycle(dependent, visited, path) {
                return true;
            }
        }
        path.pop();
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(name: &str) -> RepoId {
        RepoId::new("org", name)
    }

    #[test]
    fn test_chain_orders_dependencies_first() {
        // C → B → A
        let mut g = DependencyGraph::new();
        g.add_dependency(&repo("b"), &repo("a")).unwrap();
        g.add_dependency(&repo("c"), &repo("b")).unwrap();
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec![repo("c"), repo("b"), repo("a")]);
    }

    #[test]
    fn test_independent_nodes_sorted() {
        let mut g = DependencyGraph::new();
        g.add_node(repo("zeta"));
        g.add_node(repo("alpha"));
        g.add_node(repo("mid"));
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec![repo("alpha"), repo("mid"), repo("zeta")]);
    }

    #[test]
    fn test_cycle_is_rejected_and_rolled_back() {
        let mut g = DependencyGraph::new();
        g.add_dependency(&repo("a"), &repo("b")).unwrap();
        let err = g.add_dependency(&repo("b"), &repo("a")).unwrap_err();
        match err {
            CheckError::UnresolvableDependency { repos } => {
                assert!(repos.contains(&"org/a".to_string()));
                assert!(repos.contains(&"org/b".to_string()));
            }
            other => panic!("expected unresolvable dependency, got {other:?}"),
        }
        assert!(g.topological_order().is_ok());
        assert!(g.dependencies_of(&repo("a")).is_empty());
    }

    #[test]
    fn test_diamond_respects_every_edge() {
        let mut g = DependencyGraph::new();
        g.add_dependency(&repo("base"), &repo("left")).unwrap();
        g.add_dependency(&repo("base"), &repo("right")).unwrap();
        g.add_dependency(&repo("left"), &repo("top")).unwrap();
        g.add_dependency(&repo("right"), &repo("top")).unwrap();
        let order = g.topological_order().unwrap();
        let pos = |name: &str| order.iter().position(|r| r == &repo(name)).unwrap();
        assert!(pos("base") < pos("left"));
        assert!(pos("base") < pos("right"));
        assert!(pos("left") < pos("top"));
        assert!(pos("right") < pos("top"));
        assert_eq!(g.dependencies_of(&repo("top")).len(), 2);
    }
}
