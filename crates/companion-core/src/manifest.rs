//! Cargo manifest scanning and patching.
//!
//! Manifests are edited with `toml_edit` so that formatting and comments in
//! the patched trees survive. Dependency tables are visited uniformly:
//! `[dependencies]`, `[dev-dependencies]`, `[build-dependencies]`, their
//! `[target.<cfg>.*]` variants, `[workspace.dependencies]` and every
//! `[patch.<source>]` table.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use toml_edit::{DocumentMut, Item, TableLike};
use tracing::debug;

use crate::error::{CheckError, Result};
use crate::lockfile::LockedPackage;
use crate::model::RepoId;

const DEPENDENCY_KINDS: [&str; 3] = ["dependencies", "dev-dependencies", "build-dependencies"];

/// A dependency entry that is fetched from a git repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitDependency {
    pub manifest: PathBuf,
    /// Dotted table name, e.g. `dependencies` or `target.'cfg(unix)'.dependencies`.
    pub section: String,
    /// Key in the table (the local alias).
    pub key: String,
    /// Name of the crate in its source repository (honors `package = ...`).
    pub package: String,
    pub url: String,
}

/// A dependency reference rewritten to a pinned snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedReference {
    pub manifest: PathBuf,
    pub package: String,
}

/// Every `Cargo.toml` below `root`, skipping `target` and `.git`, sorted.
pub fn find_manifests(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    collect_manifests(root, &mut found)?;
    found.sort();
    Ok(found)
}

fn collect_manifests(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let name = entry.file_name();
        if file_type.is_dir() {
            if name == "target" || name == ".git" {
                continue;
            }
            collect_manifests(&entry.path(), out)?;
        } else if file_type.is_file() && name == "Cargo.toml" {
            out.push(entry.path());
        }
    }
    Ok(())
}

fn load(path: &Path) -> Result<DocumentMut> {
    fs::read_to_string(path)?
        .parse::<DocumentMut>()
        .map_err(|e| CheckError::manifest(path, e))
}

fn save(path: &Path, doc: &DocumentMut) -> Result<()> {
    fs::write(path, doc.to_string())?;
    Ok(())
}

/// Lower-case, without `git+`, query, fragment, `.git` or trailing slash.
pub fn normalize_git_url(url: &str) -> String {
    let url = url.trim();
    let url = url.strip_prefix("git+").unwrap_or(url);
    let url = url.split(['?', '#']).next().unwrap_or(url);
    url.trim_end_matches('/')
        .trim_end_matches(".git")
        .to_ascii_lowercase()
}

/// The `org/name` a git URL points at (its last two path segments).
pub fn repo_from_git_url(url: &str) -> Option<RepoId> {
    let normalized = normalize_git_url(url);
    let path = match normalized.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, path)| path.to_string())?,
        // scp-like `git@host:org/repo`
        None => normalized.split_once(':').map(|(_, path)| path.to_string())?,
    };
    let mut segments = path.rsplit('/').filter(|s| !s.is_empty());
    let name = segments.next()?;
    let org = segments.next()?;
    Some(RepoId::new(org, name))
}

fn visit_dependency_tables(doc: &mut DocumentMut, visit: &mut dyn FnMut(&str, &mut dyn TableLike)) {
    for (key, item) in doc.as_table_mut().iter_mut() {
        let key = key.get().to_string();
        match key.as_str() {
            kind if DEPENDENCY_KINDS.contains(&kind) => {
                if let Some(table) = item.as_table_like_mut() {
                    visit(&key, table);
                }
            }
            "workspace" => {
                if let Some(table) = item
                    .as_table_like_mut()
                    .and_then(|ws| ws.get_mut("dependencies"))
                    .and_then(|deps| deps.as_table_like_mut())
                {
                    visit("workspace.dependencies", table);
                }
            }
            "target" => {
                let Some(targets) = item.as_table_like_mut() else {
                    continue;
                };
                for (cfg, cfg_item) in targets.iter_mut() {
                    let cfg = cfg.get().to_string();
                    let Some(kinds) = cfg_item.as_table_like_mut() else {
                        continue;
                    };
                    for (kind, deps) in kinds.iter_mut() {
                        let kind = kind.get().to_string();
                        if !DEPENDENCY_KINDS.contains(&kind.as_str()) {
                            continue;
                        }
                        if let Some(table) = deps.as_table_like_mut() {
                            visit(&format!("target.'{cfg}'.{kind}"), table);
                        }
                    }
                }
            }
            "patch" => {
                let Some(sources) = item.as_table_like_mut() else {
                    continue;
                };
                for (source, deps) in sources.iter_mut() {
                    let source = source.get().to_string();
                    if let Some(table) = deps.as_table_like_mut() {
                        visit(&format!("patch.'{source}'"), table);
                    }
                }
            }
            _ => {}
        }
    }
}

fn entry_package(key: &str, entry: &dyn TableLike) -> String {
    entry
        .get("package")
        .and_then(|p| p.as_str())
        .unwrap_or(key)
        .to_string()
}

/// All git-sourced dependency entries in the tree at `root`.
pub fn git_dependencies(root: &Path) -> Result<Vec<GitDependency>> {
    let mut found = Vec::new();
    for manifest in find_manifests(root)? {
        let mut doc = load(&manifest)?;
        visit_dependency_tables(&mut doc, &mut |section, table| {
            for (key, entry) in table.iter() {
                let Some(entry) = entry.as_table_like() else {
                    continue;
                };
                let Some(url) = entry.get("git").and_then(|g| g.as_str()) else {
                    continue;
                };
                found.push(GitDependency {
                    manifest: manifest.clone(),
                    section: section.to_string(),
                    key: key.to_string(),
                    package: entry_package(key, entry),
                    url: url.to_string(),
                });
            }
        });
    }
    Ok(found)
}

/// Which of `candidates` the tree at `root` depends on through git entries.
pub fn depended_repositories(root: &Path, candidates: &[RepoId]) -> Result<BTreeSet<RepoId>> {
    let wanted: BTreeSet<&RepoId> = candidates.iter().collect();
    Ok(git_dependencies(root)?
        .into_iter()
        .filter_map(|dep| repo_from_git_url(&dep.url))
        .filter(|repo| wanted.contains(repo))
        .collect())
}

/// Rewrite every git entry pointing at `repo` to `url` pinned at `rev`.
///
/// `branch` and `tag` keys are dropped so the pin is unambiguous. Returns
/// the rewritten references.
pub fn pin_repository(root: &Path, repo: &RepoId, url: &str, rev: &str) -> Result<Vec<PinnedReference>> {
    let mut pinned = Vec::new();
    for manifest in find_manifests(root)? {
        let mut doc = load(&manifest)?;
        let mut changed = Vec::new();
        visit_dependency_tables(&mut doc, &mut |_, table| {
            for (key, entry) in table.iter_mut() {
                let Some(entry) = entry.as_table_like_mut() else {
                    continue;
                };
                let points_at_repo = entry
                    .get("git")
                    .and_then(|g| g.as_str())
                    .and_then(repo_from_git_url)
                    .is_some_and(|r| &r == repo);
                if !points_at_repo {
                    continue;
                }
                entry.insert("git", toml_edit::value(url));
                entry.insert("rev", toml_edit::value(rev));
                entry.remove("branch");
                entry.remove("tag");
                changed.push(entry_package(key.get(), &*entry));
            }
        });
        if changed.is_empty() {
            continue;
        }
        debug!(manifest = %manifest.display(), count = changed.len(), %repo, "pinned references");
        save(&manifest, &doc)?;
        pinned.extend(changed.into_iter().map(|package| PinnedReference {
            manifest: manifest.clone(),
            package,
        }));
    }
    Ok(pinned)
}

/// Names of all packages defined in the tree at `root`.
pub fn crate_names(root: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for manifest in find_manifests(root)? {
        let doc = load(&manifest)?;
        if let Some(name) = doc
            .get("package")
            .and_then(|p| p.get("name"))
            .and_then(Item::as_str)
        {
            names.insert(name.to_string());
        }
    }
    Ok(names)
}

/// Remove `[patch.*]` entries for the packages Cargo reports as unused.
///
/// Returns the number of entries removed.
pub fn prune_patches(root: &Path, unused: &[LockedPackage]) -> Result<usize> {
    let unused: BTreeSet<&str> = unused.iter().map(|p| p.name.as_str()).collect();
    if unused.is_empty() {
        return Ok(0);
    }
    let mut removed_total = 0;
    for manifest in find_manifests(root)? {
        let mut doc = load(&manifest)?;
        let mut removed = 0;
        visit_dependency_tables(&mut doc, &mut |section, table| {
            if !section.starts_with("patch.") {
                return;
            }
            let stale: Vec<String> = table
                .iter()
                .filter(|(key, entry)| {
                    let package = entry
                        .as_table_like()
                        .map_or_else(|| key.to_string(), |e| entry_package(key, e));
                    unused.contains(package.as_str())
                })
                .map(|(key, _)| key.to_string())
                .collect();
            for key in stale {
                table.remove(&key);
                removed += 1;
            }
        });
        if removed > 0 {
            debug!(manifest = %manifest.display(), removed, "pruned unused patches");
            save(&manifest, &doc)?;
            removed_total += removed;
        }
    }
    Ok(removed_total)
}
