//! Workspace link audit.
//!
//! Checks that every crate below a directory is a member of the workspace
//! and that every dependency between workspace crates goes through `path`.
//! Git-sourced dependencies are reported as notices.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Serialize;
use toml::Value;

use crate::error::{CheckError, Result};
use crate::manifest::find_manifests;

const DEPENDENCY_KINDS: [&str; 3] = ["dependencies", "dev-dependencies", "build-dependencies"];

/// `from` depends on `to` (by package name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DependencyLink {
    pub from: String,
    pub to: String,
}

impl fmt::Display for DependencyLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditFinding {
    /// Declared workspace members and crate manifests disagree in number.
    MembersMismatch { members: usize, crates: usize },
    /// A link between workspace crates without `path`.
    BrokenLink(DependencyLink),
    /// A dependency fetched from git.
    GitLink(DependencyLink),
}

impl fmt::Display for AuditFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MembersMismatch { members, crates } => write!(
                f,
                "workspace lists {members} members but {crates} crates were found"
            ),
            Self::BrokenLink(link) => write!(f, "{link} does not use `path`"),
            Self::GitLink(link) => write!(f, "{link} uses git"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub workspace_members: usize,
    pub crates: Vec<String>,
    /// Every dependency on a workspace crate.
    pub links: Vec<DependencyLink>,
    pub git_links: Vec<DependencyLink>,
    pub broken: Vec<DependencyLink>,
}

impl AuditReport {
    pub fn is_ok(&self) -> bool {
        self.workspace_members == self.crates.len() && self.broken.is_empty()
    }

    /// Findings that fail the audit.
    pub fn problems(&self) -> Vec<AuditFinding> {
        let mut out = Vec::new();
        if self.workspace_members != self.crates.len() {
            out.push(AuditFinding::MembersMismatch {
                members: self.workspace_members,
                crates: self.crates.len(),
            });
        }
        out.extend(self.broken.iter().cloned().map(AuditFinding::BrokenLink));
        out
    }

    pub fn notices(&self) -> Vec<AuditFinding> {
        self.git_links
            .iter()
            .cloned()
            .map(AuditFinding::GitLink)
            .collect()
    }
}

struct CrateManifest {
    name: String,
    value: Value,
}

/// Audit the tree at `root`.
pub fn audit(root: &Path) -> Result<AuditReport> {
    let mut members = 0;
    let mut workspace_deps: Option<Value> = None;
    let mut crates = Vec::new();

    for path in find_manifests(root)? {
        let content = fs::read_to_string(&path)?;
        let value: Value = toml::from_str(&content).map_err(|e| CheckError::manifest(&path, e))?;

        if let Some(workspace) = value.get("workspace") {
            let dir = path.parent().unwrap_or(root);
            members += count_members(dir, workspace);
            workspace_deps = workspace.get("dependencies").cloned();
            continue;
        }

        let name = value
            .get("package")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| CheckError::manifest(&path, "missing package.name"))?
            .to_string();
        crates.push(CrateManifest { name, value });
    }

    let names: BTreeSet<&str> = crates.iter().map(|c| c.name.as_str()).collect();
    let mut report = AuditReport {
        workspace_members: members,
        ..AuditReport::default()
    };

    for krate in &crates {
        for kind in DEPENDENCY_KINDS {
            let Some(deps) = krate.value.get(kind).and_then(Value::as_table) else {
                continue;
            };
            for (key, spec) in deps {
                let package = spec
                    .get("package")
                    .and_then(Value::as_str)
                    .unwrap_or(key)
                    .to_string();
                let link = DependencyLink {
                    from: krate.name.clone(),
                    to: package,
                };
                if spec.get("git").is_some() {
                    report.git_links.push(link.clone());
                }
                if !names.contains(link.to.as_str()) {
                    continue;
                }
                if !has_path(key, spec, workspace_deps.as_ref()) {
                    report.broken.push(link.clone());
                }
                report.links.push(link);
            }
        }
    }

    report.crates = crates.into_iter().map(|c| c.name).collect();
    report.crates.sort();
    report.links.sort();
    report.broken.sort();
    Ok(report)
}

/// `workspace = true` entries inherit `path` from `[workspace.dependencies]`.
fn has_path(key: &str, spec: &Value, workspace_deps: Option<&Value>) -> bool {
    if spec.get("path").is_some() {
        return true;
    }
    let inherits = spec.get("workspace").and_then(Value::as_bool) == Some(true);
    inherits
        && workspace_deps
            .and_then(|deps| deps.get(key))
            .is_some_and(|entry| entry.get("path").is_some())
}

/// Member entries, expanding a trailing `/*` glob to the crate directories
/// it matches.
fn count_members(dir: &Path, workspace: &Value) -> usize {
    let Some(members) = workspace.get("members").and_then(Value::as_array) else {
        return 0;
    };
    members
        .iter()
        .filter_map(Value::as_str)
        .map(|member| match member.strip_suffix("/*") {
            Some(parent) => fs::read_dir(dir.join(parent))
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .filter(|e| e.path().join("Cargo.toml").is_file())
                        .count()
                })
                .unwrap_or(0),
            None => 1,
        })
        .sum()
}
