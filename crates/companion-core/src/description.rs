//! Tagged-line classification of changeset descriptions.
//!
//! Every line of a description is classified exactly once into a
//! [`DescriptionLine`]. Downstream code consumes the typed result and never
//! re-parses text.
//!
//! Recognized forms (keyword case-insensitive, optional `<repo> ` prefix and
//! list bullet):
//!
//! ```text
//! companion: https://github.com/org/repo/pull/123
//! polkadot companion: org/polkadot#123
//! companion: polkadot#123
//! polkadot companion branch: release-v1.2
//! ```

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{CheckError, Result};
use crate::model::{ChangesetRef, RepoId};

/// A request to build `repo` against `branch` when no companion exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchOverride {
    pub repo_name: String,
    pub branch: String,
}

/// One classified description line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptionLine {
    Companion(ChangesetRef),
    BranchOverride(BranchOverride),
    PlainText,
}

fn override_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:[-*+]\s+)?([\w.-]+)\s+companion\s+branch\s*:\s*(\S+)\s*$")
            .expect("branch override pattern compiles")
    })
}

fn keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:[-*+]\s+)?(?:[\w.-]+\s+)?companion\s*:\s*(.*?)\s*$")
            .expect("companion keyword pattern compiles")
    })
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^<?https?://[^/\s]+/([\w.-]+)/([\w.-]+)/pulls?/(\d+)/?>?$")
            .expect("companion url pattern compiles")
    })
}

fn short_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:([\w.-]+)/)?([\w.-]+)#(\d+)$").expect("companion short pattern compiles")
    })
}

/// Classify a single line.
///
/// `org` is the only organization companions may live in; short references
/// without an organization default to it. `source` names the changeset the
/// line came from and is only used in diagnostics.
pub fn classify_line(line: &str, org: &str, source: &ChangesetRef) -> Result<DescriptionLine> {
    if let Some(caps) = override_re().captures(line) {
        return Ok(DescriptionLine::BranchOverride(BranchOverride {
            repo_name: caps[1].to_ascii_lowercase(),
            branch: caps[2].to_string(),
        }));
    }

    let Some(caps) = keyword_re().captures(line) else {
        return Ok(DescriptionLine::PlainText);
    };
    let target = &caps[1];
    let malformed = |reason: &str| CheckError::MalformedReference {
        changeset: source.to_string(),
        line: line.trim().to_string(),
        reason: reason.to_string(),
    };

    let (ref_org, name, number) = if let Some(m) = url_re().captures(target) {
        (m[1].to_string(), m[2].to_string(), m[3].to_string())
    } else if let Some(m) = short_re().captures(target) {
        let ref_org = m.get(1).map_or(org, |o| o.as_str()).to_string();
        (ref_org, m[2].to_string(), m[3].to_string())
    } else {
        return Err(malformed("expected a pull request URL, `org/repo#N` or `repo#N`"));
    };

    if !ref_org.eq_ignore_ascii_case(org) {
        return Err(malformed(&format!("repository is outside organization `{org}`")));
    }
    let number = number
        .parse()
        .map_err(|_| malformed("changeset number out of range"))?;

    Ok(DescriptionLine::Companion(ChangesetRef::new(
        RepoId::new(ref_org, name),
        number,
    )))
}

/// Classify every line of `body`.
pub fn classify(body: &str, org: &str, source: &ChangesetRef) -> Result<Vec<DescriptionLine>> {
    body.lines()
        .map(|line| classify_line(line, org, source))
        .collect()
}

/// Companion references in `body`, in order of appearance, without duplicates.
pub fn companions(body: &str, org: &str, source: &ChangesetRef) -> Result<Vec<ChangesetRef>> {
    let mut found: Vec<ChangesetRef> = Vec::new();
    for line in classify(body, org, source)? {
        if let DescriptionLine::Companion(reference) = line {
            if !found.contains(&reference) {
                found.push(reference);
            }
        }
    }
    Ok(found)
}

/// Branch override directives in `body`.
pub fn branch_overrides(body: &str) -> Vec<BranchOverride> {
    body.lines()
        .filter_map(|line| override_re().captures(line))
        .map(|caps| BranchOverride {
            repo_name: caps[1].to_ascii_lowercase(),
            branch: caps[2].to_string(),
        })
        .collect()
}
