//! Order-independent fingerprints of a tree's tracked files.
//!
//! A [`FingerprintSet`] lists `(mode, hash, path)` triples. Two sets are
//! equivalent iff their triples are set-equal; the listing order carries no
//! meaning. The serialized form is one `mode hash path` line per file, the
//! same shape `git ls-files --stage` produces minus the stage column.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CheckError, Result};

/// Fingerprint of a single tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub path: String,
    pub mode: String,
    pub hash: String,
}

impl FileFingerprint {
    pub fn new(mode: impl Into<String>, hash: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: mode.into(),
            hash: hash.into(),
        }
    }
}

impl fmt::Display for FileFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.mode, self.hash, self.path)
    }
}

/// A single disagreement between a recorded and a current set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintDiff {
    /// Recorded but no longer present.
    Missing(FileFingerprint),
    /// Present now but never recorded.
    Unexpected(FileFingerprint),
    /// Same path, different mode or content.
    Changed {
        recorded: FileFingerprint,
        current: FileFingerprint,
    },
}

impl fmt::Display for FingerprintDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(file) => write!(
                f,
                "`{}` recorded as {} {} is missing",
                file.path, file.mode, file.hash
            ),
            Self::Unexpected(file) => write!(
                f,
                "`{}` ({} {}) was not recorded",
                file.path, file.mode, file.hash
            ),
            Self::Changed { recorded, current } => write!(
                f,
                "`{}` recorded as {} {} but is now {} {}",
                recorded.path, recorded.mode, recorded.hash, current.mode, current.hash
            ),
        }
    }
}

/// Listing of a tree's files at one point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FingerprintSet {
    files: Vec<FileFingerprint>,
}

impl FingerprintSet {
    pub fn new(files: Vec<FileFingerprint>) -> Self {
        Self { files }
    }

    /// Parse the serialized `mode hash path` listing. Blank lines are ignored.
    pub fn parse(listing: &str) -> Result<Self> {
        let mut files = Vec::new();
        for (idx, line) in listing.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut parts = line.splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(mode), Some(hash), Some(path)) if !path.is_empty() => {
                    files.push(FileFingerprint::new(mode, hash, path));
                }
                _ => {
                    return Err(CheckError::manifest(
                        "<fingerprint listing>",
                        format!("line {} is not `mode hash path`: {line:?}", idx + 1),
                    ))
                }
            }
        }
        Ok(Self { files })
    }

    /// Parse `git ls-files --stage` output (`mode hash stage<TAB>path`).
    pub fn from_ls_files(output: &str) -> Result<Self> {
        let mut files = Vec::new();
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let (meta, path) = line.split_once('\t').ok_or_else(|| {
                CheckError::Git(format!("unexpected ls-files line: {line:?}"))
            })?;
            let mut meta = meta.split_whitespace();
            match (meta.next(), meta.next()) {
                (Some(mode), Some(hash)) => files.push(FileFingerprint::new(mode, hash, path)),
                _ => return Err(CheckError::Git(format!("unexpected ls-files line: {line:?}"))),
            }
        }
        Ok(Self { files })
    }

    /// Serialize to the newline separated `mode hash path` listing.
    pub fn to_listing(&self) -> String {
        self.files
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn files(&self) -> &[FileFingerprint] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Set equality over the triples.
    pub fn is_equivalent(&self, other: &Self) -> bool {
        let a: BTreeSet<&FileFingerprint> = self.files.iter().collect();
        let b: BTreeSet<&FileFingerprint> = other.files.iter().collect();
        a == b
    }

    /// Differences between `self` (recorded) and `current`, sorted by path.
    pub fn diff(&self, current: &Self) -> Vec<FingerprintDiff> {
        let recorded: BTreeMap<&str, &FileFingerprint> =
            self.files.iter().map(|f| (f.path.as_str(), f)).collect();
        let now: BTreeMap<&str, &FileFingerprint> =
            current.files.iter().map(|f| (f.path.as_str(), f)).collect();

        let mut diffs = Vec::new();
        for (path, old) in &recorded {
            match now.get(path) {
                None => diffs.push(FingerprintDiff::Missing((*old).clone())),
                Some(new) if new != old => diffs.push(FingerprintDiff::Changed {
                    recorded: (*old).clone(),
                    current: (*new).clone(),
                }),
                Some(_) => {}
            }
        }
        for (path, new) in &now {
            if !recorded.contains_key(path) {
                diffs.push(FingerprintDiff::Unexpected((*new).clone()));
            }
        }
        diffs
    }
}

impl PartialEq for FingerprintSet {
    fn eq(&self, other: &Self) -> bool {
        self.is_equivalent(other)
    }
}

impl Eq for FingerprintSet {}

/// Fingerprint every regular file below `root`, skipping `.git` and `target`.
///
/// Hashes are SHA-256 of the file content; the mode is `100755` for
/// executables and `100644` otherwise. Used for trees that are not backed by
/// a git index.
pub fn fingerprint_directory(root: &Path) -> Result<FingerprintSet> {
    let mut files = Vec::new();
    walk(root, root, &mut files)?;
    files.sort();
    Ok(FingerprintSet { files })
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<FileFingerprint>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let name = entry.file_name();
            if name == ".git" || name == "target" {
                continue;
            }
            walk(root, &path, out)?;
        } else if file_type.is_file() {
            let content = fs::read(&path)?;
            let hash = hex::encode(Sha256::digest(&content));
            let relative = path
                .strip_prefix(root)
                .unwrap_or(path.as_path())
                .to_string_lossy()
                .replace('\\', "/");
            out.push(FileFingerprint::new(file_mode(&entry.metadata()?), hash, relative));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> &'static str {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        "100755"
    } else {
        "100644"
    }
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> &'static str {
    "100644"
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "100644 aaa Cargo.toml\n100755 bbb scripts/run.sh\n100644 ccc src/lib.rs";

    #[test]
    fn test_parse_and_serialize() {
        let set = FingerprintSet::parse(LISTING).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.files()[1].mode, "100755");
        assert_eq!(set.to_listing(), LISTING);
    }

    #[test]
    fn test_path_with_spaces_survives_parse() {
        let set = FingerprintSet::parse("100644 abc docs/read me.md").unwrap();
        assert_eq!(set.files()[0].path, "docs/read me.md");
    }

    #[test]
    fn test_parse_rejects_short_line() {
        assert!(FingerprintSet::parse("100644 only-two").is_err());
    }

    #[test]
    fn test_equivalence_is_order_independent() {
        let a = FingerprintSet::parse(LISTING).unwrap();
        let mut lines: Vec<&str> = LISTING.lines().collect();
        lines.reverse();
        let b = FingerprintSet::parse(&lines.join("\n")).unwrap();
        assert!(a.is_equivalent(&b));
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn test_diff_reports_each_kind() {
        let recorded = FingerprintSet::parse("100644 h1 x\n100644 h2 gone\n100644 h3 mode").unwrap();
        let current = FingerprintSet::parse("100644 h9 x\n100755 h3 mode\n100644 h4 new").unwrap();
        let diffs = recorded.diff(&current);
        assert_eq!(diffs.len(), 4);
        assert!(diffs.iter().any(|d| matches!(d, FingerprintDiff::Missing(f) if f.path == "gone")));
        assert!(diffs.iter().any(|d| matches!(d, FingerprintDiff::Unexpected(f) if f.path == "new")));
        let changed_x = diffs
            .iter()
            .find(|d| matches!(d, FingerprintDiff::Changed { recorded, .. } if recorded.path == "x"))
            .unwrap();
        let msg = changed_x.to_string();
        assert!(msg.contains("h1") && msg.contains("h9"));
    }

    #[test]
    fn test_from_ls_files() {
        let out = "100644 e69de29bb2d1d6434b8b29ae775ad8c2e48c5391 0\tREADME.md\n\
                   100755 5716ca5987cbf97d6bb54920bea6adde242d87e6 0\tbin/tool\n";
        let set = FingerprintSet::from_ls_files(out).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.files()[1].path, "bin/tool");
        assert_eq!(set.files()[1].mode, "100755");
    }

    #[test]
    fn test_fingerprint_directory_skips_git_and_target() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::create_dir_all(dir.path().join("target")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        fs::write(dir.path().join("target/out"), "bin").unwrap();

        let set = fingerprint_directory(dir.path()).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.files()[0].path, "src/lib.rs");
        assert_eq!(set.files()[0].hash.len(), 64);
    }

    #[test]
    fn test_fingerprint_directory_tracks_content_changes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        let before = fingerprint_directory(dir.path()).unwrap();
        fs::write(dir.path().join("a.txt"), "two").unwrap();
        let after = fingerprint_directory(dir.path()).unwrap();
        assert!(!before.is_equivalent(&after));
    }
}
