//! Skip-cache records and their storage.
//!
//! A record captures the state a successful run validated: the dependent's
//! tracked files and lock, one fingerprint set per companion dependency and
//! the run's job listing. Records are replaced wholesale, never mutated.

pub mod fs;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CheckError, Result};
use crate::fingerprint::FingerprintSet;
use crate::model::RepoId;
use crate::sequencer::SnapshotChain;

/// `cbs/<dependent-repository>/PR-<number>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(dependent: &RepoId, number: u64) -> Self {
        Self(format!("cbs/{}/PR-{}", dependent.name, number))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serializes a [`FingerprintSet`] as its `mode hash path` listing.
mod listing {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::fingerprint::FingerprintSet;

    pub fn serialize<S: Serializer>(set: &FingerprintSet, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&set.to_listing())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<FingerprintSet, D::Error> {
        let raw = String::deserialize(d)?;
        FingerprintSet::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedDependency {
    /// Where the validated snapshot was published.
    pub url: String,
    #[serde(with = "listing")]
    pub files: FingerprintSet,
    /// `org/name`.
    pub repository: String,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedDependent {
    #[serde(with = "listing")]
    pub files: FingerprintSet,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    /// Raw `Cargo.lock` of the dependent before patching.
    #[serde(default)]
    pub manifest_lock: Option<String>,
    /// Keyed by the normalized URL prefix dependents reference the
    /// repository with.
    pub dependencies: BTreeMap<String, CachedDependency>,
    pub dependent: CachedDependent,
    /// Job listing of the validated run.
    pub jobs: String,
}

impl CacheRecord {
    /// Record for a validated chain whose run lists its jobs at `jobs_url`.
    pub fn from_chain(chain: &SnapshotChain, jobs_url: &str) -> Result<Self> {
        let dependent = chain.dependent().ok_or_else(|| CheckError::CacheMismatch {
            scope: "record".to_string(),
            detail: "cannot record an empty snapshot chain".to_string(),
        })?;
        let dependencies = chain
            .dependencies()
            .iter()
            .map(|s| {
                (
                    s.source_url.clone(),
                    CachedDependency {
                        url: s.published_url.clone(),
                        files: s.fingerprints.clone(),
                        repository: s.repo.to_string(),
                        sha: s.sha.clone(),
                    },
                )
            })
            .collect();
        Ok(Self {
            manifest_lock: chain.dependent_lock.clone(),
            dependencies,
            dependent: CachedDependent {
                files: dependent.fingerprints.clone(),
                sha: dependent.sha.clone(),
            },
            jobs: jobs_url.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Key/value storage for cache records with last-writer-wins semantics.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &CacheKey, value: &[u8]) -> Result<()>;
}
