//! Skip decisions based on previously validated state.
//!
//! A changeset's head commit changes once its base moves, so previously
//! validated state is recognized by content: fingerprint sets of the
//! dependent and of every cached companion dependency must be set-equal to
//! what was recorded, and every other locked package must match by
//! `(name, version, source)`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheRecord, CacheStore};
use crate::error::{CheckError, Result};
use crate::fingerprint::FingerprintSet;
use crate::lockfile::Lockfile;

/// Excluded from the dependent's file comparison; the lock is reconciled
/// package by package instead.
const LOCK_FILE: &str = "Cargo.lock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipDecision {
    /// Validated state matches; `jobs` lists the run's jobs.
    Skip { jobs: String },
    MustRun { reason: String },
}

impl SkipDecision {
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip { .. })
    }
}

/// The state a cached record is compared against.
#[derive(Debug, Clone, Default)]
pub struct CurrentState {
    pub dependent: FingerprintSet,
    /// Raw `Cargo.lock` of the dependent.
    pub lock: Option<String>,
    /// Keyed like [`CacheRecord::dependencies`].
    pub dependencies: BTreeMap<String, FingerprintSet>,
}

/// Captures the current state of the repositories a record covers.
#[async_trait]
pub trait StateProbe: Send + Sync {
    async fn capture(&self, record: &CacheRecord) -> Result<CurrentState>;
}

pub struct SkipCacheValidator {
    store: Arc<dyn CacheStore>,
}

impl SkipCacheValidator {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, key: &CacheKey) -> Result<Option<CacheRecord>> {
        match self.store.get(key).await? {
            Some(bytes) => Ok(Some(CacheRecord::from_json(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Strict check for the skip path: any mismatch or store failure is an
    /// error. A missing record is `MustRun`.
    pub async fn check(&self, key: &CacheKey, probe: &dyn StateProbe) -> Result<SkipDecision> {
        let Some(record) = self.load(key).await? else {
            info!(%key, "no cache record");
            return Ok(SkipDecision::MustRun {
                reason: format!("no cache record for {key}"),
            });
        };
        let current = probe.capture(&record).await?;
        compare(key, &record, &current)?;
        info!(%key, jobs = %record.jobs, "cached state matches");
        Ok(SkipDecision::Skip { jobs: record.jobs })
    }

    /// Lenient check for the primary path: every failure degrades to
    /// `MustRun`.
    pub async fn validate(&self, key: &CacheKey, probe: &dyn StateProbe) -> SkipDecision {
        match self.check(key, probe).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(%key, error = %e, "skip cache unusable; running");
                SkipDecision::MustRun {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Replace the record under `key`.
    pub async fn record(&self, key: &CacheKey, record: &CacheRecord) -> Result<()> {
        self.store.put(key, &record.to_json()?).await?;
        debug!(%key, dependencies = record.dependencies.len(), "cache record written");
        Ok(())
    }
}

fn mismatch(scope: impl Into<String>, detail: impl Into<String>) -> CheckError {
    CheckError::CacheMismatch {
        scope: scope.into(),
        detail: detail.into(),
    }
}

fn without_lock(set: &FingerprintSet) -> FingerprintSet {
    FingerprintSet::new(
        set.files()
            .iter()
            .filter(|f| f.path != LOCK_FILE)
            .cloned()
            .collect(),
    )
}

fn compare_files(scope: String, recorded: &FingerprintSet, current: &FingerprintSet) -> Result<()> {
    let diffs = recorded.diff(current);
    if diffs.is_empty() {
        return Ok(());
    }
    let detail = diffs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    Err(mismatch(scope, detail))
}

/// Compare a record against the current state.
pub fn compare(key: &CacheKey, record: &CacheRecord, current: &CurrentState) -> Result<()> {
    compare_files(
        format!("{key} dependent"),
        &without_lock(&record.dependent.files),
        &without_lock(&current.dependent),
    )?;

    for (prefix, cached) in &record.dependencies {
        let now = current.dependencies.get(prefix).ok_or_else(|| {
            mismatch(
                format!("{key} {}", cached.repository),
                format!("{prefix} is no longer a dependency"),
            )
        })?;
        compare_files(format!("{key} {}", cached.repository), &cached.files, now)?;
    }
    if let Some(extra) = current
        .dependencies
        .keys()
        .find(|prefix| !record.dependencies.contains_key(*prefix))
    {
        return Err(mismatch(
            key.to_string(),
            format!("{extra} was not part of the validated run"),
        ));
    }

    compare_locks(key, record, current)
}

fn compare_locks(key: &CacheKey, record: &CacheRecord, current: &CurrentState) -> Result<()> {
    let scope = format!("{key} {LOCK_FILE}");
    let parse = |raw: &Option<String>| -> Result<Option<Lockfile>> {
        raw.as_deref().map(Lockfile::parse).transpose()
    };
    let (recorded, now) = match (parse(&record.manifest_lock)?, parse(&current.lock)?) {
        (None, None) => return Ok(()),
        (Some(r), Some(n)) => (r, n),
        (Some(_), None) => return Err(mismatch(scope, "lock file disappeared")),
        (None, Some(_)) => return Err(mismatch(scope, "lock file appeared")),
    };

    let prefixes: Vec<&str> = record.dependencies.keys().map(String::as_str).collect();
    let recorded = recorded.triples_excluding(&prefixes);
    let now = now.triples_excluding(&prefixes);
    if recorded == now {
        return Ok(());
    }
    let describe = |set: BTreeSet<&(String, String, String)>| {
        set.into_iter()
            .map(|(name, version, source)| format!("{name} {version} {source}").trim_end().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let removed = describe(recorded.difference(&now).collect());
    let added = describe(now.difference(&recorded).collect());
    Err(mismatch(scope, format!("removed [{removed}], added [{added}]")))
}
