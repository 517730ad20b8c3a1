//! Companion Check Core Library
//!
//! Validates a change against the repositories that depend on it. A change
//! names its companions in its description; the resolver walks those
//! references into a graph, the sequencer pins every dependent manifest to
//! freshly committed snapshots, the dispatcher publishes them and drives a
//! pipeline, and the skip cache lets an unchanged companion reuse a
//! previously validated run.

pub mod branch;
pub mod cache;
pub mod cargo;
pub mod check;
pub mod config;
pub mod description;
pub mod dispatch;
pub mod error;
pub mod fakes;
pub mod fingerprint;
pub mod git;
pub mod graph;
pub mod host;
pub mod lockfile;
pub mod manifest;
pub mod model;
mod process;
pub mod resolver;
pub mod sequencer;
pub mod skip_cache;
pub mod telemetry;
pub mod workspace_audit;

pub use error::{CheckError, Result};

pub use model::{Changeset, ChangesetRef, ChangesetState, RepoId, SnapshotRemote};

pub use host::{BranchInfo, CodeHost, PipelineHost, RunHandle, RunRequest, RunStatus};

pub use branch::{choose_branch, BranchChoice, BranchOverrideTable, BranchPattern};

pub use fingerprint::{fingerprint_directory, FileFingerprint, FingerprintDiff, FingerprintSet};

pub use git::{Checkout, GitCli, SourceControl, Worktree};

pub use cargo::{CargoCli, LockTool, UrlRedirect};

pub use graph::DependencyGraph;

pub use resolver::{CompanionResolver, NodeSource, ResolvedGraph, ResolvedNode};

pub use sequencer::{PatchSequencer, PatchedSnapshot, SnapshotChain};

pub use dispatch::{DispatchContext, PipelineDispatcher, PollPolicy, RunOutcome, TerminalStatus};

pub use cache::fs::FsCacheStore;
pub use cache::{CacheKey, CacheRecord, CacheStore};

pub use skip_cache::{CurrentState, SkipCacheValidator, SkipDecision, StateProbe};

pub use check::{CheckOutcome, CheckRequest, CompanionCheck, SkipOutcome};

pub use config::CheckConfig;

pub use workspace_audit::{audit, AuditFinding, AuditReport};

pub use telemetry::init_tracing;
