//! End-to-end companion checks against in-memory collaborators.
//!
//! Covers the primary path (resolve, sequence, dispatch, record), the skip
//! path reusing the recorded state, and degradation when the cache store is
//! unavailable.

use std::sync::Arc;

use companion_core::fakes::{
    changeset, MemoryCacheStore, MemoryCodeHost, MemoryPipelineHost, MemorySourceControl,
    NoopLockTool,
};
use companion_core::{
    CacheKey, CacheStore, CheckConfig, CheckError, CheckOutcome, CheckRequest, Checkout,
    ChangesetRef, CompanionCheck, FsCacheStore, RepoId, RunStatus, SkipOutcome, SourceControl,
    TerminalStatus,
};

const SUB_URL: &str = "https://github.com/org/sub";

fn repo(name: &str) -> RepoId {
    RepoId::new("org", name)
}

fn lock(sub_commit: &str) -> String {
    format!(
        r#"version = 3

[[package]]
name = "dep-cli"
version = "0.1.0"
dependencies = ["serde", "sub-io"]

[[package]]
name = "serde"
version = "1.0.190"
source = "registry+https://github.com/rust-lang/crates.io-index"

[[package]]
name = "sub-io"
version = "0.1.0"
source = "git+https://github.com/org/sub?branch=master#{sub_commit}"
"#
    )
}

const SUB_MANIFEST: &str = "[package]\nname = \"sub-io\"\nversion = \"0.1.0\"\n";
const DEP_MANIFEST: &str = "[package]\nname = \"dep-cli\"\nversion = \"0.1.0\"\n\n[dependencies]\nserde = \"1\"\nsub-io = { git = \"https://github.com/org/sub\", branch = \"master\" }\n";

struct Harness {
    host: Arc<MemoryCodeHost>,
    vcs: Arc<MemorySourceControl>,
    pipelines: Arc<MemoryPipelineHost>,
    lock_tool: Arc<NoopLockTool>,
    check: CompanionCheck,
}

/// `org/sub#3` names `org/dep#7` as its companion.
fn harness(store: Arc<dyn CacheStore>) -> Harness {
    let host = Arc::new(MemoryCodeHost::new());
    host.add_changeset(changeset(repo("sub"), 3, "master", "Rework IO\n\ncompanion: dep#7"));
    host.add_changeset(changeset(repo("dep"), 7, "master", "Follow sub-io changes"));

    let vcs = Arc::new(MemorySourceControl::new());
    vcs.add_changeset_tree(
        &repo("sub"),
        3,
        &[("Cargo.toml", SUB_MANIFEST), ("src/lib.rs", "pub fn read() {}\n")],
    );
    vcs.add_changeset_tree(
        &repo("dep"),
        7,
        &[("Cargo.toml", DEP_MANIFEST), ("Cargo.lock", &lock("old"))],
    );

    let pipelines = Arc::new(MemoryPipelineHost::new());
    pipelines.set_jobs(&MemoryPipelineHost::jobs_url_for(1), &["build", "test-linux"]);
    let lock_tool = Arc::new(NoopLockTool::default());

    let config = CheckConfig {
        organization: "org".to_string(),
        mirror_url: "https://mirror.example.com/{repo}.git".to_string(),
        poll_interval_secs: 1,
        ..CheckConfig::default()
    };
    let check = CompanionCheck::new(
        &config,
        host.clone(),
        vcs.clone(),
        pipelines.clone(),
        lock_tool.clone(),
        store,
    )
    .unwrap();

    Harness {
        host,
        vcs,
        pipelines,
        lock_tool,
        check,
    }
}

fn request() -> CheckRequest {
    CheckRequest {
        source: ChangesetRef::new(repo("sub"), 3),
        dependent: repo("dep"),
        nested_companion: None,
        validated_repos: Vec::new(),
        pre_patched: false,
    }
}

/// Commit `sub#3` resolves to once merged.
async fn merged_source_head(h: &Harness) -> String {
    let scratch = tempfile::tempdir().unwrap();
    let merged = h
        .vcs
        .materialize(
            &repo("sub"),
            SUB_URL,
            &Checkout::Changeset {
                head_ref: "pull/3/head".to_string(),
                base: "master".to_string(),
            },
            &scratch.path().join("sub"),
        )
        .await
        .unwrap();
    merged.head
}

/// Point the dependent's lock at the merged source, as if the companion had
/// been updated after the source change landed.
async fn relock_dependent_on_merged_source(h: &Harness) {
    let head = merged_source_head(h).await;
    h.vcs.add_changeset_tree(
        &repo("dep"),
        7,
        &[("Cargo.toml", DEP_MANIFEST), ("Cargo.lock", &lock(&head))],
    );
}

#[tokio::test(start_paused = true)]
async fn successful_run_publishes_chain_and_records_state() {
    let store = Arc::new(MemoryCacheStore::default());
    let h = harness(store.clone());
    h.pipelines.push_status(RunStatus::Running("pending".to_string()));
    h.pipelines.push_status(RunStatus::Success);

    let outcome = h.check.run(&request()).await.unwrap();
    assert!(outcome.is_success());
    let CheckOutcome::Completed(run) = outcome else {
        panic!("expected a completed run");
    };
    assert_eq!(run.status, TerminalStatus::Success);
    assert_eq!(run.branch, "cbs/sub/PR-3");

    let pushes: Vec<String> = h.vcs.pushes().into_iter().map(|p| p.remote_url).collect();
    assert_eq!(
        pushes,
        vec![
            "https://mirror.example.com/sub.git",
            "https://mirror.example.com/dep.git"
        ]
    );
    assert!(h.vcs.pushes().iter().all(|p| p.branch == "cbs/sub/PR-3"));

    let updates = h.lock_tool.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1, vec!["sub-io".to_string()]);

    let record = store
        .record(&CacheKey::new(&repo("dep"), 7))
        .expect("record written for the dependent's companion");
    let cached = &record.dependencies[SUB_URL];
    assert_eq!(cached.repository, "org/sub");
    assert_eq!(cached.url, "https://mirror.example.com/sub.git");
    assert_eq!(cached.files.len(), 2);
    assert_eq!(record.manifest_lock.as_deref(), Some(lock("old").as_str()));
    assert_eq!(record.jobs, MemoryPipelineHost::jobs_url_for(1));
}

#[tokio::test(start_paused = true)]
async fn skip_path_marks_cached_jobs_as_passed() {
    let h = harness(Arc::new(MemoryCacheStore::default()));
    h.pipelines.push_status(RunStatus::Success);
    h.check.run(&request()).await.unwrap();

    relock_dependent_on_merged_source(&h).await;
    let dep = ChangesetRef::new(repo("dep"), 7);

    let first = h.check.skip(&dep).await.unwrap();
    let second = h.check.skip(&dep).await.unwrap();
    assert_eq!(
        first,
        SkipOutcome::Skipped {
            jobs: vec!["build".to_string(), "test-linux".to_string()]
        }
    );
    assert_eq!(first, second);

    let passed = h.host.passed_jobs();
    assert_eq!(passed.len(), 4);
    assert!(passed.iter().all(|j| j.sha == "dep-7-head" && j.repo == repo("dep")));
}

#[tokio::test(start_paused = true)]
async fn changed_dependent_file_fails_skip_but_not_run() {
    let h = harness(Arc::new(MemoryCacheStore::default()));
    h.pipelines.push_status(RunStatus::Success);
    h.check.run(&request()).await.unwrap();

    let head = merged_source_head(&h).await;
    h.vcs.add_changeset_tree(
        &repo("dep"),
        7,
        &[
            ("Cargo.toml", &DEP_MANIFEST.replace("0.1.0", "0.2.0")),
            ("Cargo.lock", &lock(&head)),
        ],
    );

    let err = h
        .check
        .skip(&ChangesetRef::new(repo("dep"), 7))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckError::CacheMismatch { .. }));
    assert!(err.to_string().contains("Cargo.toml"), "{err}");

    h.pipelines.push_status(RunStatus::Success);
    let outcome = h.check.run(&request()).await.unwrap();
    assert!(matches!(outcome, CheckOutcome::Completed(_)));
    assert_eq!(h.pipelines.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn unchanged_state_reuses_cached_run() {
    let h = harness(Arc::new(MemoryCacheStore::default()));
    h.pipelines.push_status(RunStatus::Success);
    h.check.run(&request()).await.unwrap();
    relock_dependent_on_merged_source(&h).await;

    let outcome = h.check.run(&request()).await.unwrap();
    assert_eq!(
        outcome,
        CheckOutcome::Cached {
            jobs: vec!["build".to_string(), "test-linux".to_string()]
        }
    );
    assert_eq!(h.pipelines.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unavailable_store_never_aborts_the_run() {
    let h = harness(Arc::new(MemoryCacheStore::unavailable()));
    h.pipelines.push_status(RunStatus::Success);

    let outcome = h.check.run(&request()).await.unwrap();
    assert!(matches!(
        outcome,
        CheckOutcome::Completed(ref run) if run.status == TerminalStatus::Success
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_run_writes_no_record() {
    let store = Arc::new(MemoryCacheStore::default());
    let h = harness(store.clone());
    h.pipelines.push_status(RunStatus::Failed);

    let outcome = h.check.run(&request()).await.unwrap();
    assert!(!outcome.is_success());
    assert!(store.record(&CacheKey::new(&repo("dep"), 7)).is_none());
}

#[tokio::test(start_paused = true)]
async fn parent_validation_short_circuits() {
    let h = harness(Arc::new(MemoryCacheStore::default()));

    let mut validated = request();
    validated.validated_repos = vec!["org/sub".to_string(), "org/dep".to_string()];
    assert_eq!(h.check.run(&validated).await.unwrap(), CheckOutcome::AlreadyValidated);

    let mut patched = request();
    patched.pre_patched = true;
    assert_eq!(h.check.run(&patched).await.unwrap(), CheckOutcome::PrePatched);

    assert!(h.pipelines.requests().is_empty());
    assert!(h.vcs.pushes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn nested_companion_gets_its_own_branch() {
    let h = harness(Arc::new(MemoryCacheStore::default()));
    h.pipelines.push_status(RunStatus::Success);

    let mut nested = request();
    nested.nested_companion = Some(7);
    nested.validated_repos = vec!["org/polkadot".to_string()];
    h.check.run(&nested).await.unwrap();

    let request = &h.pipelines.requests()[0];
    assert_eq!(request.branch, "cbs/sub/PR-3/7");
    assert_eq!(
        request.variables["CBS_VALIDATED_REPOS"],
        "org/dep org/polkadot org/sub"
    );
}

#[tokio::test(start_paused = true)]
async fn filesystem_store_survives_between_checks() {
    let cache_dir = tempfile::tempdir().unwrap();
    let h = harness(Arc::new(FsCacheStore::new(cache_dir.path()).unwrap()));
    h.pipelines.push_status(RunStatus::Success);
    h.check.run(&request()).await.unwrap();

    assert!(cache_dir.path().join("cbs/dep/PR-7.json").exists());

    relock_dependent_on_merged_source(&h).await;
    let fresh = harness(Arc::new(FsCacheStore::new(cache_dir.path()).unwrap()));
    // The fresh harness never saw the merged source commit.
    let outcome = fresh.check.skip(&ChangesetRef::new(repo("dep"), 7)).await;
    assert!(outcome.is_err());

    let same = h.check.skip(&ChangesetRef::new(repo("dep"), 7)).await.unwrap();
    assert!(matches!(same, SkipOutcome::Skipped { .. }));
}
