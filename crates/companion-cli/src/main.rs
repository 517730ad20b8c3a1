//! Companion Check CLI
//!
//! The `companion-check` command validates a change against a dependent
//! repository using the companions named in the change's description.
//!
//! ## Commands
//!
//! - `check`: resolve, patch and run the dependent's pipeline
//! - `skip`: reuse a previously validated run for a companion
//! - `plan`: resolve and patch without publishing; prints the chain
//! - `audit-workspace`: verify a workspace's internal links use `path`

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use companion_core::{
    audit, CargoCli, ChangesetRef, CheckConfig, CheckOutcome, CheckRequest, CompanionCheck,
    FsCacheStore, GitCli, RepoId, SkipOutcome, TerminalStatus,
};
use companion_forge::{GitHubClient, GitLabClient};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "companion-check")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Validate changes against their companion changesets", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// TOML configuration file
    #[arg(long, global = true, env = "CBS_CONFIG")]
    config: Option<PathBuf>,

    /// Organization companions must belong to (overrides the config)
    #[arg(long, global = true, env = "CBS_ORGANIZATION")]
    organization: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// The change under test, as CI reports it.
#[derive(Args)]
struct SourceArgs {
    /// Repository of the change, as `org/name`
    #[arg(long, env = "CBS_SOURCE_REPO")]
    repo: String,

    /// CI ref name: a changeset number, `pr-<n>` or `refs/pull/<n>/head`
    #[arg(long = "ref", env = "CI_COMMIT_REF_NAME")]
    ci_ref: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a dependent repository against a change and its companions
    Check {
        #[command(flatten)]
        source: SourceArgs,

        /// Dependent repository, as `org/name`
        #[arg(long, env = "CBS_DEPENDENT")]
        dependent: String,

        /// Companion number when invoked from an outer check
        #[arg(long, env = "CBS_NESTED_COMPANION")]
        nested_companion: Option<u64>,

        /// Repositories a parent run already validated (space separated)
        #[arg(long, env = "CBS_VALIDATED_REPOS", default_value = "")]
        validated_repos: String,

        /// The tree was already patched by a parent run
        #[arg(
            long,
            env = "CBS_PRE_PATCHED",
            action = ArgAction::Set,
            value_parser = BoolishValueParser::new(),
            default_value = "false"
        )]
        pre_patched: bool,
    },

    /// Mark a companion's jobs as passed when a cached run still covers it
    Skip {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Resolve and patch without publishing; print the snapshot chain
    Plan {
        #[command(flatten)]
        source: SourceArgs,

        /// Dependent repository, as `org/name`
        #[arg(long, env = "CBS_DEPENDENT")]
        dependent: String,
    },

    /// Audit a workspace's internal dependency links
    AuditWorkspace {
        /// Workspace root (default: current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    companion_core::init_tracing(cli.json, level);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref(), cli.organization)?;

    match cli.command {
        Commands::Check {
            source,
            dependent,
            nested_companion,
            validated_repos,
            pre_patched,
        } => {
            let Some(changeset) = changeset_of(&source)? else {
                return Ok(ExitCode::SUCCESS);
            };
            let request = CheckRequest {
                source: changeset,
                dependent: dependent
                    .parse()
                    .context("invalid dependent repository")?,
                nested_companion,
                validated_repos: validated_repos.split_whitespace().map(String::from).collect(),
                pre_patched,
            };
            cmd_check(&config, &request).await
        }
        Commands::Skip { source } => {
            let Some(changeset) = changeset_of(&source)? else {
                return Ok(ExitCode::SUCCESS);
            };
            cmd_skip(&config, &changeset).await
        }
        Commands::Plan { source, dependent } => {
            let Some(changeset) = changeset_of(&source)? else {
                return Ok(ExitCode::SUCCESS);
            };
            let dependent: RepoId = dependent.parse().context("invalid dependent repository")?;
            cmd_plan(&config, &changeset, &dependent).await
        }
        Commands::AuditWorkspace { path } => cmd_audit_workspace(&path),
    }
}

fn load_config(path: Option<&Path>, organization: Option<String>) -> Result<CheckConfig> {
    let mut config = CheckConfig::load(path).context("failed to load configuration")?;
    if let Some(org) = organization {
        config.organization = org;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// `None` when the CI ref is a plain branch or tag.
fn changeset_of(source: &SourceArgs) -> Result<Option<ChangesetRef>> {
    let repo: RepoId = source.repo.parse().context("invalid source repository")?;
    let changeset = ChangesetRef::from_ci_ref(repo, &source.ci_ref);
    if changeset.is_none() {
        info!(ci_ref = %source.ci_ref, "ref is not a changeset; nothing to check");
    }
    Ok(changeset)
}

fn engine(config: &CheckConfig) -> Result<CompanionCheck> {
    let host = GitHubClient::new(&config.github_api_url, config.github_token.clone())
        .context("failed to create GitHub client")?;
    let project = config
        .gitlab_project
        .as_deref()
        .context("no pipeline project configured (set CBS_GITLAB_PROJECT or gitlab_project)")?;
    let pipelines = GitLabClient::new(&config.gitlab_url, project, config.gitlab_token.clone())
        .context("failed to create GitLab client")?;
    let store = FsCacheStore::new(&config.cache_dir).with_context(|| {
        format!("failed to open cache directory {}", config.cache_dir.display())
    })?;

    CompanionCheck::new(
        config,
        Arc::new(host),
        Arc::new(GitCli::new(&config.git_author_name, &config.git_author_email)),
        Arc::new(pipelines),
        Arc::new(CargoCli::default()),
        Arc::new(store),
    )
    .context("failed to set up companion check")
}

async fn cmd_check(config: &CheckConfig, request: &CheckRequest) -> Result<ExitCode> {
    let check = engine(config)?;
    let outcome = check
        .run(request)
        .await
        .with_context(|| format!("check of {} against {} failed", request.dependent, request.source))?;

    match &outcome {
        CheckOutcome::AlreadyValidated => {
            println!("{} was already validated by a parent run", request.dependent)
        }
        CheckOutcome::PrePatched => println!("Tree already patched; nothing to do"),
        CheckOutcome::Cached { jobs } => {
            println!("Reused a previous run; marked {} jobs as passed", jobs.len())
        }
        CheckOutcome::Completed(run) => {
            let status = match run.status {
                TerminalStatus::Success => "✓ PASSED",
                TerminalStatus::Failed => "✗ FAILED",
                TerminalStatus::Cancelled => "✗ CANCELLED",
            };
            println!("Branch: {}", run.branch);
            println!("Pipeline: {}", run.run.web_url.as_deref().unwrap_or("-"));
            println!("Status: {status}");
        }
    }

    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cmd_skip(config: &CheckConfig, changeset: &ChangesetRef) -> Result<ExitCode> {
    let check = engine(config)?;
    match check
        .skip(changeset)
        .await
        .with_context(|| format!("cannot skip {changeset}"))?
    {
        SkipOutcome::Skipped { jobs } => {
            println!("Marked {} jobs of {changeset} as passed:", jobs.len());
            for job in &jobs {
                println!("  ✓ {job}");
            }
            Ok(ExitCode::SUCCESS)
        }
        SkipOutcome::MustRun { reason } => {
            println!("{changeset} must run: {reason}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn cmd_plan(
    config: &CheckConfig,
    changeset: &ChangesetRef,
    dependent: &RepoId,
) -> Result<ExitCode> {
    let check = engine(config)?;
    let chain = check
        .plan(changeset, dependent)
        .await
        .with_context(|| format!("cannot plan {dependent} against {changeset}"))?;

    let snapshots: Vec<serde_json::Value> = chain
        .snapshots
        .iter()
        .map(|s| {
            serde_json::json!({
                "repository": s.repo.to_string(),
                "sha": s.sha,
                "source": s.source_url,
                "published": s.published_url,
                "files": s.fingerprints.len(),
            })
        })
        .collect();
    let plan = serde_json::json!({
        "source": changeset.to_string(),
        "dependent": dependent.to_string(),
        "dependentBranch": chain.dependent_branch.as_ref().map(|b| b.name().to_string()),
        "snapshots": snapshots,
    });
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(ExitCode::SUCCESS)
}

fn cmd_audit_workspace(path: &Path) -> Result<ExitCode> {
    let report = audit(path).with_context(|| format!("cannot audit {}", path.display()))?;

    println!(
        "Workspace: {} members, {} crates, {} internal links",
        report.workspace_members,
        report.crates.len(),
        report.links.len()
    );
    for notice in report.notices() {
        println!("  note: {notice}");
    }
    let problems = report.problems();
    for problem in &problems {
        println!("  ✗ {problem}");
    }

    if problems.is_empty() {
        println!("✓ workspace links OK");
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(ci_ref: &str) -> SourceArgs {
        SourceArgs {
            repo: "paritytech/substrate".to_string(),
            ci_ref: ci_ref.to_string(),
        }
    }

    #[test]
    fn test_branch_refs_are_not_changesets() {
        assert!(changeset_of(&source("master")).unwrap().is_none());
        let cs = changeset_of(&source("pr-812")).unwrap().unwrap();
        assert_eq!(cs.to_string(), "paritytech/substrate#812");
    }

    #[test]
    fn test_invalid_repo_is_an_error() {
        let mut args = source("12");
        args.repo = "substrate".to_string();
        assert!(changeset_of(&args).is_err());
    }

    #[test]
    fn test_check_parses_env_style_flags() {
        let cli = Cli::try_parse_from([
            "companion-check",
            "check",
            "--repo",
            "org/substrate",
            "--ref",
            "42",
            "--dependent",
            "org/polkadot",
            "--validated-repos",
            "org/cumulus org/polkadot",
            "--pre-patched",
            "1",
        ])
        .unwrap();
        match cli.command {
            Commands::Check {
                validated_repos,
                pre_patched,
                ..
            } => {
                assert_eq!(validated_repos.split_whitespace().count(), 2);
                assert!(pre_patched);
            }
            _ => panic!("expected check"),
        }
    }

    #[test]
    fn test_organization_flag_overrides_config() {
        let config = load_config(None, Some("acme".to_string())).unwrap();
        assert_eq!(config.organization, "acme");
    }
}
