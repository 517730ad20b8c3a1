//! GitHub REST v3 code host.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use companion_core::{
    BranchInfo, BranchPattern, Changeset, ChangesetRef, ChangesetState, CheckError, CodeHost,
    RepoId, Result,
};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::ForgeError;
use crate::http::{build_client, ensure_success, read_json};
use crate::retry::RetryPolicy;

const SERVICE: &str = "github";
const PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: u64,
    state: String,
    #[serde(default)]
    merged: bool,
    mergeable: Option<bool>,
    body: Option<String>,
    head: RefResponse,
    base: RefResponse,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    #[serde(rename = "ref")]
    name: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    name: String,
    commit: CommitRef,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    committer: Signature,
}

#[derive(Debug, Deserialize)]
struct Signature {
    date: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct StatusRequest<'a> {
    state: &'a str,
    context: &'a str,
    description: &'a str,
    target_url: &'a str,
}

/// Code host backed by the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: Client,
    api_url: String,
    web_url: String,
    token: Option<String>,
    retry: RetryPolicy,
}

impl GitHubClient {
    /// `api_url` is e.g. `https://api.github.com` or
    /// `https://ghe.example.com/api/v3`.
    pub fn new(api_url: &str, token: Option<String>) -> std::result::Result<Self, ForgeError> {
        let api_url = api_url.trim_end_matches('/').to_string();
        let web_url = if api_url == "https://api.github.com" {
            "https://github.com".to_string()
        } else {
            api_url.trim_end_matches("/api/v3").to_string()
        };
        Ok(Self {
            http: build_client()?,
            api_url,
            web_url,
            token,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> std::result::Result<T, ForgeError> {
        let url = format!("{}{}", self.api_url, path);
        let url = url.as_str();
        self.retry
            .run(SERVICE, || async move {
                let resp = self.request(Method::GET, url).send().await?;
                read_json(url, resp).await
            })
            .await
    }

    async fn branch_page(&self, repo: &RepoId, page: usize) -> Result<Vec<BranchResponse>> {
        self.get_json(&format!(
            "/repos/{}/{}/branches?per_page={PAGE_SIZE}&page={page}",
            repo.org, repo.name
        ))
        .await
        .map_err(|e| e.into_check_error(SERVICE))
    }

    async fn commit_date(&self, repo: &RepoId, sha: &str) -> Result<DateTime<Utc>> {
        let commit: CommitResponse = self
            .get_json(&format!("/repos/{}/{}/commits/{sha}", repo.org, repo.name))
            .await
            .map_err(|e| e.into_check_error(SERVICE))?;
        Ok(commit.commit.committer.date)
    }
}

fn to_changeset(reference: &ChangesetRef, pull: PullResponse) -> Changeset {
    let state = match (pull.state.as_str(), pull.merged) {
        ("open", _) => ChangesetState::Open,
        (_, true) => ChangesetState::Merged,
        _ => ChangesetState::Closed,
    };
    debug!(changeset = %reference, number = pull.number, head = %pull.head.name, ?state, "fetched pull request");
    Changeset {
        reference: reference.clone(),
        base_branch: pull.base.name,
        head_sha: pull.head.sha,
        body: pull.body.unwrap_or_default(),
        state,
        mergeable: pull.mergeable,
    }
}

#[async_trait]
impl CodeHost for GitHubClient {
    #[instrument(skip(self), fields(changeset = %reference))]
    async fn changeset(&self, reference: &ChangesetRef) -> Result<Changeset> {
        let path = format!(
            "/repos/{}/{}/pulls/{}",
            reference.repo.org, reference.repo.name, reference.number
        );
        match self.get_json::<PullResponse>(&path).await {
            Ok(pull) => Ok(to_changeset(reference, pull)),
            Err(ForgeError::NotFound { .. }) => Err(CheckError::ChangesetNotFound {
                changeset: reference.to_string(),
            }),
            Err(e) => Err(e.into_check_error(SERVICE)),
        }
    }

    async fn default_branch(&self, repo: &RepoId) -> Result<String> {
        let info: RepoResponse = self
            .get_json(&format!("/repos/{}/{}", repo.org, repo.name))
            .await
            .map_err(|e| e.into_check_error(SERVICE))?;
        Ok(info.default_branch)
    }

    async fn branch_exists(&self, repo: &RepoId, branch: &str) -> Result<bool> {
        let path = format!("/repos/{}/{}/branches/{branch}", repo.org, repo.name);
        match self.get_json::<BranchResponse>(&path).await {
            Ok(_) => Ok(true),
            Err(ForgeError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into_check_error(SERVICE)),
        }
    }

    async fn matching_branches(
        &self,
        repo: &RepoId,
        pattern: &BranchPattern,
    ) -> Result<Vec<BranchInfo>> {
        let mut matching = Vec::new();
        let mut page = 1;
        loop {
            let branches = self.branch_page(repo, page).await?;
            let last = branches.len() < PAGE_SIZE;
            for branch in branches {
                if pattern.matches(&branch.name) {
                    matching.push(branch);
                }
            }
            if last {
                break;
            }
            page += 1;
        }

        let mut infos = Vec::with_capacity(matching.len());
        for branch in matching {
            let updated_at = self.commit_date(repo, &branch.commit.sha).await?;
            infos.push(BranchInfo {
                name: branch.name,
                updated_at,
            });
        }
        debug!(%repo, %pattern, count = infos.len(), "matching branches");
        Ok(infos)
    }

    fn clone_url(&self, repo: &RepoId) -> String {
        format!("{}/{}/{}.git", self.web_url, repo.org, repo.name)
    }

    async fn mark_job_passed(
        &self,
        repo: &RepoId,
        sha: &str,
        job: &str,
        details_url: &str,
    ) -> Result<()> {
        let url = format!("{}/repos/{}/{}/statuses/{sha}", self.api_url, repo.org, repo.name);
        let url = url.as_str();
        let body = StatusRequest {
            state: "success",
            context: job,
            description: "Validated by a previous companion run",
            target_url: details_url,
        };
        let body = &body;
        self.retry
            .run(SERVICE, || async move {
                let resp = self.request(Method::POST, url).json(body).send().await?;
                ensure_success(url, resp).await.map(|_| ())
            })
            .await
            .map_err(|e| e.into_check_error(SERVICE))
    }
}
