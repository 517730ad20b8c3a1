//! GitLab v4 pipeline host.

use std::collections::BTreeMap;

use async_trait::async_trait;
use companion_core::{PipelineHost, Result, RunHandle, RunRequest, RunStatus};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::ForgeError;
use crate::http::{build_client, read_json};
use crate::retry::RetryPolicy;

const SERVICE: &str = "gitlab";

#[derive(Debug, Serialize)]
struct Variable<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct CreatePipeline<'a> {
    #[serde(rename = "ref")]
    branch: &'a str,
    variables: Vec<Variable<'a>>,
}

#[derive(Debug, Deserialize)]
struct PipelineResponse {
    id: u64,
    project_id: u64,
    status: String,
    web_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    name: String,
}

/// Pipeline host backed by the GitLab REST API.
#[derive(Debug, Clone)]
pub struct GitLabClient {
    http: Client,
    base_url: String,
    token: Option<String>,
    /// Numeric id or url-encoded `group/project`.
    project: String,
    retry: RetryPolicy,
}

impl GitLabClient {
    pub fn new(
        base_url: &str,
        project: &str,
        token: Option<String>,
    ) -> std::result::Result<Self, ForgeError> {
        if project.trim().is_empty() {
            return Err(ForgeError::Config("GitLab project must not be empty".to_string()));
        }
        Ok(Self {
            http: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            project: project.replace('/', "%2F"),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/v4{}", self.base_url, path)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.header("PRIVATE-TOKEN", token),
            None => builder,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> std::result::Result<T, ForgeError> {
        self.retry
            .run(SERVICE, || async move {
                let resp = self.request(Method::GET, url).send().await?;
                read_json(url, resp).await
            })
            .await
    }
}

#[async_trait]
impl PipelineHost for GitLabClient {
    #[instrument(skip(self, request), fields(branch = %request.branch))]
    async fn create_run(&self, request: &RunRequest) -> Result<RunHandle> {
        let url = self.api(&format!("/projects/{}/pipeline", self.project));
        let url = url.as_str();
        let body = CreatePipeline {
            branch: &request.branch,
            variables: request
                .variables
                .iter()
                .map(|(key, value)| Variable { key, value })
                .collect(),
        };
        let body = &body;
        // A failed POST may still have created the pipeline.
        let pipeline: PipelineResponse = self
            .retry
            .run_while(SERVICE, ForgeError::is_unsent, || async move {
                let resp = self.request(Method::POST, url).json(body).send().await?;
                read_json(url, resp).await
            })
            .await
            .map_err(|e| e.into_check_error(SERVICE))?;

        info!(pipeline = pipeline.id, status = %pipeline.status, "pipeline created");
        Ok(RunHandle {
            project_id: pipeline.project_id,
            run_id: pipeline.id,
            web_url: pipeline.web_url,
            jobs_url: self.api(&format!(
                "/projects/{}/pipelines/{}/jobs",
                pipeline.project_id, pipeline.id
            )),
        })
    }

    async fn run_status(&self, run: &RunHandle) -> Result<RunStatus> {
        let url = self.api(&format!("/projects/{}/pipelines/{}", run.project_id, run.run_id));
        let pipeline: PipelineResponse = self
            .get_json(&url)
            .await
            .map_err(|e| e.into_check_error(SERVICE))?;
        debug!(pipeline = pipeline.id, status = %pipeline.status, "pipeline status");
        Ok(RunStatus::from_api(&pipeline.status))
    }

    async fn job_names(&self, jobs_url: &str) -> Result<Vec<String>> {
        let url = format!("{jobs_url}?per_page=100");
        let jobs: Vec<JobResponse> = self
            .get_json(&url)
            .await
            .map_err(|e| e.into_check_error(SERVICE))?;

        // Retried jobs appear once per attempt.
        let mut seen = BTreeMap::new();
        for (idx, job) in jobs.into_iter().enumerate() {
            seen.entry(job.name).or_insert(idx);
        }
        let mut names: Vec<(usize, String)> = seen.into_iter().map(|(name, idx)| (idx, name)).collect();
        names.sort();
        Ok(names.into_iter().map(|(_, name)| name).collect())
    }
}
