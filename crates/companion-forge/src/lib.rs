//! Forge clients for companion checks.
//!
//! [`GitHubClient`] implements [`companion_core::CodeHost`] over the GitHub
//! REST API and [`GitLabClient`] implements [`companion_core::PipelineHost`]
//! over the GitLab v4 API. Both retry transient failures per
//! [`RetryPolicy`] before reporting the remote as unavailable.

pub mod error;
pub mod github;
pub mod gitlab;
mod http;
pub mod retry;

pub use error::ForgeError;
pub use github::GitHubClient;
pub use gitlab::GitLabClient;
pub use retry::RetryPolicy;
