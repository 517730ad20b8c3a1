//! Response handling shared by both clients.

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::ForgeError;

pub(crate) fn build_client() -> Result<Client, ForgeError> {
    Client::builder()
        .user_agent(concat!("companion-check/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ForgeError::Config(format!("cannot build HTTP client: {e}")))
}

/// Fail on any non-success status; 404 becomes [`ForgeError::NotFound`].
pub(crate) async fn ensure_success(url: &str, resp: Response) -> Result<Response, ForgeError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ForgeError::NotFound {
            url: url.to_string(),
        });
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ForgeError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

pub(crate) async fn read_json<T: DeserializeOwned>(url: &str, resp: Response) -> Result<T, ForgeError> {
    let resp = ensure_success(url, resp).await?;
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ForgeError::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })
}
