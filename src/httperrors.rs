//! A typed "non-200 response" error shared by every outbound HTTP call.

use thiserror::Error;

#[derive(Debug, Error)]
#[error("request failed with {status}{}", .server_error.as_ref().map(|b| format!(", got from the server:\n{b}")).unwrap_or_default())]
pub struct HttpError {
    pub status: reqwest::StatusCode,
    pub server_error: Option<String>,
}

pub async fn maybe_error(resp: reqwest::Response) -> Result<reqwest::Response, HttpError> {
    if resp.status().is_success() {
        return Ok(resp);
    }

    let status = resp.status();
    let server_error = resp.text().await.ok().filter(|s| !s.is_empty());
    Err(HttpError {
        status,
        server_error,
    })
}
