//! Posts a breakpoint's status to an operator-configured webhook.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::httperrors::{self, HttpError};

const USER_AGENT: &str = "Breakpoint/1.0";
const TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Http(#[from] HttpError),
}

pub async fn notify(endpoint: &str, payload: &Value) -> Result<(), NotifyError> {
    let client = reqwest::Client::builder().timeout(TIMEOUT).build()?;

    let resp = client
        .post(endpoint)
        .header("User-Agent", USER_AGENT)
        .json(payload)
        .send()
        .await?;

    httperrors::maybe_error(resp).await?;
    Ok(())
}
