//! Client side of the local control socket: `breakpoint extend/resume/status`
//! dial this to reach the `wait` process's [`crate::internalserver`].
//! Grounded on `pkg/bcontrol/client.go`.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UnixStream;

use crate::framing::{FramingError, MessageChannel};

pub const SOCKET_RELATIVE: &str = "breakpoint/breakpoint.sock";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("could not determine a config directory for the control socket")]
    NoConfigDir,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("control server error: {0}")]
    Server(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum ControlRequest {
    Extend { wait_for: Duration },
    Resume,
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub endpoint: Option<String>,
    pub expiration: DateTime<Utc>,
    pub num_connections: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum ControlResponse {
    Extend { expiration: DateTime<Utc> },
    Resume,
    Status(StatusResponse),
    Error(String),
}

pub fn socket_path() -> Result<PathBuf, ControlError> {
    let dir = dirs::config_dir().ok_or(ControlError::NoConfigDir)?;
    Ok(dir.join(SOCKET_RELATIVE))
}

async fn dial() -> Result<MessageChannel<UnixStream>, ControlError> {
    let path = socket_path()?;
    let stream = UnixStream::connect(&path).await?;
    Ok(MessageChannel::new(stream))
}

async fn roundtrip(request: ControlRequest) -> Result<ControlResponse, ControlError> {
    let mut channel = dial().await?;
    channel.send(&request).await?;
    let response = channel.recv::<ControlResponse>().await?;
    Ok(response)
}

pub async fn extend(wait_for: Duration) -> Result<DateTime<Utc>, ControlError> {
    match roundtrip(ControlRequest::Extend { wait_for }).await? {
        ControlResponse::Extend { expiration } => Ok(expiration),
        ControlResponse::Error(e) => Err(ControlError::Server(e)),
        _ => Err(ControlError::Server("unexpected response to Extend".into())),
    }
}

pub async fn resume() -> Result<(), ControlError> {
    match roundtrip(ControlRequest::Resume).await? {
        ControlResponse::Resume => Ok(()),
        ControlResponse::Error(e) => Err(ControlError::Server(e)),
        _ => Err(ControlError::Server("unexpected response to Resume".into())),
    }
}

pub async fn status() -> Result<StatusResponse, ControlError> {
    match roundtrip(ControlRequest::Status).await? {
        ControlResponse::Status(s) => Ok(s),
        ControlResponse::Error(e) => Err(ControlError::Server(e)),
        _ => Err(ControlError::Server("unexpected response to Status".into())),
    }
}
