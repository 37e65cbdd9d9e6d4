//! Server side of the local control socket: a tiny Unix-socket RPC loop that
//! lets `breakpoint extend/resume/status` reach the running manager.
//! Grounded on `pkg/internalserver/internalserver.go`.

use std::sync::Arc;

use log::info;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use crate::bcontrol::{self, ControlError, ControlRequest, ControlResponse, StatusResponse};
use crate::framing::MessageChannel;
use crate::waiter::Manager;

/// Binds the control socket (removing any stale leftover from a previous
/// run) and serves Extend/Resume/Status requests until `cancel` fires.
pub async fn listen_and_serve(manager: Arc<Manager>, cancel: CancellationToken) -> Result<(), ControlError> {
    let socket_path = bcontrol::socket_path()?;
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let _ = tokio::fs::remove_file(&socket_path).await;

    let listener = UnixListener::bind(&socket_path)?;
    info!("control socket listening at {}", socket_path.display());

    let result = serve(&listener, manager, cancel).await;
    let _ = tokio::fs::remove_file(&socket_path).await;
    result
}

async fn serve(
    listener: &UnixListener,
    manager: Arc<Manager>,
    cancel: CancellationToken,
) -> Result<(), ControlError> {
    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };

        let manager = manager.clone();
        tokio::spawn(async move {
            let mut channel = MessageChannel::new(stream);
            loop {
                let request: ControlRequest = match channel.recv().await {
                    Ok(r) => r,
                    Err(_) => return,
                };

                let response = handle(&manager, request).await;
                if channel.send(&response).await.is_err() {
                    return;
                }
            }
        });
    }
}

async fn handle(manager: &Arc<Manager>, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::Extend { wait_for } => {
            let expiration = manager.extend(wait_for, true).await;
            ControlResponse::Extend { expiration }
        }
        ControlRequest::Resume => {
            manager.stop().await;
            ControlResponse::Resume
        }
        ControlRequest::Status => {
            let status = manager.status().await;
            ControlResponse::Status(StatusResponse {
                endpoint: status.endpoint,
                expiration: status.expiration,
                num_connections: status.num_connections,
            })
        }
    }
}
