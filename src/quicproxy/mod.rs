//! Front-end abstractions that expose a tunneled QUIC connection as a plain
//! TCP endpoint the outside world can dial, plus the glue that proxies
//! accepted connections back down the QUIC connection as new streams.

pub mod mux;
pub mod proxyproto;
pub mod raw;
pub mod register;
pub mod wire;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use thiserror::Error;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::quicnet::QuicStream;

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub endpoint: String,
}

#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("failed to allocate a port")]
    AllocationExhausted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("allocation callback rejected: {0}")]
    Rejected(String),
    #[error("cancelled")]
    Cancelled,
}

pub type HandleConn = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;
pub type OnAllocation = Arc<dyn Fn(Allocation) -> Result<(), String> + Send + Sync>;
pub type OnCleanup = Arc<dyn Fn(Allocation, Option<FrontendError>) + Send + Sync>;

#[derive(Clone)]
pub struct Handlers {
    pub on_allocation: OnAllocation,
    pub on_cleanup: Option<OnCleanup>,
    pub handle_conn: HandleConn,
}

/// A mechanism for making a QUIC-tunneled connection publicly reachable over
/// plain TCP: either a dedicated ephemeral listener (`raw`) or a shared
/// PROXY-protocol-speaking listener multiplexed by local port (`mux`).
#[async_trait]
pub trait ProxyFrontend: Send + Sync {
    async fn listen_and_serve(&self, cancel: CancellationToken) -> Result<(), FrontendError>;
    async fn handle(
        &self,
        cancel: CancellationToken,
        handlers: Handlers,
    ) -> Result<(), FrontendError>;
}

/// Dials the tunnel backend (a fresh QUIC stream on `connection`) for every
/// TCP connection the frontend accepts, 1:1, until the frontend's `handle`
/// future resolves (allocation released, or connection torn down).
pub async fn serve_proxy<F>(
    cancel: CancellationToken,
    frontend: Arc<F>,
    connection: quinn::Connection,
    on_new_allocation: impl Fn(Allocation) -> Result<(), String> + Send + Sync + 'static,
) -> Result<(), FrontendError>
where
    F: ProxyFrontend + 'static,
{
    let on_allocation: OnAllocation = Arc::new(move |alloc: Allocation| {
        info!("new allocation: {}", alloc.endpoint);
        on_new_allocation(alloc)
    });

    let on_cleanup: OnCleanup = Arc::new(|alloc, err| match err {
        None | Some(FrontendError::Cancelled) => {
            info!("released allocation: {}", alloc.endpoint);
        }
        Some(e) => {
            info!("released allocation: {} ({e})", alloc.endpoint);
        }
    });

    let handle_conn: HandleConn = {
        let connection = connection.clone();
        Arc::new(move |mut tcp_conn: TcpStream, remote: SocketAddr| {
            let connection = connection.clone();
            tokio::spawn(async move {
                let opened = tokio::time::timeout(DIAL_TIMEOUT, QuicStream::open(connection)).await;
                let mut tunnel = match opened {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => {
                        info!("failed to open tunnel stream for {remote}: {e}");
                        return;
                    }
                    Err(_) => {
                        info!("timed out opening tunnel stream for {remote}");
                        return;
                    }
                };

                if let Err(e) = proxyproto::encode(&mut tunnel, remote).await {
                    info!("failed to write PROXY header for {remote}: {e}");
                    return;
                }

                if let Err(e) = copy_bidirectional(&mut tcp_conn, &mut tunnel).await {
                    info!("tunnel copy ended for {remote}: {e}");
                }
            });
        })
    };

    frontend
        .handle(
            cancel,
            Handlers {
                on_allocation,
                on_cleanup: Some(on_cleanup),
                handle_conn,
            },
        )
        .await
}
