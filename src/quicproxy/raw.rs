use async_trait::async_trait;
use log::debug;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{Allocation, FrontendError, Handlers, ProxyFrontend};

/// Binds a fresh ephemeral `0.0.0.0:0` listener per allocation and reports
/// its chosen port as the public endpoint. Used when the rendezvous has a
/// dedicated public IP per breakpoint rather than a shared front-end port.
pub struct RawFrontend {
    pub public_addr: String,
}

#[async_trait]
impl ProxyFrontend for RawFrontend {
    async fn listen_and_serve(&self, _cancel: CancellationToken) -> Result<(), FrontendError> {
        Ok(())
    }

    async fn handle(
        &self,
        cancel: CancellationToken,
        handlers: Handlers,
    ) -> Result<(), FrontendError> {
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();
        let alloc = Allocation {
            endpoint: format!("{}:{}", self.public_addr, port),
        };

        (handlers.on_allocation)(alloc.clone()).map_err(FrontendError::Rejected)?;

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Err(FrontendError::Cancelled),
                accepted = listener.accept() => match accepted {
                    Ok((conn, remote)) => {
                        debug!("new connection on allocation {}", alloc.endpoint);
                        (handlers.handle_conn)(conn, remote);
                    }
                    Err(e) => break Err(FrontendError::Io(e)),
                },
            }
        };

        if let Some(on_cleanup) = handlers.on_cleanup {
            let cleanup_err = match &result {
                Ok(()) => None,
                Err(FrontendError::Cancelled) => Some(FrontendError::Cancelled),
                Err(e) => Some(FrontendError::Rejected(e.to_string())),
            };
            on_cleanup(alloc, cleanup_err);
        }

        result
    }
}
