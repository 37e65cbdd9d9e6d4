use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::proxyproto;
use super::{Allocation, FrontendError, HandleConn, Handlers, ProxyFrontend};

/// A single shared TCP listener, speaking PROXY protocol v1, that
/// multiplexes many tunneled breakpoints by local port. Each breakpoint gets
/// a random port in `[port_start, port_end)`; `allocate` retries up to 100
/// times before giving up, matching the original's naive allocator.
pub struct MuxFrontend {
    pub listen_port: u16,
    pub port_start: u16,
    pub port_end: u16,
    pub public_addr: String,
    alloc: RwLock<HashMap<u16, HandleConn>>,
}

impl MuxFrontend {
    pub fn new(listen_port: u16, port_start: u16, port_end: u16, public_addr: String) -> Self {
        Self {
            listen_port,
            port_start,
            port_end,
            public_addr,
            alloc: RwLock::new(HashMap::new()),
        }
    }

    async fn allocate(&self, handler: HandleConn) -> Result<u16, FrontendError> {
        let mut alloc = self.alloc.write().await;
        for _ in 0..100 {
            let port = self.port_start
                + rand::thread_rng().gen_range(0..self.port_end - self.port_start);
            if !alloc.contains_key(&port) {
                alloc.insert(port, handler);
                return Ok(port);
            }
        }
        Err(FrontendError::AllocationExhausted)
    }

    async fn release(&self, port: u16) {
        self.alloc.write().await.remove(&port);
    }
}

#[async_trait]
impl ProxyFrontend for MuxFrontend {
    async fn listen_and_serve(&self, cancel: CancellationToken) -> Result<(), FrontendError> {
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port)).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (conn, remote) = accepted?;
                    let alloc = self.alloc_snapshot_for(conn, remote).await;
                    if let Some((handler, conn, remote)) = alloc {
                        debug!("new connection from {remote}");
                        handler(conn, remote);
                    }
                }
            }
        }
    }

    async fn handle(
        &self,
        cancel: CancellationToken,
        handlers: Handlers,
    ) -> Result<(), FrontendError> {
        let handle_conn = handlers.handle_conn.clone();
        let port = self.allocate(handle_conn).await?;

        let alloc = Allocation {
            endpoint: format!("{}:{}", self.public_addr, port),
        };
        (handlers.on_allocation)(alloc.clone()).map_err(FrontendError::Rejected)?;

        cancel.cancelled().await;
        self.release(port).await;

        if let Some(on_cleanup) = handlers.on_cleanup {
            on_cleanup(alloc, Some(FrontendError::Cancelled));
        }

        Ok(())
    }
}

impl MuxFrontend {
    /// Reads the PROXY protocol preamble off a freshly accepted connection,
    /// looks up the handler registered for the connection's *local* port
    /// (the port a client actually dialed), and hands both back so the
    /// caller can invoke the handler without holding the read lock.
    async fn alloc_snapshot_for(
        &self,
        mut conn: TcpStream,
        _remote: std::net::SocketAddr,
    ) -> Option<(HandleConn, TcpStream, std::net::SocketAddr)> {
        let local_port = conn.local_addr().ok()?.port();

        let original_remote = match proxyproto::decode(&mut conn).await {
            Ok(addr) => addr,
            Err(_) => return None,
        };

        let table = self.alloc.read().await;
        let handler = table.get(&local_port)?.clone();
        Some((handler, conn, original_remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocation_round_trips_and_releases() {
        let front = MuxFrontend::new(0, 20000, 20100, "example.org".into());
        let handler: HandleConn = Arc::new(|_, _| {});
        let port = front.allocate(handler.clone()).await.unwrap();
        assert!(front.alloc.read().await.contains_key(&port));
        front.release(port).await;
        assert!(!front.alloc.read().await.contains_key(&port));
    }

    #[tokio::test]
    async fn allocation_exhaustion_is_reported() {
        let front = MuxFrontend::new(0, 20000, 20001, "example.org".into());
        let handler: HandleConn = Arc::new(|_, _| {});
        // Only one port (20000) is ever in range, so the second allocation
        // without releasing the first must exhaust all 100 retries.
        front.allocate(handler.clone()).await.unwrap();
        let err = front.allocate(handler).await;
        assert!(matches!(err, Err(FrontendError::AllocationExhausted)));
    }
}
