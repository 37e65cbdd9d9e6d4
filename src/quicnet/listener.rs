use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use super::conn::QuicStream;

const STREAM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener closed")]
    Closed,
    #[error("listener shutting down")]
    Cancelled,
    #[error(transparent)]
    Quic(#[from] quinn::ConnectionError),
}

struct Inbox {
    queue: VecDeque<QuicStream>,
    err: Option<String>,
}

/// Queues exactly one stream per accepted connection, mirroring the
/// original's mutex+cond inbox.
pub struct Listener {
    endpoint: quinn::Endpoint,
    inbox: Arc<Mutex<Inbox>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
}

impl Listener {
    pub fn new(endpoint: quinn::Endpoint, cancel: CancellationToken) -> Arc<Self> {
        let this = Arc::new(Self {
            endpoint,
            inbox: Arc::new(Mutex::new(Inbox {
                queue: VecDeque::new(),
                err: None,
            })),
            notify: Arc::new(Notify::new()),
            cancel,
        });

        let accept_loop = this.clone();
        tokio::spawn(async move { accept_loop.run().await });

        this
    }

    async fn run(self: Arc<Self>) {
        loop {
            let incoming = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.close_with_err("listener shutting down".into()).await;
                    return;
                }
                incoming = self.endpoint.accept() => incoming,
            };

            let Some(connecting) = incoming else {
                self.close_with_err("endpoint closed".into()).await;
                return;
            };

            let this = self.clone();
            tokio::spawn(async move { this.wait_for_stream(connecting).await });
        }
    }

    async fn wait_for_stream(self: Arc<Self>, connecting: quinn::Connecting) {
        let connection = match connecting.await {
            Ok(c) => c,
            Err(e) => {
                info!("failed to complete QUIC handshake: {e}");
                return;
            }
        };

        let accept = connection.accept_bi();
        match tokio::time::timeout(STREAM_TIMEOUT, accept).await {
            Ok(Ok((send, recv))) => {
                self.queue(QuicStream {
                    send,
                    recv,
                    connection,
                })
                .await;
            }
            Ok(Err(e)) => {
                info!(
                    "failed to accept stream from {}: {e}",
                    connection.remote_address()
                );
                connection.close(0u32.into(), b"");
            }
            Err(_) => {
                info!(
                    "no stream from {} within 10s, closing",
                    connection.remote_address()
                );
                connection.close(0u32.into(), b"");
            }
        }
    }

    async fn queue(&self, stream: QuicStream) {
        let mut inbox = self.inbox.lock().await;
        if inbox.err.is_some() {
            stream.connection.close(0u32.into(), b"");
            return;
        }
        inbox.queue.push_back(stream);
        self.notify.notify_one();
    }

    async fn close_with_err(&self, err: String) {
        let mut inbox = self.inbox.lock().await;
        if inbox.err.is_some() {
            return;
        }
        inbox.err = Some(err);
        let drained: Vec<_> = inbox.queue.drain(..).collect();
        drop(inbox);
        for stream in drained {
            stream.connection.close(0u32.into(), b"");
        }
        self.notify.notify_waiters();
    }

    pub async fn accept(&self) -> Result<QuicStream, ListenerError> {
        loop {
            {
                let mut inbox = self.inbox.lock().await;
                if let Some(stream) = inbox.queue.pop_front() {
                    return Ok(stream);
                }
                if inbox.err.is_some() {
                    return Err(ListenerError::Closed);
                }
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.cancel.cancelled() => return Err(ListenerError::Cancelled),
            }
        }
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.endpoint.local_addr()
    }

    pub async fn close(&self) {
        self.close_with_err("closed".into()).await;
        self.endpoint.close(0u32.into(), b"");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_blocks_until_queued() {
        let inbox: Arc<Mutex<Inbox>> = Arc::new(Mutex::new(Inbox {
            queue: VecDeque::new(),
            err: None,
        }));
        let notify = Arc::new(Notify::new());

        {
            let mut guard = inbox.lock().await;
            assert!(guard.queue.is_empty());
            guard.err = Some("closed".into());
        }
        notify.notify_waiters();

        let guard = inbox.lock().await;
        assert!(guard.err.is_some());
    }
}
