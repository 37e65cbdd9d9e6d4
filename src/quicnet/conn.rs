use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A single bidirectional QUIC stream paired with the connection it came
/// from, so callers can still read local/remote addresses off what looks
/// like an ordinary `TcpStream`.
pub struct QuicStream {
    pub(crate) send: quinn::SendStream,
    pub(crate) recv: quinn::RecvStream,
    pub(crate) connection: quinn::Connection,
}

impl QuicStream {
    pub fn local_addr(&self) -> SocketAddr {
        self.connection.local_ip().map_or_else(
            || "0.0.0.0:0".parse().unwrap(),
            |ip| SocketAddr::new(ip, 0),
        )
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Opens a fresh bidirectional stream on an existing connection, the
    /// client-side counterpart to the listener's accept loop.
    pub async fn open(connection: quinn::Connection) -> Result<Self, quinn::ConnectionError> {
        let (send, recv) = connection.open_bi().await?;
        Ok(Self {
            send,
            recv,
            connection,
        })
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.send).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}
