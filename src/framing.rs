//! Length-delimited bincode framing shared by the Register RPC (over QUIC
//! streams) and the Control RPC (over a Unix socket), standing in for the
//! generated request/response plumbing a real RPC framework would give us.

use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use futures::{SinkExt, StreamExt};

#[derive(Debug, Error)]
pub enum FramingError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("message decode failed: {0}")]
    Decode(#[from] bincode::Error),
    #[error("connection closed")]
    Closed,
}

/// A bincode-over-length-delimited-frames channel for a single message type
/// pair. Both sides of a Register or Control RPC construct one of these over
/// their respective transport (a QUIC stream, a Unix socket).
pub struct MessageChannel<S> {
    inner: Framed<S, LengthDelimitedCodec>,
}

impl<S> MessageChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            inner: Framed::new(stream, LengthDelimitedCodec::new()),
        }
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), FramingError> {
        let bytes = bincode::serialize(msg)?;
        self.inner.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, FramingError> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(decode(&frame)?),
            Some(Err(e)) => Err(e.into()),
            None => Err(FramingError::Closed),
        }
    }
}

fn decode<T: DeserializeOwned>(frame: &BytesMut) -> Result<T, bincode::Error> {
    bincode::deserialize(frame)
}
