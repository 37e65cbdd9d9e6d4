//! Agent-side half of the Register RPC: dials the rendezvous over QUIC,
//! registers (optionally presenting a GitHub OIDC token), then concurrently
//! accepts tunneled streams and reports each allocation the rendezvous
//! grants. Grounded on `pkg/quicproxyclient/client.go`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{error, info};
use quinn::{ClientConfig, Endpoint, VarInt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::framing::{FramingError, MessageChannel};
use crate::passthrough::NetStream;
use crate::quicnet::QuicStream;
use crate::quicproxy::proxyproto;
use crate::quicproxy::wire::{RegisterRequest, RegisterResponse};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error(transparent)]
    Connect(#[from] quinn::ConnectError),
    #[error(transparent)]
    Connection(#[from] quinn::ConnectionError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
}

pub type OnAllocation = Arc<dyn Fn(String) + Send + Sync>;
pub type ProxyFn = Arc<dyn Fn(Box<dyn NetStream>, SocketAddr) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

#[derive(Clone)]
pub struct Handlers {
    pub on_allocation: OnAllocation,
    pub proxy: ProxyFn,
}

struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

fn client_config() -> ClientConfig {
    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    let mut config = ClientConfig::new(Arc::new(crypto));
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(VarInt::from_u32(5_000).into()));
    transport.keep_alive_interval(Some(Duration::from_secs(30)));
    config.transport_config(Arc::new(transport));
    config
}

/// Dials `endpoint`, registers, and drives the tunnel until `cancel` fires or
/// either of the accept/register loops errors out.
pub async fn serve(
    cancel: CancellationToken,
    endpoint: &str,
    oidc_token: Option<String>,
    handlers: Handlers,
) -> Result<(), ClientError> {
    let remote = tokio::net::lookup_host(endpoint)
        .await?
        .next()
        .ok_or_else(|| ClientError::Resolve(endpoint.to_string()))?;

    let sni = endpoint.rsplit_once(':').map(|(host, _)| host).unwrap_or(endpoint);

    let bind_addr: SocketAddr = if remote.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };

    let mut client_endpoint = Endpoint::client(bind_addr)?;
    client_endpoint.set_default_client_config(client_config());

    info!("connecting to rendezvous at {endpoint}");
    let connection = client_endpoint.connect(remote, sni)?.await?;
    info!("connected to rendezvous {}", connection.remote_address());

    let register_stream = QuicStream::open(connection.clone()).await?;
    let mut register_channel = MessageChannel::new(register_stream);
    register_channel.send(&RegisterRequest { oidc_token }).await?;

    let accept_connection = connection.clone();
    let accept_cancel = cancel.clone();
    let proxy = handlers.proxy.clone();
    let accept_loop = tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = accept_cancel.cancelled() => return,
                accepted = accept_connection.accept_bi() => accepted,
            };

            let (send, recv) = match accepted {
                Ok(s) => s,
                Err(e) => {
                    info!("tunnel accept loop ended: {e}");
                    return;
                }
            };

            let mut stream = QuicStream {
                send,
                recv,
                connection: accept_connection.clone(),
            };
            let remote = stream.remote_addr();
            let proxy = proxy.clone();

            tokio::spawn(async move {
                let peer = match proxyproto::decode(&mut stream).await {
                    Ok(addr) => addr,
                    Err(e) => {
                        error!("failed to decode PROXY header from tunnel stream: {e}");
                        return;
                    }
                };
                info!("new tunneled connection remote={peer} local={remote}");
                if let Err(e) = proxy(Box::new(stream), peer).await {
                    error!("proxy handler failed for {peer}: {e}");
                }
            });
        }
    });

    let register_cancel = cancel.clone();
    let register_loop = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = register_cancel.cancelled() => return,
                msg = register_channel.recv::<RegisterResponse>() => msg,
            };

            match msg {
                Ok(RegisterResponse::Allocation { endpoint }) => {
                    (handlers.on_allocation)(endpoint);
                }
                Ok(RegisterResponse::Denied { reason }) => {
                    error!("register denied: {reason}");
                    return;
                }
                Err(e) => {
                    info!("register stream ended: {e}");
                    return;
                }
            }
        }
    });

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = accept_loop => {}
        _ = register_loop => {}
    }

    connection.close(VarInt::from_u32(0), b"done");
    Ok(())
}
