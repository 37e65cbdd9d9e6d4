//! Rendezvous-side half of the Register RPC: accepts QUIC connections from
//! agents, validates an optional GitHub OIDC token, and hands the connection
//! off to a [`super::ProxyFrontend`] for the lifetime of the registration.
//! Grounded on `pkg/quicproxy/service.go`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use quinn::{Endpoint, ServerConfig, VarInt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::framing::{FramingError, MessageChannel};
use crate::githuboidc::{validate_token, Verifier};
use crate::quicnet::{Listener as QuicListener, QuicStream};
use crate::tlscerts::{self, Subjects};

use super::wire::{RegisterRequest, RegisterResponse};
use super::{serve_proxy, Allocation, ProxyFrontend};

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error(transparent)]
    Tls(#[from] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Which identities a rendezvous will accept a Register from, beyond
/// signature/audience validity. Empty lists mean "no restriction".
#[derive(Clone, Default)]
pub struct AccessControl {
    pub require_oidc: bool,
    pub restrict_to_repositories: Vec<String>,
    pub restrict_to_owners: Vec<String>,
}

impl AccessControl {
    fn permits(&self, claims: Option<&crate::githuboidc::Claims>) -> Result<(), String> {
        let restricted = !self.restrict_to_repositories.is_empty() || !self.restrict_to_owners.is_empty();

        let Some(claims) = claims else {
            if self.require_oidc {
                return Err("GitHub OIDC validation is required".into());
            }
            if restricted {
                return Err("repository/owner restriction requires a validated identity".into());
            }
            return Ok(());
        };

        if !self.restrict_to_repositories.is_empty()
            && !self.restrict_to_repositories.contains(&claims.repository)
        {
            return Err(format!("repository {} is not permitted", claims.repository));
        }
        if !self.restrict_to_owners.is_empty()
            && !self.restrict_to_owners.contains(&claims.repository_owner)
        {
            return Err(format!(
                "repository owner {} is not permitted",
                claims.repository_owner
            ));
        }

        Ok(())
    }
}

pub struct RegisterServerOpts<F> {
    pub bind_addr: SocketAddr,
    pub subjects: Subjects,
    pub frontend: Arc<F>,
    pub verifier: Option<Arc<Verifier>>,
    pub access: AccessControl,
}

fn configure_endpoint(subjects: &Subjects) -> Result<(ServerConfig, Vec<u8>), RegisterError> {
    let cert = tlscerts::generate(subjects).map_err(RegisterError::Tls)?;

    let priv_key = rustls::PrivateKey(cert.key_der);
    let cert_chain = vec![rustls::Certificate(cert.cert_der.clone())];

    let mut server_config = ServerConfig::with_single_cert(cert_chain, priv_key)
        .map_err(|e| RegisterError::Tls(Box::new(e)))?;

    let transport = Arc::get_mut(&mut server_config.transport).expect("fresh config");
    transport.max_concurrent_uni_streams(0_u8.into());
    transport.max_idle_timeout(Some(VarInt::from_u32(60_000).into()));
    transport.keep_alive_interval(Some(Duration::from_secs(1)));
    #[cfg(any(windows, target_os = "linux"))]
    transport.mtu_discovery_config(Some(quinn::MtuDiscoveryConfig::default()));

    Ok((server_config, cert.cert_der))
}

/// Runs the Register RPC server until `cancel` fires. One task per accepted
/// agent connection; each blocks in [`serve_proxy`] for as long as that
/// agent's allocation stays alive.
pub async fn serve<F>(opts: RegisterServerOpts<F>, cancel: CancellationToken) -> Result<(), RegisterError>
where
    F: ProxyFrontend + 'static,
{
    let (server_config, cert_der) = configure_endpoint(&opts.subjects)?;
    let endpoint = Endpoint::server(server_config, opts.bind_addr)?;
    info!(
        "register rpc listening on {} (cert {} bytes)",
        opts.bind_addr,
        cert_der.len()
    );

    let listener = QuicListener::new(endpoint, cancel.clone());

    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(s) => s,
                Err(e) => {
                    info!("register listener stopped: {e}");
                    return Ok(());
                }
            },
        };

        let frontend = opts.frontend.clone();
        let verifier = opts.verifier.clone();
        let access = opts.access.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_registration(stream, frontend, verifier, access, cancel).await {
                info!("register rpc session ended: {e}");
            }
        });
    }
}

async fn handle_registration<F>(
    stream: QuicStream,
    frontend: Arc<F>,
    verifier: Option<Arc<Verifier>>,
    access: AccessControl,
    cancel: CancellationToken,
) -> Result<(), FramingError>
where
    F: ProxyFrontend + 'static,
{
    let connection = stream.connection.clone();
    let remote = stream.remote_addr();
    let mut channel = MessageChannel::new(stream);

    let request: RegisterRequest = channel.recv().await?;

    let claims = match (&request.oidc_token, &verifier) {
        (Some(token), Some(verifier)) => validate_token(verifier, token).await,
        (Some(_), None) => {
            warn!("register from {remote} carried an OIDC token but no verifier is configured");
            None
        }
        (None, _) => None,
    };

    if let Err(reason) = access.permits(claims.as_ref()) {
        info!("register from {remote} denied: {reason}");
        channel.send(&RegisterResponse::Denied { reason }).await?;
        connection.close(VarInt::from_u32(0), b"permission denied");
        return Ok(());
    }

    if let Some(claims) = &claims {
        info!(
            "register from {remote} repository={} owner={}",
            claims.repository, claims.repository_owner
        );
    } else {
        info!("register from {remote} (no identity claims)");
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<RegisterResponse>();
    let sender = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            if channel.send(&resp).await.is_err() {
                break;
            }
        }
    });

    let on_allocation = move |alloc: Allocation| {
        tx.send(RegisterResponse::Allocation {
            endpoint: alloc.endpoint,
        })
        .map_err(|e| e.to_string())
    };

    if let Err(e) = serve_proxy(cancel, frontend, connection, on_allocation).await {
        info!("serve_proxy ended for {remote}: {e}");
    }

    let _ = sender.await;
    Ok(())
}
