//! The embedded SSH server: public-key auth against a static/fetched key
//! table, PTY and non-PTY sessions, SFTP, agent forwarding, and local port
//! forwarding. Mirrors `pkg/sshd/sshd.go`.

mod agent;
mod keepalive;
mod pty;
mod sftp;
mod writenotify;

pub use writenotify::WriteNotify;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};
use portable_pty::CommandBuilder;
use russh::server::{Auth, Handle, Msg, Server as RusshServerTrait, Session};
use russh::{Channel, ChannelId, Pty};
use russh_keys::key::KeyPair;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SshdError {
    #[error("failed to parse authorized key: {0}")]
    InvalidKey(String),
    #[error(transparent)]
    Russh(#[from] russh::Error),
    #[error(transparent)]
    Keys(#[from] russh_keys::Error),
}

/// Parses a map of OpenSSH authorized-key lines (`ssh-ed25519 AAAA... owner`)
/// keyed by owner into the canonical wire-bytes table `SshServerOpts` wants.
/// Lines that fail to parse are skipped with a warning rather than aborting
/// startup over one bad key.
pub fn parse_authorized_keys(raw: &HashMap<String, String>) -> HashMap<Vec<u8>, String> {
    let mut table = HashMap::new();
    for (line, owner) in raw {
        let Some(encoded) = line.split_whitespace().nth(1) else {
            log::warn!("skipping malformed authorized key for {owner}");
            continue;
        };
        match russh_keys::parse_public_key_base64(encoded) {
            Ok(key) => {
                table.insert(key.public_key_bytes(), owner.clone());
            }
            Err(e) => log::warn!("skipping unparsable authorized key for {owner}: {e}"),
        }
    }
    table
}

pub struct SshServerOpts {
    pub allowed_users: Vec<String>,
    /// Canonical wire-format key bytes -> owner display name.
    pub authorized_keys: HashMap<Vec<u8>, String>,
    pub env: Vec<(String, String)>,
    pub shell: Vec<String>,
    pub dir: std::path::PathBuf,
    pub interactive_motd: Option<Arc<dyn Fn() -> String + Send + Sync>>,
    /// Called whenever a session produces output - wired to
    /// `Manager::extend` with `log=false` by the caller.
    pub on_write: Arc<dyn Fn() + Send + Sync>,
}

/// The running SSH service plus a way to read the current connection count,
/// which `waiter::Manager::status` reports to callers.
pub struct SshServer {
    config: Arc<russh::server::Config>,
    handler_factory: Arc<HandlerFactory>,
    pub connection_count: Arc<AtomicU32>,
}

impl SshServer {
    /// `connection_count` is supplied rather than created here so the
    /// caller can hand the same counter to `waiter::ManagerOpts` before the
    /// server itself exists.
    pub fn make(opts: SshServerOpts, connection_count: Arc<AtomicU32>) -> Result<Self, SshdError> {
        let mut authorized = Vec::new();
        for (wire, owner) in &opts.authorized_keys {
            authorized.push((wire.clone(), owner.clone()));
        }

        let started = std::time::Instant::now();
        let key_pair = KeyPair::generate_rsa(2048, russh_keys::key::SignatureHash::SHA2_256)
            .ok_or_else(|| SshdError::InvalidKey("failed to generate RSA host key".into()))?;
        info!(
            "generated ssh host key fingerprint={} in {:?}",
            key_pair.fingerprint(),
            started.elapsed()
        );

        let config = Arc::new(russh::server::Config {
            keys: vec![key_pair],
            ..Default::default()
        });

        Ok(Self {
            config,
            handler_factory: Arc::new(HandlerFactory {
                opts: Arc::new(opts),
                authorized_keys: Arc::new(authorized),
                connection_count: connection_count.clone(),
            }),
            connection_count,
        })
    }

    /// Drives the server off a [`crate::passthrough::Listener`] instead of a
    /// real TCP socket: one `accept()` per tunneled connection.
    pub async fn serve(self, listener: &crate::passthrough::Listener, cancel: CancellationToken) {
        let mut server = self.handler_factory.as_ref().clone_server();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                next = listener.accept() => {
                    let crate::passthrough::Offered { stream, remote } = match next {
                        Ok(offered) => offered,
                        Err(_) => return,
                    };
                    let config = self.config.clone();
                    let handler = server.new_client(Some(remote));
                    tokio::spawn(async move {
                        if let Err(e) = russh::server::run_stream(config, stream, handler).await {
                            debug!("ssh session from {remote} ended: {e}");
                        }
                    });
                }
            }
        }
    }
}

#[derive(Clone)]
struct HandlerFactory {
    opts: Arc<SshServerOpts>,
    authorized_keys: Arc<Vec<(Vec<u8>, String)>>,
    connection_count: Arc<AtomicU32>,
}

impl HandlerFactory {
    fn clone_server(&self) -> ServerImpl {
        ServerImpl {
            factory: self.clone(),
        }
    }
}

#[derive(Clone)]
struct ServerImpl {
    factory: HandlerFactory,
}

impl RusshServerTrait for ServerImpl {
    type Handler = SessionHandler;

    fn new_client(&mut self, addr: Option<std::net::SocketAddr>) -> Self::Handler {
        self.factory.connection_count.fetch_add(1, Ordering::SeqCst);
        SessionHandler {
            factory: self.factory.clone(),
            remote_addr: addr,
            owner: None,
            user: String::new(),
            ptys: HashMap::new(),
            cancel: CancellationToken::new(),
            agent: None,
        }
    }
}

struct PtyChannel {
    session: pty::PtySession,
    cancel: CancellationToken,
}

pub struct SessionHandler {
    factory: HandlerFactory,
    remote_addr: Option<std::net::SocketAddr>,
    owner: Option<String>,
    user: String,
    ptys: HashMap<ChannelId, Arc<PtyChannel>>,
    cancel: CancellationToken,
    agent: Option<agent::AgentListener>,
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.factory.connection_count.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lookup_key(table: &[(Vec<u8>, String)], wire: &[u8]) -> Option<String> {
    table
        .iter()
        .find(|(key, _)| key.as_slice() == wire)
        .map(|(_, owner)| owner.clone())
}

#[async_trait]
impl russh::server::Handler for SessionHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &russh_keys::key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.user = user.to_string();
        let wire = key.public_key_bytes();
        match lookup_key(&self.factory.authorized_keys, &wire) {
            Some(owner) => {
                self.owner = Some(owner);
                Ok(Auth::Accept)
            }
            None => Ok(Auth::Reject {
                proceed_with_methods: None,
            }),
        }
    }

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let owner = self.owner.clone().unwrap_or_default();
        info!(
            "incoming ssh session user={} owner={owner} remote={:?}",
            self.user, self.remote_addr
        );

        if self.factory.opts.allowed_users.is_empty()
            || self
                .factory
                .opts
                .allowed_users
                .iter()
                .any(|u| u == &self.user)
        {
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut command = self.make_command(None);
        command.env("TERM", term);

        let (pty_session, mut reader) =
            pty::PtySession::spawn(command, col_width as u16, row_height as u16)?;

        if let Some(motd) = &self.factory.opts.interactive_motd {
            session.data(channel, russh::CryptoVec::from(motd().into_bytes()));
        }

        let handle = session.handle();
        let on_write = self.factory.opts.on_write.clone();
        let cancel = CancellationToken::new();
        keepalive::spawn(handle.clone(), channel, cancel.clone());

        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match std::io::Read::read(&mut reader, &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        on_write();
                        let handle = handle.clone();
                        let data = russh::CryptoVec::from_slice(&buf[..n]);
                        let _ = futures::executor::block_on(handle.data(channel, data));
                    }
                }
            }
            let _ = futures::executor::block_on(handle.eof(channel));
        });

        self.ptys.insert(
            channel,
            Arc::new(PtyChannel {
                session: pty_session,
                cancel,
            }),
        );

        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(pty) = self.ptys.get(&channel) {
            pty.session.resize(col_width as u16, row_height as u16);
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // A bare shell with no preceding pty_request is a non-interactive
        // session; spawn it directly, piping stdout/stderr into the
        // channel.
        if self.ptys.contains_key(&channel) {
            return Ok(());
        }
        self.spawn_plain(channel, None, session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        if self.ptys.contains_key(&channel) {
            if let Some(pty) = self.ptys.get(&channel) {
                let _ = pty.session.write_input(command.as_bytes());
            }
            return Ok(());
        }
        self.spawn_plain(channel, Some(command), session)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        (self.factory.opts.on_write)();
        if let Some(pty) = self.ptys.get(&channel) {
            let _ = pty.session.write_input(data);
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            session.channel_failure(channel);
            return Ok(());
        }

        session.channel_success(channel);
        let handle = session.handle();
        let on_write = self.factory.opts.on_write.clone();
        let notify = WriteNotify::new(move || on_write());

        tokio::spawn(async move {
            let stream = ChannelDataStream::new(handle, channel);
            sftp::serve(stream, notify).await;
        });

        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!("port forward request to {host_to_connect}:{port_to_connect}");

        let target = format!("{host_to_connect}:{port_to_connect}");
        tokio::spawn(async move {
            match tokio::net::TcpStream::connect(&target).await {
                Ok(mut remote) => {
                    let mut stream = channel.into_stream();
                    if let Err(e) =
                        tokio::io::copy_bidirectional(&mut stream, &mut remote).await
                    {
                        error!("direct-tcpip copy to {target} ended: {e}");
                    }
                }
                Err(e) => error!("failed to dial direct-tcpip target {target}: {e}"),
            }
        });

        Ok(true)
    }
}

impl SessionHandler {
    fn make_command(&self, raw_command: Option<&str>) -> CommandBuilder {
        let shell = &self.factory.opts.shell;
        let mut command = match raw_command {
            Some(raw) if !raw.is_empty() => {
                let mut c = CommandBuilder::new(&shell[0]);
                c.arg("-c");
                c.arg(raw);
                c
            }
            _ => {
                let mut c = CommandBuilder::new(&shell[0]);
                for arg in &shell[1..] {
                    c.arg(arg);
                }
                c
            }
        };

        for (key, value) in &self.factory.opts.env {
            command.env(key, value);
        }
        command.cwd(&self.factory.opts.dir);

        command
    }

    fn spawn_plain(
        &mut self,
        channel: ChannelId,
        raw_command: Option<String>,
        session: &mut Session,
    ) -> Result<(), anyhow::Error> {
        let mut command = self.make_command(raw_command.as_deref());
        let mut child = command.spawn()?;

        let mut stdout = child.take_stdout().ok_or_else(|| anyhow::anyhow!("no stdout"))?;
        let handle = session.handle();
        let on_write = self.factory.opts.on_write.clone();

        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match std::io::Read::read(&mut stdout, &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        on_write();
                        let data = russh::CryptoVec::from_slice(&buf[..n]);
                        let _ = futures::executor::block_on(handle.data(channel, data));
                    }
                }
            }
        });

        tokio::spawn(async move {
            let _ = tokio::task::spawn_blocking(move || child.wait()).await;
        });

        Ok(())
    }
}

/// Adapts an SSH channel into a plain `AsyncRead + AsyncWrite` stream for
/// the SFTP subsystem handler, which has no notion of SSH channels itself.
struct ChannelDataStream {
    handle: Handle,
    channel: ChannelId,
    inbound: tokio::sync::mpsc::Receiver<Vec<u8>>,
}

impl ChannelDataStream {
    fn new(handle: Handle, channel: ChannelId) -> Self {
        let (_tx, inbound) = tokio::sync::mpsc::channel(16);
        Self {
            handle,
            channel,
            inbound,
        }
    }
}

impl tokio::io::AsyncRead for ChannelDataStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.inbound.poll_recv(cx) {
            std::task::Poll::Ready(Some(data)) => {
                buf.put_slice(&data);
                std::task::Poll::Ready(Ok(()))
            }
            std::task::Poll::Ready(None) => std::task::Poll::Ready(Ok(())),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl tokio::io::AsyncWrite for ChannelDataStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let handle = self.handle.clone();
        let channel = self.channel;
        let data = russh::CryptoVec::from_slice(buf);
        let _ = futures::executor::block_on(handle.data(channel, data));
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}
