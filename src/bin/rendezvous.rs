//! `rendezvous` - the public process agents dial into. Binds the Register
//! RPC over QUIC, serves a public-facing front-end (raw or PROXY-mux), and
//! runs a small HTTP side-listener that redirects browsers somewhere useful.
//! Grounded on `cmd/rendezvous/main.go`.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use clap::Parser;
use log::{error, info, LevelFilter};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use breakpoint::githuboidc::Verifier;
use breakpoint::logging;
use breakpoint::quicproxy::mux::MuxFrontend;
use breakpoint::quicproxy::raw::RawFrontend;
use breakpoint::quicproxy::register::{AccessControl, RegisterServerOpts};
use breakpoint::quicproxy::{register, ProxyFrontend};
use breakpoint::tlscerts::Subjects;

#[derive(Parser, Debug)]
struct Cli {
    /// The address:port to listen on for the Register RPC.
    #[arg(short = 'l', long = "listen", env = "PROXY_LISTEN")]
    listen: String,

    /// If unset, defaults to the host portion of --listen.
    #[arg(long = "pub", env = "PROXY_PUBLIC")]
    public_addr: Option<String>,

    /// Comma-separated domain names attached as TLS cert subjects.
    #[arg(long = "sub", env = "PROXY_DOMAINS", value_delimiter = ',')]
    domains: Vec<String>,

    /// Front-end config, as JSON: `{"kind": "proxy_proto", ...}`.
    #[arg(long = "frontend", env = "PROXY_FRONTEND")]
    frontend: Option<String>,

    /// Where the HTTP redirect side-listener binds.
    #[arg(long = "http_port", env = "PROXY_HTTP_PORT", default_value_t = 10020)]
    http_port: u16,

    /// Validate GitHub Actions OIDC tokens presented at registration.
    #[arg(long = "validate_github_oidc", env = "PROXY_VALIDATE_GITHUB_OIDC")]
    validate_github_oidc: bool,

    /// Require a validated identity on every registration; rejects
    /// registrations carrying no OIDC token at all.
    #[arg(long = "require_github_oidc", env = "PROXY_REQUIRE_GITHUB_OIDC")]
    require_github_oidc: bool,

    /// Only accept registrations from these repositories ("owner/name").
    #[arg(long = "restrict_repository", env = "PROXY_RESTRICT_REPOSITORY", value_delimiter = ',')]
    restrict_repository: Vec<String>,

    /// Only accept registrations from these repository owners.
    #[arg(long = "restrict_owner", env = "PROXY_RESTRICT_OWNER", value_delimiter = ',')]
    restrict_owner: Vec<String>,

    /// Where browsers hitting the HTTP side-listener get redirected to.
    #[arg(
        long = "redirect_target",
        env = "PROXY_REDIRECT_TARGET",
        default_value = "https://github.com/namespacelabs/breakpoint"
    )]
    redirect_target: String,

    #[arg(long)]
    log_file: Option<std::path::PathBuf>,
    #[arg(long)]
    log_level: Option<LevelFilter>,
}

#[derive(Debug, Default, Deserialize)]
struct FrontendConfig {
    kind: Option<String>,
    port_start: Option<u16>,
    port_end: Option<u16>,
    listen_port: Option<u16>,
}

fn make_frontend(cfg: &FrontendConfig, public_addr: &str) -> Arc<dyn ProxyFrontend> {
    match cfg.kind.as_deref() {
        Some("proxy_proto") => Arc::new(MuxFrontend::new(
            cfg.listen_port.unwrap_or(0),
            cfg.port_start.unwrap_or(0),
            cfg.port_end.unwrap_or(0),
            public_addr.to_string(),
        )),
        _ => Arc::new(RawFrontend {
            public_addr: public_addr.to_string(),
        }),
    }
}

fn subjects_for(public_addr: &str, domains: Vec<String>) -> Subjects {
    let mut dns: Option<String> = domains.into_iter().next();
    let ip: Option<IpAddr> = public_addr.parse().ok().filter(|a: &IpAddr| !a.is_unspecified());

    if ip.is_none() && dns.is_none() {
        dns = Some(public_addr.to_string());
    }

    Subjects { ip, dns }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_file.clone(), cli.log_level);

    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    if let Err(e) = runtime.block_on(run(cli)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let bind_addr: SocketAddr = cli.listen.parse()?;
    let public_addr = cli
        .public_addr
        .clone()
        .unwrap_or_else(|| bind_addr.ip().to_string());

    let fcfg: FrontendConfig = match &cli.frontend {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
        _ => FrontendConfig::default(),
    };

    let subjects = subjects_for(&public_addr, cli.domains.clone());
    let frontend = make_frontend(&fcfg, &public_addr);

    let verifier = cli.validate_github_oidc.then(Verifier::new);
    let access = AccessControl {
        require_oidc: cli.require_github_oidc,
        restrict_to_repositories: cli.restrict_repository.clone(),
        restrict_to_owners: cli.restrict_owner.clone(),
    };

    let cancel = CancellationToken::new();

    let register_cancel = cancel.clone();
    let register_frontend = frontend.clone();
    let register_task = tokio::spawn(async move {
        register::serve(
            RegisterServerOpts {
                bind_addr,
                subjects,
                frontend: register_frontend,
                verifier,
                access,
            },
            register_cancel,
        )
        .await
        .map_err(anyhow::Error::from)
    });

    let listen_cancel = cancel.clone();
    let listen_frontend = frontend.clone();
    let listen_task = tokio::spawn(async move {
        listen_frontend
            .listen_and_serve(listen_cancel)
            .await
            .map_err(anyhow::Error::from)
    });

    let http_cancel = cancel.clone();
    let http_task = tokio::spawn(http_redirect_server(cli.http_port, cli.redirect_target.clone(), http_cancel));

    tokio::select! {
        _ = shutdown_signal() => info!("received shutdown signal"),
        res = wait_any(register_task, listen_task, http_task) => {
            if let Err(e) = res {
                error!("a rendezvous task exited with an error: {e}");
            }
        }
    }

    cancel.cancel();
    Ok(())
}

/// Awaits whichever of the three long-running tasks finishes first; the
/// others are left running (they'll notice `cancel` and unwind too).
async fn wait_any(
    a: tokio::task::JoinHandle<anyhow::Result<()>>,
    b: tokio::task::JoinHandle<anyhow::Result<()>>,
    c: tokio::task::JoinHandle<anyhow::Result<()>>,
) -> anyhow::Result<()> {
    tokio::select! {
        r = a => r.unwrap_or_else(|e| Err(e.into())),
        r = b => r.unwrap_or_else(|e| Err(e.into())),
        r = c => r.unwrap_or_else(|e| Err(e.into())),
    }
}

async fn http_redirect_server(
    port: u16,
    redirect_target: String,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let make_svc = make_service_fn(move |_conn| {
        let redirect_target = redirect_target.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |_req: Request<Body>| {
                let redirect_target = redirect_target.clone();
                async move {
                    Response::builder()
                        .status(StatusCode::TEMPORARY_REDIRECT)
                        .header("Location", redirect_target.clone())
                        .body(Body::from(format!(
                            "Heading over to <a href=\"{redirect_target}\">{redirect_target}</a>"
                        )))
                }
            }))
        }
    });

    info!("http redirect listening on {addr}");
    let server = Server::bind(&addr).serve(make_svc);
    let graceful = server.with_graceful_shutdown(async move { cancel.cancelled().await });
    graceful.await?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
