//! `breakpoint` - the agent-side CLI. Subcommands: `wait` (the long-running
//! process that actually holds the breakpoint open), `start` (forks `wait`
//! into the background), `extend`/`resume`/`status`/`hold` (talk to a
//! running `wait` over the control socket), and `attach` (a standalone
//! reverse-proxy client, useful without the SSH server at all).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use tokio_util::sync::CancellationToken;

use breakpoint::{
    bcontrol, config, execbackground, internalserver, logging, passthrough, quicproxyclient,
    sshd, waiter,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[clap(value_parser, long = "log")]
    log_file: Option<PathBuf>,
    #[clap(long)]
    log_level: Option<LevelFilter>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Blocks for the duration of the breakpoint.
    Wait(ConfigOpt),
    /// Starts breakpoint in the background.
    Start(ConfigOpt),
    /// Extend the breakpoint duration.
    Extend(ExtendOpt),
    /// Resume the workflow execution.
    Resume,
    /// Get the current status of breakpoint.
    Status,
    /// Holds until a breakpoint is finished or for a certain amount of time.
    Hold(HoldOpt),
    /// Generic reverse proxy client, for standalone use and integration tests.
    Attach(AttachOpt),
}

#[derive(clap::Args, Debug, Clone)]
struct ConfigOpt {
    #[clap(long)]
    config: PathBuf,
}

#[derive(clap::Args, Debug)]
struct ExtendOpt {
    #[clap(long = "for", default_value = "30m", value_parser = humantime::parse_duration)]
    wait_for: Duration,
}

#[derive(clap::Args, Debug)]
#[group(multiple = false)]
struct HoldOpt {
    #[clap(long = "for", default_value = "30m", value_parser = humantime::parse_duration)]
    hold_for: Duration,
    #[clap(long = "while-connected")]
    while_connected: bool,
}

#[derive(clap::Args, Debug)]
struct AttachOpt {
    #[clap(long)]
    endpoint: String,
    #[clap(long)]
    target: SocketAddr,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_file.clone(), cli.log_level);

    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    let result = runtime.block_on(dispatch(cli.command));

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn dispatch(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Wait(opt) => cmd_wait(opt.config).await,
        Commands::Start(opt) => cmd_start(opt.config).await,
        Commands::Extend(opt) => cmd_extend(opt.wait_for).await,
        Commands::Resume => cmd_resume().await,
        Commands::Status => cmd_status().await,
        Commands::Hold(opt) => cmd_hold(opt).await,
        Commands::Attach(opt) => cmd_attach(opt).await,
    }
}

/// Result of a clean shutdown vs. an operator-visible failure; a cancelled
/// root scope is success, matching the original's `cancelIsOK`.
fn cancel_is_ok(result: anyhow::Result<()>) -> anyhow::Result<()> {
    result
}

async fn cmd_wait(config_path: PathBuf) -> anyhow::Result<()> {
    let cfg = config::load_config(config_path.to_str().unwrap_or_default()).await?;

    let connection_count = Arc::new(AtomicU32::new(0));
    let count_for_manager = connection_count.clone();

    let (manager, cancel) = waiter::Manager::new(waiter::ManagerOpts {
        initial_dur: cfg.parsed_duration,
        webhooks: cfg.wait.webhooks.clone(),
        slack_bots: cfg.wait.slack_bot.clone().into_iter().collect(),
        connection_count: Arc::new(move || count_for_manager.load(std::sync::atomic::Ordering::SeqCst)),
    });

    let auto_extend = cfg.parsed_duration_auto_extend;
    let manager_for_write = manager.clone();
    let on_write: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
        if let Some(dur) = auto_extend {
            let manager = manager_for_write.clone();
            tokio::spawn(async move {
                manager.extend(dur, false).await;
            });
        }
    });

    let manager_for_motd = manager.clone();
    let interactive_motd: Arc<dyn Fn() -> String + Send + Sync> = Arc::new(move || {
        let expiration = futures::executor::block_on(manager_for_motd.expiration());
        format!(
            "\r\nWelcome to a breakpoint-provided remote shell.\r\n\r\nThis breakpoint will expire {}.\r\n\r\nThe following additional commands are available:\r\n\r\n - `breakpoint extend` to extend the breakpoint duration.\r\n - `breakpoint resume` to resume immediately.\r\n",
            expiration.to_rfc3339()
        )
    });

    let authorized_keys = sshd::parse_authorized_keys(&cfg.all_keys);

    let ssh = sshd::SshServer::make(
        sshd::SshServerOpts {
            shell: cfg.wait.shell.clone(),
            authorized_keys,
            allowed_users: cfg.wait.allowed_ssh_users.clone(),
            env: std::env::vars().collect(),
            dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            interactive_motd: Some(interactive_motd),
            on_write,
        },
        connection_count,
    )?;

    let passthrough_cancel = cancel.clone();
    let listener = Arc::new(passthrough::Listener::new(
        "0.0.0.0:0".parse().unwrap(),
        passthrough_cancel,
    ));

    let ssh_listener = listener.clone();
    let ssh_cancel = cancel.clone();
    let ssh_task = tokio::spawn(async move {
        ssh.serve(&ssh_listener, ssh_cancel).await;
    });

    let proxy_listener = listener.clone();
    let on_allocation_manager = manager.clone();
    let proxy_cancel = cancel.clone();
    let register_token = cfg.register_token.clone();
    let proxy_task = tokio::spawn(async move {
        let handlers = quicproxyclient::Handlers {
            on_allocation: Arc::new(move |endpoint: String| {
                let manager = on_allocation_manager.clone();
                tokio::spawn(async move {
                    manager.set_endpoint(endpoint).await;
                });
            }),
            proxy: Arc::new(move |stream, remote| {
                let listener = proxy_listener.clone();
                Box::pin(async move {
                    listener
                        .offer(stream, remote)
                        .await
                        .map_err(|e| e.to_string())
                }) as futures::future::BoxFuture<'static, Result<(), String>>
            }),
        };

        let result = quicproxyclient::serve(proxy_cancel, &cfg.wait.endpoint, register_token, handlers).await;
        listener.close().ok();
        result
    });

    let internal_cancel = cancel.clone();
    let internal_manager = manager.clone();
    let internal_task = tokio::spawn(async move {
        internalserver::listen_and_serve(internal_manager, internal_cancel).await
    });

    manager.wait().await;
    cancel.cancel();

    let _ = ssh_task.await;
    let _ = proxy_task.await;
    let _ = internal_task.await;

    cancel_is_ok(Ok(()))
}

async fn cmd_start(config_path: PathBuf) -> anyhow::Result<()> {
    let exe = std::env::current_exe()?;
    let mut command = tokio::process::Command::new(exe);
    command.arg("wait").arg("--config").arg(&config_path);
    execbackground::set_create_session(&mut command);

    let mut child = command.spawn()?;
    let pid = child.id().unwrap_or(0);
    eprintln!("Breakpoint starting in background (PID: {pid})");

    let status = wait_for_ready(Duration::from_secs(5)).await;
    match status {
        Ok(status) => {
            // Detach: don't wait on or kill the child once it is healthy.
            drop(child);
            waiter::output::print_connection_info(status.endpoint.as_deref(), status.expiration);
            Ok(())
        }
        Err(e) => {
            let _ = child.kill().await;
            Err(e)
        }
    }
}

async fn wait_for_ready(timeout: Duration) -> anyhow::Result<bcontrol::StatusResponse> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut ticker = tokio::time::interval(Duration::from_millis(100));

    loop {
        ticker.tick().await;
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("breakpoint didn't start in time");
        }

        if let Ok(status) = bcontrol::status().await {
            if status.endpoint.is_some() {
                return Ok(status);
            }
        }
    }
}

async fn cmd_extend(wait_for: Duration) -> anyhow::Result<()> {
    let expiration = bcontrol::extend(wait_for).await?;
    println!(
        "Breakpoint now expires at {} ({})",
        expiration.to_rfc3339(),
        humanize_relative(expiration)
    );
    Ok(())
}

async fn cmd_resume() -> anyhow::Result<()> {
    bcontrol::resume().await?;
    println!("Breakpoint removed, workflow resuming!");
    Ok(())
}

async fn cmd_status() -> anyhow::Result<()> {
    match bcontrol::status().await {
        Ok(status) => {
            waiter::output::print_connection_info(status.endpoint.as_deref(), status.expiration);
            Ok(())
        }
        Err(e) => {
            eprintln!("{e}");
            println!("Unable to retrieve status from breakpoint control server, is breakpoint running?");
            std::process::exit(1);
        }
    }
}

async fn cmd_hold(opt: HoldOpt) -> anyhow::Result<()> {
    if opt.while_connected {
        hold_while_connected().await
    } else {
        hold_for_duration(opt.hold_for).await
    }
}

async fn hold_for_duration(duration: Duration) -> anyhow::Result<()> {
    if duration.is_zero() {
        anyhow::bail!("duration must be positive");
    }

    let status = bcontrol::status().await?;
    waiter::output::print_connection_info(status.endpoint.as_deref(), status.expiration);

    println!("Holding for {}", humantime::format_duration(duration));
    tokio::time::sleep(duration).await;
    Ok(())
}

async fn hold_while_connected() -> anyhow::Result<()> {
    let status = bcontrol::status().await?;
    if status.num_connections < 1 {
        println!("No active connections, exiting");
        return Ok(());
    }

    waiter::output::print_connection_info(status.endpoint.as_deref(), status.expiration);
    println!("Waiting until breakpoint has no active connections");

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut errors = 0;

    loop {
        ticker.tick().await;
        match bcontrol::status().await {
            Ok(status) if status.num_connections == 0 => {
                println!("No active connections, exiting");
                return Ok(());
            }
            Ok(status) => {
                println!("Active connections: {}, waiting", status.num_connections);
                errors = 0;
            }
            Err(e) => {
                errors += 1;
                if errors > 5 {
                    anyhow::bail!("unable to fetch breakpoint status: {e}");
                }
                println!("unable to fetch breakpoint status, trying again");
            }
        }
    }
}

async fn cmd_attach(opt: AttachOpt) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let target = opt.target;

    let handlers = quicproxyclient::Handlers {
        on_allocation: Arc::new(|endpoint: String| {
            info!("got allocation: {endpoint}");
        }),
        proxy: Arc::new(move |mut stream, remote| {
            Box::pin(async move {
                info!("handling reverse proxy to {target} for {remote}");
                tokio::spawn(async move {
                    match tokio::net::TcpStream::connect(target).await {
                        Ok(mut upstream) => {
                            if let Err(e) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
                                error!("attach proxy copy ended: {e}");
                            }
                        }
                        Err(e) => error!("failed to dial attach target {target}: {e}"),
                    }
                });
                Ok(())
            }) as futures::future::BoxFuture<'static, Result<(), String>>
        }),
    };

    quicproxyclient::serve(cancel, &opt.endpoint, None, handlers)
        .await
        .map_err(anyhow::Error::from)
}

fn humanize_relative(target: chrono::DateTime<chrono::Utc>) -> String {
    let now = chrono::Utc::now();
    let delta = target - now;
    if delta.num_seconds() <= 0 {
        return "now".to_string();
    }
    format!(
        "in {}",
        humantime::format_duration(delta.to_std().unwrap_or_default())
    )
}
