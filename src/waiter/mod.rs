//! The lifetime manager: tracks a single expiration deadline, lets it be
//! extended or collapsed to zero, and fires side effects (webhooks, chat
//! bot updates, periodic console announcements) whenever the deadline or
//! endpoint change.

pub mod output;
pub mod slackbot;
pub mod template;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{SlackBotConfig, WebhookConfig};
use crate::webhook;

const LOG_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Something the manager owns for the duration of a breakpoint and must
/// tear down once it exits - chiefly a running Slack bot.
#[async_trait]
pub trait ManagedResource: Send {
    async fn close(self: Box<Self>);
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct ManagerStatus {
    pub endpoint: Option<String>,
    pub expiration: DateTime<Utc>,
    pub num_connections: u32,
}

pub struct ManagerOpts {
    pub initial_dur: Duration,
    pub webhooks: Vec<WebhookConfig>,
    pub slack_bots: Vec<SlackBotConfig>,
    pub connection_count: Arc<dyn Fn() -> u32 + Send + Sync>,
}

struct State {
    expiration: DateTime<Utc>,
    endpoint: Option<String>,
}

enum Signal {
    Updated,
    Stop,
}

/// Tracks how long the breakpoint should stay alive and fires the side
/// effects that go with its lifecycle. One `Manager` per running
/// breakpoint; `wait()` resolves once it expires or is explicitly resumed.
pub struct Manager {
    state: Mutex<State>,
    opts: ManagerOpts,
    signal_tx: mpsc::Sender<Signal>,
    cancel: CancellationToken,
    resources: Mutex<Vec<Box<dyn ManagedResource>>>,
}

impl Manager {
    /// Spawns the manager's background loop and returns both the handle and
    /// a token callers should select on elsewhere to know the breakpoint is
    /// winding down.
    pub fn new(opts: ManagerOpts) -> (Arc<Self>, CancellationToken) {
        let cancel = CancellationToken::new();
        let (signal_tx, signal_rx) = mpsc::channel(1);

        let expiration = Utc::now() + chrono::Duration::from_std(opts.initial_dur).unwrap();

        let manager = Arc::new(Self {
            state: Mutex::new(State {
                expiration,
                endpoint: None,
            }),
            opts,
            signal_tx,
            cancel: cancel.clone(),
            resources: Mutex::new(Vec::new()),
        });

        let loop_manager = manager.clone();
        tokio::spawn(async move { loop_manager.run(signal_rx).await });

        (manager, cancel)
    }

    async fn run(self: Arc<Self>, mut signal_rx: mpsc::Receiver<Signal>) {
        let initial_exp = { self.state.lock().await.expiration };
        let mut exit_sleep = Box::pin(sleep_until(initial_exp));
        let mut log_tick = tokio::time::interval(log_tick_interval());
        log_tick.tick().await; // first tick fires immediately; discard it.

        loop {
            tokio::select! {
                signal = signal_rx.recv() => {
                    match signal {
                        None | Some(Signal::Stop) => break,
                        Some(Signal::Updated) => {
                            let exp = { self.state.lock().await.expiration };
                            exit_sleep = Box::pin(sleep_until(exp));
                            self.announce().await;
                        }
                    }
                }
                _ = &mut exit_sleep => {
                    info!("breakpoint expired");
                    break;
                }
                _ = log_tick.tick() => {
                    self.announce().await;
                }
                _ = self.cancel.cancelled() => break,
            }
        }

        self.cancel.cancel();

        let mut resources = self.resources.lock().await;
        for resource in resources.drain(..) {
            resource.close().await;
        }
    }

    pub async fn wait(&self) {
        self.cancel.cancelled().await;
    }

    /// Adds `dur` to the current expiration and signals the loop. `log`
    /// controls whether this shows up as an explicit "Extend wait" line -
    /// the control-RPC handler passes `true`; the SSH server's
    /// write-activity auto-extend hook passes `false` so routine keystrokes
    /// don't spam the log.
    pub async fn extend(&self, dur: Duration, log: bool) -> DateTime<Utc> {
        let new_exp = {
            let mut state = self.state.lock().await;
            state.expiration += chrono::Duration::from_std(dur).unwrap_or_default();
            state.expiration
        };

        let _ = self.signal_tx.try_send(Signal::Updated);

        if log {
            info!("extend wait: dur={dur:?} expiration={new_exp}");
        }

        new_exp
    }

    /// Collapses the remaining wait to zero, ending the breakpoint now.
    pub async fn stop(&self) {
        info!("resume requested");
        let _ = self.signal_tx.send(Signal::Stop).await;
    }

    pub async fn expiration(&self) -> DateTime<Utc> {
        self.state.lock().await.expiration
    }

    pub async fn endpoint(&self) -> Option<String> {
        self.state.lock().await.endpoint.clone()
    }

    pub async fn status(&self) -> ManagerStatus {
        let state = self.state.lock().await;
        ManagerStatus {
            endpoint: state.endpoint.clone(),
            expiration: state.expiration,
            num_connections: (self.opts.connection_count)(),
        }
    }

    /// Records the publicly reachable endpoint once the tunnel allocates
    /// one, then starts chat bots and fires webhooks against it.
    pub async fn set_endpoint(self: &Arc<Self>, addr: String) {
        {
            let mut state = self.state.lock().await;
            state.endpoint = Some(addr.clone());
        }

        let expiration = self.expiration().await;
        let expand_fn = template::expand_fn(&addr, expiration);

        {
            let mut resources = self.resources.lock().await;
            for bot in &self.opts.slack_bots {
                resources.push(Box::new(slackbot::start(self.clone(), bot.clone())));
            }
        }

        let _ = self.signal_tx.try_send(Signal::Updated);

        for wh in &self.opts.webhooks {
            let url = template::expand_string(&wh.url, &expand_fn);
            let payload = template::expand_value(&wh.payload, &expand_fn);

            let started = std::time::Instant::now();
            match webhook::notify(&url, &payload).await {
                Ok(()) => info!("notified webhook {url} in {:?}", started.elapsed()),
                Err(e) => error!("failed to notify webhook {url}: {e}"),
            }
        }
    }

    async fn announce(&self) {
        let status = self.status().await;
        output::print_connection_info(status.endpoint.as_deref(), status.expiration);
    }
}

fn log_tick_interval() -> Duration {
    if std::env::var("CI").map(|v| !v.is_empty()).unwrap_or(false) {
        LOG_TICK_INTERVAL
    } else {
        Duration::from_secs(u64::MAX / 2)
    }
}

async fn sleep_until(target: DateTime<Utc>) {
    let now = Utc::now();
    let remaining = (target - now).to_std().unwrap_or(Duration::ZERO);
    tokio::time::sleep(remaining).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn extend_is_monotonic() {
        let (manager, _cancel) = Manager::new(ManagerOpts {
            initial_dur: Duration::from_secs(60),
            webhooks: vec![],
            slack_bots: vec![],
            connection_count: Arc::new(|| 0),
        });

        let before = manager.expiration().await;
        let after = manager.extend(Duration::from_secs(30), true).await;
        assert!(after > before);
    }

    #[tokio::test]
    async fn extend_zero_is_a_noop_but_still_signals() {
        let (manager, _cancel) = Manager::new(ManagerOpts {
            initial_dur: Duration::from_secs(60),
            webhooks: vec![],
            slack_bots: vec![],
            connection_count: Arc::new(|| 0),
        });

        let before = manager.expiration().await;
        let after = manager.extend(Duration::from_secs(0), false).await;
        assert_eq!(before, after);
    }
}
