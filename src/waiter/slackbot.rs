//! A minimal Slack bot that posts a status message when a breakpoint's
//! endpoint becomes known, updates it every 30s, and posts a final
//! "leaving" update when the breakpoint winds down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, warn};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{ManagedResource, Manager};
use crate::config::SlackBotConfig;
use crate::jsonfile;

const UPDATE_INTERVAL: Duration = Duration::from_secs(30);
const LEAVING_BUDGET: Duration = Duration::from_secs(5);

struct GitHubProps {
    repository: String,
    ref_name: String,
    workflow: String,
    run_id: String,
    run_number: String,
    actor: String,
    push_commit_message: Option<String>,
    push_commit_url: Option<String>,
}

/// Reads the ambient GitHub Actions environment, mirroring
/// `prepareGitHubProps`. `GITHUB_EVENT_PAH` is read for compatibility with
/// the misspelling the original publisher left in, but the correctly
/// spelled `GITHUB_EVENT_PATH` wins when both are present.
fn prepare_github_props() -> GitHubProps {
    let env = |key: &str| std::env::var(key).unwrap_or_default();

    let mut props = GitHubProps {
        repository: env("GITHUB_REPOSITORY"),
        ref_name: env("GITHUB_REF_NAME"),
        workflow: env("GITHUB_WORKFLOW"),
        run_id: env("GITHUB_RUN_ID"),
        run_number: env("GITHUB_RUN_NUMBER"),
        actor: env("GITHUB_ACTOR"),
        push_commit_message: None,
        push_commit_url: None,
    };

    let event_file = std::env::var("GITHUB_EVENT_PATH")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| std::env::var("GITHUB_EVENT_PAH").ok().filter(|v| !v.is_empty()));

    if env("GITHUB_EVENT_NAME") == "push" {
        if let Some(event_file) = event_file {
            match jsonfile::load::<Value>(&event_file) {
                Ok(event) => {
                    props.push_commit_message = event
                        .pointer("/head_commit/message")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    props.push_commit_url = event
                        .pointer("/head_commit/url")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| {
                            event
                                .pointer("/repository/url")
                                .and_then(Value::as_str)
                                .map(str::to_string)
                        });
                }
                Err(e) => warn!("failed to load GitHub event file: {e}"),
            }
        }
    }

    props
}

fn render_blocks(props: &GitHubProps, endpoint: Option<&str>, expiration: Option<DateTime<Utc>>) -> Vec<Value> {
    let mut blocks = vec![
        json!({
            "type": "header",
            "text": { "type": "plain_text", "text": "Workflow failed", "emoji": false },
        }),
        json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!(
                    "*Repository:* <https://github.com/{0}/tree/{1}|github.com/{0}> ({1})",
                    props.repository, props.ref_name
                ),
            },
        }),
        json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!(
                    "*Workflow:* {} (<https://github.com/{}/actions/runs/{}|Run #{}>)",
                    props.workflow, props.repository, props.run_id, props.run_number
                ),
            },
        }),
    ];

    if let Some(message) = &props.push_commit_message {
        let url = props
            .push_commit_url
            .clone()
            .unwrap_or_else(|| format!("https://github.com/{}", props.repository));
        blocks.push(json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("*<{url}|Commit>:* {message}") },
        }));
    }

    if let (Some(endpoint), Some(expiration)) = (endpoint, expiration) {
        if let Some((host, port)) = endpoint.rsplit_once(':') {
            blocks.push(json!({
                "type": "section",
                "text": { "type": "mrkdwn", "text": format!("*SSH:* `ssh -p {port} runner@{host}`") },
            }));
            blocks.push(json!({
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": format!(
                        "*Expires:* {}",
                        expiration.format("%b %e %H:%M:%S %Z")
                    ),
                },
            }));
        }
    }

    blocks.push(json!({
        "type": "context",
        "elements": [{ "type": "plain_text", "text": format!("Actor: {}", props.actor) }],
    }));

    blocks
}

struct Posted {
    channel: String,
    ts: String,
}

pub struct SlackBot {
    client: reqwest::Client,
    token: String,
    github_props: GitHubProps,
    manager: Arc<Manager>,
    posted: Mutex<Option<Posted>>,
    cancel: CancellationToken,
}

impl SlackBot {
    async fn post_message(&self, channel: &str, blocks: &[Value]) -> Result<Posted, String> {
        let resp: Value = self
            .client
            .post("https://slack.com/api/chat.postMessage")
            .bearer_auth(&self.token)
            .json(&json!({ "channel": channel, "blocks": blocks }))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())?;

        if resp.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(format!("slack error: {resp}"));
        }

        Ok(Posted {
            channel: resp["channel"].as_str().unwrap_or_default().to_string(),
            ts: resp["ts"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn send_update(&self, leaving: bool) -> Result<(), String> {
        let posted = self.posted.lock().await;
        let Some(posted) = posted.as_ref() else {
            return Ok(());
        };

        let blocks = if leaving {
            render_blocks(&self.github_props, None, None)
        } else {
            let endpoint = self.manager.endpoint().await;
            let expiration = self.manager.expiration().await;
            render_blocks(&self.github_props, endpoint.as_deref(), Some(expiration))
        };

        let resp: Value = self
            .client
            .post("https://slack.com/api/chat.update")
            .bearer_auth(&self.token)
            .json(&json!({ "channel": posted.channel, "ts": posted.ts, "blocks": blocks }))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())?;

        if resp.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(format!("slack error: {resp}"));
        }

        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(UPDATE_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.send_update(false).await {
                        error!("slack update failed: {e}");
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ManagedResource for SlackBot {
    async fn close(self: Box<Self>) {
        let fut = self.send_update(true);
        if tokio::time::timeout(LEAVING_BUDGET, fut).await.is_err() {
            warn!("timed out sending Slack leaving update");
        }
        self.cancel.cancel();
    }
}

/// Starts a bot, posting the initial status message immediately. Returns a
/// handle the manager keeps until the breakpoint exits.
pub fn start(manager: Arc<Manager>, conf: SlackBotConfig) -> Arc<SlackBot> {
    let props = prepare_github_props();
    let token = expand_env(&conf.token);
    let channel = expand_env(&conf.channel);

    let bot = Arc::new(SlackBot {
        client: reqwest::Client::new(),
        token,
        github_props: props,
        manager,
        posted: Mutex::new(None),
        cancel: CancellationToken::new(),
    });

    let spawn_bot = bot.clone();
    tokio::spawn(async move {
        let blocks = render_blocks(&spawn_bot.github_props, None, None);
        match spawn_bot.post_message(&channel, &blocks).await {
            Ok(posted) => {
                *spawn_bot.posted.lock().await = Some(posted);
                spawn_bot.clone().run().await;
            }
            Err(e) => error!("slack bot failed to post initial message: {e}"),
        }
    });

    bot
}

fn expand_env(input: &str) -> String {
    crate::waiter::template::expand_string(input, &|key| std::env::var(key).unwrap_or_default())
}
