//! Loads and validates the JSON config a breakpoint is started with,
//! resolving authorized keys and an optional GitHub OIDC token along the
//! way. Mirrors `pkg/config/config.go` and the JSON schema in
//! `api/private/v1/configtype.go`.

use std::collections::HashMap;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::github_keys;
use crate::githuboidc;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("webhook is missing url")]
    WebhookMissingUrl,
    #[error("unknown feature {0:?}")]
    UnknownFeature(String),
    #[error("invalid duration {0:?}: {1}")]
    InvalidDuration(String, humantime::DurationError),
    #[error(transparent)]
    KeyResolution(#[from] github_keys::ResolveError),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlackBotConfig {
    pub token: String,
    pub channel: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WaitConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub duration_auto_extend: String,
    #[serde(default)]
    pub authorized_keys: Vec<String>,
    #[serde(default)]
    pub authorized_github_users: Vec<String>,
    #[serde(default)]
    pub shell: Vec<String>,
    #[serde(default)]
    pub allowed_ssh_users: Vec<String>,
    #[serde(default)]
    pub enable: Vec<String>,
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
    #[serde(default)]
    pub slack_bot: Option<SlackBotConfig>,
}

/// A loaded config plus everything derived from it: the resolved
/// key-ownership index, the parsed durations, and an optional OIDC token to
/// attach to the Register RPC.
pub struct ParsedConfig {
    pub wait: WaitConfig,
    /// Key wire-bytes (as published) -> owner display name. A static key
    /// maps to itself; a key fetched via a GitHub identity maps to that
    /// username.
    pub all_keys: HashMap<String, String>,
    pub parsed_duration: Duration,
    pub parsed_duration_auto_extend: Option<Duration>,
    pub register_token: Option<String>,
}

pub async fn load_config(path: &str) -> Result<ParsedConfig, ConfigError> {
    let wait: WaitConfig = crate::jsonfile::load(path)?;

    for wh in &wait.webhooks {
        if wh.url.is_empty() {
            return Err(ConfigError::WebhookMissingUrl);
        }
    }

    let mut wait = wait;
    if wait.shell.is_empty() {
        wait.shell = vec![std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())];
    }

    // The original's `enable` handling forces `requireGitHubOIDC` back to
    // false immediately after recognizing "github/oidc" - preserved as-is,
    // since OIDC token attachment is separately gated by
    // `githuboidc::oidc_available()` below regardless of this flag.
    let mut require_github_oidc = false;
    for feature in &wait.enable {
        match feature.as_str() {
            "github/oidc" => {
                require_github_oidc = false;
            }
            other => return Err(ConfigError::UnknownFeature(other.to_string())),
        }
    }

    let register_token = if githuboidc::oidc_available() || require_github_oidc {
        match githuboidc::fetch_jwt(githuboidc::AUDIENCE).await {
            Ok(token) => Some(token),
            Err(e) if require_github_oidc => {
                return Err(ConfigError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e,
                )))
            }
            Err(e) => {
                warn!("failed to obtain GitHub OIDC token: {e}");
                None
            }
        }
    } else {
        None
    };

    let parsed_duration = humantime::parse_duration(&wait.duration)
        .map_err(|e| ConfigError::InvalidDuration(wait.duration.clone(), e))?;

    let parsed_duration_auto_extend = if wait.duration_auto_extend.is_empty() {
        None
    } else {
        Some(
            humantime::parse_duration(&wait.duration_auto_extend)
                .map_err(|e| ConfigError::InvalidDuration(wait.duration_auto_extend.clone(), e))?,
        )
    };

    let key_map = github_keys::resolve_ssh_keys(&wait.authorized_github_users).await?;

    let mut all_keys = HashMap::new();
    for key in &wait.authorized_keys {
        all_keys.insert(key.clone(), key.clone());
    }
    for (user, keys) in key_map {
        for key in keys {
            all_keys.insert(key, user.clone());
        }
    }

    Ok(ParsedConfig {
        wait,
        all_keys,
        parsed_duration,
        parsed_duration_auto_extend,
        register_token,
    })
}
