//! Resolves SSH public keys published on a GitHub user's profile, via the
//! well-known `https://github.com/{user}.keys` endpoint.

use std::collections::HashMap;
use std::time::Instant;

use log::info;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to fetch keys for {user}: {source}")]
    Request {
        user: String,
        source: reqwest::Error,
    },
    #[error("unexpected status code {status} fetching keys for {user}")]
    BadStatus {
        user: String,
        status: reqwest::StatusCode,
    },
}

/// Fetches authorized keys for each username in sequence (not concurrently),
/// to keep the burst of requests against GitHub's profile endpoint small -
/// matches the original's explicit choice to avoid parallel fetches.
pub async fn resolve_ssh_keys(
    usernames: &[String],
) -> Result<HashMap<String, Vec<String>>, ResolveError> {
    let client = reqwest::Client::new();
    let mut out = HashMap::new();

    for username in usernames {
        let started = Instant::now();

        let resp = client
            .get(format!("https://github.com/{username}.keys"))
            .send()
            .await
            .map_err(|source| ResolveError::Request {
                user: username.clone(),
                source,
            })?;

        if !resp.status().is_success() {
            return Err(ResolveError::BadStatus {
                user: username.clone(),
                status: resp.status(),
            });
        }

        let body = resp.text().await.map_err(|source| ResolveError::Request {
            user: username.clone(),
            source,
        })?;

        let keys: Vec<String> = body
            .trim()
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();

        info!(
            "resolved {} key(s) for {username} in {:?}",
            keys.len(),
            started.elapsed()
        );

        out.insert(username.clone(), keys);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_dropped() {
        let body = "ssh-ed25519 AAAA...\n\nssh-rsa BBBB...\n";
        let keys: Vec<String> = body
            .trim()
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        assert_eq!(keys, vec!["ssh-ed25519 AAAA...", "ssh-rsa BBBB..."]);
    }
}
