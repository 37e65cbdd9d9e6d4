use thiserror::Error;

const USER_AGENT: &str = "actions/oidc-client";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("please add `id-token: write` to your workflow permissions")]
    MissingIdTokenWrite,
    #[error("failed to request GitHub JWT: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to obtain token: HTTP {0}")]
    BadStatus(reqwest::StatusCode),
}

fn oidc_conf() -> Option<(String, String)> {
    let url = std::env::var("ACTIONS_ID_TOKEN_REQUEST_URL").ok()?;
    let token = std::env::var("ACTIONS_ID_TOKEN_REQUEST_TOKEN").ok()?;
    if url.is_empty() || token.is_empty() {
        return None;
    }
    Some((url, token))
}

pub fn oidc_available() -> bool {
    oidc_conf().is_some()
}

/// Fetches a GitHub Actions OIDC ID token scoped to `audience`, the Rust
/// counterpart of `githuboidc.JWT`.
pub async fn fetch_jwt(audience: &str) -> Result<String, TokenError> {
    let (mut url, id_token) = oidc_conf().ok_or(TokenError::MissingIdTokenWrite)?;

    if !audience.is_empty() {
        url.push_str(&format!(
            "&audience={}",
            urlencoding_escape(audience)
        ));
    }

    let client = reqwest::Client::new();
    let resp = client
        .get(&url)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("User-Agent", USER_AGENT)
        .bearer_auth(id_token)
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(TokenError::BadStatus(resp.status()));
    }

    #[derive(serde::Deserialize)]
    struct TokenResponse {
        value: String,
    }

    let parsed: TokenResponse = resp.json().await?;
    Ok(parsed.value)
}

fn urlencoding_escape(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}
