use serde::{Deserialize, Serialize};

pub const AUDIENCE: &str = "https://github.com/namespacelabs/breakpoint";
const GITHUB_JWKS_URL: &str = "https://token.actions.githubusercontent.com/.well-known/jwks";

pub(crate) fn jwks_url() -> &'static str {
    GITHUB_JWKS_URL
}

/// The GitHub Actions OIDC claim set. Carries the full set the token
/// actually contains, not just the handful spec.md names, since the
/// notification templates (`template.rs`) can reference any of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub aud: Vec<String>,
    pub sub: String,
    pub iss: String,
    pub exp: usize,
    pub iat: usize,

    pub job_workflow_ref: String,
    pub sha: String,
    pub event_name: String,
    pub repository: String,
    pub workflow: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub job_workflow_sha: String,
    #[serde(default)]
    pub runner_environment: String,
    #[serde(default)]
    pub repository_id: String,
    pub repository_owner: String,
    #[serde(default)]
    pub repository_owner_id: String,
    #[serde(default)]
    pub workflow_ref: String,
    #[serde(default)]
    pub workflow_sha: String,
    pub run_id: String,
    pub run_attempt: String,
}
