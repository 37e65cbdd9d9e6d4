use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;

use super::claims::{jwks_url, Claims};

const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("failed to fetch JWKS: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("failed to verify GitHub JWT: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("unknown key id {0}")]
    UnknownKid(String),
    #[error("token has no key id")]
    MissingKid,
}

#[derive(Debug, Deserialize, Clone)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

struct Cached {
    keys: Vec<Jwk>,
    fetched_at: tokio::time::Instant,
}

/// Fetches and caches the GitHub Actions OIDC JWKS, refreshing it on an hour
/// boundary the way `keyfunc.Options{RefreshInterval: time.Hour}` does in
/// the original, minus the background refresh goroutine: this refreshes
/// lazily, on the next validation after the interval elapses.
pub struct Verifier {
    client: reqwest::Client,
    cache: RwLock<Option<Cached>>,
}

impl Verifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            cache: RwLock::new(None),
        })
    }

    async fn keys(&self) -> Result<Vec<Jwk>, VerifierError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < REFRESH_INTERVAL {
                    return Ok(cached.keys.clone());
                }
            }
        }

        let set: JwkSet = self
            .client
            .get(jwks_url())
            .send()
            .await?
            .json()
            .await?;

        let mut cache = self.cache.write().await;
        *cache = Some(Cached {
            keys: set.keys.clone(),
            fetched_at: tokio::time::Instant::now(),
        });

        Ok(set.keys)
    }

    /// Verifies a GitHub Actions OIDC token and returns its claims, the
    /// counterpart of `githuboidc.Validate`.
    pub async fn validate(&self, token: &str) -> Result<Claims, VerifierError> {
        let header = decode_header(token)?;
        let kid = header.kid.ok_or(VerifierError::MissingKid)?;

        let keys = self.keys().await?;
        let jwk = keys
            .iter()
            .find(|k| k.kid == kid)
            .ok_or_else(|| VerifierError::UnknownKid(kid.clone()))?;

        let decoding_key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;

        let data = decode::<Claims>(token, &decoding_key, &validation)?;
        Ok(data.claims)
    }
}
