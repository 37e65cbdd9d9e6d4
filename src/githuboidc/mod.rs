pub mod claims;
pub mod token;
pub mod verifier;

pub use claims::{Claims, AUDIENCE};
pub use token::{fetch_jwt, oidc_available, TokenError};
pub use verifier::{Verifier, VerifierError};

use log::warn;

/// Validates an incoming Register RPC's GitHub OIDC token, if present, and
/// checks that its audience matches what this rendezvous expects.
///
/// The upstream audience check this was ported from is inverted - it warns
/// "failed to validate audience" when the claim *does* contain the expected
/// audience and only accepts the token otherwise. Here the check is the
/// audience actually has to be present to succeed.
pub async fn validate_token(
    verifier: &verifier::Verifier,
    token: &str,
) -> Option<Claims> {
    let claims = match verifier.validate(token).await {
        Ok(c) => c,
        Err(e) => {
            warn!("failed to validate GitHub OIDC token: {e}");
            return None;
        }
    };

    if !claims.aud.iter().any(|a| a == AUDIENCE) {
        warn!(
            "failed to validate GitHub OIDC token audience: expected {AUDIENCE}, got {:?}",
            claims.aud
        );
        return None;
    }

    Some(claims)
}
