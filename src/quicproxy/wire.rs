//! Wire types for the Register RPC, framed with [`crate::framing`] instead
//! of a generated gRPC stub.

use serde::{Deserialize, Serialize};

pub const OIDC_TOKEN_HEADER: &str = "x-breakpoint-github-oidc-token";

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub oidc_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RegisterResponse {
    Allocation { endpoint: String },
    Denied { reason: String },
}
