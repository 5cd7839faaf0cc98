pub mod lwa;
pub mod shopify;
pub mod tokens;

pub use lwa::LwaClient;
pub use shopify::ShopifyOAuth;
pub use tokens::{AuthorizationCallback, AuthorizationStart, TokenError, TokenService};

use crate::models::CredentialKind;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Access tokens without `expires_in` are assumed to last this long.
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token endpoint returned HTTP {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
    #[error("{0} is required for this platform")]
    MissingParameter(&'static str),
    #[error("oauth transport error: {0}")]
    Transport(String),
    #[error("unexpected token response: {0}")]
    Decode(String),
}

impl AuthError {
    /// The provider rejected the grant itself, so only a new consent helps.
    pub fn is_authorization_failure(&self) -> bool {
        match self {
            AuthError::Provider { status, body } => {
                let body = body.to_ascii_lowercase();
                matches!(status, 400 | 401)
                    && (body.contains("invalid_grant") || body.contains("unauthorized"))
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AuthError::Decode(err.to_string())
        } else {
            AuthError::Transport(err.to_string())
        }
    }
}

/// Tokens issued by a code exchange or refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds; `None` for permanent tokens.
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Per-platform OAuth capability.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn credential_kind(&self) -> CredentialKind;

    fn client_id(&self) -> &str;

    /// Consent page URL; `shop` is required by shop-scoped platforms.
    fn authorization_url(&self, shop: Option<&str>, state: &str) -> Result<String, AuthError>;

    async fn exchange_code(&self, code: &str, shop: Option<&str>) -> Result<TokenBundle, AuthError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenBundle, AuthError>;

    fn supports_refresh(&self) -> bool {
        self.credential_kind() == CredentialKind::Refresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rejected_grants_need_reauthorization() {
        let invalid_grant = AuthError::Provider {
            status: 400,
            body: r#"{"error":"invalid_grant","error_description":"expired"}"#.into(),
        };
        let unauthorized = AuthError::Provider {
            status: 401,
            body: r#"{"error":"unauthorized_client"}"#.into(),
        };
        let outage = AuthError::Provider {
            status: 503,
            body: "unauthorized".into(),
        };
        assert!(invalid_grant.is_authorization_failure());
        assert!(unauthorized.is_authorization_failure());
        assert!(!outage.is_authorization_failure());
        assert!(!AuthError::Transport("reset".into()).is_authorization_failure());
    }
}
